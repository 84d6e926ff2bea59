pub mod artifacts;

pub use artifacts::{content_hash, ArtifactKind, ArtifactStore, CleanupReport};
