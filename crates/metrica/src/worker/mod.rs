pub mod orchestrator;
pub mod pool;
pub mod sweeper;

pub use orchestrator::{stitch_continuations, JobOutcome, JobReport, Orchestrator};
pub use pool::WorkerPool;
pub use sweeper::{RetentionPolicy, Sweeper};
