use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::StorageError;

/// Categories of blobs kept per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Upload,
    Preprocessed,
    RawOcr,
    Tokens,
    Candidates,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Upload => "upload",
            ArtifactKind::Preprocessed => "preprocessed",
            ArtifactKind::RawOcr => "raw_ocr",
            ArtifactKind::Tokens => "tokens",
            ArtifactKind::Candidates => "candidates",
        }
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "upload" => Some(ArtifactKind::Upload),
            "preprocessed" => Some(ArtifactKind::Preprocessed),
            "raw_ocr" => Some(ArtifactKind::RawOcr),
            "tokens" => Some(ArtifactKind::Tokens),
            "candidates" => Some(ArtifactKind::Candidates),
            _ => None,
        }
    }
}

/// Hex SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of a retention pass.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub bytes_freed: u64,
}

/// Content-addressable blob store on the local filesystem.
///
/// Blobs live at `<root>/<kind>/<first two hex chars>/<sha256>` and are
/// referenced by the relative path `<kind>/<hh>/<sha256>`. Storing the same
/// bytes twice is a no-op.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put(&self, kind: ArtifactKind, content: &[u8]) -> Result<String, StorageError> {
        let hash = content_hash(content);
        let reference = format!("{}/{}/{}", kind.dir_name(), &hash[..2], hash);
        let path = self.root.join(&reference);
        if path.exists() {
            return Ok(reference);
        }

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::CreateDirectory {
            path: dir.clone(),
            source: e,
        })?;

        // Concurrent writers of identical bytes race harmlessly on the rename.
        let tmp = dir.join(format!(".{}.{}.tmp", hash, uuid::Uuid::new_v4()));
        write_new(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            if !path.exists() {
                return Err(StorageError::MoveFile {
                    from: tmp,
                    to: path,
                    source: e,
                });
            }
        }
        Ok(reference)
    }

    pub fn put_json<T: Serialize>(&self, kind: ArtifactKind, value: &T) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.put(kind, &bytes)
    }

    pub fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(reference)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(reference.to_string()),
            _ => StorageError::ReadFile { path, source: e },
        })
    }

    pub fn get_json<T: DeserializeOwned>(&self, reference: &str) -> Result<T, StorageError> {
        let bytes = self.get(reference)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn exists(&self, reference: &str) -> bool {
        self.resolve(reference).map(|p| p.exists()).unwrap_or(false)
    }

    /// Maps a reference to its path, rejecting anything that is not
    /// `<kind>/<hh>/<64 hex chars>`.
    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let mut parts = reference.split('/');
        let (Some(kind), Some(prefix), Some(hash), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(StorageError::NotFound(reference.to_string()));
        };
        let valid = ArtifactKind::from_dir_name(kind).is_some()
            && hash.len() == 64
            && hash.chars().all(|c| c.is_ascii_hexdigit())
            && hash.starts_with(prefix)
            && prefix.len() == 2;
        if !valid {
            return Err(StorageError::NotFound(reference.to_string()));
        }
        Ok(self.root.join(reference))
    }

    /// Deletes blobs whose modification time is older than `max_age`.
    /// Independent of the pipeline: callers decide when to run it.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();
        if !self.root.exists() {
            return Ok(report);
        }
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable artifact entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::now());
            if modified >= cutoff {
                continue;
            }

            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let reference = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if self.resolve(&reference).is_err() {
                continue;
            }

            std::fs::remove_file(path).map_err(|e| StorageError::WriteFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            report.bytes_freed += metadata.len();
            report.removed.push(reference);
        }

        if !report.removed.is_empty() {
            log::info!(
                "Artifact retention removed {} blobs ({} bytes)",
                report.removed.len(),
                report.bytes_freed
            );
        }
        Ok(report)
    }
}

fn write_new(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;
    file.write_all(content).map_err(|e| StorageError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    file.sync_all().map_err(|e| StorageError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let a = store.put(ArtifactKind::RawOcr, b"{\"words\":[]}").unwrap();
        let b = store.put(ArtifactKind::RawOcr, b"{\"words\":[]}").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("raw_ocr/"));
        assert_eq!(store.get(&a).unwrap(), b"{\"words\":[]}");

        let other = store.put(ArtifactKind::Preprocessed, b"{\"words\":[]}").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let reference = store
            .put_json(ArtifactKind::Tokens, &vec!["Anna", "Petrova"])
            .unwrap();
        let back: Vec<String> = store.get_json(&reference).unwrap();
        assert_eq!(back, vec!["Anna", "Petrova"]);
    }

    #[test]
    fn test_rejects_traversal_references() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.get("../../etc/passwd"),
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.exists("upload/zz/not-a-hash"));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let hash = content_hash(b"never stored");
        let reference = format!("upload/{}/{}", &hash[..2], hash);
        assert!(matches!(store.get(&reference), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let kept = store.put(ArtifactKind::Upload, b"fresh").unwrap();

        let report = store.cleanup_older_than(Duration::from_secs(3600)).unwrap();
        assert!(report.removed.is_empty());
        assert!(store.exists(&kept));

        std::thread::sleep(Duration::from_millis(20));
        let report = store.cleanup_older_than(Duration::ZERO).unwrap();
        assert_eq!(report.removed, vec![kept.clone()]);
        assert_eq!(report.bytes_freed, 5);
        assert!(!store.exists(&kept));
    }

    #[test]
    fn test_content_hash_is_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
