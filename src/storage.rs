use std::path::PathBuf;

use thiserror::Error;

use crate::eid::Eid;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The persistence layer could not be initialized. Every dependent
    /// operation propagates this instead of silently no-opping.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt collection {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

/// Named-blob persistence for the JSON collections and binary files.
///
/// Writes are atomic per blob: readers observe either the previous or the
/// next content, never a partial write.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> Result<(), StoreError>;
    fn read(&self, ident: &str) -> Result<Vec<u8>, StoreError>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
    /// On-disk size of one blob in bytes, 0 when absent.
    fn size_of(&self, ident: &str) -> u64;
}

#[derive(Clone)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: &str) -> Result<Self, StoreError> {
        let path = PathBuf::from(storage_dir);
        std::fs::create_dir_all(&path)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", path.display())))?;
        Ok(BackendLocal { base_dir: path })
    }

    fn blob_path(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.blob_path(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(self.blob_path(ident))?)
    }

    fn write(&self, ident: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(ident);
        let temp_path = self.base_dir.join(format!("{}-{ident}", Eid::new()));

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    fn delete(&self, ident: &str) -> Result<(), StoreError> {
        Ok(std::fs::remove_file(self.blob_path(ident))?)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = std::fs::read_dir(&self.base_dir)?;

        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.is_file() {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    fn size_of(&self, ident: &str) -> u64 {
        std::fs::metadata(self.blob_path(ident))
            .map(|meta| meta.len())
            .unwrap_or(0)
    }
}

impl BackendLocal {
    pub fn file_path(&self, ident: &str) -> PathBuf {
        self.blob_path(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path().to_str().unwrap()).unwrap();

        store.write("edges.json", b"[]").unwrap();
        assert!(store.exists("edges.json"));
        assert_eq!(store.read("edges.json").unwrap(), b"[]");
        assert_eq!(store.size_of("edges.json"), 2);
    }

    #[test]
    fn write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path().to_str().unwrap()).unwrap();

        store.write("rules.json", b"first").unwrap();
        store.write("rules.json", b"second").unwrap();
        assert_eq!(store.read("rules.json").unwrap(), b"second");

        // no temp files left behind
        let names = store.list().unwrap();
        assert_eq!(names, vec!["rules.json".to_string()]);
    }

    #[test]
    fn missing_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path().to_str().unwrap()).unwrap();

        assert!(!store.exists("nope.json"));
        assert!(store.read("nope.json").is_err());
        assert_eq!(store.size_of("nope.json"), 0);
    }

    #[test]
    fn unavailable_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("occupied");
        std::fs::write(&file_path, b"x").unwrap();

        // a regular file cannot become the base directory
        let result = BackendLocal::new(file_path.to_str().unwrap());
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
