//! Atomic document writer: serialize to a temporary sibling, then rename
//! into place. Readers never observe a half-written document.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write raw bytes atomically.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Serialize a document as YAML and write it atomically.
pub fn atomic_write_yaml<T: Serialize>(path: &Path, document: &T) -> std::io::Result<()> {
    let yaml = serde_yaml::to_string(document).map_err(std::io::Error::other)?;
    atomic_write_bytes(path, yaml.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_replaces_existing_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("doc.yml");
        atomic_write_bytes(&path, b"first").unwrap();
        atomic_write_bytes(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("doc.yml.tmp").exists());
    }

    #[test]
    fn write_creates_missing_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/doc.yml");
        atomic_write_bytes(&path, b"content").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("list.yml");
        let doc = vec!["a".to_string(), "b".to_string()];
        atomic_write_yaml(&path, &doc).unwrap();
        let read: Vec<String> =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, doc);
    }
}
