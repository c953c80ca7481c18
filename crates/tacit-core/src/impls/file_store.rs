//! FileStore - ディレクトリに 1 キー 1 ファイルで保存する DurableStore
//!
//! 書き込みは同じディレクトリの一時ファイルに書いてから rename するので、
//! 失敗しても以前の値が壊れない。

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::errors::StoreError;
use crate::ports::DurableStore;

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Write {
            key: dir.display().to_string(),
            reason: format!("failed to create store directory: {e}"),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }
}

/// Keys are mostly `[A-Za-z0-9._-]`; anything else is percent-encoded.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                name.push(byte as char)
            }
            other => name.push_str(&format!("%{other:02X}")),
        }
    }
    // "." and ".." are not usable file names
    if name.chars().all(|c| c == '.') {
        name = name.replace('.', "%2E");
    }
    name
}

impl DurableStore for FileStore {
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let write_err = |reason: String| StoreError::Write {
            key: key.to_string(),
            reason,
        };
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| write_err(format!("failed to create temp file: {e}")))?;
        temp.write_all(value.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| write_err(format!("failed to write temp file: {e}")))?;
        temp.persist(self.path_for(key))
            .map_err(|e| write_err(format!("failed to persist: {e}")))?;
        debug!(key, bytes = value.len(), "store entry written");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                debug!(key, "store entry removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Remove {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("tacit.silent.queues", r#"{"default":[]}"#).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("tacit.silent.queues").unwrap().as_deref(),
            Some(r#"{"default":[]}"#)
        );
    }

    #[test]
    fn missing_keys_read_as_none_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.get("nope").unwrap(), None);
        store.remove("nope").unwrap();

        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("k", "first").unwrap();
        store.set("k", "second").unwrap();

        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    #[case::plain("tacit.silent.op.op-01ABC", "tacit.silent.op.op-01ABC")]
    #[case::slash("a/b", "a%2Fb")]
    #[case::space("a b", "a%20b")]
    #[case::dots("..", "%2E%2E")]
    fn keys_map_to_safe_file_names(#[case] key: &str, #[case] expected: &str) {
        assert_eq!(file_name(key), expected);
    }
}
