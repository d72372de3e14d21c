use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::key::SafeKey;
use crate::traits::{BlobStore, BlobWriter};

/// A [BlobStore] which keeps one file per entry under a root directory.
///
/// Writes go to a temporary file in the root which is renamed over the entry only once the writer commits, so readers
/// never observe a half-written entry and an abandoned write leaves nothing behind.  Entry names are checked so that
/// nothing can resolve outside the root, primarily as a measure to detect bugs.
#[derive(Debug)]
pub struct FilesystemBlobStore {
    root_path: PathBuf,
}

fn conv_path(path: impl AsRef<Path>) -> Result<relative_path::RelativePathBuf, StoreError> {
    relative_path::RelativePathBuf::from_path(path.as_ref())
        .map_err(|_| StoreError::InvalidKey(path.as_ref().display().to_string()))
}

impl FilesystemBlobStore {
    /// Open a store rooted at `root_path`, creating the directory if needed.
    pub fn new(root_path: &Path) -> Result<FilesystemBlobStore, StoreError> {
        fs::create_dir_all(root_path)?;
        Ok(FilesystemBlobStore {
            root_path: root_path.to_path_buf(),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Resolve an entry name to its file, refusing anything which would land outside the root.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        // Go via `RelativePathBuf` so `..` segments are resolved logically rather than by the OS.
        let absolute = conv_path(name)?.to_logical_path(&self.root_path);
        if absolute == self.root_path || !absolute.starts_with(&self.root_path) {
            return Err(StoreError::InvalidKey(name.to_string()));
        }
        Ok(absolute)
    }
}

impl BlobStore for FilesystemBlobStore {
    fn get(&self, key: &SafeKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key.as_str())?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &SafeKey, writer: &mut dyn BlobWriter) -> Result<bool, StoreError> {
        let path = self.path_for(key.as_str())?;
        // Dropping the temporary file deletes it, which covers both the declined and the failed write.
        let mut staged = tempfile::NamedTempFile::new_in(&self.root_path)?;
        if !writer.write(&mut staged)? {
            tracing::trace!(key = %key, "writer declined, nothing stored");
            return Ok(false);
        }
        staged.flush()?;
        staged.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(true)
    }

    fn delete(&self, key: &SafeKey) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key.as_str())?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Error;

    use crate::key::Key;

    fn safe(id: &str) -> SafeKey {
        Key::new(id, 8, 8, ["d1", "t1"]).safe_key()
    }

    #[test]
    fn test_filesystem_store() {
        let tmp_dir = tempfile::tempdir().unwrap();

        // Root the store one level down so that we can test escaping it.
        let store_path = tmp_dir.path().join("actual_dir");
        let store = FilesystemBlobStore::new(&store_path).unwrap();
        assert!(store_path.is_dir());

        let mut writer = |sink: &mut dyn Write| -> std::io::Result<bool> {
            sink.write_all(b"aaaa")?;
            Ok(true)
        };
        assert!(store.put(&safe("a"), &mut writer).unwrap());
        assert_eq!(store.get(&safe("a")).unwrap(), Some(b"aaaa".to_vec()));
        assert!(store_path.join(safe("a").as_str()).is_file());
        assert_eq!(store.get(&safe("b")).unwrap(), None);

        // Overwriting replaces the entry.
        let mut second = |sink: &mut dyn Write| -> std::io::Result<bool> {
            sink.write_all(b"bb")?;
            Ok(true)
        };
        assert!(store.put(&safe("a"), &mut second).unwrap());
        assert_eq!(store.get(&safe("a")).unwrap(), Some(b"bb".to_vec()));

        assert!(store.delete(&safe("a")).unwrap());
        assert!(!store.delete(&safe("a")).unwrap());
        assert_eq!(store.get(&safe("a")).unwrap(), None);
    }

    #[test]
    fn abandoned_writes_leave_no_files() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(tmp_dir.path()).unwrap();

        let mut declined = |sink: &mut dyn Write| -> std::io::Result<bool> {
            sink.write_all(b"partial")?;
            Ok(false)
        };
        assert!(!store.put(&safe("a"), &mut declined).unwrap());

        let mut failing = |sink: &mut dyn Write| -> std::io::Result<bool> {
            sink.write_all(b"partial")?;
            Err(Error::new(ErrorKind::Other, "disk on fire"))
        };
        assert!(matches!(
            store.put(&safe("a"), &mut failing),
            Err(StoreError::Io(_))
        ));

        assert_eq!(store.get(&safe("a")).unwrap(), None);
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn names_outside_the_root_are_rejected() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store_path = tmp_dir.path().join("actual_dir");
        let store = FilesystemBlobStore::new(&store_path).unwrap();

        assert!(store.path_for("abc").is_ok());
        assert!(matches!(
            store.path_for("../d"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.path_for("a/../../d"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.path_for(".."), Err(StoreError::InvalidKey(_))));
    }
}
