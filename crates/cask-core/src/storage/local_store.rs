use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::debug;

use crate::error::{CaskError, Result};
use crate::storage::{BlobId, BlobMetadata, BlobStore, PutOptions};
use crate::trace::CancelToken;

const TEMP_PREFIX: &str = ".tmp-";

/// Seam over the file being written, so tests can observe the
/// write/sync/close ordering and inject sync failures.
pub(crate) trait WriteFile: Send {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
    fn close(self: Box<Self>) -> std::io::Result<()>;
}

pub(crate) trait WriteFileFactory: Send + Sync {
    fn create(&self, path: &Path) -> std::io::Result<Box<dyn WriteFile>>;
}

struct StdWriteFile(fs::File);

impl WriteFile for StdWriteFile {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.0.write_all(data)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.0.sync_all()
    }

    fn close(self: Box<Self>) -> std::io::Result<()> {
        // fs::File has no explicit close; dropping closes the descriptor.
        Ok(())
    }
}

struct StdWriteFileFactory;

impl WriteFileFactory for StdWriteFileFactory {
    fn create(&self, path: &Path) -> std::io::Result<Box<dyn WriteFile>> {
        Ok(Box::new(StdWriteFile(
            fs::OpenOptions::new().write(true).create_new(true).open(path)?,
        )))
    }
}

/// Filesystem-backed blob store.
///
/// Writes go to a temp file in the target directory and are published with
/// `write → sync → close → rename`; a failure at any step leaves no
/// partially named output.
pub struct LocalStore {
    root: PathBuf,
    files: Box<dyn WriteFileFactory>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_file_factory(root, Box::new(StdWriteFileFactory))
    }

    pub(crate) fn with_file_factory(
        root: impl Into<PathBuf>,
        files: Box<dyn WriteFileFactory>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: fs::canonicalize(&root)?,
            files,
        })
    }

    /// Resolve a blob ID to a path under the root, rejecting traversal.
    fn resolve(&self, id: &BlobId) -> Result<PathBuf> {
        let path = Path::new(id.as_str());
        for component in path.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(CaskError::InvalidFormat(format!(
                        "unsafe blob id: '{id}'"
                    )))
                }
            }
        }
        Ok(self.root.join(path))
    }

    fn temp_path(&self, final_path: &Path) -> PathBuf {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        final_path.with_file_name(format!("{TEMP_PREFIX}{name}-{}", hex::encode(suffix)))
    }

    fn list_dir(
        &self,
        cancel: &CancelToken,
        dir: &Path,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut items: Vec<_> = entries.collect::<std::io::Result<_>>()?;
        items.sort_by_key(|e| e.file_name());

        for entry in items {
            cancel.check()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| CaskError::Other("path outside store root".into()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            if file_type.is_dir() {
                // Descend when the directory could still contain matches.
                if rel.starts_with(prefix) || prefix.starts_with(&format!("{rel}/")) {
                    self.list_dir(cancel, &entry.path(), prefix, callback)?;
                }
            } else if file_type.is_file() && rel.starts_with(prefix) {
                let meta = entry.metadata()?;
                callback(&BlobMetadata {
                    id: BlobId::new(rel)?,
                    length: meta.len(),
                    timestamp: DateTime::<Utc>::from(meta.modified()?),
                })?;
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalStore {
    fn get_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let path = self.resolve(id)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::BlobNotFound(id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len();
        let wanted = match length {
            Some(l) => l,
            None => size.saturating_sub(offset),
        };
        if offset + wanted > size {
            return Err(CaskError::InvalidRange {
                id: id.clone(),
                offset,
                length: wanted,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; wanted as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata> {
        cancel.check()?;
        let path = self.resolve(id)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(BlobMetadata {
                id: id.clone(),
                length: meta.len(),
                timestamp: DateTime::<Utc>::from(meta.modified()?),
            }),
            Ok(_) => Err(CaskError::BlobNotFound(id.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CaskError::BlobNotFound(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<()> {
        cancel.check()?;
        let final_path = self.resolve(id)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.temp_path(&final_path);
        let mut file = self.files.create(&temp_path)?;

        let write_result = file
            .write_all(data)
            .map_err(|e| CaskError::Other(format!("can't write temporary file data: {e}")))
            .and_then(|()| {
                // Sync must complete before close; a dirty close is a contract
                // violation observable through the factory seam.
                file.sync()
                    .map_err(|e| CaskError::Other(format!("can't sync temporary file data: {e}")))
            });

        if let Err(e) = write_result {
            let _ = file.close();
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = file.close() {
            let _ = fs::remove_file(&temp_path);
            return Err(CaskError::Other(format!(
                "can't close temporary file: {e}"
            )));
        }

        // Last chance to abort without committing.
        if let Err(e) = cancel.check() {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if opts.do_not_recreate {
            // Atomic publish: hard_link fails when the target already exists.
            match fs::hard_link(&temp_path, &final_path) {
                Ok(()) => {
                    let _ = fs::remove_file(&temp_path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(CaskError::BlobAlreadyExists(id.clone()));
                }
                Err(e) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(e.into());
                }
            }
        } else if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        if let Some(mtime) = opts.set_mod_time {
            let f = fs::File::open(&final_path)?;
            f.set_modified(mtime.into())?;
        }

        debug!(id = %id, bytes = data.len(), "put blob");
        Ok(())
    }

    fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()> {
        cancel.check()?;
        let path = self.resolve(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_blobs(
        &self,
        cancel: &CancelToken,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        cancel.check()?;
        let root = self.root.clone();
        self.list_dir(cancel, &root, prefix, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list_all_blobs;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let st = LocalStore::new(dir.path()).unwrap();
        (dir, st)
    }

    fn bid(s: &str) -> BlobId {
        BlobId::new(s).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        st.put_blob(&cancel, &bid("pabc"), b"hello world", &PutOptions::default())
            .unwrap();

        assert_eq!(
            st.get_blob(&cancel, &bid("pabc"), 0, None).unwrap(),
            b"hello world"
        );
        assert_eq!(
            st.get_blob(&cancel, &bid("pabc"), 6, Some(5)).unwrap(),
            b"world"
        );
    }

    #[test]
    fn get_missing_blob() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        assert!(matches!(
            st.get_blob(&cancel, &bid("pmissing"), 0, None),
            Err(CaskError::BlobNotFound(_))
        ));
        assert!(matches!(
            st.get_metadata(&cancel, &bid("pmissing")),
            Err(CaskError::BlobNotFound(_))
        ));
    }

    #[test]
    fn get_invalid_range() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        st.put_blob(&cancel, &bid("pr"), b"12345", &PutOptions::default())
            .unwrap();
        assert!(matches!(
            st.get_blob(&cancel, &bid("pr"), 3, Some(10)),
            Err(CaskError::InvalidRange { .. })
        ));
    }

    #[test]
    fn do_not_recreate_is_atomic_refusal() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        let opts = PutOptions {
            do_not_recreate: true,
            ..Default::default()
        };
        st.put_blob(&cancel, &bid("n1"), b"first", &opts).unwrap();
        assert!(matches!(
            st.put_blob(&cancel, &bid("n1"), b"second", &opts),
            Err(CaskError::BlobAlreadyExists(_))
        ));
        assert_eq!(st.get_blob(&cancel, &bid("n1"), 0, None).unwrap(), b"first");
    }

    #[test]
    fn delete_missing_is_success() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        st.delete_blob(&cancel, &bid("pgone")).unwrap();
    }

    #[test]
    fn list_filters_by_prefix_and_skips_temp_files() {
        let (dir, st) = store();
        let cancel = CancelToken::new();
        st.put_blob(&cancel, &bid("p1"), b"a", &PutOptions::default())
            .unwrap();
        st.put_blob(&cancel, &bid("p2"), b"bb", &PutOptions::default())
            .unwrap();
        st.put_blob(&cancel, &bid("x0_aa"), b"ccc", &PutOptions::default())
            .unwrap();
        std::fs::write(dir.path().join(".tmp-p3-deadbeef"), b"junk").unwrap();

        let packs = list_all_blobs(&st, &cancel, "p").unwrap();
        assert_eq!(packs.len(), 2);
        assert_eq!(packs[0].id.as_str(), "p1");
        assert_eq!(packs[0].length, 1);

        let all = list_all_blobs(&st, &cancel, "").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn rejects_traversal() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        let id = bid("a/../escape");
        assert!(st.get_blob(&cancel, &id, 0, None).is_err());
        assert!(st
            .put_blob(&cancel, &id, b"bad", &PutOptions::default())
            .is_err());
    }

    #[test]
    fn cancelled_put_leaves_no_blob() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            st.put_blob(&cancel, &bid("pc"), b"data", &PutOptions::default()),
            Err(CaskError::Cancelled)
        ));
        let fresh = CancelToken::new();
        assert!(matches!(
            st.get_metadata(&fresh, &bid("pc")),
            Err(CaskError::BlobNotFound(_))
        ));
    }

    #[test]
    fn set_mod_time_is_honored() {
        let (_dir, st) = store();
        let cancel = CancelToken::new();
        let mtime = "2020-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        st.put_blob(
            &cancel,
            &bid("pmt"),
            b"x",
            &PutOptions {
                set_mod_time: Some(mtime),
                ..Default::default()
            },
        )
        .unwrap();
        let meta = st.get_metadata(&cancel, &bid("pmt")).unwrap();
        assert_eq!(meta.timestamp, mtime);
    }
}
