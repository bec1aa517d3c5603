use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// A file target that is only rewritten when its content digest changed
/// since the last successful write.
///
/// Writes are all-or-nothing: the bytes land in a sibling temp file that
/// is renamed over the target, so readers never observe a torn flush.
pub struct DiffAwareFile {
    path: PathBuf,
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl DiffAwareFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_digest: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `bytes` as the on-disk state without writing, used after a
    /// successful load so an immediate flush of unchanged data is a no-op.
    pub fn prime(&self, bytes: &[u8]) {
        *self.last_digest.lock().unwrap() = Some(digest(bytes));
    }

    /// Write `bytes` if they differ from the last written content.
    /// Returns whether a write happened.
    pub fn store(&self, bytes: &[u8]) -> std::io::Result<bool> {
        let current = digest(bytes);
        let mut last = self.last_digest.lock().unwrap();
        if *last == Some(current) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        *last = Some(current);
        Ok(true)
    }

    /// Read the target and prime the digest, `None` when it does not exist.
    pub fn load(&self) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                self.prime(&bytes);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
