//! sled-backed persistence shared by the nonce store and the transaction log

use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};

/// The database and its trees. Dropping this releases the sled file lock.
struct OpenDb {
    db: sled::Db,
    trees: HashMap<&'static str, sled::Tree>,
}

/// One open sled database plus the drain gate guarding its shutdown.
///
/// Critical sections hold a read guard on `drain`; the final close takes
/// the write guard, so it waits for every in-flight section before
/// flushing and dropping the database.
pub struct SledBackend {
    path: PathBuf,
    flush_on_write: bool,
    open: SyncRwLock<Option<OpenDb>>,
    drain: Arc<RwLock<()>>,
}

impl SledBackend {
    /// Open the database at `path` along with the named trees
    pub fn open(path: &Path, flush_on_write: bool, tree_names: &[&'static str]) -> NonceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                NonceError::ResourceUnavailable(format!("{}: {}", parent.display(), e))
            })?;
        }
        let db = sled::open(path)
            .map_err(|e| NonceError::ResourceUnavailable(format!("{}: {}", path.display(), e)))?;
        let mut trees = HashMap::with_capacity(tree_names.len());
        for name in tree_names {
            trees.insert(*name, db.open_tree(*name)?);
        }
        info!(path = %path.display(), recovered = db.was_recovered(), "Opened storage");
        Ok(Self {
            path: path.to_path_buf(),
            flush_on_write,
            open: SyncRwLock::new(Some(OpenDb { db, trees })),
            drain: Arc::new(RwLock::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn closed_error(&self) -> NonceError {
        NonceError::ResourceUnavailable(format!("{} is closed", self.path.display()))
    }

    /// Handle to a tree opened with the backend; fails once closed.
    ///
    /// Callers keep the handle for one operation only.
    pub fn tree(&self, name: &str) -> NonceResult<sled::Tree> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed_error())?;
        open.trees
            .get(name)
            .cloned()
            .ok_or_else(|| NonceError::Internal(format!("tree {} was not opened", name)))
    }

    pub fn generate_id(&self) -> NonceResult<u64> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed_error())?;
        Ok(open.db.generate_id()?)
    }

    pub fn is_closed(&self) -> bool {
        self.open.read().is_none()
    }

    pub fn ensure_open(&self) -> NonceResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Make preceding writes durable before the caller returns
    pub async fn persist(&self) -> NonceResult<()> {
        if !self.flush_on_write {
            return Ok(());
        }
        let db = self
            .open
            .read()
            .as_ref()
            .map(|open| open.db.clone())
            .ok_or_else(|| self.closed_error())?;
        db.flush_async().await?;
        Ok(())
    }

    /// Enter a critical section; fails once the backend is closed
    pub async fn enter(&self) -> NonceResult<OwnedRwLockReadGuard<()>> {
        let guard = self.drain.clone().read_owned().await;
        self.ensure_open()?;
        Ok(guard)
    }

    /// Wait for in-flight sections, flush, and drop the database so its
    /// file lock is released.
    ///
    /// Returns `false` if the backend was already closed.
    pub async fn drain_and_close(&self) -> NonceResult<bool> {
        let _exclusive = self.drain.write().await;
        let Some(open) = self.open.write().take() else {
            return Ok(false);
        };
        open.db.flush_async().await?;
        drop(open);
        debug!(path = %self.path.display(), "Storage drained, flushed and released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_close_releases_file_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let first = SledBackend::open(&path, true, &["t"]).unwrap();
        first.tree("t").unwrap().insert(b"k", b"v".as_slice()).unwrap();

        assert!(first.drain_and_close().await.unwrap());
        assert!(!first.drain_and_close().await.unwrap());
        assert!(matches!(first.tree("t"), Err(NonceError::ResourceUnavailable(_))));

        // `first` is still alive, yet the path can be opened again
        let second = SledBackend::open(&path, true, &["t"]).unwrap();
        assert_eq!(
            second.tree("t").unwrap().get(b"k").unwrap().as_deref(),
            Some(b"v".as_slice())
        );
    }

    #[test]
    fn test_unknown_tree_is_an_error() {
        let dir = TempDir::new().unwrap();
        let backend = SledBackend::open(&dir.path().join("db"), false, &["t"]).unwrap();
        assert!(matches!(backend.tree("other"), Err(NonceError::Internal(_))));
    }
}
