use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{EntryStore, StoreError, StoreFactory, check_key};
use crate::entry::{Entry, EntryId};

/// Filesystem [`EntryStore`]: one `<digest>.json` file per entry.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write never leaves a torn entry behind.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Factory placing each instance in its own subdirectory of `root`.
    pub fn factory(root: impl Into<PathBuf>) -> StoreFactory {
        let root = root.into();
        Arc::new(move |id: &str| {
            Arc::new(Self::new(root.join(instance_dir_name(id)))) as Arc<dyn EntryStore>
        })
    }

    /// File holding `id`, or `None` if the id is not a plain hex digest and
    /// so could name a path outside `dir`.
    fn path_for(&self, id: &EntryId) -> Option<PathBuf> {
        id.is_well_formed()
            .then(|| self.dir.join(format!("{}.json", id.digest())))
    }
}

/// Filesystem-safe directory name for an instance id.
fn instance_dir_name(id: &str) -> String {
    let readable: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    let digest = blake3::hash(id.as_bytes()).to_hex();
    format!("{readable}-{}", &digest[..12])
}

#[async_trait]
impl EntryStore for FsStore {
    async fn has(&self, id: &EntryId) -> Result<bool, StoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, id: &EntryId, entry: &Entry) -> Result<(), StoreError> {
        check_key(id, entry)?;
        let path = self
            .path_for(id)
            .ok_or_else(|| StoreError::InvalidKey(id.clone()))?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(entry = %id, path = %path.display(), "stored entry");
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = tokio::fs::read(&path).await?;
                entries.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(entries)
    }
}
