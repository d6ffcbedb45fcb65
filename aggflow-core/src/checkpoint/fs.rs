//! Every checkpoint goes to its own file `chk-<id>.json`, written through a temporary file that
//! is synced and renamed into place. Committing rewrites the `LATEST` pointer the same way, so a
//! crash at any point leaves either the old or the new pointer, never a torn one. Only the newest
//! `retain` checkpoint files are kept.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::Error;
use crate::Result;
use crate::checkpoint::{CheckpointStore, Location};

const LATEST_POINTER: &str = "LATEST";
const CHECKPOINT_PREFIX: &str = "chk-";
const CHECKPOINT_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

pub struct FsCheckpointStore {
    dir: PathBuf,
    retain: usize,
}

fn file_name(id: u64) -> String {
    format!("{CHECKPOINT_PREFIX}{id:020}{CHECKPOINT_SUFFIX}")
}

fn parse_id(name: &str) -> Option<u64> {
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?
        .parse()
        .ok()
}

/// Writes `bytes` to `path` atomically: temporary file, fsync, rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

impl FsCheckpointStore {
    pub fn new(dir: PathBuf, retain: usize) -> Self {
        Self {
            dir,
            retain: retain.max(1),
        }
    }

    async fn ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(parse_id) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drops the oldest files beyond `retain`, never the committed one. Runs after the pointer
    /// moved, so failures are logged and left for the next commit to clean up.
    async fn apply_retention(&self, committed: u64) {
        let ids = match self.ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(?e, "Listing checkpoints for retention");
                return;
            }
        };
        let excess = ids.len().saturating_sub(self.retain);
        for id in ids.into_iter().take(excess).filter(|id| *id != committed) {
            let path = self.dir.join(file_name(id));
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), ?e, "Removing old checkpoint");
            } else {
                debug!(id, "Removed old checkpoint");
            }
        }
    }
}

impl CheckpointStore for FsCheckpointStore {
    async fn put_versioned(&self, id: u64, bytes: Bytes) -> Result<Location> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name(id));
        write_atomic(&path, &bytes).await?;
        Ok(Location {
            id,
            path: path.to_string_lossy().into_owned(),
        })
    }

    async fn commit_pointer(&self, location: &Location) -> Result<()> {
        let name = file_name(location.id);
        if !fs::try_exists(self.dir.join(&name)).await? {
            return Err(Error::Checkpoint(format!(
                "cannot commit {location}, it was never written"
            )));
        }
        write_atomic(&self.dir.join(LATEST_POINTER), name.as_bytes()).await?;
        self.apply_retention(location.id).await;
        Ok(())
    }

    async fn get_latest_committed(&self) -> Result<Option<Bytes>> {
        let name = match fs::read_to_string(self.dir.join(LATEST_POINTER)).await {
            Ok(name) => name,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let name = name.trim();
        if parse_id(name).is_none() {
            return Err(Error::Checkpoint(format!("corrupt checkpoint pointer {name:?}")));
        }
        let bytes = fs::read(self.dir.join(name)).await.map_err(|e| {
            Error::Checkpoint(format!("reading committed checkpoint {name}: {e}"))
        })?;
        Ok(Some(Bytes::from(bytes)))
    }
}
