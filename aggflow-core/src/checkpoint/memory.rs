use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Error;
use crate::Result;
use crate::checkpoint::{CheckpointStore, Location};

#[derive(Debug, Default)]
struct State {
    versions: BTreeMap<u64, Bytes>,
    committed: Option<u64>,
    fail_puts: usize,
    fail_commits: usize,
}

/// Keeps checkpoints in memory. Clones share the storage, which lets a test restart a pipeline
/// on the checkpoints of a previous one.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<State>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `puts` calls to `put_versioned` fail.
    pub fn fail_next_puts(&self, puts: usize) {
        self.state.lock().fail_puts = puts;
    }

    /// The next `commits` calls to `commit_pointer` fail.
    pub fn fail_next_commits(&self, commits: usize) {
        self.state.lock().fail_commits = commits;
    }

    pub fn committed_id(&self) -> Option<u64> {
        self.state.lock().committed
    }

    /// Ids of every checkpoint written, committed or not.
    pub fn versions(&self) -> Vec<u64> {
        self.state.lock().versions.keys().copied().collect()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn put_versioned(&self, id: u64, bytes: Bytes) -> Result<Location> {
        let mut state = self.state.lock();
        if state.fail_puts > 0 {
            state.fail_puts -= 1;
            return Err(Error::Io(format!("injected failure writing checkpoint {id}")));
        }
        state.versions.insert(id, bytes);
        Ok(Location {
            id,
            path: format!("memory://{id}"),
        })
    }

    async fn commit_pointer(&self, location: &Location) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(Error::Io(format!("injected failure committing {location}")));
        }
        if !state.versions.contains_key(&location.id) {
            return Err(Error::Checkpoint(format!(
                "cannot commit {location}, it was never written"
            )));
        }
        state.committed = Some(location.id);
        Ok(())
    }

    async fn get_latest_committed(&self) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        Ok(state
            .committed
            .and_then(|id| state.versions.get(&id).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_committed_checkpoints_are_visible() {
        let store = MemoryCheckpointStore::new();
        let location = store.put_versioned(1, Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(store.get_latest_committed().await.unwrap(), None);

        store.fail_next_commits(1);
        assert!(store.commit_pointer(&location).await.is_err());
        assert_eq!(store.get_latest_committed().await.unwrap(), None);

        store.commit_pointer(&location).await.unwrap();
        store.put_versioned(2, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(
            store.get_latest_committed().await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert_eq!(store.versions(), vec![1, 2]);
    }
}
