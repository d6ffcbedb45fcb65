use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sink::{Sink, SinkItem, SinkResponse};

#[derive(Debug, Default)]
struct State {
    /// Delivered items by id. A repeated id overwrites, it never duplicates.
    items: BTreeMap<String, SinkItem>,
    /// Every delivery in arrival order, duplicates included.
    deliveries: Vec<String>,
    writes: usize,
    fail_writes: usize,
    fail_items: HashMap<String, usize>,
}

/// Keeps delivered items in memory. Clones share the same state, so a test keeps one clone and
/// hands the other to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<State>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every item of the next `writes` calls.
    pub fn fail_next_writes(&self, writes: usize) {
        self.state.lock().fail_writes = writes;
    }

    /// Fails the item with this id the next `times` it is written.
    pub fn fail_item(&self, id: impl Into<String>, times: usize) {
        self.state.lock().fail_items.insert(id.into(), times);
    }

    /// Delivered items, one per id, ordered by id.
    pub fn items(&self) -> Vec<SinkItem> {
        self.state.lock().items.values().cloned().collect()
    }

    /// Ids of all successful deliveries in the order they arrived.
    pub fn deliveries(&self) -> Vec<String> {
        self.state.lock().deliveries.clone()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for MemorySink {
    async fn write(&mut self, items: Vec<SinkItem>) -> crate::Result<Vec<SinkResponse>> {
        let mut state = self.state.lock();
        state.writes += 1;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Ok(items
                .into_iter()
                .map(|item| SinkResponse::failed(item.id, "injected write failure"))
                .collect());
        }

        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            if let Some(remaining) = state.fail_items.get_mut(&item.id)
                && *remaining > 0
            {
                *remaining -= 1;
                responses.push(SinkResponse::failed(item.id, "injected item failure"));
                continue;
            }
            responses.push(SinkResponse::success(&item.id));
            state.deliveries.push(item.id.clone());
            state.items.insert(item.id.clone(), item);
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::record;

    #[tokio::test]
    async fn duplicates_do_not_show_twice() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let item = SinkItem::record(record(0, 1, "A", 1_000));
        writer.write(vec![item.clone()]).await.unwrap();
        writer.write(vec![item]).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.deliveries(), vec!["0-1", "0-1"]);
    }

    #[tokio::test]
    async fn injected_failures() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        sink.fail_item("0-2", 1);
        let responses = writer
            .write(vec![
                SinkItem::record(record(0, 1, "A", 1_000)),
                SinkItem::record(record(0, 2, "A", 1_000)),
            ])
            .await
            .unwrap();
        assert_eq!(responses[0], SinkResponse::success("0-1"));
        assert_eq!(responses[1], SinkResponse::failed("0-2", "injected item failure"));

        sink.fail_next_writes(1);
        let responses = writer
            .write(vec![SinkItem::record(record(0, 2, "A", 1_000))])
            .await
            .unwrap();
        assert!(matches!(responses[0].status, crate::sink::SinkStatus::Failed(_)));
        assert_eq!(sink.writes(), 2);
    }
}
