use crate::sink::{Sink, SinkItem, SinkResponse};

/// Blackhole is a sink to emulate /dev/null
pub struct BlackholeSink;

impl Sink for BlackholeSink {
    async fn write(&mut self, items: Vec<SinkItem>) -> crate::Result<Vec<SinkResponse>> {
        Ok(items
            .into_iter()
            .map(|item| SinkResponse::success(item.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::record;

    #[tokio::test]
    async fn test_black_hole() {
        let mut sink = BlackholeSink;
        let items = vec![
            SinkItem::record(record(0, 1, "A", 1_000)),
            SinkItem::record(record(0, 2, "A", 2_000)),
        ];
        let responses = sink.write(items).await.unwrap();
        assert_eq!(
            responses,
            vec![SinkResponse::success("0-1"), SinkResponse::success("0-2")]
        );
    }
}
