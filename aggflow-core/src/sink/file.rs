use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::Result;
use crate::sink::{Sink, SinkItem, SinkResponse};

/// Appends every item as a JSON line. The batch is written and flushed as a whole, an I/O error
/// fails every item of it.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    async fn append(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                self.file.insert(file)
            }
        };
        file.write_all(buf).await?;
        file.flush().await
    }
}

impl Sink for FileSink {
    async fn write(&mut self, items: Vec<SinkItem>) -> Result<Vec<SinkResponse>> {
        let mut buf = Vec::new();
        let mut responses = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        for item in &items {
            match serde_json::to_writer(&mut buf, item) {
                Ok(()) => {
                    buf.push(b'\n');
                    ids.push(item.id.clone());
                }
                Err(e) => responses.push(SinkResponse::failed(&item.id, e.to_string())),
            }
        }

        match self.append(&buf).await {
            Ok(()) => responses.extend(ids.into_iter().map(SinkResponse::success)),
            Err(e) => {
                warn!(path = %self.path.display(), ?e, "Appending to file sink");
                // reopen on the next attempt
                self.file = None;
                let reason = e.to_string();
                responses.extend(ids.into_iter().map(|id| SinkResponse::failed(id, &reason)));
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::record;
    use crate::sink::SinkPayload;

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("records.jsonl");
        let mut sink = FileSink::new(path.clone());

        let responses = sink
            .write(vec![SinkItem::record(record(0, 1, "A", 1_000))])
            .await
            .unwrap();
        assert_eq!(responses, vec![SinkResponse::success("0-1")]);
        sink.write(vec![SinkItem::record(record(0, 2, "B", 2_000))])
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let items: Vec<SinkItem> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1].payload, SinkPayload::Record(r) if r.key == "B"));
    }

    #[tokio::test]
    async fn io_errors_fail_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let mut sink = FileSink::new(dir.path().to_path_buf());
        let responses = sink
            .write(vec![SinkItem::record(record(0, 1, "A", 1_000))])
            .await
            .unwrap();
        assert!(matches!(
            responses.as_slice(),
            [SinkResponse { status: crate::sink::SinkStatus::Failed(_), .. }]
        ));
    }
}
