//! Output pipeline — batches results and fans them out to file writers
//! and real-time endpoints.

pub mod batch;
pub mod file;
pub mod realtime;
pub mod timeseries;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::model::OutputConfig;
use crate::results::{TestResult, TestSummary};
use batch::BatchBuffer;
use file::FileBatch;
use realtime::{GraphiteEndpoint, WebhookEndpoint, WebsocketEndpoint};
use timeseries::TimeSeriesWriter;

/// Fans batches out to every configured output. File writers run as their
/// own tasks behind bounded channels; real-time endpoint failures are
/// logged and never block one another.
pub struct OutputPipeline {
    file_writers: Vec<(mpsc::Sender<FileBatch>, JoinHandle<()>)>,
    graphite: Vec<GraphiteEndpoint>,
    webhooks: Vec<WebhookEndpoint>,
    websockets: Vec<WebsocketEndpoint>,
    influx: Vec<TimeSeriesWriter>,
    buffer: BatchBuffer,
    batch_number: u64,
    test_start_ms: i64,
}

impl OutputPipeline {
    pub fn new(
        outputs: &[OutputConfig],
        client: Arc<reqwest::Client>,
        test_name: &str,
    ) -> Self {
        let mut pipeline = Self {
            file_writers: Vec::new(),
            graphite: Vec::new(),
            webhooks: Vec::new(),
            websockets: Vec::new(),
            influx: Vec::new(),
            buffer: BatchBuffer::default(),
            batch_number: 0,
            test_start_ms: crate::clock::epoch_ms(),
        };

        for output in outputs {
            match output {
                OutputConfig::Jsonl { path } => {
                    pipeline
                        .file_writers
                        .push(file::spawn_jsonl_writer(PathBuf::from(path)));
                }
                OutputConfig::Csv { path } => {
                    pipeline
                        .file_writers
                        .push(file::spawn_csv_writer(PathBuf::from(path)));
                }
                OutputConfig::JsonSnapshot { path } => {
                    pipeline
                        .file_writers
                        .push(file::spawn_snapshot_writer(PathBuf::from(path)));
                }
                OutputConfig::Graphite { host, port, prefix } => {
                    pipeline.graphite.push(GraphiteEndpoint {
                        host: host.clone(),
                        port: *port,
                        prefix: prefix.clone(),
                    });
                }
                OutputConfig::Webhook { url } => {
                    pipeline.webhooks.push(WebhookEndpoint {
                        url: url.clone(),
                        client: Arc::clone(&client),
                    });
                }
                OutputConfig::Influxdb { url, database } => {
                    pipeline.influx.push(TimeSeriesWriter::new(
                        Arc::clone(&client),
                        url,
                        database.as_deref(),
                        test_name,
                    ));
                }
                OutputConfig::Websocket { url } => {
                    pipeline
                        .websockets
                        .push(WebsocketEndpoint { url: url.clone() });
                }
            }
        }

        pipeline
    }

    /// True when no output is configured at all; callers may skip feeding
    /// the pipeline entirely.
    pub fn is_empty(&self) -> bool {
        self.file_writers.is_empty()
            && self.graphite.is_empty()
            && self.webhooks.is_empty()
            && self.websockets.is_empty()
            && self.influx.is_empty()
    }

    /// Buffer one result, flushing when the batch size is reached.
    pub async fn submit(&mut self, result: TestResult) {
        if let Some(batch) = self.buffer.push(result) {
            self.flush(batch).await;
        }
    }

    /// Interval flush; called by the engine's ticker.
    pub async fn tick(&mut self) {
        let batch = self.buffer.take();
        if !batch.is_empty() {
            self.flush(batch).await;
        }
        for influx in &mut self.influx {
            influx.tick().await;
        }
    }

    /// Flush the residue, push the summary point, and wait for the file
    /// writer tasks to drain.
    pub async fn finalize(mut self, summary: &TestSummary) {
        let batch = self.buffer.take();
        if !batch.is_empty() {
            self.flush(batch).await;
        }
        for influx in &mut self.influx {
            influx.add_summary(summary).await;
        }
        for (tx, handle) in self.file_writers {
            drop(tx);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "file writer task failed");
            }
        }
    }

    async fn flush(&mut self, batch: Vec<TestResult>) {
        self.batch_number += 1;
        let batch_number = self.batch_number;

        for (tx, _) in &self.file_writers {
            let file_batch = FileBatch {
                batch_number,
                results: batch.clone(),
            };
            if tx.send(file_batch).await.is_err() {
                tracing::warn!("file writer task is gone; batch dropped");
            }
        }

        for endpoint in &self.graphite {
            if let Err(e) = endpoint.send(&batch).await {
                tracing::warn!(endpoint = "graphite", "{e}");
            }
        }
        for endpoint in &self.webhooks {
            if let Err(e) = endpoint
                .send(&batch, batch_number, self.test_start_ms)
                .await
            {
                tracing::warn!(endpoint = "webhook", "{e}");
            }
        }
        for endpoint in &self.websockets {
            if let Err(e) = endpoint.send(&batch, batch_number).await {
                tracing::warn!(endpoint = "websocket", "{e}");
            }
        }
        for influx in &mut self.influx {
            for result in &batch {
                influx.add_result(result).await;
            }
        }
    }
}
