//! Append-only file writers. Each output file is owned by a single writer
//! task; producers post batches through a bounded channel, so concurrent
//! flushes can never interleave writes within one file.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::results::TestResult;

/// One flushed batch heading for a file writer.
pub struct FileBatch {
    pub batch_number: u64,
    pub results: Vec<TestResult>,
}

const WRITER_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// JSONL
// ---------------------------------------------------------------------------

/// Append-only JSONL writer: one JSON record per line, with a sidecar
/// `<path>.batch` file tracking the last flushed batch number.
pub fn spawn_jsonl_writer(path: PathBuf) -> (mpsc::Sender<FileBatch>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FileBatch>(WRITER_QUEUE);
    let handle = tokio::spawn(async move {
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open JSONL output");
                return;
            }
        };
        let mut file = tokio::io::BufWriter::new(file);
        let sidecar = path.with_extension(format!(
            "{}batch",
            path.extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));

        while let Some(batch) = rx.recv().await {
            let mut out = String::new();
            for result in &batch.results {
                match serde_json::to_string(result) {
                    Ok(line) => {
                        out.push_str(&line);
                        out.push('\n');
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize result"),
                }
            }
            if let Err(e) = file.write_all(out.as_bytes()).await {
                tracing::error!(path = %path.display(), error = %e, "JSONL write failed");
            }
            if let Err(e) = file.flush().await {
                tracing::error!(path = %path.display(), error = %e, "JSONL flush failed");
            }
            if let Err(e) =
                tokio::fs::write(&sidecar, batch.batch_number.to_string()).await
            {
                tracing::debug!(error = %e, "failed to update batch sidecar");
            }
        }
    });
    (tx, handle)
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// Fixed CSV column order, matching the result record's field order.
/// Header maps and custom metrics are JSON-encoded into single columns.
pub const CSV_HEADER: &str = "id,vu_id,iteration,scenario,action,step_name,thread_name,\
timestamp,duration,response_time,success,status,status_text,error,error_code,\
response_size,request_url,request_method,connect_time,latency,sent_bytes,\
headers_size_sent,body_size_sent,headers_size_received,body_size_received,\
data_type,custom_metrics";

/// Quote a CSV field when needed; embedded quotes are doubled.
pub fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row(r: &TestResult) -> String {
    let custom_metrics = if r.custom_metrics.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&r.custom_metrics).unwrap_or_default()
    };
    [
        r.id.to_string(),
        r.vu_id.to_string(),
        r.iteration.to_string(),
        csv_escape(&r.scenario),
        csv_escape(&r.action),
        csv_escape(&r.step_name),
        csv_escape(&r.thread_name),
        r.timestamp.to_string(),
        r.duration.to_string(),
        r.response_time.to_string(),
        r.success.to_string(),
        r.status.to_string(),
        csv_escape(&r.status_text),
        csv_escape(r.error.as_deref().unwrap_or("")),
        csv_escape(r.error_code.as_deref().unwrap_or("")),
        r.response_size.to_string(),
        csv_escape(&r.request_url),
        csv_escape(&r.request_method),
        r.connect_time.to_string(),
        r.latency.to_string(),
        r.sent_bytes.to_string(),
        r.headers_size_sent.to_string(),
        r.body_size_sent.to_string(),
        r.headers_size_received.to_string(),
        r.body_size_received.to_string(),
        csv_escape(r.data_type.as_deref().unwrap_or("")),
        csv_escape(&custom_metrics),
    ]
    .join(",")
}

/// Append-only CSV writer with a fixed header row written on creation.
pub fn spawn_csv_writer(path: PathBuf) -> (mpsc::Sender<FileBatch>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FileBatch>(WRITER_QUEUE);
    let handle = tokio::spawn(async move {
        let fresh = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open CSV output");
                return;
            }
        };
        let mut file = tokio::io::BufWriter::new(file);
        if fresh {
            let header = format!("{CSV_HEADER}\n");
            if let Err(e) = file.write_all(header.as_bytes()).await {
                tracing::error!(path = %path.display(), error = %e, "CSV header write failed");
            }
        }

        while let Some(batch) = rx.recv().await {
            let mut out = String::new();
            for result in &batch.results {
                out.push_str(&csv_row(result));
                out.push('\n');
            }
            if let Err(e) = file.write_all(out.as_bytes()).await {
                tracing::error!(path = %path.display(), error = %e, "CSV write failed");
            }
            if let Err(e) = file.flush().await {
                tracing::error!(path = %path.display(), error = %e, "CSV flush failed");
            }
        }
    });
    (tx, handle)
}

// ---------------------------------------------------------------------------
// Rotating JSON snapshot
// ---------------------------------------------------------------------------

/// Rewrites the complete result array on every batch, writing to a temp
/// file first so readers never see a half-written snapshot.
pub fn spawn_snapshot_writer(path: PathBuf) -> (mpsc::Sender<FileBatch>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FileBatch>(WRITER_QUEUE);
    let handle = tokio::spawn(async move {
        let mut all: Vec<TestResult> = Vec::new();
        let tmp = path.with_extension("tmp");

        while let Some(batch) = rx.recv().await {
            all.extend(batch.results);
            let json = match serde_json::to_string_pretty(&all) {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize snapshot");
                    continue;
                }
            };
            if let Err(e) = tokio::fs::write(&tmp, &json).await {
                tracing::error!(path = %tmp.display(), error = %e, "snapshot write failed");
                continue;
            }
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                tracing::error!(path = %path.display(), error = %e, "snapshot rotate failed");
            }
        }
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_result(i: u64) -> TestResult {
        let mut r = TestResult::new(i, 0, "s", "rest", "step");
        r.status = 200;
        r.status_text = "OK".to_string();
        r
    }

    async fn send_and_close(
        tx: mpsc::Sender<FileBatch>,
        handle: JoinHandle<()>,
        batches: Vec<FileBatch>,
    ) {
        for batch in batches {
            tx.send(batch).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
    }

    // -----------------------------------------------------------------------
    // csv_escape
    // -----------------------------------------------------------------------

    #[test]
    fn csv_escape_passes_plain_fields_through() {
        assert_eq!(csv_escape("plain"), "plain");
    }

    #[test]
    fn csv_escape_quotes_commas_and_doubles_quotes() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    // -----------------------------------------------------------------------
    // JSONL
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn jsonl_writer_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let (tx, handle) = spawn_jsonl_writer(path.clone());

        send_and_close(
            tx,
            handle,
            vec![
                FileBatch {
                    batch_number: 1,
                    results: vec![make_result(1), make_result(2)],
                },
                FileBatch {
                    batch_number: 2,
                    results: vec![make_result(3)],
                },
            ],
        )
        .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        // Round-trip: each line parses back into a result, in order.
        let parsed: TestResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.vu_id, 1);
        let parsed: TestResult = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.vu_id, 3);

        let sidecar = tokio::fs::read_to_string(path.with_extension("jsonl.batch"))
            .await
            .unwrap();
        assert_eq!(sidecar, "2");
    }

    // -----------------------------------------------------------------------
    // CSV
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn csv_writer_emits_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let (tx, handle) = spawn_csv_writer(path.clone());

        let mut tricky = make_result(1);
        tricky.error = Some("expected \"200\", got 500".to_string());
        tricky.fail(tricky.error.clone().unwrap());

        send_and_close(
            tx,
            handle,
            vec![FileBatch {
                batch_number: 1,
                results: vec![tricky, make_result(2)],
            }],
        )
        .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3);
        // Embedded quotes are doubled.
        assert!(lines[1].contains("\"\"200\"\""));
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn snapshot_writer_rewrites_full_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let (tx, handle) = spawn_snapshot_writer(path.clone());

        send_and_close(
            tx,
            handle,
            vec![
                FileBatch {
                    batch_number: 1,
                    results: vec![make_result(1)],
                },
                FileBatch {
                    batch_number: 2,
                    results: vec![make_result(2)],
                },
            ],
        )
        .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<TestResult> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
