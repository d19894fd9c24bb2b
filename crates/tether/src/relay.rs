//! Device relay: forwards newline-delimited JSON records from a local source
//! to the parent, for devices the parent knows about.
//!
//! Each record must carry a string `device` field. The parent is asked for
//! the device's registration; a registered device gets the whole record as a
//! `data` envelope, an unknown one is reported as an error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tether::worker::WorkerError;
use tether::Worker;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Ready option naming the record file. Stdin is used when absent.
pub const INPUT_PATH_OPTION: &str = "inputPath";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cannot open record source {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read record source: {0}")]
    Read(#[source] std::io::Error),

    #[error("record is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("record has no device identifier")]
    MissingDevice,

    #[error("Device {0} not registered")]
    UnregisteredDevice(String),
}

/// One input record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub device: String,
    /// The full record, re-serialized.
    pub payload: String,
}

impl Record {
    pub fn parse(line: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(line).map_err(RelayError::Parse)?;
        let device = value
            .get("device")
            .and_then(Value::as_str)
            .filter(|device| !device.trim().is_empty())
            .ok_or(RelayError::MissingDevice)?
            .to_string();
        Ok(Self {
            device,
            payload: value.to_string(),
        })
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct RecordSource {
    lines: Lines<BufReader<BoxedReader>>,
    origin: String,
}

impl RecordSource {
    pub async fn open(path: Option<&Path>) -> Result<Self, RelayError> {
        let (reader, origin): (BoxedReader, String) = match path {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| RelayError::Open {
                        path: path.to_path_buf(),
                        source,
                    })?;
                (Box::new(file), path.display().to_string())
            }
            None => (Box::new(tokio::io::stdin()), "stdin".to_string()),
        };
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            origin,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Next non-blank line parsed as a record. The outer error ends the
    /// source; the inner one only rejects that line.
    pub async fn next_record(&mut self) -> Result<Option<Result<Record, RelayError>>, RelayError> {
        loop {
            let Some(line) = self.lines.next_line().await.map_err(RelayError::Read)? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(Record::parse(&line)));
        }
    }
}

/// Register the relay's lifecycle handlers on `worker`.
///
/// `input` overrides the `inputPath` ready option.
pub fn install(worker: &Worker, input: Option<PathBuf>) {
    let source_task: Arc<Mutex<Option<AbortHandle>>> = Arc::default();

    let handle = worker.clone();
    let task = Arc::clone(&source_task);
    worker.on_ready(move |options| {
        let input = input.or_else(|| {
            options
                .get(INPUT_PATH_OPTION)
                .and_then(Value::as_str)
                .map(PathBuf::from)
        });
        let abort = handle.spawn("record-source", relay_records(handle.clone(), input));
        if let Ok(mut slot) = task.lock() {
            *slot = Some(abort);
        }
    });

    let handle = worker.clone();
    worker.on_close(move || {
        if let Some(abort) = source_task.lock().ok().and_then(|mut slot| slot.take()) {
            abort.abort();
            info!("event source stopped");
        }
        let _ = handle.notify_close();
    });
}

async fn relay_records(worker: Worker, input: Option<PathBuf>) -> Result<(), RelayError> {
    let mut source = RecordSource::open(input.as_deref()).await?;
    if let Err(err) = worker.notify_ready().await {
        warn!(error = %err, "ready not delivered");
    }
    if let Err(err) = worker.log("event source has been initialized").await {
        warn!(error = %err, "log not delivered");
    }
    info!(source = source.origin(), "event source initialized");

    while let Some(record) = source.next_record().await? {
        match record {
            Ok(record) => {
                worker.spawn_infallible("forward", forward(worker.clone(), record));
            }
            Err(err) => {
                warn!(error = %err, "record rejected");
                if let Err(err) = worker.report(&err).await {
                    warn!(error = %err, "record rejection not delivered");
                }
            }
        }
    }

    info!(source = source.origin(), "event source exhausted");
    Ok(())
}

async fn forward(worker: Worker, record: Record) {
    let pending = match worker.request_device_info(&record.device) {
        Ok(pending) => pending,
        Err(err) => {
            warn!(device = %record.device, error = %err, "device lookup rejected");
            return;
        }
    };

    match pending.await {
        Ok(Value::Null) => {
            let err = RelayError::UnregisteredDevice(record.device);
            if let Err(report_err) = worker.report(&err).await {
                warn!(error = %report_err, "{err} not delivered");
            }
        }
        Ok(_) => {
            if let Err(err) = worker.send_data(&record.device, &record.payload).await {
                warn!(device = %record.device, error = %err, "data not delivered");
            }
        }
        Err(WorkerError::Timeout(timeout)) => {
            debug!(device = %record.device, ?timeout, "device lookup got no reply");
        }
        Err(err) => debug!(device = %record.device, error = %err, "device lookup abandoned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_full_payload() {
        let record = Record::parse(r#"{"device":"dev-1","temp":21}"#).unwrap();
        assert_eq!(record.device, "dev-1");
        let payload: Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(payload, serde_json::json!({ "device": "dev-1", "temp": 21 }));
    }

    #[test]
    fn record_without_device_is_rejected() {
        assert!(matches!(
            Record::parse(r#"{"temp":21}"#),
            Err(RelayError::MissingDevice)
        ));
        assert!(matches!(
            Record::parse(r#"{"device":"  "}"#),
            Err(RelayError::MissingDevice)
        ));
        assert!(matches!(
            Record::parse("not json"),
            Err(RelayError::Parse(_))
        ));
    }

    #[test]
    fn unregistered_device_message() {
        assert_eq!(
            RelayError::UnregisteredDevice("ghost".to_string()).to_string(),
            "Device ghost not registered"
        );
    }

    #[tokio::test]
    async fn source_skips_blank_lines_and_reports_bad_ones() {
        let dir = std::env::temp_dir().join(format!(
            "tether-relay-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join("records.ndjson");
        std::fs::write(&path, "{\"device\":\"a\"}\n\n   \nbroken\n{\"device\":\"b\"}\n")
            .expect("records should be writable");

        let mut source = RecordSource::open(Some(&path)).await.unwrap();
        let first = source.next_record().await.unwrap().unwrap().unwrap();
        assert_eq!(first.device, "a");
        assert!(source.next_record().await.unwrap().unwrap().is_err());
        let third = source.next_record().await.unwrap().unwrap().unwrap();
        assert_eq!(third.device, "b");
        assert!(source.next_record().await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn undelivered_notifications_do_not_stop_the_relay() {
        let dir = std::env::temp_dir().join(format!(
            "tether-relay-gone-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join("records.ndjson");
        std::fs::write(&path, "broken\n").expect("records should be writable");

        let (worker_in, _parent_out) = tokio::io::duplex(1024);
        let (worker_out, parent_in) = tokio::io::duplex(1024);
        drop(parent_in);
        let (worker, _runtime) =
            Worker::from_parts(worker_in, worker_out, tether::WorkerConfig::default());

        // ready, log and the rejection report all fail to write.
        relay_records(worker, Some(path)).await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let err = RecordSource::open(Some(Path::new("/nonexistent/tether/records.ndjson")))
            .await
            .err()
            .expect("open should fail");
        assert!(matches!(err, RelayError::Open { .. }));
    }
}
