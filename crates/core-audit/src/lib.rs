//! Structured JSON-lines audit logger with a pluggable sink.
//!
//! Writers never block the request path: every append is off-loaded to a
//! worker thread via [`tokio::task::spawn_blocking`], and
//! [`AuditLogger::dispatch_fire_and_forget`] schedules the write on a
//! detached task whose failure is logged to stderr and never propagated
//! (the "fire-and-forget audit" pattern of spec.md §4.9 / glossary).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use subterm_config::LogOutput;
use subterm_error::CoreError;

/// A sink that can durably record one JSON-lines record. Implementations
/// must be safe to call from a blocking worker thread.
pub trait AuditSink: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), CoreError>;
}

struct StdoutSink;

impl AuditSink for StdoutSink {
    fn write_line(&self, line: &str) -> Result<(), CoreError> {
        println!("{line}");
        Ok(())
    }
}

struct FileSink {
    path: PathBuf,
}

impl AuditSink for FileSink {
    fn write_line(&self, line: &str) -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CoreError::Internal(format!("audit file open {:?}: {e}", self.path)))?;
        writeln!(file, "{line}")
            .map_err(|e| CoreError::Internal(format!("audit file write {:?}: {e}", self.path)))
    }
}

struct BothSink {
    stdout: StdoutSink,
    file: FileSink,
}

impl AuditSink for BothSink {
    fn write_line(&self, line: &str) -> Result<(), CoreError> {
        self.stdout.write_line(line)?;
        self.file.write_line(line)
    }
}

/// Non-blocking JSON-lines audit logger. One instance is shared (cloned
/// cheaply via `Arc`) across all concurrent requests in Core B, and across
/// the single session in Core A.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(output: LogOutput, file_path: PathBuf) -> Self {
        let sink: Arc<dyn AuditSink> = match output {
            LogOutput::Stdout => Arc::new(StdoutSink),
            LogOutput::File => Arc::new(FileSink { path: file_path }),
            LogOutput::Both => Arc::new(BothSink {
                stdout: StdoutSink,
                file: FileSink { path: file_path },
            }),
        };
        AuditLogger { sink }
    }

    /// For tests and for the Core A session log, which writes plain files
    /// rather than going through `LogOutput`.
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        AuditLogger { sink }
    }

    /// Serializes `record` to one JSON line and writes it, off the calling
    /// task's thread. Awaited: callers that want fire-and-forget semantics
    /// should use [`Self::dispatch_fire_and_forget`] instead.
    pub async fn log<T>(&self, record: &T) -> Result<(), CoreError>
    where
        T: serde::Serialize,
    {
        let line = serde_json::to_string(record)
            .map_err(|e| CoreError::Internal(format!("audit serialize: {e}")))?;
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.write_line(&line))
            .await
            .map_err(|e| CoreError::Internal(format!("audit write task join: {e}")))?
    }

    /// Schedules the write on a detached task. Any failure (serialize or
    /// sink I/O) is logged to stderr and swallowed; the caller never awaits
    /// this and the response path is never affected. Per spec.md invariant
    /// #4: success emits exactly one entry; failure emits at most one
    /// stderr diagnostic.
    pub fn dispatch_fire_and_forget<T>(&self, record: T)
    where
        T: serde::Serialize + Send + 'static,
    {
        let logger = self.clone();
        tokio::spawn(async move {
            if let Err(e) = logger.log(&record).await {
                tracing::error!("audit dispatch failed (swallowed): {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingSink {
        lines: Mutex<Vec<String>>,
    }

    impl AuditSink for CapturingSink {
        fn write_line(&self, line: &str) -> Result<(), CoreError> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn write_line(&self, _line: &str) -> Result<(), CoreError> {
            Err(CoreError::Internal("boom".into()))
        }
    }

    #[derive(serde::Serialize)]
    struct Rec {
        n: u32,
    }

    #[tokio::test]
    async fn log_writes_one_json_line() {
        let sink = Arc::new(CapturingSink {
            lines: Mutex::new(Vec::new()),
        });
        let logger = AuditLogger::with_sink(sink.clone());
        logger.log(&Rec { n: 1 }).await.unwrap();
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn fire_and_forget_swallows_sink_failure() {
        let logger = AuditLogger::with_sink(Arc::new(FailingSink));
        logger.dispatch_fire_and_forget(Rec { n: 2 });
        // Task runs to completion without panicking or propagating anything
        // to the caller; give the spawned task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn file_sink_appends_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(LogOutput::File, path.clone());
        logger.log(&Rec { n: 1 }).await.unwrap();
        logger.log(&Rec { n: 2 }).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
