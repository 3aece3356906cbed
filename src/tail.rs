//! Log tailing: one follower per launched process, all feeding one
//! aggregated [`LogSink`].
//!
//! A process may create its log file some time after it was launched, so the
//! tailer first polls for the file to appear. Once open it follows the file
//! by polling for growth. On the stop signal it drains whatever has been
//! written up to the current end of file and exits.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClusterError;

// ── LogSink ──────────────────────────────────────────────────────────────────

/// Shared destination for every forwarded line. Clones write to the same
/// writers; each line is written whole under one lock so lines from
/// different instances never interleave.
#[derive(Clone, Default)]
pub struct LogSink {
    writers: Arc<Mutex<Vec<Box<dyn Write + Send>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to `path` (created if missing), optionally echoing to stdout.
    pub fn open(path: &Path, echo_stdout: bool) -> Result<Self, ClusterError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ClusterError::directory(path, e))?;
        let sink = Self::with_writer(file);
        if echo_stdout {
            sink.add_writer(io::stdout());
        }
        Ok(sink)
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        let sink = Self::new();
        sink.add_writer(writer);
        sink
    }

    pub fn add_writer(&self, writer: impl Write + Send + 'static) {
        self.lock().push(Box::new(writer));
    }

    /// Write `<instance> <line>` to every writer.
    ///
    /// Every writer is attempted; the first failure is returned.
    pub fn write_line(&self, instance: &str, line: &str) -> io::Result<()> {
        let record = format!("{instance} {line}\n");
        let mut first_err = None;
        for writer in self.lock().iter_mut() {
            if let Err(e) = write_record(writer.as_mut(), record.as_bytes()) {
                warn!(instance, "cluster log write failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn Write + Send>>> {
        // A panic mid-write leaves at worst a torn line; keep logging.
        self.writers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_record(writer: &mut dyn Write, record: &[u8]) -> io::Result<()> {
    writer.write_all(record)?;
    writer.flush()
}

// ── tailer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TailSettings {
    /// How often to check for file creation and growth.
    pub poll_interval: Duration,
    /// How long a log file may take to appear before the tail fails.
    pub open_timeout: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Follow `path`, forwarding complete lines to `sink` prefixed by `instance`.
///
/// Returns `Ok` once `stop` is cancelled and the file has been drained. If
/// `stop` fires before the file ever appeared there is nothing to drain and
/// the tail ends quietly. A line the sink fails to write ends the tail with
/// [`ClusterError::Tail`].
pub async fn tail_file(
    instance: String,
    path: PathBuf,
    sink: LogSink,
    settings: TailSettings,
    stop: CancellationToken,
) -> Result<(), ClusterError> {
    let Some(file) = open_when_ready(&instance, &path, &settings, &stop).await? else {
        debug!(instance = %instance, "stopped before log file appeared");
        return Ok(());
    };
    debug!(instance = %instance, path = %path.display(), "tailing log");

    let mut reader = BufReader::new(file);
    let mut pending = Vec::new();
    loop {
        let stopping = stop.is_cancelled();
        loop {
            let n = reader
                .read_until(b'\n', &mut pending)
                .await
                .map_err(|e| tail_error(&instance, &path, e))?;
            if n == 0 {
                break;
            }
            if pending.ends_with(b"\n") {
                emit(&sink, &instance, &path, &pending)?;
                pending.clear();
            }
        }
        if stopping {
            break;
        }
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    if !pending.is_empty() {
        emit(&sink, &instance, &path, &pending)?;
    }
    debug!(instance = %instance, "log drained");
    Ok(())
}

async fn open_when_ready(
    instance: &str,
    path: &Path,
    settings: &TailSettings,
    stop: &CancellationToken,
) -> Result<Option<File>, ClusterError> {
    let deadline = Instant::now() + settings.open_timeout;
    loop {
        match File::open(path).await {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if stop.is_cancelled() {
                    return Ok(None);
                }
                if Instant::now() >= deadline {
                    return Err(tail_error(
                        instance,
                        path,
                        format!("not created within {:?}", settings.open_timeout),
                    ));
                }
            }
            Err(e) => return Err(tail_error(instance, path, e)),
        }
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }
}

fn emit(sink: &LogSink, instance: &str, path: &Path, raw: &[u8]) -> Result<(), ClusterError> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    sink.write_line(instance, line)
        .map_err(|e| tail_error(instance, path, format!("cluster log write failed: {e}")))
}

fn tail_error(instance: &str, path: &Path, reason: impl ToString) -> ClusterError {
    ClusterError::Tail {
        instance: instance.to_string(),
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast() -> TailSettings {
        TailSettings {
            poll_interval: Duration::from_millis(10),
            open_timeout: Duration::from_secs(5),
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn sink_prefixes_every_line() {
        let buf = SharedBuffer::default();
        let sink = LogSink::with_writer(buf.clone());
        sink.write_line("node-0.example.org", "hello").unwrap();
        sink.clone().write_line("provider-0.example.org", "world").unwrap();
        assert_eq!(
            buf.contents(),
            "node-0.example.org hello\nprovider-0.example.org world\n"
        );
    }

    #[test]
    fn sink_fans_out_to_all_writers() {
        let a = SharedBuffer::default();
        let b = SharedBuffer::default();
        let sink = LogSink::with_writer(a.clone());
        sink.add_writer(b.clone());
        sink.write_line("x", "y").unwrap();
        assert_eq!(a.contents(), b.contents());
    }

    #[test]
    fn broken_writer_is_reported_after_others_are_written() {
        let buf = SharedBuffer::default();
        let sink = LogSink::with_writer(BrokenWriter);
        sink.add_writer(buf.clone());
        assert!(sink.write_line("x", "y").is_err());
        assert_eq!(buf.contents(), "x y\n");
    }

    #[tokio::test]
    async fn sink_failure_ends_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.log");
        append(&path, "one\n");
        let err = tail_file(
            "node-0".into(),
            path,
            LogSink::with_writer(BrokenWriter),
            fast(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            ClusterError::Tail { instance, reason, .. } => {
                assert_eq!(instance, "node-0");
                assert!(reason.contains("cluster log write failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sink_appends_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cluster.log");
        LogSink::open(&path, false).unwrap().write_line("a", "one").unwrap();
        LogSink::open(&path, false).unwrap().write_line("b", "two").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a one\nb two\n");
    }

    #[tokio::test]
    async fn existing_lines_are_drained_on_stop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.log");
        append(&path, "one\ntwo\n");
        let buf = SharedBuffer::default();
        let stop = CancellationToken::new();
        stop.cancel();
        tail_file(
            "node-0".into(),
            path,
            LogSink::with_writer(buf.clone()),
            fast(),
            stop,
        )
        .await
        .unwrap();
        assert_eq!(buf.contents(), "node-0 one\nnode-0 two\n");
    }

    #[tokio::test]
    async fn late_file_and_partial_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.log");
        let buf = SharedBuffer::default();
        let stop = CancellationToken::new();
        let task = tokio::spawn(tail_file(
            "node-0".into(),
            path.clone(),
            LogSink::with_writer(buf.clone()),
            fast(),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "first\npar");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(buf.contents(), "node-0 first\n");

        append(&path, "tial");
        stop.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(buf.contents(), "node-0 first\nnode-0 partial\n");
    }

    #[tokio::test]
    async fn missing_file_times_out() {
        let tmp = TempDir::new().unwrap();
        let settings = TailSettings {
            poll_interval: Duration::from_millis(10),
            open_timeout: Duration::from_millis(50),
        };
        let err = tail_file(
            "node-0".into(),
            tmp.path().join("never.log"),
            LogSink::new(),
            settings,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::Tail { .. }));
    }

    #[tokio::test]
    async fn stop_before_creation_is_quiet() {
        let tmp = TempDir::new().unwrap();
        let stop = CancellationToken::new();
        stop.cancel();
        tail_file(
            "node-0".into(),
            tmp.path().join("never.log"),
            LogSink::new(),
            fast(),
            stop,
        )
        .await
        .unwrap();
    }
}
