//! Field reader backed by the `dcgmi dmon` command line tool
//!
//! `dcgmi dmon -e <fields> -d <ms>` prints one row per GPU per interval:
//!
//! ```text
//! #Entity   POWER  GPUTL  FBUSD
//!       ID      W      %    MiB
//!     GPU 0  25.43      0      0
//! ```
//!
//! A background task reads the rows as they arrive; each poll drains what
//! was read since the previous one. `open` returns once the first data row
//! is in, so the first poll already carries the watch's initial readings.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::catalog::FieldId;
use crate::fields::{DeviceIndex, FieldReader, FieldSample, FieldValue, PollResult, ReaderError, WatchSession};

const BLANK_VALUE: &str = "N/A";
const DEFAULT_FIRST_ROW_TIMEOUT: Duration = Duration::from_secs(30);

/// A stdout line and the wall clock time it was read at
type TimedLine = (i64, String);

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Spawns `dcgmi dmon` watch sessions
#[derive(Debug, Clone)]
pub struct DcgmiReader {
    program: PathBuf,
    leading_args: Vec<OsString>,
    first_row_timeout: Duration,
}

impl Default for DcgmiReader {
    fn default() -> Self {
        Self::new("dcgmi")
    }
}

impl DcgmiReader {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            first_row_timeout: DEFAULT_FIRST_ROW_TIMEOUT,
        }
    }

    /// How long `open` waits for the first data row
    pub fn with_first_row_timeout(mut self, timeout: Duration) -> Self {
        self.first_row_timeout = timeout;
        self
    }

    /// Arguments inserted before `dmon ...`, e.g. for a wrapper script
    pub fn with_leading_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl FieldReader for DcgmiReader {
    type Session = DcgmiSession;

    async fn open(
        &self,
        field_ids: &[FieldId],
        group_name: &str,
        update_frequency_us: u64,
    ) -> Result<DcgmiSession, ReaderError> {
        let fields = field_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let delay_ms = (update_frequency_us / 1_000).max(1);

        info!("Starting {} dmon for group {} (fields {}, every {}ms)",
              self.program.display(), group_name, fields, delay_ms);

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg("dmon")
            .arg("-e")
            .arg(&fields)
            .arg("-d")
            .arg(delay_ms.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ReaderError::Spawn)?;

        let stdout = child.stdout.take().ok_or(ReaderError::NoOutput)?;
        let (tx, rx) = mpsc::unbounded_channel::<TimedLine>();

        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((now_micros(), line)).is_err() {
                    break;
                }
            }
        });

        let mut session = DcgmiSession {
            child: Some(child),
            pump: Some(pump),
            rx,
            pending: Vec::new(),
            field_ids: field_ids.to_vec(),
            group_name: group_name.to_string(),
        };

        if let Err(e) = session.await_first_row(self.first_row_timeout).await {
            session.close().await.ok();
            return Err(e);
        }
        Ok(session)
    }
}

/// A running `dcgmi dmon` process
pub struct DcgmiSession {
    child: Option<Child>,
    pump: Option<JoinHandle<()>>,
    rx: mpsc::UnboundedReceiver<TimedLine>,
    /// Lines read by `open` and not yet handed out by `poll`
    pending: Vec<TimedLine>,
    field_ids: Vec<FieldId>,
    group_name: String,
}

impl DcgmiSession {
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Buffer output until a data row shows up, the child exits, or
    /// `limit` elapses. Only an exit is an error.
    async fn await_first_row(&mut self, limit: Duration) -> Result<(), ReaderError> {
        let deadline = Instant::now() + limit;

        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some((timestamp_us, line))) => {
                    let is_data = matches!(parse_row(&line, &self.field_ids, timestamp_us), Ok(Some(_)));
                    self.pending.push((timestamp_us, line));
                    if is_data {
                        debug!("First dcgmi row received");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    // stdout closed: the child is gone
                    if let Some(child) = self.child.as_mut() {
                        let status = child.wait().await?;
                        return Err(ReaderError::Exited(status));
                    }
                    return Err(ReaderError::NoOutput);
                }
                Err(_) => {
                    warn!("No dcgmi data row within {:?}, polling anyway", limit);
                    return Ok(());
                }
            }
        }
    }
}

/// Parse one dmon output line.
///
/// Returns `Ok(None)` for header and empty lines.
pub fn parse_row(
    line: &str,
    field_ids: &[FieldId],
    timestamp_us: i64,
) -> Result<Option<(DeviceIndex, Vec<(FieldId, FieldSample)>)>, ReaderError> {
    let mut tokens = line.split_whitespace();
    let Some(entity) = tokens.next() else {
        return Ok(None);
    };
    if entity.starts_with('#') || entity.eq_ignore_ascii_case("id") {
        return Ok(None);
    }
    if !entity.eq_ignore_ascii_case("gpu") {
        return Err(ReaderError::Parse(format!("unexpected entity in row: {line}")));
    }

    let device = tokens
        .next()
        .and_then(|index| index.parse::<DeviceIndex>().ok())
        .ok_or_else(|| ReaderError::Parse(format!("missing device index in row: {line}")))?;

    let values: Vec<&str> = tokens.collect();
    if values.len() != field_ids.len() {
        return Err(ReaderError::Parse(format!(
            "expected {} values, got {} in row: {line}",
            field_ids.len(),
            values.len()
        )));
    }

    let samples = field_ids
        .iter()
        .zip(values)
        .map(|(field_id, raw)| {
            let sample = if raw == BLANK_VALUE {
                FieldSample::blank(timestamp_us)
            } else {
                FieldSample::new(FieldValue::parse(raw), timestamp_us)
            };
            (*field_id, sample)
        })
        .collect();

    Ok(Some((device, samples)))
}

impl WatchSession for DcgmiSession {
    async fn poll(&mut self) -> Result<PollResult, ReaderError> {
        let mut result = PollResult::new();
        let mut lines = std::mem::take(&mut self.pending);
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }

        for (timestamp_us, line) in lines {
            match parse_row(&line, &self.field_ids, timestamp_us) {
                Ok(Some((device, samples))) => {
                    let fields = result.entry(device).or_default();
                    for (field_id, sample) in samples {
                        fields.entry(field_id).or_default().push(sample);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }

        if result.is_empty() {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(ReaderError::Exited(status));
                }
            }
        }

        debug!("Polled {} devices", result.len());
        Ok(result)
    }

    async fn close(&mut self) -> Result<(), ReaderError> {
        if let Some(mut child) = self.child.take() {
            info!("Stopping dcgmi watch for group {}", self.group_name);
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_row() {
        let (device, samples) = parse_row("    GPU 1  25.43      7    N/A", &[155, 203, 252], 42)
            .unwrap()
            .unwrap();
        assert_eq!(device, 1);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], (155, FieldSample::new(FieldValue::Double(25.43), 42)));
        assert_eq!(samples[1], (203, FieldSample::new(FieldValue::Int(7), 42)));
        assert_eq!(samples[2].0, 252);
        assert!(samples[2].1.is_blank);
    }

    #[test]
    fn test_parse_headers() {
        let ids = [155, 203];
        assert!(parse_row("#Entity   POWER  GPUTL", &ids, 0).unwrap().is_none());
        assert!(parse_row("      ID      W      %", &ids, 0).unwrap().is_none());
        assert!(parse_row("", &ids, 0).unwrap().is_none());
    }

    #[test]
    fn test_parse_malformed() {
        let ids = [155, 203];
        assert!(parse_row("GPU 0 1.0", &ids, 0).is_err());
        assert!(parse_row("GPU x 1.0 2", &ids, 0).is_err());
        assert!(parse_row("Error: unable to connect", &ids, 0).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_reads_child_output() {
        let script = "printf '#Entity POWER GPUTL\\n ID W %%\\nGPU 0 10.5 3\\nGPU 1 N/A 4\\nGPU 0 11.5 5\\n'; sleep 30";
        let reader = DcgmiReader::new("sh").with_leading_args(["-c", script, "dcgmi"]);
        let mut session = reader.open(&[155, 203], "test_group", 1_000_000).await.unwrap();
        assert_eq!(session.group_name(), "test_group");

        let mut collected = PollResult::new();
        for _ in 0..100 {
            for (device, fields) in session.poll().await.unwrap() {
                let entry = collected.entry(device).or_default();
                for (field, mut window) in fields {
                    entry.entry(field).or_default().append(&mut window);
                }
            }
            if collected.get(&0).map_or(0, |f| f[&203].len()) == 2 && collected.contains_key(&1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let gpu0 = &collected[&0];
        assert_eq!(gpu0[&203].last().unwrap().value, FieldValue::Int(5));
        assert_eq!(gpu0[&155].last().unwrap().value, FieldValue::Double(11.5));
        assert!(collected[&1][&155][0].is_blank);

        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_first_poll_has_delayed_row() {
        let script = "printf '#Entity GPUTL\\n'; sleep 0.2; printf 'GPU 0 99\\n'; sleep 30";
        let reader = DcgmiReader::new("sh").with_leading_args(["-c", script, "dcgmi"]);
        let mut session = reader.open(&[203], "test_group", 1_000_000).await.unwrap();

        let first = session.poll().await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first[&0][&203][0].value, FieldValue::Int(99));

        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_child_opens_after_timeout() {
        let reader = DcgmiReader::new("sh")
            .with_leading_args(["-c", "sleep 30", "dcgmi"])
            .with_first_row_timeout(Duration::from_millis(50));
        let mut session = reader.open(&[203], "test_group", 1_000_000).await.unwrap();

        assert!(session.poll().await.unwrap().is_empty());
        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exiting_before_first_row_fails_open() {
        let reader = DcgmiReader::new("sh").with_leading_args(["-c", "exit 3", "dcgmi"]);
        match reader.open(&[203], "test_group", 1_000_000).await {
            Err(ReaderError::Exited(status)) => assert_eq!(status.code(), Some(3)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open succeeded for an exited child"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_is_reported() {
        let reader = DcgmiReader::new("sh").with_leading_args(["-c", "printf 'GPU 0 1\\n'; exit 3", "dcgmi"]);
        let mut session = reader.open(&[203], "test_group", 1_000_000).await.unwrap();

        let first = session.poll().await.unwrap();
        assert_eq!(first[&0][&203][0].value, FieldValue::Int(1));

        let mut exited = false;
        for _ in 0..100 {
            if let Err(ReaderError::Exited(status)) = session.poll().await {
                assert_eq!(status.code(), Some(3));
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_open() {
        let reader = DcgmiReader::new("/nonexistent/dcgmi");
        let result = reader.open(&[203], "test_group", 1_000_000).await;
        assert!(matches!(result, Err(ReaderError::Spawn(_))));
    }
}
