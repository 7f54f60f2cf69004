//! Presence capture: turns a stream of observed hardware addresses into
//! liveness updates on the shared presence state.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use futures::{Stream, StreamExt as _};
use log::{debug, error, info, warn};
use mac_address::MacAddress;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::allowlist;
use crate::config::CaptureConfig;
use crate::presence::{PresenceState, Sighting};

/// Longest capture line kept; the rest of an overlong line is discarded.
pub const MAX_LINE_LEN: usize = 256;

/// A non-restartable source of observed addresses, one per line.
pub trait AddressSource: Send {
    /// Raw line without its `\n`. `Ok(None)` once the source has ended.
    fn next_line(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// Release the source. Called exactly once, when capture stops.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Packet-capture subprocess printing one source address per frame.
#[derive(Debug)]
pub struct CaptureProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl CaptureProcess {
    pub fn spawn(config: &CaptureConfig) -> anyhow::Result<Self> {
        let command = config.command();
        let args = config.args();
        info!("Starting capture: {} {}", command, args.join(" "));

        let mut child = Command::new(&command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning capture command {command}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("capture command has no stdout"))?;

        Ok(CaptureProcess {
            child,
            stdout: BufReader::new(stdout),
        })
    }
}

impl AddressSource for CaptureProcess {
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        read_bounded_line(&mut self.stdout).await
    }

    async fn close(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!("Capture process already gone: {}", err);
        }
        match self.child.wait().await {
            Ok(status) => debug!("Capture process exited: {}", status),
            Err(err) => warn!("Failed to reap capture process: {}", err),
        }
    }
}

/// Read up to the next `\n`, keeping at most [`MAX_LINE_LEN`] bytes of it.
/// A final line without a terminator is still returned.
async fn read_bounded_line<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(line));
        }
        read_any = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let end = newline.unwrap_or(available.len());
        let room = MAX_LINE_LEN.saturating_sub(line.len());
        line.extend_from_slice(&available[..end.min(room)]);

        reader.consume(newline.map_or(end, |i| i + 1));
        if newline.is_some() {
            return Ok(Some(line));
        }
    }
}

/// Wraps any stream of lines, e.g. a fixed list in tests.
pub struct StreamSource<S> {
    stream: S,
}

impl<S> StreamSource<S>
where
    S: Stream + Unpin + Send,
    S::Item: Into<Vec<u8>>,
{
    pub fn new(stream: S) -> Self {
        StreamSource { stream }
    }
}

impl<S> AddressSource for StreamSource<S>
where
    S: Stream + Unpin + Send,
    S::Item: Into<Vec<u8>>,
{
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.stream.next().await.map(Into::into))
    }

    async fn close(&mut self) {}
}

/// Every distinct address ever observed, appended as discovered.
#[derive(Debug)]
pub struct ObservedLog {
    path: PathBuf,
    seen: HashSet<MacAddress>,
}

impl ObservedLog {
    /// Truncates `path`; the log covers the current run only.
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating observed-address file {}", path.display()))?;
        Ok(ObservedLog {
            path: path.to_path_buf(),
            seen: HashSet::new(),
        })
    }

    /// Returns `true` if `address` had not been observed before.
    pub async fn observe(&mut self, address: MacAddress) -> bool {
        if !self.seen.insert(address) {
            return false;
        }
        if let Err(err) = self.append(address).await {
            warn!("Failed to record observed address {}: {:#}", address, err);
        }
        true
    }

    async fn append(&self, address: MacAddress) -> anyhow::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{address}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct CaptureEnded(pub String);

impl std::fmt::Display for CaptureEnded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "capture source ended: {}", self.0)
    }
}

impl std::error::Error for CaptureEnded {}

/// Feed observed addresses into `state` until shutdown. Returns an error
/// wrapping [`CaptureEnded`] if the source stops on its own.
pub async fn run<A: AddressSource>(
    mut source: A,
    state: Arc<PresenceState>,
    mut observed: ObservedLog,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ended = loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break None,
            line = source.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Some("end of stream".to_string()),
            Err(err) => break Some(err.to_string()),
        };

        let Ok(text) = std::str::from_utf8(&line) else {
            debug!("Ignoring non-UTF-8 capture line {:?}", String::from_utf8_lossy(&line));
            continue;
        };
        let Some(address) = allowlist::parse_address(text) else {
            debug!("Ignoring capture line {:?}", text);
            continue;
        };

        if observed.observe(address).await {
            info!("New device in network: {}", address);
        }

        if state.record_seen(address, Instant::now()).await == Sighting::Arrived {
            info!("Found device: {}", address);
        }
    };

    source.close().await;

    match ended {
        None => {
            debug!("Capture stopped");
            Ok(())
        }
        Some(reason) => {
            error!("Presence capture stopped: {}", reason);
            Err(CaptureEnded(reason).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    #[tokio::test]
    async fn test_capture_marks_tracked_devices_present() {
        let dir = tempfile::tempdir().unwrap();
        let observed_path = dir.path().join("mac_available.txt");
        let observed = ObservedLog::create(&observed_path).await.unwrap();
        let state = Arc::new(PresenceState::with_devices(&[mac(0xFF)], Duration::from_secs(15)));
        let (_tx, rx) = watch::channel(false);

        let lines = vec![
            "11:22:33:44:55:66".to_string(),
            "garbage".to_string(),
            "aa:bb:cc:dd:ee:ff".to_string(),
            "11:22:33:44:55:66".to_string(),
        ];
        let result = run(StreamSource::new(stream::iter(lines)), state.clone(), observed, rx).await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<CaptureEnded>().is_some());
        assert!(state.query().await);

        let contents = std::fs::read_to_string(&observed_path).unwrap();
        assert_eq!(contents, "11:22:33:44:55:66\nAA:BB:CC:DD:EE:FF\n");
    }

    #[tokio::test]
    async fn test_untracked_traffic_leaves_flag_unset() {
        let dir = tempfile::tempdir().unwrap();
        let observed = ObservedLog::create(&dir.path().join("observed.txt")).await.unwrap();
        let state = Arc::new(PresenceState::with_devices(&[mac(1)], Duration::from_secs(15)));
        let (_tx, rx) = watch::channel(false);

        let lines = vec!["11:22:33:44:55:66".to_string()];
        let _ = run(StreamSource::new(stream::iter(lines)), state.clone(), observed, rx).await;
        assert!(!state.query().await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_read() {
        let dir = tempfile::tempdir().unwrap();
        let observed = ObservedLog::create(&dir.path().join("observed.txt")).await.unwrap();
        let state = Arc::new(PresenceState::with_devices(&[], Duration::from_secs(15)));
        let (tx, rx) = watch::channel(false);

        let source = StreamSource::new(stream::pending::<String>());
        let handle = tokio::spawn(run(source, state, observed, rx));
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_capture_process_end_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("capture.txt");
        std::fs::write(&input, "aa:bb:cc:dd:ee:01\n").unwrap();
        let config = CaptureConfig {
            interface: None,
            command: Some("cat".to_string()),
            args: Some(vec![input.display().to_string()]),
        };

        let observed = ObservedLog::create(&dir.path().join("observed.txt")).await.unwrap();
        let state = Arc::new(PresenceState::with_devices(&[mac(1)], Duration::from_secs(15)));
        let (_tx, rx) = watch::channel(false);

        let source = CaptureProcess::spawn(&config).unwrap();
        let result = run(source, state.clone(), observed, rx).await;
        assert!(result.is_err());
        assert!(state.query().await);
    }

    #[tokio::test]
    async fn test_garbled_bytes_do_not_end_capture() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("capture.bin");
        let mut contents = b"\xff\xfe\n".to_vec();
        contents.extend(std::iter::repeat_n(b'a', 10_000));
        contents.extend_from_slice(b"\naa:bb:cc:dd:ee:01\n");
        std::fs::write(&input, contents).unwrap();
        let config = CaptureConfig {
            interface: None,
            command: Some("sh".to_string()),
            args: Some(vec![
                "-c".to_string(),
                format!("cat '{}'; sleep 30", input.display()),
            ]),
        };

        let observed = ObservedLog::create(&dir.path().join("observed.txt")).await.unwrap();
        let state = Arc::new(PresenceState::with_devices(&[mac(1)], Duration::from_secs(15)));
        let (tx, rx) = watch::channel(false);

        let source = CaptureProcess::spawn(&config).unwrap();
        let handle = tokio::spawn(run(source, state.clone(), observed, rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.query().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_overlong_line_is_truncated() {
        let mut input: Vec<u8> = std::iter::repeat_n(b'x', 10_000).collect();
        input.extend_from_slice(b"\naa:bb:cc:dd:ee:01\r\ntail");
        let mut reader = &input[..];

        let first = read_bounded_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_LEN);
        assert_eq!(
            read_bounded_line(&mut reader).await.unwrap().unwrap(),
            b"aa:bb:cc:dd:ee:01\r"
        );
        assert_eq!(read_bounded_line(&mut reader).await.unwrap().unwrap(), b"tail");
        assert_eq!(read_bounded_line(&mut reader).await.unwrap(), None);
    }
}
