//! Serial channel manager: port cleanup, open-with-retry and line reads.
//!
//! A [`SerialChannel`] owns the retry policy and a [`PortBackend`] that does
//! the platform work. Opening yields a [`Connection`], which releases the
//! port and reruns cleanup when dropped, whatever ended the read loop.

use crate::config::SerialConfig;
use crate::serial::types::decode_line;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lines longer than this without a newline are treated as noise.
const MAX_PENDING_BYTES: usize = 4096;

/// Errors raised by the serial layer.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error(
        "could not open {port} after {attempts} attempts: {last_error}\n\n\
         Troubleshooting steps:\n\
         1. Grant access to the device:\n\
         \x20  sudo chmod 666 {port}\n\
         \x20  sudo chown $(whoami) {port}\n\
         2. Unplug and replug the board\n\
         3. Close the Arduino IDE or any other serial monitor\n\
         4. Verify that {port} is the right device (`emg-intent ports`)"
    )]
    Exhausted {
        port: String,
        attempts: u32,
        last_error: String,
    },

    #[error("serial read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("serial device disconnected")]
    Disconnected,
}

/// A stream of text lines from the sensor.
pub trait LineSource: Send {
    /// Read the next line. `Ok(None)` means the read timed out before a full
    /// line arrived; the caller should check for cancellation and try again.
    fn read_line(&mut self) -> Result<Option<String>, SerialError>;
}

impl<T: LineSource + ?Sized> LineSource for Box<T> {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        (**self).read_line()
    }
}

/// Settings applied when opening a port.
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub hardware_flow_control: bool,
    pub read_timeout: Duration,
}

impl From<&SerialConfig> for PortSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            hardware_flow_control: config.hardware_flow_control,
            read_timeout: config.read_timeout,
        }
    }
}

/// Platform operations behind the channel manager.
pub trait PortBackend: Send + Sync {
    /// Open the port and return a line reader over it.
    fn open(&self, port: &str, settings: &PortSettings) -> Result<Box<dyn LineSource>, SerialError>;

    /// Best-effort release of the port by other holders. Never fails.
    fn cleanup(&self, port: &str);
}

/// Timing and bounds for [`SerialChannel::open`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cleanup_settle: Duration,
    pub retry_delay: Duration,
    pub connect_settle: Duration,
    pub reclaim_port: bool,
}

impl From<&SerialConfig> for RetryPolicy {
    fn from(config: &SerialConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            cleanup_settle: config.cleanup_settle,
            retry_delay: config.retry_delay,
            connect_settle: config.connect_settle,
            reclaim_port: config.reclaim_port,
        }
    }
}

/// Attempt bookkeeping for one `open` call.
#[derive(Debug)]
struct RecoveryState {
    port: String,
    attempt: u32,
    max_attempts: u32,
}

impl RecoveryState {
    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Owns the reconnect policy for one physical device.
#[derive(Clone)]
pub struct SerialChannel {
    backend: Arc<dyn PortBackend>,
    policy: RetryPolicy,
}

impl SerialChannel {
    pub fn new(backend: Arc<dyn PortBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Channel backed by the real serial device.
    pub fn system(config: &SerialConfig) -> Self {
        Self::new(Arc::new(SystemBackend), RetryPolicy::from(config))
    }

    /// Open `port`, retrying with cleanup between attempts.
    ///
    /// On exhaustion the returned error carries remedies for the operator.
    pub fn open(&self, port: &str, settings: &PortSettings) -> Result<Connection, SerialError> {
        self.cleanup(port);

        let mut state = RecoveryState {
            port: port.to_string(),
            attempt: 0,
            max_attempts: self.policy.max_attempts,
        };

        loop {
            state.attempt += 1;
            match self.backend.open(&state.port, settings) {
                Ok(source) => {
                    info!(
                        port = %state.port,
                        attempt = state.attempt,
                        baud = settings.baud_rate,
                        "serial port opened"
                    );
                    if !self.policy.connect_settle.is_zero() {
                        thread::sleep(self.policy.connect_settle);
                    }
                    return Ok(Connection {
                        port: state.port,
                        source: Some(source),
                        channel: self.clone(),
                    });
                }
                Err(e) if state.exhausted() => {
                    return Err(SerialError::Exhausted {
                        port: state.port,
                        attempts: state.attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        port = %state.port,
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        error = %e,
                        "open attempt failed, retrying"
                    );
                    self.cleanup(&state.port);
                    if !self.policy.retry_delay.is_zero() {
                        thread::sleep(self.policy.retry_delay);
                    }
                }
            }
        }
    }

    fn cleanup(&self, port: &str) {
        if self.policy.reclaim_port {
            self.backend.cleanup(port);
        }
        if !self.policy.cleanup_settle.is_zero() {
            thread::sleep(self.policy.cleanup_settle);
        }
    }
}

/// An open serial connection.
///
/// Dropping it closes the port and reruns cleanup.
pub struct Connection {
    port: String,
    source: Option<Box<dyn LineSource>>,
    channel: SerialChannel,
}

impl Connection {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Close the port explicitly. Equivalent to dropping the connection.
    pub fn close(self) {}
}

impl LineSource for Connection {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        match self.source.as_mut() {
            Some(source) => source.read_line(),
            None => Err(SerialError::Disconnected),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.source.take().is_some() {
            debug!(port = %self.port, "closing serial port");
            self.channel.cleanup(&self.port);
        }
    }
}

/// Splits a byte stream with read timeouts into lines.
///
/// Partial lines survive timeouts and are completed by later reads.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(64),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(decode_line(&line))
    }
}

impl<R: Read + Send> LineSource for LineReader<R> {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.pending.len() > MAX_PENDING_BYTES {
                debug!(bytes = self.pending.len(), "discarding unterminated serial data");
                self.pending.clear();
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(SerialError::Disconnected),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SerialError::Read(e)),
            }
        }
    }
}

/// Backend for real devices via `tokio-serial`'s blocking port API.
pub struct SystemBackend;

impl PortBackend for SystemBackend {
    fn open(&self, port: &str, settings: &PortSettings) -> Result<Box<dyn LineSource>, SerialError> {
        let flow_control = if settings.hardware_flow_control {
            tokio_serial::FlowControl::Hardware
        } else {
            tokio_serial::FlowControl::None
        };

        let mut handle = tokio_serial::new(port, settings.baud_rate)
            .timeout(settings.read_timeout)
            .flow_control(flow_control)
            .open()
            .map_err(|e| SerialError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        if settings.hardware_flow_control {
            if let Err(e) = handle.write_data_terminal_ready(true) {
                debug!(port, error = %e, "could not assert DTR");
            }
        }

        Ok(Box::new(LineReader::new(handle)))
    }

    fn cleanup(&self, port: &str) {
        release_port(port);
    }
}

/// Terminate other processes holding `port` and reset its hang-up flag.
#[cfg(unix)]
fn release_port(port: &str) {
    use std::process::Command;

    match Command::new("lsof").arg(port).output() {
        Ok(output) => {
            let own_pid = std::process::id();
            let listing = String::from_utf8_lossy(&output.stdout);
            for pid in parse_lsof_pids(&listing) {
                if pid == own_pid {
                    continue;
                }
                info!(pid, port, "terminating process holding serial port");
                if let Err(e) = Command::new("kill").arg("-9").arg(pid.to_string()).status() {
                    warn!(pid, error = %e, "could not terminate port holder");
                }
            }
        }
        Err(e) => debug!(error = %e, "lsof unavailable, skipping port reclaim"),
    }

    let stty_flag = if cfg!(target_os = "macos") { "-f" } else { "-F" };
    match std::process::Command::new("stty")
        .args([stty_flag, port, "hupcl"])
        .output()
    {
        Ok(out) if !out.status.success() => {
            debug!(port, "stty reset returned {}", out.status);
        }
        Err(e) => debug!(port, error = %e, "stty unavailable"),
        _ => {}
    }
}

#[cfg(not(unix))]
fn release_port(port: &str) {
    debug!(port, "port reclaim not supported on this platform");
}

/// Extract PIDs from `lsof` output, skipping the header row.
pub(crate) fn parse_lsof_pids(listing: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = listing
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|pid| pid.parse().ok())
        .collect();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails a fixed number of opens, then serves scripted lines.
    struct FlakyBackend {
        failures: AtomicU32,
        opens: AtomicU32,
        cleanups: AtomicU32,
        lines: Mutex<Vec<String>>,
    }

    impl FlakyBackend {
        fn new(failures: u32, lines: &[&str]) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                opens: AtomicU32::new(0),
                cleanups: AtomicU32::new(0),
                lines: Mutex::new(lines.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    struct Scripted(VecDeque<String>);

    impl LineSource for Scripted {
        fn read_line(&mut self) -> Result<Option<String>, SerialError> {
            Ok(self.0.pop_front())
        }
    }

    impl PortBackend for FlakyBackend {
        fn open(&self, port: &str, _: &PortSettings) -> Result<Box<dyn LineSource>, SerialError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SerialError::Open {
                    port: port.to_string(),
                    reason: "Resource busy".to_string(),
                });
            }
            let lines = self.lines.lock().drain(..).collect();
            Ok(Box::new(Scripted(lines)))
        }

        fn cleanup(&self, _port: &str) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            cleanup_settle: Duration::ZERO,
            retry_delay: Duration::ZERO,
            connect_settle: Duration::ZERO,
            reclaim_port: true,
        }
    }

    fn settings() -> PortSettings {
        PortSettings {
            baud_rate: 9600,
            hardware_flow_control: false,
            read_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_open_succeeds_on_third_attempt() {
        let backend = Arc::new(FlakyBackend::new(2, &["512", "600"]));
        let channel = SerialChannel::new(backend.clone(), instant_policy(3));

        let mut conn = channel.open("/dev/ttyUSB0", &settings()).expect("third attempt opens");
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("512"));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("600"));
        assert_eq!(conn.port(), "/dev/ttyUSB0");
    }

    #[test]
    fn test_open_exhaustion_reports_remedies() {
        let backend = Arc::new(FlakyBackend::new(5, &[]));
        let channel = SerialChannel::new(backend.clone(), instant_policy(3));

        let err = match channel.open("/dev/cu.usbmodem1", &settings()) {
            Err(e) => e,
            Ok(_) => panic!("open should fail"),
        };
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        match &err {
            SerialError::Exhausted { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("sudo chmod 666 /dev/cu.usbmodem1"));
        assert!(message.contains("Resource busy"));
    }

    #[test]
    fn test_cleanup_runs_before_retries_and_on_close() {
        let backend = Arc::new(FlakyBackend::new(1, &[]));
        let channel = SerialChannel::new(backend.clone(), instant_policy(3));

        let conn = channel.open("COM10", &settings()).unwrap();
        // initial cleanup plus one between the failed and successful attempt
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 2);
        conn.close();
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_line_reader_splits_and_decodes() {
        let mut reader = LineReader::new(Cursor::new(b"512\r\n60".to_vec()));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("512"));
        // the trailing partial line is never completed and EOF means disconnect
        assert!(matches!(reader.read_line(), Err(SerialError::Disconnected)));
    }

    #[test]
    fn test_line_reader_keeps_partial_line_across_timeouts() {
        struct Chunks(VecDeque<std::io::Result<Vec<u8>>>);
        impl Read for Chunks {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.pop_front() {
                    Some(Ok(bytes)) => {
                        buf[..bytes.len()].copy_from_slice(&bytes);
                        Ok(bytes.len())
                    }
                    Some(Err(e)) => Err(e),
                    None => Ok(0),
                }
            }
        }

        let timeout = || Err(std::io::Error::new(ErrorKind::TimedOut, "timeout"));
        let mut reader = LineReader::new(Chunks(VecDeque::from(vec![
            Ok(b"51".to_vec()),
            timeout(),
            Ok(b"2\n".to_vec()),
        ])));
        assert_eq!(reader.read_line().unwrap(), None);
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("512"));
    }

    #[test]
    fn test_parse_lsof_pids() {
        let listing = "COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\n\
                       screen  4242 me    5u   CHR  9,3   0t0      611 /dev/cu.usbmodem1\n\
                       screen  4242 me    6u   CHR  9,3   0t0      611 /dev/cu.usbmodem1\n\
                       python  777  me    3u   CHR  9,3   0t0      611 /dev/cu.usbmodem1\n";
        assert_eq!(parse_lsof_pids(listing), vec![4242, 777]);
        assert!(parse_lsof_pids("").is_empty());
    }
}
