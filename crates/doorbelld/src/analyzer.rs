//! Face analysis delegated to a helper process.
//!
//! Per frame the daemon writes one JSON header line
//! `{"width":W,"height":H,"len":N}` followed by `N` raw grayscale bytes to
//! the helper's stdin and reads back one JSON line: an array of
//! `{"box":{"x","y","width","height"},"embedding":[...]}` objects.
//!
//! Each exchange has a deadline. Any failure, including a missed deadline,
//! kills the helper; it is started again on the next frame.

use doorbell_core::{DetectedFace, FaceAnalyzer, Frame};
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default time a helper gets to answer one frame.
pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("failed to start analyzer {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("analyzer pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("analyzer exited")]
    Exited,
    #[error("analyzer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed analyzer response: {0}")]
    Response(#[from] serde_json::Error),
    #[error("frame is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}

#[derive(Serialize)]
struct RequestHeader {
    width: u32,
    height: u32,
    len: usize,
}

/// Wait until `fd` is ready for `events` or `deadline` passes.
///
/// Returns `false` on timeout.
fn wait_ready(fd: RawFd, events: libc::c_short, deadline: Instant) -> std::io::Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let mut fds = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // Round up so a sub-millisecond remainder still waits.
        let timeout_ms = remaining.as_millis().saturating_add(1).min(i32::MAX as u128) as libc::c_int;

        // SAFETY:
        // - `fds` is a single valid pollfd and nfds is 1
        // - the caller keeps `fd` open for the duration of the call
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret > 0 {
            // Readiness, hangup and error all mean the next I/O call won't block.
            return Ok(true);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` is an open pipe end owned by the caller; F_GETFL/F_SETFL
    // only touch its status flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Bytes read past the end of the last response line.
    pending: Vec<u8>,
}

impl Helper {
    fn spawn(command: &[String]) -> Result<Self, AnalyzerError> {
        let (program, args) = command.split_first().ok_or_else(|| AnalyzerError::Spawn {
            program: String::new(),
            source: std::io::Error::new(ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| AnalyzerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AnalyzerError::Exited);
        };

        let helper = Self {
            child,
            stdin,
            stdout,
            pending: Vec::new(),
        };
        if let Err(e) = set_nonblocking(helper.stdin.as_raw_fd())
            .and_then(|()| set_nonblocking(helper.stdout.as_raw_fd()))
        {
            helper.kill();
            return Err(e.into());
        }

        tracing::info!(program = %program, pid = helper.child.id(), "face analyzer started");
        Ok(helper)
    }

    fn exchange(&mut self, frame: &Frame, timeout: Duration) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let deadline = Instant::now() + timeout;
        let header = RequestHeader {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        };
        let mut request = serde_json::to_vec(&header)?;
        request.push(b'\n');
        request.extend_from_slice(&frame.data);

        self.write_all(&request, deadline, timeout)?;
        let line = self.read_line(deadline, timeout)?;
        Ok(serde_json::from_slice(&line)?)
    }

    fn write_all(&mut self, mut buf: &[u8], deadline: Instant, timeout: Duration) -> Result<(), AnalyzerError> {
        while !buf.is_empty() {
            match self.stdin.write(buf) {
                Ok(0) => return Err(AnalyzerError::Exited),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !wait_ready(self.stdin.as_raw_fd(), libc::POLLOUT, deadline)? {
                        return Err(AnalyzerError::Timeout(timeout));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read one response line, without its terminator.
    fn read_line(&mut self, deadline: Instant, timeout: Duration) -> Result<Vec<u8>, AnalyzerError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                line.pop();
                return Ok(line);
            }
            match self.stdout.read(&mut chunk) {
                Ok(0) => return Err(AnalyzerError::Exited),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !wait_ready(self.stdout.as_raw_fd(), libc::POLLIN, deadline)? {
                        return Err(AnalyzerError::Timeout(timeout));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// [`FaceAnalyzer`] backed by a long-running helper program.
pub struct ProcessAnalyzer {
    command: Vec<String>,
    timeout: Duration,
    helper: Option<Helper>,
}

impl ProcessAnalyzer {
    /// The helper is started lazily on the first frame and gets `timeout`
    /// to take each frame and answer it.
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            helper: None,
        }
    }

    fn helper(&mut self) -> Result<&mut Helper, AnalyzerError> {
        if self.helper.is_none() {
            self.helper = Some(Helper::spawn(&self.command)?);
        }
        self.helper.as_mut().ok_or(AnalyzerError::Exited)
    }
}

impl FaceAnalyzer for ProcessAnalyzer {
    type Error = AnalyzerError;

    fn detect_and_embed(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let expected = frame.width as usize * frame.height as usize;
        if frame.data.len() != expected {
            return Err(AnalyzerError::FrameSize {
                expected,
                actual: frame.data.len(),
            });
        }

        let timeout = self.timeout;
        let result = self.helper().and_then(|helper| helper.exchange(frame, timeout));
        match result {
            Ok(faces) => {
                tracing::debug!(seq = frame.sequence, faces = faces.len(), "frame analyzed");
                Ok(faces)
            }
            Err(e) => {
                if let Some(helper) = self.helper.take() {
                    helper.kill();
                }
                Err(e)
            }
        }
    }
}

impl Drop for ProcessAnalyzer {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.kill();
        }
    }
}
