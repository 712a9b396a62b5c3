//! Line source backed by an external follower process.
//!
//! The follower (`tail -f <file>` by default) is spawned once per response in
//! its own process group. Its stdout is read without blocking so the server
//! can wait on it alongside the client socket; its stderr is drained on a
//! small thread into the log. The whole group is terminated with `SIGTERM`
//! and the follower reaped, either through `stop` or when the handle is
//! dropped.
//!
//! Line endings follow universal-newline rules: `\n`, `\r\n` and a lone `\r`
//! all end a line, and each is delivered as `\n`.

use bytes::BytesMut;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Result of a non-blocking line read.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A complete line, ending in `\n`.
    Ready(Vec<u8>),
    /// No complete line yet; wait for the follower to become readable.
    Pending,
    /// The follower's output has ended and every line was delivered.
    Exhausted,
}

/// A running follower process.
pub struct TailProcess {
    child: Child,
    stdout: ChildStdout,
    pending: BytesMut,
    eof: bool,
    stopped: bool,
}

impl TailProcess {
    /// Spawn `program args... file`.
    pub fn spawn(program: &str, args: &[String], file: &Path) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let pid = child.id();

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "follower stdout was not captured",
                ));
            }
        };

        if let Err(e) = set_nonblocking(stdout.as_raw_fd()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        if let Some(stderr) = child.stderr.take() {
            log_stderr(pid, stderr);
        }

        debug!(pid, program, file = %file.display(), "Follower started");

        Ok(Self {
            child,
            stdout,
            pending: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            stopped: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Return the next line if one can be had without blocking.
    pub fn try_next_line(&mut self) -> io::Result<Line> {
        if let Some(line) = self.take_line() {
            return Ok(Line::Ready(line));
        }

        if !self.eof {
            self.read_available()?;
            if let Some(line) = self.take_line() {
                return Ok(Line::Ready(line));
            }
        }

        if self.eof {
            Ok(Line::Exhausted)
        } else {
            Ok(Line::Pending)
        }
    }

    /// Read until the pipe would block or reaches end of file.
    fn read_available(&mut self) -> io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stdout.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Split one line off the pending bytes.
    ///
    /// A trailing `\r` is held back until the next byte shows whether it is
    /// part of `\r\n`, unless the output has ended.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == b'\n' || b == b'\r');

        let (end, consumed) = match pos {
            Some(i) if self.pending[i] == b'\n' => (i, i + 1),
            Some(i) if i + 1 < self.pending.len() => {
                if self.pending[i + 1] == b'\n' {
                    (i, i + 2)
                } else {
                    (i, i + 1)
                }
            }
            Some(i) if self.eof => (i, i + 1),
            Some(_) => return None,
            None if self.eof && !self.pending.is_empty() => {
                let rest = self.pending.split();
                return Some(to_utf8(rest.to_vec()));
            }
            None => return None,
        };

        let mut line = self.pending.split_to(consumed).to_vec();
        line.truncate(end);
        line.push(b'\n');
        Some(to_utf8(line))
    }

    /// Terminate and reap the follower.
    ///
    /// Never fails: problems signalling or reaping are logged, since the only
    /// consequence is a leaked process. Returns the exit status when reaped.
    pub fn stop(&mut self) -> Option<ExitStatus> {
        if self.stopped {
            return None;
        }
        self.stopped = true;

        let pid = self.child.id();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "Follower already exited");
                // Its group may still hold children started by a wrapper.
                signal_group(pid);
                Some(status)
            }
            Ok(None) => self.terminate(pid),
            Err(e) => {
                warn!(pid, error = %e, "Failed to poll follower");
                self.terminate(pid)
            }
        }
    }

    fn terminate(&mut self, pid: u32) -> Option<ExitStatus> {
        if !signal_group(pid) {
            if let Err(e) = self.child.kill() {
                warn!(pid, error = %e, "Failed to kill follower");
            }
        }

        match self.child.wait() {
            Ok(status) => {
                debug!(pid, %status, "Follower reaped");
                Some(status)
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to reap follower, process may leak");
                None
            }
        }
    }
}

impl AsRawFd for TailProcess {
    /// The follower's stdout, for readiness polling.
    fn as_raw_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }
}

impl Drop for TailProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send `SIGTERM` to the follower's process group.
///
/// Returns false when signalling failed for a reason other than the group
/// already being gone.
fn signal_group(pid: u32) -> bool {
    // SAFETY: plain signal delivery. The follower leads its own group; a group
    // id is not handed out again while any member is alive.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
    if rc == 0 {
        return true;
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return true;
    }
    warn!(pid, error = %err, "Failed to send SIGTERM to follower group");
    false
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is an open pipe owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Log whatever the follower writes to stderr until the pipe closes.
fn log_stderr(pid: u32, stderr: ChildStderr) {
    let spawned = thread::Builder::new()
        .name("tail-stderr".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&raw);
                        let text = text.trim();
                        if !text.is_empty() {
                            debug!(pid, stderr = text, "Follower diagnostics");
                        }
                    }
                }
            }
        });

    if let Err(e) = spawned {
        warn!(pid, error = %e, "Failed to start follower stderr reader");
    }
}

/// Decode as UTF-8, replacing invalid sequences, and hand back the bytes.
fn to_utf8(raw: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(raw) {
        Ok(line) => line.into_bytes(),
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn process_gone(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc != 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
    }

    /// Block (bounded) until the next line or the end of output.
    fn next_line(tail: &mut TailProcess) -> Option<Vec<u8>> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match tail.try_next_line().unwrap() {
                Line::Ready(line) => return Some(line),
                Line::Exhausted => return None,
                Line::Pending => {}
            }
            assert!(Instant::now() < deadline, "no line from follower in time");

            let mut fds = libc::pollfd {
                fd: tail.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: one valid pollfd for the duration of the call.
            unsafe { libc::poll(&mut fds, 1, 100) };
        }
    }

    #[test]
    fn test_finite_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lines.txt");
        std::fs::write(&file, "first\nsecond\nlast").unwrap();

        let mut tail = TailProcess::spawn("cat", &[], &file).unwrap();
        assert_eq!(next_line(&mut tail), Some(b"first\n".to_vec()));
        assert_eq!(next_line(&mut tail), Some(b"second\n".to_vec()));
        assert_eq!(next_line(&mut tail), Some(b"last".to_vec()));
        assert_eq!(next_line(&mut tail), None);
        assert_eq!(tail.try_next_line().unwrap(), Line::Exhausted);

        assert!(tail.stop().is_some());
        assert!(tail.stop().is_none());
    }

    #[test]
    fn test_universal_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("endings.txt");
        std::fs::write(&file, "a\r\nb\rc\nd\r").unwrap();

        let mut tail = TailProcess::spawn("cat", &[], &file).unwrap();
        assert_eq!(next_line(&mut tail), Some(b"a\n".to_vec()));
        assert_eq!(next_line(&mut tail), Some(b"b\n".to_vec()));
        assert_eq!(next_line(&mut tail), Some(b"c\n".to_vec()));
        assert_eq!(next_line(&mut tail), Some(b"d\n".to_vec()));
        assert_eq!(next_line(&mut tail), None);
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bytes.txt");
        std::fs::write(&file, b"ok\xff\n").unwrap();

        let mut tail = TailProcess::spawn("cat", &[], &file).unwrap();
        assert_eq!(
            next_line(&mut tail),
            Some("ok\u{FFFD}\n".as_bytes().to_vec())
        );
    }

    #[test]
    fn test_follow_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("follow.txt");
        std::fs::write(&file, "existing\n").unwrap();

        let mut tail = TailProcess::spawn("tail", &["-f".to_string()], &file).unwrap();
        let pid = tail.id();
        assert_eq!(next_line(&mut tail), Some(b"existing\n".to_vec()));
        assert_eq!(tail.try_next_line().unwrap(), Line::Pending);

        let mut out = OpenOptions::new().append(true).open(&file).unwrap();
        out.write_all(b"appended\n").unwrap();
        assert_eq!(next_line(&mut tail), Some(b"appended\n".to_vec()));

        let status = tail.stop().unwrap();
        assert!(!status.success());
        assert!(process_gone(pid));
    }

    #[test]
    fn test_drop_reaps_follower() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("follow.txt");
        std::fs::write(&file, "").unwrap();

        let tail = TailProcess::spawn("tail", &["-f".to_string()], &file).unwrap();
        let pid = tail.id();
        drop(tail);

        assert!(process_gone(pid));
    }

    #[test]
    fn test_wrapper_follower_stops_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wrapped.txt");
        std::fs::write(&file, "wrapped\n").unwrap();

        // The shell stays the parent of `tail` instead of exec'ing it.
        let args = vec!["-c".to_string(), "tail -f \"$0\"; true".to_string()];
        let mut tail = TailProcess::spawn("sh", &args, &file).unwrap();
        assert_eq!(next_line(&mut tail), Some(b"wrapped\n".to_vec()));

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            tx.send(tail.stop()).unwrap();
        });

        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stop() did not return");
        assert!(status.is_some());
    }

    #[test]
    fn test_noisy_stderr_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("noisy.txt");
        std::fs::write(&file, "").unwrap();

        // Far more than a pipe buffer of diagnostics before the first line.
        let args = vec![
            "-c".to_string(),
            "i=0; while [ $i -lt 5000 ]; do echo \"warning $i: something went wrong\" >&2; i=$((i+1)); done; echo done"
                .to_string(),
        ];
        let mut tail = TailProcess::spawn("sh", &args, &file).unwrap();
        assert_eq!(next_line(&mut tail), Some(b"done\n".to_vec()));
    }

    #[test]
    fn test_spawn_missing_program() {
        let file = Path::new("/tmp/does-not-matter.txt");
        match TailProcess::spawn("/nonexistent/follower", &[], file) {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
