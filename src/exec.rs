//! Per-command execution options and the transport-agnostic waiter.

use std::io::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::Result;

/// Which remote stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Callback receiving one line (with its trailing newline) per delivery.
pub type OutputFn = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Pure function rewriting a command before execution (e.g. sudo wrapping).
pub type CommandRewriter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Writer that replaces line-scanned stdout capture with a raw byte copy.
pub type SharedWriter = Arc<Mutex<Box<dyn io::Write + Send>>>;

/// Local byte source fed to a streamed command's stdin.
pub type ExecStdin = Box<dyn AsyncRead + Send + Unpin>;
/// Local byte sink for a streamed command's stdout or stderr.
pub type ExecSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-call execution modifiers.
#[derive(Clone, Default)]
pub struct ExecOptions {
    pub(crate) stdin: Option<String>,
    pub(crate) writer: Option<SharedWriter>,
    pub(crate) rewrite: Option<CommandRewriter>,
    pub(crate) on_output: Option<OutputFn>,
    pub(crate) capture: Option<Arc<Mutex<String>>>,
    pub(crate) allow_win_stderr: bool,
    pub(crate) hide_command: bool,
    pub(crate) hide_output: bool,
}

impl ExecOptions {
    /// Payload written to the remote stdin; stdin is closed right after.
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Copy raw stdout bytes to `w` instead of line-scanned capture.
    pub fn writer(mut self, w: impl io::Write + Send + 'static) -> Self {
        self.writer = Some(Arc::new(Mutex::new(Box::new(w))));
        self
    }

    /// Rewrite the command before execution.
    pub fn rewrite(mut self, f: CommandRewriter) -> Self {
        self.rewrite = Some(f);
        self
    }

    /// Receive every captured output line.
    pub fn on_output(mut self, f: impl Fn(OutputStream, &str) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(f));
        self
    }

    /// Append captured stdout lines into `buf`.
    pub fn capture(mut self, buf: Arc<Mutex<String>>) -> Self {
        self.capture = Some(buf);
        self
    }

    /// Tolerate stderr output on Windows hosts instead of treating it as a
    /// command failure.
    pub fn allow_win_stderr(mut self) -> Self {
        self.allow_win_stderr = true;
        self
    }

    /// Keep the command line out of the logs (secrets).
    pub fn hide_command(mut self) -> Self {
        self.hide_command = true;
        self
    }

    /// Keep output lines out of the logs.
    pub fn hide_output(mut self) -> Self {
        self.hide_output = true;
        self
    }

    pub(crate) fn command(&self, cmd: &str) -> String {
        match &self.rewrite {
            Some(f) => f(cmd),
            None => cmd.to_string(),
        }
    }

    pub(crate) fn log_command(&self, name: &str, cmd: &str) {
        if self.hide_command {
            debug!("{name}: executing [command hidden]");
        } else {
            debug!("{name}: executing `{cmd}`");
        }
    }

    pub(crate) fn log_stdin(&self, name: &str) {
        debug!("{name}: writing stdin payload");
    }

    /// Deliver one scanned line to the configured sinks.
    pub(crate) fn deliver(&self, name: &str, stream: OutputStream, line: &str) {
        if !self.hide_output {
            match stream {
                OutputStream::Stdout => debug!("{name}: {}", line.trim_end()),
                OutputStream::Stderr => warn!("{name}: {}", line.trim_end()),
            }
        }
        if stream == OutputStream::Stdout {
            if let Some(buf) = &self.capture {
                buf.lock().push_str(line);
            }
        }
        if let Some(f) = &self.on_output {
            f(stream, line);
        }
    }
}

/// Incremental line scanner for the output pumps. Splits on `\n`, drops a
/// trailing `\r`, and flushes any unterminated remainder at end of stream.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, data: &[u8], mut deliver: impl FnMut(&str)) {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            deliver(&String::from_utf8_lossy(&line));
        }
    }

    pub(crate) fn finish(self, mut deliver: impl FnMut(&str)) {
        if !self.buf.is_empty() {
            deliver(&String::from_utf8_lossy(&self.buf));
        }
    }
}

/// Stdout pump: raw copy when a writer override is present, otherwise
/// line-scanned delivery (optionally scrubbing ANSI escapes, which only
/// PTY-backed transports need).
pub(crate) async fn pump_stdout(
    name: String,
    opts: ExecOptions,
    mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    strip_ansi: bool,
) {
    if let Some(writer) = opts.writer.clone() {
        while let Some(chunk) = rx.recv().await {
            if let Err(err) = writer.lock().write_all(&chunk) {
                warn!("{name}: failed to stream stdout: {err}");
            }
        }
        if let Err(err) = writer.lock().flush() {
            warn!("{name}: failed to flush stdout writer: {err}");
        }
        return;
    }

    let mut lines = LineBuffer::default();
    let mut deliver = |line: &str| {
        if strip_ansi {
            let stripped = strip_ansi_escapes::strip_str(line);
            opts.deliver(&name, OutputStream::Stdout, &format!("{stripped}\n"));
        } else {
            opts.deliver(&name, OutputStream::Stdout, &format!("{line}\n"));
        }
    };
    while let Some(chunk) = rx.recv().await {
        lines.push(&chunk, &mut deliver);
    }
    lines.finish(deliver);
}

/// Stderr pump: always line-scanned.
pub(crate) async fn pump_stderr(
    name: String,
    opts: ExecOptions,
    mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    let mut lines = LineBuffer::default();
    let mut deliver = |line: &str| opts.deliver(&name, OutputStream::Stderr, &format!("{line}\n"));
    while let Some(chunk) = rx.recv().await {
        lines.push(&chunk, &mut deliver);
    }
    lines.finish(deliver);
}

/// Handle to a streamed command; `wait` blocks until it finishes and
/// surfaces its exit status.
pub enum ExecWaiter {
    Ssh(crate::ssh::SshWaiter),
    WinRm(crate::winrm::WinRmWaiter),
    Loopback(crate::loopback::LoopbackWaiter),
}

impl ExecWaiter {
    pub async fn wait(self) -> Result<()> {
        match self {
            ExecWaiter::Ssh(w) => w.wait().await,
            ExecWaiter::WinRm(w) => w.wait().await,
            ExecWaiter::Loopback(w) => w.wait().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_and_strips_cr() {
        let mut lines = Vec::new();
        let mut buf = LineBuffer::default();
        buf.push(b"one\r\ntwo\nthr", |l| lines.push(l.to_string()));
        buf.push(b"ee\n", |l| lines.push(l.to_string()));
        buf.finish(|l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn line_buffer_flushes_partial_tail() {
        let mut lines = Vec::new();
        let mut buf = LineBuffer::default();
        buf.push(b"no newline", |l| lines.push(l.to_string()));
        assert!(lines.is_empty());
        buf.finish(|l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["no newline"]);
    }

    #[test]
    fn capture_receives_only_stdout() {
        let buf = Arc::new(Mutex::new(String::new()));
        let opts = ExecOptions::default().capture(buf.clone());
        opts.deliver("[test] host", OutputStream::Stdout, "out\n");
        opts.deliver("[test] host", OutputStream::Stderr, "err\n");
        assert_eq!(buf.lock().as_str(), "out\n");
    }
}
