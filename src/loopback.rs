//! In-process loopback transport: commands run on the local machine
//! through the platform shell, with the same pump and exit semantics as
//! the network transports.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::exec::{pump_stderr, pump_stdout, ExecOptions, ExecStdin, ExecSink};
use crate::host::LoopbackSpec;

pub struct LoopbackTransport {
    connected: AtomicBool,
    name: String,
}

impl LoopbackTransport {
    pub(crate) fn new(_spec: LoopbackSpec) -> Self {
        Self {
            connected: AtomicBool::new(false),
            name: "[local] localhost".into(),
        }
    }

    pub fn protocol(&self) -> &'static str {
        "Local"
    }

    pub fn address(&self) -> &str {
        "127.0.0.1"
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_windows(&self) -> bool {
        cfg!(windows)
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn shell_command(cmd: &str) -> Command {
        if cfg!(windows) {
            let mut c = Command::new("cmd.exe");
            c.arg("/C").arg(cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        }
    }

    fn spawn(&self, cmd: &str, stdin: Stdio) -> Result<Child> {
        Self::shell_command(cmd)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::CommandFailed(format!("{}: spawn: {err}", self.name)))
    }

    pub async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let cmd = opts.command(cmd);
        opts.log_command(&self.name, &cmd);

        let mut child = self.spawn(&cmd, Stdio::piped())?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(payload) = &opts.stdin {
                opts.log_stdin(&self.name);
                stdin
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|err| {
                        Error::CommandFailed(format!("{}: write stdin: {err}", self.name))
                    })?;
            }
            drop(stdin);
        }

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdout_pump = tokio::spawn(pump_stdout(self.name.clone(), opts.clone(), out_rx, true));
        let stderr_pump = tokio::spawn(pump_stderr(self.name.clone(), opts.clone(), err_rx));

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let got_stderr = std::sync::Arc::new(AtomicBool::new(false));

        let out_feed = tokio::spawn(async move {
            let Some(stdout) = stdout.as_mut() else { return };
            let mut buf = [0u8; 8192];
            while let Ok(n) = stdout.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                if out_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });
        let err_flag = got_stderr.clone();
        let err_feed = tokio::spawn(async move {
            let Some(stderr) = stderr.as_mut() else { return };
            let mut buf = [0u8; 8192];
            while let Ok(n) = stderr.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                err_flag.store(true, Ordering::SeqCst);
                if err_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });

        let status = child
            .wait()
            .await
            .map_err(|err| Error::CommandFailed(format!("{}: wait: {err}", self.name)))?;

        let _ = out_feed.await;
        let _ = err_feed.await;
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;

        if !status.success() {
            return Err(Error::CommandFailed(format!(
                "{}: command exited with code {}",
                self.name,
                status.code().unwrap_or(-1)
            )));
        }

        if self.is_windows() && !opts.allow_win_stderr && got_stderr.load(Ordering::SeqCst) {
            return Err(Error::CommandFailed(format!(
                "{}: received data in stderr",
                self.name
            )));
        }

        Ok(())
    }

    pub async fn exec_streams(
        &self,
        cmd: &str,
        stdin: Option<ExecStdin>,
        stdout: ExecSink,
        stderr: ExecSink,
        opts: &ExecOptions,
    ) -> Result<LoopbackWaiter> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let cmd = opts.command(cmd);
        opts.log_command(&self.name, &cmd);
        let child = self.spawn(
            &cmd,
            if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            },
        )?;
        Ok(LoopbackWaiter {
            child,
            stdin,
            stdout,
            stderr,
            name: self.name.clone(),
        })
    }

    pub async fn exec_interactive(&self, cmd: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut command = if cmd.is_empty() {
            if cfg!(windows) {
                Command::new("cmd.exe")
            } else {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".into());
                let mut c = Command::new(shell);
                c.arg("-l");
                c
            }
        } else {
            Self::shell_command(cmd)
        };

        let status = command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|err| Error::CommandFailed(format!("{}: spawn: {err}", self.name)))?;
        if !status.success() {
            return Err(Error::CommandFailed(format!(
                "{}: interactive session exited with code {}",
                self.name,
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

/// A started local command; `wait` shuttles the caller's streams and
/// surfaces the exit status.
pub struct LoopbackWaiter {
    child: Child,
    stdin: Option<ExecStdin>,
    stdout: ExecSink,
    stderr: ExecSink,
    name: String,
}

impl LoopbackWaiter {
    pub async fn wait(mut self) -> Result<()> {
        if let (Some(mut src), Some(mut sink)) = (self.stdin.take(), self.child.stdin.take()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut src, &mut sink).await;
            });
        }

        let mut child_out = self.child.stdout.take();
        let mut child_err = self.child.stderr.take();
        let mut stdout = self.stdout;
        let mut stderr = self.stderr;
        let out_copy = tokio::spawn(async move {
            if let Some(out) = child_out.as_mut() {
                let _ = tokio::io::copy(out, &mut stdout).await;
                let _ = stdout.flush().await;
            }
        });
        let err_copy = tokio::spawn(async move {
            if let Some(err) = child_err.as_mut() {
                let _ = tokio::io::copy(err, &mut stderr).await;
                let _ = stderr.flush().await;
            }
        });

        let status = self
            .child
            .wait()
            .await
            .map_err(|err| Error::CommandFailed(format!("{}: wait: {err}", self.name)))?;
        let _ = out_copy.await;
        let _ = err_copy.await;

        if !status.success() {
            return Err(Error::CommandFailed(format!(
                "{}: command exited with code {}",
                self.name,
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::exec::OutputStream;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn transport() -> LoopbackTransport {
        let t = LoopbackTransport::new(LoopbackSpec { enabled: true });
        t.connect();
        t
    }

    #[tokio::test]
    async fn echo_delivers_one_stdout_line() {
        let t = transport();
        let lines: Arc<Mutex<Vec<(OutputStream, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let opts = ExecOptions::default()
            .on_output(move |stream, line| sink.lock().push((stream, line.to_string())));
        t.exec("echo hi", &opts).await.unwrap();
        let lines = lines.lock();
        assert_eq!(lines.as_slice(), &[(OutputStream::Stdout, "hi\n".into())]);
    }

    #[tokio::test]
    async fn stdin_payload_reaches_the_command() {
        let t = transport();
        let out: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let opts = ExecOptions::default()
            .stdin("first\nsecond\n")
            .capture(out.clone());
        t.exec("cat", &opts).await.unwrap();
        assert_eq!(out.lock().as_str(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let t = transport();
        let err = t.exec("exit 3", &ExecOptions::default()).await.unwrap_err();
        match err {
            Error::CommandFailed(msg) => assert!(msg.contains("code 3"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn stderr_lines_are_delivered_as_stderr_events() {
        let t = transport();
        let lines: Arc<Mutex<Vec<(OutputStream, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let opts = ExecOptions::default()
            .on_output(move |stream, line| sink.lock().push((stream, line.to_string())));
        t.exec("echo oops 1>&2", &opts).await.unwrap();
        assert_eq!(
            lines.lock().as_slice(),
            &[(OutputStream::Stderr, "oops\n".into())]
        );
    }

    #[tokio::test]
    async fn exec_before_connect_is_not_connected() {
        let t = LoopbackTransport::new(LoopbackSpec { enabled: true });
        assert!(matches!(
            t.exec("true", &ExecOptions::default()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn streamed_exec_surfaces_exit_status() {
        let t = transport();
        let waiter = t
            .exec_streams(
                "cat > /dev/null; exit 0",
                Some(Box::new(std::io::Cursor::new(b"data".to_vec()))),
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        waiter.wait().await.unwrap();

        let waiter = t
            .exec_streams(
                "exit 9",
                None,
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        assert!(matches!(
            waiter.wait().await,
            Err(Error::CommandFailed(_))
        ));
    }
}
