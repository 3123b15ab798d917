//! SSH command execution engine.
//!
//! One command per session: the session is opened, the command started,
//! stdin written and closed, then stdout and stderr are consumed by two
//! concurrent pumps that are both joined before the result is returned.

use russh::{Channel, ChannelMsg, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::client::SshTransport;
use crate::error::{Error, Result};
use crate::exec::{pump_stderr, pump_stdout, ExecOptions, ExecStdin, ExecSink};

const PTY_WIDTH: u32 = 80;
const PTY_HEIGHT: u32 = 40;

pub(crate) async fn exec(t: &SshTransport, cmd: &str, opts: &ExecOptions) -> Result<()> {
    let handle = t.handle()?;
    let name = t.name().to_string();
    let cmd = opts.command(cmd);

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|err| Error::cant_connect(format!("{name}: open session: {err}")))?;

    let windows = t.windows_hint();
    let os_known = windows.is_some();
    let is_windows = windows.unwrap_or(false);

    // Only request a PTY when there is no stdin payload: input over a PTY
    // would need an explicit EOT to mark the end of text.
    if opts.stdin.is_none() && os_known && !is_windows {
        channel
            .request_pty(false, "xterm", PTY_WIDTH, PTY_HEIGHT, 0, 0, &[(Pty::ECHO, 0)])
            .await
            .map_err(|err| Error::CommandFailed(format!("{name}: request pty: {err}")))?;
    }

    opts.log_command(&name, &cmd);
    channel
        .exec(true, cmd.as_bytes())
        .await
        .map_err(|err| Error::cant_connect(format!("{name}: start: {err}")))?;

    if let Some(stdin) = &opts.stdin {
        opts.log_stdin(&name);
        channel
            .data(stdin.as_bytes())
            .await
            .map_err(|err| Error::CommandFailed(format!("{name}: write stdin: {err}")))?;
    }
    channel
        .eof()
        .await
        .map_err(|err| Error::CommandFailed(format!("{name}: close stdin: {err}")))?;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
    let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(64);
    let stdout_pump = tokio::spawn(pump_stdout(name.clone(), opts.clone(), out_rx, true));
    let stderr_pump = tokio::spawn(pump_stderr(name.clone(), opts.clone(), err_rx));

    let mut exit_status: Option<u32> = None;
    let mut exit_signal: Option<String> = None;
    let mut got_stderr = false;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                let _ = out_tx.send(data.to_vec()).await;
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                if !data.is_empty() {
                    got_stderr = true;
                }
                let _ = err_tx.send(data.to_vec()).await;
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                exit_signal = Some(format!("{signal_name:?}"))
            }
            _ => {}
        }
    }

    // Close the pumps' inputs and join them; no event is delivered after
    // this function returns.
    drop(out_tx);
    drop(err_tx);
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    if let Some(signal) = exit_signal {
        return Err(Error::CommandFailed(format!(
            "{name}: command terminated by signal {signal}"
        )));
    }
    match exit_status {
        Some(0) => {}
        Some(code) => {
            return Err(Error::CommandFailed(format!(
                "{name}: command exited with code {code}"
            )))
        }
        None => {
            return Err(Error::CommandFailed(format!(
                "{name}: session closed without an exit status"
            )))
        }
    }

    // Windows tooling routinely exits 0 while writing diagnostics to
    // stderr; callers opt into tolerating that.
    if os_known && is_windows && !opts.allow_win_stderr && got_stderr {
        return Err(Error::CommandFailed(format!(
            "{name}: received data in stderr"
        )));
    }

    Ok(())
}

/// A started command whose streams belong to the caller. `wait` drives
/// stdin and both outputs and returns once the remote reports an exit.
pub struct SshWaiter {
    pub(crate) channel: Channel<russh::client::Msg>,
    pub(crate) stdin: Option<ExecStdin>,
    pub(crate) stdout: ExecSink,
    pub(crate) stderr: ExecSink,
    pub(crate) name: String,
}

pub(crate) async fn exec_streams(
    t: &SshTransport,
    cmd: &str,
    stdin: Option<ExecStdin>,
    stdout: ExecSink,
    stderr: ExecSink,
    opts: &ExecOptions,
) -> Result<SshWaiter> {
    let handle = t.handle()?;
    let name = t.name().to_string();
    let cmd = opts.command(cmd);

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|err| Error::cant_connect(format!("{name}: open session: {err}")))?;

    opts.log_command(&name, &cmd);
    channel
        .exec(true, cmd.as_bytes())
        .await
        .map_err(|err| Error::cant_connect(format!("{name}: start: {err}")))?;

    Ok(SshWaiter {
        channel,
        stdin,
        stdout,
        stderr,
        name,
    })
}

impl SshWaiter {
    pub async fn wait(mut self) -> Result<()> {
        let mut stdin_open = self.stdin.is_some();
        if !stdin_open {
            let _ = self.channel.eof().await;
        }

        let mut buf = [0u8; 8192];
        let mut exit_status: Option<u32> = None;

        loop {
            let msg = if stdin_open {
                let stdin = self.stdin.as_mut().expect("stdin_open implies a reader");
                tokio::select! {
                    read = stdin.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => {
                                let _ = self.channel.eof().await;
                                stdin_open = false;
                            }
                            Ok(n) => {
                                if self.channel.data(&buf[..n]).await.is_err() {
                                    stdin_open = false;
                                }
                            }
                        }
                        continue;
                    }
                    msg = self.channel.wait() => msg,
                }
            } else {
                self.channel.wait().await
            };

            let Some(msg) = msg else { break };
            match msg {
                ChannelMsg::Data { data } => {
                    self.stdout.write_all(&data).await.map_err(|err| {
                        Error::CommandFailed(format!("{}: write stdout: {err}", self.name))
                    })?;
                }
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    self.stderr.write_all(&data).await.map_err(|err| {
                        Error::CommandFailed(format!("{}: write stderr: {err}", self.name))
                    })?;
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let _ = self.stdout.flush().await;
        let _ = self.stderr.flush().await;

        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(Error::CommandFailed(format!(
                "{}: command exited with code {code}",
                self.name
            ))),
            None => Err(Error::CommandFailed(format!(
                "{}: session closed without an exit status",
                self.name
            ))),
        }
    }
}
