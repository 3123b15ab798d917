//! Interactive terminal sessions: local terminal wired to a remote PTY.

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size as term_size};
use russh::{ChannelMsg, Pty};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;

use super::client::SshTransport;
use crate::error::{Error, Result};

enum InputEvent {
    Data(Vec<u8>),
    Resize(u16, u16),
    Eof,
}

/// Runs `cmd` (or a login shell when empty) on the remote with the local
/// terminal in raw mode. Terminal state is restored on every exit path.
pub(crate) async fn exec_interactive(t: &SshTransport, cmd: &str) -> Result<()> {
    let handle = t.handle()?;
    let name = t.name().to_string();

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|err| Error::cant_connect(format!("{name}: open session: {err}")))?;

    let _raw = RawModeGuard::activate()
        .map_err(|err| Error::Os(format!("{name}: make terminal raw: {err}")))?;
    let (cols, rows) =
        term_size().map_err(|err| Error::Os(format!("{name}: get terminal size: {err}")))?;

    channel
        .request_pty(
            true,
            "xterm",
            u32::from(cols),
            u32::from(rows),
            0,
            0,
            &[(Pty::ECHO, 1)],
        )
        .await
        .map_err(|err| Error::CommandFailed(format!("{name}: request pty: {err}")))?;

    if cmd.is_empty() {
        debug!("{name}: starting interactive shell");
        channel
            .request_shell(true)
            .await
            .map_err(|err| Error::CommandFailed(format!("{name}: request shell: {err}")))?;
    } else {
        debug!("{name}: starting interactive command");
        channel
            .exec(true, cmd.as_bytes())
            .await
            .map_err(|err| Error::CommandFailed(format!("{name}: start: {err}")))?;
    }

    let (tx, mut rx) = unbounded_channel::<InputEvent>();
    spawn_input_thread(tx.clone());
    spawn_resize_thread(tx);

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut exit_status: Option<u32> = None;
    let mut stdin_closed = false;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(InputEvent::Data(data)) => {
                        if channel.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(InputEvent::Resize(cols, rows)) => {
                        let _ = channel
                            .window_change(u32::from(cols.max(1)), u32::from(rows.max(1)), 0, 0)
                            .await;
                    }
                    Some(InputEvent::Eof) | None => {
                        if !stdin_closed {
                            let _ = channel.eof().await;
                            stdin_closed = true;
                        }
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.write_all(&data).await.map_err(|err| {
                            Error::Os(format!("{name}: write terminal: {err}"))
                        })?;
                        let _ = stdout.flush().await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        let _ = stderr.write_all(&data).await;
                        let _ = stderr.flush().await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                        exit_status = Some(code);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }

    match exit_status {
        Some(0) | None => Ok(()),
        Some(code) => Err(Error::CommandFailed(format!(
            "{name}: interactive session exited with code {code}"
        ))),
    }
}

/// Blocking reader feeding local stdin bytes to the session. Interrupt
/// characters travel as ordinary bytes because the terminal is raw.
fn spawn_input_thread(tx: UnboundedSender<InputEvent>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut stdin = stdin.lock();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(InputEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.send(InputEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    let _ = tx.send(InputEvent::Eof);
                    break;
                }
            }
        }
    });
}

/// Polls the terminal size and forwards window changes to the session.
fn spawn_resize_thread(tx: UnboundedSender<InputEvent>) {
    thread::spawn(move || {
        let mut last = term_size().unwrap_or((80, 24));
        loop {
            thread::sleep(Duration::from_millis(200));
            if let Ok(size) = term_size() {
                if size != last {
                    last = size;
                    if tx.send(InputEvent::Resize(size.0, size.1)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

struct RawModeGuard;

impl RawModeGuard {
    fn activate() -> io::Result<Self> {
        enable_raw_mode().map_err(io::Error::other)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}
