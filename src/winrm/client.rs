//! WinRM connection bring-up and execution.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ntlm::NtlmAuthenticator;
use super::protocol::{AuthMode, WsmanClient};
use crate::error::{Error, Result};
use crate::exec::{pump_stderr, pump_stdout, ExecOptions, ExecStdin, ExecSink};
use crate::host::WinRmSpec;
use crate::ssh::{SshContext, SshTransport};

/// A WinRM-reachable host. `IsWindows` is true by definition here.
pub struct WinRmTransport {
    spec: WinRmSpec,
    ctx: Arc<SshContext>,
    name: String,
    wsman: RwLock<Option<Arc<WsmanClient>>>,
    bastion: RwLock<Option<Arc<SshTransport>>>,
    forwarder: RwLock<Option<JoinHandle<()>>>,
}

impl WinRmTransport {
    pub(crate) fn new(mut spec: WinRmSpec, ctx: Arc<SshContext>) -> Self {
        spec.set_defaults();
        let name = format!("[winrm] {}:{}", spec.address, spec.port);
        Self {
            spec,
            ctx,
            name,
            wsman: RwLock::new(None),
            bastion: RwLock::new(None),
            forwarder: RwLock::new(None),
        }
    }

    pub fn protocol(&self) -> &'static str {
        "WinRM"
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub fn is_windows(&self) -> bool {
        true
    }

    pub fn is_connected(&self) -> bool {
        self.wsman.read().is_some()
    }

    fn wsman(&self) -> Result<Arc<WsmanClient>> {
        self.wsman.read().clone().ok_or(Error::NotConnected)
    }

    /// Builds the endpoint (routing through the bastion when configured)
    /// and validates it with a probe command; any probe error is fatal.
    pub async fn connect(&self) -> Result<()> {
        let certs = self.load_certificates()?;

        let (host, port) = match &self.spec.bastion {
            Some(bastion_spec) => {
                let bastion = Arc::new(SshTransport::new(
                    (**bastion_spec).clone(),
                    self.ctx.clone(),
                ));
                bastion.connect().await.map_err(|err| {
                    Error::cant_connect_with(format!("{}: bastion connect", self.name), err)
                })?;
                let (addr, task) =
                    start_forwarder(bastion.clone(), self.spec.address.clone(), self.spec.port)
                        .await?;
                *self.bastion.write() = Some(bastion);
                *self.forwarder.write() = Some(task);
                ("127.0.0.1".to_string(), addr.port())
            }
            None => (self.spec.address.clone(), self.spec.port),
        };

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(self.spec.insecure);

        if let Some(ca) = &certs.ca {
            let ca = reqwest::Certificate::from_pem(ca)
                .map_err(|err| Error::InvalidPath(format!("{}: ca cert: {err}", self.name)))?;
            builder = builder.add_root_certificate(ca);
        }

        // NTLM and client-certificate transports are mutually exclusive;
        // NTLM takes precedence.
        let auth = if self.spec.use_ntlm {
            AuthMode::Ntlm(NtlmAuthenticator::new(
                &self.spec.user,
                self.spec.password.as_deref().unwrap_or_default(),
            ))
        } else if self.spec.use_https && certs.cert.is_some() {
            let mut pem = certs.cert.clone().unwrap_or_default();
            if let Some(key) = &certs.key {
                pem.extend_from_slice(key);
            }
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|err| Error::InvalidPath(format!("{}: client cert: {err}", self.name)))?;
            builder = builder.identity(identity);
            AuthMode::Certificate
        } else {
            AuthMode::Basic
        };

        let mut url_host = host.clone();
        if let Some(server_name) = self
            .spec
            .tls_server_name
            .as_deref()
            .filter(|n| !n.is_empty() && self.spec.use_https)
        {
            // reqwest offers no SNI override, so pin the resolved socket
            // addresses under the certificate's name instead.
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|err| {
                    Error::cant_connect(format!("{}: resolve {host}:{port}: {err}", self.name))
                })?
                .collect();
            builder = builder.resolve_to_addrs(server_name, &addrs);
            url_host = server_name.to_string();
        }

        let http = builder.build().map_err(|err| {
            Error::cant_connect(format!("{}: create http client: {err}", self.name))
        })?;
        let scheme = if self.spec.use_https { "https" } else { "http" };
        let url = format!("{scheme}://{url_host}:{port}/wsman");
        let wsman = Arc::new(WsmanClient::new(
            http,
            url,
            self.spec.user.clone(),
            self.spec.password.clone().unwrap_or_default(),
            auth,
        ));
        *self.wsman.write() = Some(wsman);

        debug!("{}: testing connection", self.name);
        if let Err(err) = self
            .exec(
                "echo ok",
                &ExecOptions::default().allow_win_stderr().hide_output(),
            )
            .await
        {
            *self.wsman.write() = None;
            return Err(Error::cant_connect_with(
                format!("{}: test connection", self.name),
                err,
            ));
        }
        debug!("{}: test passed", self.name);
        Ok(())
    }

    /// Idempotent; tears down the forwarder and bastion as well.
    pub async fn disconnect(&self) {
        *self.wsman.write() = None;
        if let Some(task) = self.forwarder.write().take() {
            task.abort();
        }
        let bastion = self.bastion.write().take();
        if let Some(bastion) = bastion {
            bastion.disconnect().await;
        }
    }

    pub async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<()> {
        let wsman = self.wsman()?;
        let cmd = opts.command(cmd);
        opts.log_command(&self.name, &cmd);

        let shell_id = wsman.create_shell().await.map_err(|err| {
            Error::cant_connect_with(format!("{}: create shell", self.name), err)
        })?;
        let result = self.run_in_shell(&wsman, &shell_id, &cmd, opts).await;
        let _ = wsman.delete_shell(&shell_id).await;
        result
    }

    async fn run_in_shell(
        &self,
        wsman: &WsmanClient,
        shell_id: &str,
        cmd: &str,
        opts: &ExecOptions,
    ) -> Result<()> {
        let command_id = wsman.command(shell_id, cmd).await.map_err(|err| {
            Error::CommandFailed(format!("{}: execute command: {err}", self.name))
        })?;

        if let Some(payload) = &opts.stdin {
            opts.log_stdin(&self.name);
            wsman
                .send_stdin(shell_id, &command_id, payload.as_bytes(), true)
                .await
                .map_err(|err| {
                    Error::CommandFailed(format!("{}: write stdin: {err}", self.name))
                })?;
        } else {
            let _ = wsman.send_stdin(shell_id, &command_id, b"", true).await;
        }

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdout_pump =
            tokio::spawn(pump_stdout(self.name.clone(), opts.clone(), out_rx, false));
        let stderr_pump = tokio::spawn(pump_stderr(self.name.clone(), opts.clone(), err_rx));

        let mut exit_code = 0;
        let mut got_stderr = false;
        let mut receive_error = None;

        loop {
            match wsman.receive(shell_id, &command_id).await {
                Ok(chunk) => {
                    if !chunk.stdout.is_empty() {
                        let _ = out_tx.send(chunk.stdout).await;
                    }
                    if !chunk.stderr.is_empty() {
                        got_stderr = true;
                        let _ = err_tx.send(chunk.stderr).await;
                    }
                    if let Some(code) = chunk.exit_code {
                        exit_code = code;
                    }
                    if chunk.done {
                        break;
                    }
                }
                Err(err) => {
                    receive_error = Some(err);
                    break;
                }
            }
        }

        let _ = wsman.signal_terminate(shell_id, &command_id).await;
        drop(out_tx);
        drop(err_tx);
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;

        if let Some(err) = receive_error {
            return Err(Error::CommandFailed(format!(
                "{}: receive output: {err}",
                self.name
            )));
        }
        if exit_code != 0 {
            return Err(Error::CommandFailed(format!(
                "{}: non-zero exit code {exit_code}",
                self.name
            )));
        }
        if !opts.allow_win_stderr && got_stderr {
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
    ) -> Result<WinRmWaiter> {
        let wsman = self.wsman()?;
        let cmd = opts.command(cmd);
        opts.log_command(&self.name, &cmd);

        let shell_id = wsman.create_shell().await.map_err(|err| {
            Error::cant_connect_with(format!("{}: create shell", self.name), err)
        })?;
        let command_id = wsman.command(&shell_id, &cmd).await.map_err(|err| {
            Error::CommandFailed(format!("{}: execute command: {err}", self.name))
        })?;

        Ok(WinRmWaiter {
            wsman,
            shell_id,
            command_id,
            stdin,
            stdout,
            stderr,
            name: self.name.clone(),
        })
    }

    /// Runs the command (default `cmd`) with the local standard streams
    /// attached.
    pub async fn exec_interactive(&self, cmd: &str) -> Result<()> {
        let cmd = if cmd.is_empty() { "cmd" } else { cmd };
        let waiter = self
            .exec_streams(
                cmd,
                Some(Box::new(tokio::io::stdin())),
                Box::new(tokio::io::stdout()),
                Box::new(tokio::io::stderr()),
                &ExecOptions::default(),
            )
            .await?;
        waiter.wait().await
    }

    fn load_certificates(&self) -> Result<LoadedCerts> {
        let read = |slot: &Option<String>, what: &str| -> Result<Option<Vec<u8>>> {
            match slot.as_deref().filter(|p| !p.is_empty()) {
                Some(path) => std::fs::read(path).map(Some).map_err(|err| {
                    Error::InvalidPath(format!("{}: load {what} {path}: {err}", self.name))
                }),
                None => Ok(None),
            }
        };
        Ok(LoadedCerts {
            ca: read(&self.spec.ca_cert_path, "ca cert")?,
            cert: read(&self.spec.cert_path, "cert")?,
            key: read(&self.spec.key_path, "key")?,
        })
    }
}

struct LoadedCerts {
    ca: Option<Vec<u8>>,
    cert: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
}

/// Accepts local TCP connections and shuttles each through a fresh
/// `direct-tcpip` channel on the bastion.
async fn start_forwarder(
    bastion: Arc<SshTransport>,
    target: String,
    target_port: u16,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| Error::Os(format!("bind forwarder: {err}")))?;
    let local = listener
        .local_addr()
        .map_err(|err| Error::Os(format!("forwarder address: {err}")))?;
    debug!("forwarding {local} to {target}:{target_port} through the bastion");

    let task = tokio::spawn(async move {
        loop {
            let Ok((mut tcp, _)) = listener.accept().await else {
                break;
            };
            let bastion = bastion.clone();
            let target = target.clone();
            tokio::spawn(async move {
                match bastion.open_tunnel(&target, target_port).await {
                    Ok(mut stream) => {
                        let _ = tokio::io::copy_bidirectional(&mut tcp, &mut stream).await;
                    }
                    Err(err) => warn!("forwarded connection failed: {err}"),
                }
            });
        }
    });

    Ok((local, task))
}

/// A started WS-Man command; `wait` drives stdin and the receive loop.
pub struct WinRmWaiter {
    wsman: Arc<WsmanClient>,
    shell_id: String,
    command_id: String,
    stdin: Option<ExecStdin>,
    stdout: ExecSink,
    stderr: ExecSink,
    name: String,
}

impl WinRmWaiter {
    pub async fn wait(mut self) -> Result<()> {
        let stdin_task = match self.stdin.take() {
            Some(mut src) => {
                let wsman = self.wsman.clone();
                let shell_id = self.shell_id.clone();
                let command_id = self.command_id.clone();
                Some(tokio::spawn(async move {
                    let mut buf = [0u8; 32_768];
                    loop {
                        match src.read(&mut buf).await {
                            Ok(0) | Err(_) => {
                                let _ = wsman.send_stdin(&shell_id, &command_id, b"", true).await;
                                break;
                            }
                            Ok(n) => {
                                if wsman
                                    .send_stdin(&shell_id, &command_id, &buf[..n], false)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }))
            }
            None => {
                let _ = self
                    .wsman
                    .send_stdin(&self.shell_id, &self.command_id, b"", true)
                    .await;
                None
            }
        };

        let mut exit_code = 0;
        let mut outcome = Ok(());
        loop {
            match self.wsman.receive(&self.shell_id, &self.command_id).await {
                Ok(chunk) => {
                    if !chunk.stdout.is_empty() {
                        if let Err(err) = self.stdout.write_all(&chunk.stdout).await {
                            outcome = Err(Error::CommandFailed(format!(
                                "{}: write stdout: {err}",
                                self.name
                            )));
                            break;
                        }
                    }
                    if !chunk.stderr.is_empty() {
                        if let Err(err) = self.stderr.write_all(&chunk.stderr).await {
                            outcome = Err(Error::CommandFailed(format!(
                                "{}: write stderr: {err}",
                                self.name
                            )));
                            break;
                        }
                    }
                    if let Some(code) = chunk.exit_code {
                        exit_code = code;
                    }
                    if chunk.done {
                        break;
                    }
                }
                Err(err) => {
                    outcome = Err(Error::CommandFailed(format!(
                        "{}: receive output: {err}",
                        self.name
                    )));
                    break;
                }
            }
        }

        let _ = self.stdout.flush().await;
        let _ = self.stderr.flush().await;
        if let Some(task) = stdin_task {
            task.abort();
        }
        let _ = self
            .wsman
            .signal_terminate(&self.shell_id, &self.command_id)
            .await;
        let _ = self.wsman.delete_shell(&self.shell_id).await;

        outcome?;
        if exit_code != 0 {
            return Err(Error::CommandFailed(format!(
                "{}: non-zero exit code {exit_code}",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_reflects_promoted_port() {
        let mut spec = WinRmSpec::new("win.example.com");
        spec.use_https = true;
        let t = WinRmTransport::new(
            spec,
            SshContext::new(Arc::new(|_: &str, _: &str| Vec::<String>::new())),
        );
        assert_eq!(t.name(), "[winrm] win.example.com:5986");
        assert!(t.is_windows());
        assert!(!t.is_connected());
        assert_eq!(t.protocol(), "WinRM");
    }

    #[tokio::test]
    async fn exec_before_connect_is_not_connected() {
        let t = WinRmTransport::new(
            WinRmSpec::new("win.example.com"),
            SshContext::new(Arc::new(|_: &str, _: &str| Vec::<String>::new())),
        );
        assert!(matches!(
            t.exec("echo ok", &ExecOptions::default()).await,
            Err(Error::NotConnected)
        ));
        t.disconnect().await;
    }
}
