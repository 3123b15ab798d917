//! The transport-agnostic connection facade.
//!
//! A [`Connection`] binds a declarative [`HostSpec`] to one live transport
//! and exposes the uniform operation set: connect, execute (plain,
//! streamed or interactive), privilege elevation and verified upload.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::{CommandRewriter, ExecOptions, ExecStdin, ExecSink, ExecWaiter};
use crate::fs::{FsFactory, OpenMode, Remote, RemoteFs};
use crate::host::{HostSpec, LoopbackSpec};
use crate::loopback::LoopbackTransport;
use crate::os::{DefaultOsProbe, OsProbe, OsVersion};
use crate::ssh::{SshContext, SshTransport};
use crate::sudo::{self, SudoFn};
use crate::winrm::WinRmTransport;

/// The bound transport. Variants share the capability set; everything else
/// (sudo, upload, filesystems) lives on the [`Connection`] facade.
pub enum Client {
    WinRm(Arc<WinRmTransport>),
    Loopback(Arc<LoopbackTransport>),
    Ssh(Arc<SshTransport>),
}

impl Client {
    pub async fn connect(&self) -> Result<()> {
        match self {
            Client::WinRm(t) => t.connect().await,
            Client::Loopback(t) => {
                t.connect();
                Ok(())
            }
            Client::Ssh(t) => t.connect().await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            Client::WinRm(t) => t.disconnect().await,
            Client::Loopback(t) => t.disconnect(),
            Client::Ssh(t) => t.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Client::WinRm(t) => t.is_connected(),
            Client::Loopback(t) => t.is_connected(),
            Client::Ssh(t) => t.is_connected(),
        }
    }

    pub async fn is_windows(&self) -> bool {
        match self {
            Client::WinRm(t) => t.is_windows(),
            Client::Loopback(t) => t.is_windows(),
            Client::Ssh(t) => t.is_windows().await,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Client::WinRm(t) => t.protocol(),
            Client::Loopback(t) => t.protocol(),
            Client::Ssh(t) => t.protocol(),
        }
    }

    pub fn address(&self) -> String {
        match self {
            Client::WinRm(t) => t.address().to_string(),
            Client::Loopback(t) => t.address().to_string(),
            Client::Ssh(t) => t.address().to_string(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            Client::WinRm(t) => t.name(),
            Client::Loopback(t) => t.name(),
            Client::Ssh(t) => t.name(),
        }
    }

    pub async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<()> {
        match self {
            Client::WinRm(t) => t.exec(cmd, opts).await,
            Client::Loopback(t) => t.exec(cmd, opts).await,
            Client::Ssh(t) => t.exec(cmd, opts).await,
        }
    }

    pub async fn exec_streams(
        &self,
        cmd: &str,
        stdin: Option<ExecStdin>,
        stdout: ExecSink,
        stderr: ExecSink,
        opts: &ExecOptions,
    ) -> Result<ExecWaiter> {
        match self {
            Client::WinRm(t) => Ok(ExecWaiter::WinRm(
                t.exec_streams(cmd, stdin, stdout, stderr, opts).await?,
            )),
            Client::Loopback(t) => Ok(ExecWaiter::Loopback(
                t.exec_streams(cmd, stdin, stdout, stderr, opts).await?,
            )),
            Client::Ssh(t) => Ok(ExecWaiter::Ssh(
                t.exec_streams(cmd, stdin, stdout, stderr, opts).await?,
            )),
        }
    }

    pub async fn exec_interactive(&self, cmd: &str) -> Result<()> {
        match self {
            Client::WinRm(t) => t.exec_interactive(cmd).await,
            Client::Loopback(t) => t.exec_interactive(cmd).await,
            Client::Ssh(t) => t.exec_interactive(cmd).await,
        }
    }
}

/// A host handle. Construct from a [`HostSpec`], `connect`, then operate.
pub struct Connection {
    spec: HostSpec,
    ssh_ctx: Arc<SshContext>,
    os_probe: Arc<dyn OsProbe>,
    fs_factory: Option<Arc<dyn FsFactory>>,
    client: RwLock<Option<Arc<Client>>>,
    os_version: RwLock<Option<OsVersion>>,
    sudo_fn: RwLock<Option<SudoFn>>,
    fsys: RwLock<Option<Arc<dyn RemoteFs>>>,
    sudo_fsys: RwLock<Option<Arc<dyn RemoteFs>>>,
}

impl Connection {
    pub fn new(spec: HostSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            ssh_ctx: SshContext::global(),
            os_probe: Arc::new(DefaultOsProbe),
            fs_factory: None,
            client: RwLock::new(None),
            os_version: RwLock::new(None),
            sudo_fn: RwLock::new(None),
            fsys: RwLock::new(None),
            sudo_fsys: RwLock::new(None),
        })
    }

    /// Replace the OS probe collaborator.
    pub fn with_os_probe(mut self, probe: Arc<dyn OsProbe>) -> Self {
        self.os_probe = probe;
        self
    }

    /// Register the remote filesystem factory used by `fsys`, `sudo_fsys`
    /// and `upload`.
    pub fn with_fs_factory(mut self, factory: Arc<dyn FsFactory>) -> Self {
        self.fs_factory = Some(factory);
        self
    }

    /// Use a non-global SSH context (custom config source and caches).
    pub fn with_ssh_context(mut self, ctx: Arc<SshContext>) -> Self {
        self.ssh_ctx = ctx;
        self
    }

    /// First configured of WinRM, loopback, SSH; an enabled loopback when
    /// nothing is configured.
    fn build_client(&self) -> Arc<Client> {
        if let Some(winrm) = &self.spec.winrm {
            return Arc::new(Client::WinRm(Arc::new(WinRmTransport::new(
                winrm.clone(),
                self.ssh_ctx.clone(),
            ))));
        }
        if let Some(loopback) = &self.spec.loopback {
            return Arc::new(Client::Loopback(Arc::new(LoopbackTransport::new(
                loopback.clone(),
            ))));
        }
        if let Some(ssh) = &self.spec.ssh {
            return Arc::new(Client::Ssh(Arc::new(SshTransport::new(
                ssh.clone(),
                self.ssh_ctx.clone(),
            ))));
        }
        Arc::new(Client::Loopback(Arc::new(LoopbackTransport::new(
            LoopbackSpec { enabled: true },
        ))))
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client.read().clone().ok_or(Error::NotConnected)
    }

    /// The bound client, or a transient one built from configuration so
    /// the accessors work before `connect`.
    fn current_or_configured(&self) -> Arc<Client> {
        match self.client.read().clone() {
            Some(client) => client,
            None => self.build_client(),
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.current_or_configured().protocol()
    }

    pub fn address(&self) -> String {
        self.current_or_configured().address()
    }

    pub async fn is_windows(&self) -> bool {
        self.current_or_configured().is_windows().await
    }

    /// "Assumed" connected: `connect` succeeded. The transport may have
    /// dropped since; that surfaces on the next command.
    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// The detected OS, populated during `connect`.
    pub fn os_version(&self) -> Option<OsVersion> {
        self.os_version.read().clone()
    }

    /// Connect the configured transport, probe the OS and pick a privilege
    /// elevation strategy.
    pub async fn connect(&self) -> Result<()> {
        let client = match self.client.read().clone() {
            Some(client) => client,
            None => {
                let built = self.build_client();
                *self.client.write() = Some(built.clone());
                built
            }
        };

        if let Err(err) = client.connect().await {
            *self.client.write() = None;
            debug!("{}: failed to connect: {err}", client.name());
            return Err(Error::cant_connect_with(
                format!("{}: client connect", client.name()),
                err,
            ));
        }

        if self.os_version.read().is_none() {
            let os = self.os_probe.probe(self).await?;
            debug!("{}: detected os: {}", client.name(), os.id);
            *self.os_version.write() = Some(os);
        }

        self.configure_sudo().await;
        Ok(())
    }

    /// Idempotent.
    pub async fn disconnect(&self) {
        let client = self.client.write().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
    }

    async fn configure_sudo(&self) {
        if self.sudo_fn.read().is_some() {
            return;
        }
        let windows = self
            .os_version
            .read()
            .as_ref()
            .is_some_and(OsVersion::is_windows);
        let quiet = ExecOptions::default().hide_output();
        if windows {
            if self
                .exec(sudo::SUDO_PROBE_WINDOWS, quiet.clone())
                .await
                .is_ok()
            {
                *self.sudo_fn.write() = Some(sudo::sudo_windows as SudoFn);
            }
            return;
        }
        for (probe, rewriter) in sudo::SUDO_PROBES {
            if self.exec(probe, quiet.clone()).await.is_ok() {
                *self.sudo_fn.write() = Some(rewriter);
                return;
            }
        }
    }

    /// The command rewritten for privilege elevation, or `SudoRequired`
    /// when no elevation strategy probed successfully.
    pub fn sudo(&self, cmd: &str) -> Result<String> {
        match *self.sudo_fn.read() {
            Some(rewriter) => Ok(rewriter(cmd)),
            None => Err(Error::SudoRequired(
                "user is not an administrator and passwordless access elevation \
                 has not been configured"
                    .into(),
            )),
        }
    }

    fn sudo_rewriter(&self) -> Result<CommandRewriter> {
        let rewriter = (*self.sudo_fn.read()).ok_or_else(|| {
            Error::SudoRequired(
                "user is not an administrator and passwordless access elevation \
                 has not been configured"
                    .into(),
            )
        })?;
        Ok(Arc::new(move |cmd: &str| rewriter(cmd)))
    }

    pub async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<()> {
        self.client()?.exec(cmd, &opts).await
    }

    /// Runs the command and returns captured stdout with surrounding
    /// whitespace trimmed.
    pub async fn exec_output(&self, cmd: &str, opts: ExecOptions) -> Result<String> {
        let buf = Arc::new(Mutex::new(String::new()));
        self.client()?
            .exec(cmd, &opts.capture(buf.clone()))
            .await?;
        let out = buf.lock().trim().to_string();
        Ok(out)
    }

    /// Starts the command with caller-owned streams; the returned waiter's
    /// `wait` surfaces the exit status.
    pub async fn exec_streams(
        &self,
        cmd: &str,
        stdin: Option<ExecStdin>,
        stdout: ExecSink,
        stderr: ExecSink,
        opts: ExecOptions,
    ) -> Result<ExecWaiter> {
        self.client()?
            .exec_streams(cmd, stdin, stdout, stderr, &opts)
            .await
    }

    /// Attach the local terminal; an empty command means a login shell
    /// (`cmd` on Windows).
    pub async fn exec_interactive(&self, cmd: &str) -> Result<()> {
        self.client()?.exec_interactive(cmd).await
    }

    /// Remote filesystem accessor, lazily constructed by the registered
    /// factory and cached.
    pub async fn fsys(&self) -> Result<Arc<dyn RemoteFs>> {
        if let Some(fs) = self.fsys.read().clone() {
            return Ok(fs);
        }
        let fs = self.make_fsys(None).await?;
        *self.fsys.write() = Some(fs.clone());
        Ok(fs)
    }

    /// Like `fsys`, with the selected elevation rewriter applied to every
    /// command the filesystem runs.
    pub async fn sudo_fsys(&self) -> Result<Arc<dyn RemoteFs>> {
        if let Some(fs) = self.sudo_fsys.read().clone() {
            return Ok(fs);
        }
        let fs = self.make_fsys(Some(self.sudo_rewriter()?)).await?;
        *self.sudo_fsys.write() = Some(fs.clone());
        Ok(fs)
    }

    async fn make_fsys(&self, rewrite: Option<CommandRewriter>) -> Result<Arc<dyn RemoteFs>> {
        let factory = self.fs_factory.clone().ok_or_else(|| {
            Error::NotImplemented("no remote filesystem factory configured".into())
        })?;
        let remote = Remote {
            client: self.client()?,
            windows: self.is_windows().await,
            rewrite,
        };
        Ok(factory.create(remote))
    }

    /// Copies a local file to the remote host, verifying the transfer with
    /// a SHA-256 digest computed while streaming.
    pub async fn upload(&self, src: impl AsRef<Path>, dst: &str) -> Result<()> {
        let src = src.as_ref();
        self.client()?;

        let mut local = tokio::fs::File::open(src)
            .await
            .map_err(|err| Error::InvalidPath(format!("{}: {err}", src.display())))?;
        let meta = local
            .metadata()
            .await
            .map_err(|err| Error::InvalidPath(format!("stat {}: {err}", src.display())))?;
        let perm = file_mode(&meta);

        let fsys = self.fsys().await?;
        let mut remote = fsys
            .open_file(dst, OpenMode::Create, perm)
            .await
            .map_err(|err| {
                Error::InvalidPath(format!("open remote file {dst} for writing: {err}"))
            })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = local
                .read(&mut buf)
                .await
                .map_err(|err| Error::UploadFailed(format!("read {}: {err}", src.display())))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            let mut written = 0;
            while written < n {
                written += remote.write(&buf[written..n]).await.map_err(|err| {
                    Error::UploadFailed(format!("copy to remote host: {err}"))
                })?;
            }
        }
        remote
            .close()
            .await
            .map_err(|err| Error::UploadFailed(format!("finish remote file {dst}: {err}")))?;

        debug!("validating checksum of {dst} after upload");
        let local_sum = format!("{:x}", hasher.finalize());
        let remote_sum = fsys
            .sha256(dst)
            .await
            .map_err(|err| Error::UploadFailed(format!("validate checksum of {dst}: {err}")))?;
        if !remote_sum.trim().eq_ignore_ascii_case(&local_sum) {
            return Err(Error::ChecksumMismatch(format!(
                "{dst}: expected {local_sum}, remote reported {}",
                remote_sum.trim()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.current_or_configured().name())
    }
}

fn file_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SshSpec, WinRmSpec};

    fn conn(spec: HostSpec) -> Connection {
        Connection::new(spec).unwrap()
    }

    #[test]
    fn transport_selection_prefers_winrm_then_loopback_then_ssh() {
        let c = conn(HostSpec {
            winrm: Some(WinRmSpec::new("win.example.com")),
            ..Default::default()
        });
        assert_eq!(c.protocol(), "WinRM");
        assert_eq!(c.address(), "win.example.com");

        let c = conn(HostSpec::loopback());
        assert_eq!(c.protocol(), "Local");

        let c = conn(HostSpec::ssh(SshSpec::new("10.0.0.1")));
        assert_eq!(c.protocol(), "SSH");
        assert_eq!(c.to_string(), "[ssh] 10.0.0.1:22");

        // nothing configured: implicit loopback
        let c = conn(HostSpec::default());
        assert_eq!(c.protocol(), "Local");
        assert_eq!(c.address(), "127.0.0.1");
    }

    #[tokio::test]
    async fn accessors_are_safe_before_connect() {
        let c = conn(HostSpec {
            winrm: Some(WinRmSpec::new("win.example.com")),
            ..Default::default()
        });
        assert!(!c.is_connected());
        assert!(c.is_windows().await);

        let c = conn(HostSpec::ssh(SshSpec::new("10.0.0.1")));
        assert!(!c.is_windows().await);
        assert!(matches!(
            c.exec("true", ExecOptions::default()).await,
            Err(Error::NotConnected)
        ));
        c.disconnect().await;
    }

    #[tokio::test]
    async fn sudo_requires_a_probed_strategy() {
        let c = conn(HostSpec::loopback());
        assert!(matches!(c.sudo("ls"), Err(Error::SudoRequired(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loopback_connect_probes_os_and_sudo() {
        let c = conn(HostSpec::loopback());
        c.connect().await.unwrap();
        assert!(c.is_connected());
        let os = c.os_version().expect("os probed during connect");
        assert!(!os.is_windows());
        assert!(!os.id.is_empty());

        let out = c
            .exec_output("echo '  padded  '", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "padded");

        c.disconnect().await;
        assert!(!c.is_connected());
        // disconnect twice is fine
        c.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fsys_without_factory_is_not_implemented() {
        let c = conn(HostSpec::loopback());
        c.connect().await.unwrap();
        assert!(matches!(
            c.fsys().await,
            Err(Error::NotImplemented(_))
        ));
    }
}
