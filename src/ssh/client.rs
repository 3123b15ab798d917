//! SSH connection bring-up.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{ChannelStream, Disconnect};
use tracing::debug;

use super::known_hosts::{self, HostKeyPolicy};
use super::{auth, exec, identity, interactive, SshContext};
use crate::error::{Error, Result};
use crate::exec::{ExecOptions, ExecStdin, ExecSink};
use crate::host::SshSpec;

/// A single SSH-reachable host, possibly tunneled through a chain of
/// bastions. Constructed inert; `connect` brings it up.
pub struct SshTransport {
    spec: SshSpec,
    ctx: Arc<SshContext>,
    name: String,
    identity: OnceLock<identity::ResolvedIdentity>,
    handle: RwLock<Option<Arc<Handle<ClientHandler>>>>,
    bastion: RwLock<Option<Arc<SshTransport>>>,
    windows: RwLock<Option<bool>>,
}

impl SshTransport {
    pub(crate) fn new(spec: SshSpec, ctx: Arc<SshContext>) -> Self {
        let name = format!("[ssh] {}:{}", spec.address, spec.port);
        Self {
            spec,
            ctx,
            name,
            identity: OnceLock::new(),
            handle: RwLock::new(None),
            bastion: RwLock::new(None),
            windows: RwLock::new(None),
        }
    }

    pub fn protocol(&self) -> &'static str {
        "SSH"
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.handle.read().is_some()
    }

    pub(crate) fn handle(&self) -> Result<Arc<Handle<ClientHandler>>> {
        self.handle.read().clone().ok_or(Error::NotConnected)
    }

    fn resolved_identity(&self) -> &identity::ResolvedIdentity {
        self.identity
            .get_or_init(|| identity::resolve(&self.spec, &self.ctx, &self.name))
    }

    /// Opens the connection: resolve identities, pick a host-key policy,
    /// assemble auth methods, dial (directly or through the bastion chain)
    /// and authenticate.
    pub async fn connect(&self) -> Result<()> {
        let identity = self.resolved_identity().clone();
        let policy = known_hosts::select_policy(&self.spec, &self.ctx, &self.name)?;
        let (methods, agent) = auth::assemble(&self.spec, &identity, &self.ctx, &self.name).await?;

        let config = Arc::new(client::Config {
            nodelay: true,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: self.spec.address.clone(),
            port: self.spec.port,
            policy,
        };

        let mut handle = match &self.spec.bastion {
            None => {
                debug!("{}: connecting", self.name);
                client::connect(
                    config,
                    (self.spec.address.as_str(), self.spec.port),
                    handler,
                )
                .await
                .map_err(|err| {
                    Error::cant_connect_with(format!("{}: dial", self.name), err)
                })?
            }
            Some(bastion_spec) => {
                let bastion =
                    Arc::new(SshTransport::new((**bastion_spec).clone(), self.ctx.clone()));
                Box::pin(bastion.connect()).await.map_err(|err| {
                    Error::cant_connect_with(format!("{}: bastion connect", self.name), err)
                })?;
                let stream = bastion
                    .open_tunnel(&self.spec.address, self.spec.port)
                    .await?;
                debug!("{}: connecting through {}", self.name, bastion.name);
                let handle = client::connect_stream(config, stream, handler)
                    .await
                    .map_err(|err| {
                        Error::cant_connect_with(
                            format!("{}: bastion client connect", self.name),
                            err,
                        )
                    })?;
                *self.bastion.write() = Some(bastion);
                handle
            }
        };

        auth::authenticate(&mut handle, &self.spec.user, &methods, agent, &self.name).await?;
        *self.handle.write() = Some(Arc::new(handle));
        debug!("{}: connected", self.name);
        Ok(())
    }

    /// Opens a raw stream to `host:port` through this (connected) host.
    /// Used for nested SSH hops and for the WinRM bastion forwarder.
    pub(crate) async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream<client::Msg>> {
        let handle = self.handle()?;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|err| {
                Error::cant_connect(format!("{}: open tunnel to {host}:{port}: {err}", self.name))
            })?;
        Ok(channel.into_stream())
    }

    /// Idempotent; tears down the bastion chain as well.
    pub async fn disconnect(&self) {
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "").await;
        }
        let bastion = self.bastion.write().take();
        if let Some(bastion) = bastion {
            Box::pin(bastion.disconnect()).await;
        }
    }

    /// Whether the remote runs Windows. Unknown until probed; the probe
    /// runs `cmd.exe /c exit 0` once and caches the verdict.
    pub async fn is_windows(&self) -> bool {
        if let Some(known) = *self.windows.read() {
            return known;
        }
        if !self.is_connected() {
            return false;
        }
        debug!("{}: checking if the host is windows", self.name);
        let windows = exec::exec(
            self,
            "cmd.exe /c exit 0",
            &ExecOptions::default().hide_output(),
        )
        .await
        .is_ok();
        debug!("{}: host is windows: {windows}", self.name);
        *self.windows.write() = Some(windows);
        windows
    }

    /// OS knowledge without triggering a probe; `None` until detected.
    pub(crate) fn windows_hint(&self) -> Option<bool> {
        *self.windows.read()
    }

    pub async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<()> {
        exec::exec(self, cmd, opts).await
    }

    pub async fn exec_streams(
        &self,
        cmd: &str,
        stdin: Option<ExecStdin>,
        stdout: ExecSink,
        stderr: ExecSink,
        opts: &ExecOptions,
    ) -> Result<exec::SshWaiter> {
        exec::exec_streams(self, cmd, stdin, stdout, stderr, opts).await
    }

    pub async fn exec_interactive(&self, cmd: &str) -> Result<()> {
        interactive::exec_interactive(self, cmd).await
    }
}

/// russh event handler; verifies the server key against the selected
/// policy.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        self.policy
            .verify(&self.host, self.port, server_public_key)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn transport(spec: SshSpec) -> SshTransport {
        SshTransport::new(
            spec,
            SshContext::new(StdArc::new(|_: &str, _: &str| Vec::<String>::new())),
        )
    }

    #[test]
    fn printable_name_includes_transport_and_endpoint() {
        let mut spec = SshSpec::new("10.0.0.1");
        spec.port = 2222;
        let t = transport(spec);
        assert_eq!(t.name(), "[ssh] 10.0.0.1:2222");
        assert_eq!(t.protocol(), "SSH");
        assert_eq!(t.address(), "10.0.0.1");
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn operations_before_connect_report_not_connected() {
        let t = transport(SshSpec::new("10.0.0.1"));
        assert!(matches!(t.handle(), Err(Error::NotConnected)));
        assert!(matches!(
            t.exec("true", &ExecOptions::default()).await,
            Err(Error::NotConnected)
        ));
        assert!(!t.is_windows().await);
        // disconnect before connect is a no-op
        t.disconnect().await;
    }
}
