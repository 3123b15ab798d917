//! Declarative host descriptions.
//!
//! A [`HostSpec`] says how a host can be reached; at most one transport slot
//! may be populated. The field names mirror the YAML keys consumers already
//! use (`keyPath`, `useHTTPS`, `winRM`, ...), so host inventories can be
//! deserialized directly into these types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::expand_path;

/// Default WinRM HTTP port; auto-promoted when HTTPS is enabled.
pub const DEFAULT_WINRM_PORT: u16 = 5985;
/// Default WinRM HTTPS port.
pub const DEFAULT_WINRM_TLS_PORT: u16 = 5986;

/// Process-local callback used to obtain a passphrase for an encrypted
/// private key. Never serialized.
#[derive(Clone)]
pub struct PasswordCallback(pub Arc<dyn Fn() -> Result<String> + Send + Sync>);

impl PasswordCallback {
    pub fn new(f: impl Fn() -> Result<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self) -> Result<String> {
        (self.0)()
    }
}

impl fmt::Debug for PasswordCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordCallback")
    }
}

fn default_ssh_user() -> String {
    "root".into()
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH transport description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSpec {
    pub address: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Explicit private key path. When set, SSH config and conventional
    /// defaults are not consulted.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Literal known-hosts key material (`keytype base64`), accepted as the
    /// only valid server key.
    #[serde(default)]
    pub host_key: Option<String>,
    #[serde(default)]
    pub bastion: Option<Box<SshSpec>>,
    #[serde(skip)]
    pub password_callback: Option<PasswordCallback>,
}

impl SshSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: default_ssh_user(),
            port: default_ssh_port(),
            key_path: None,
            host_key: None,
            bastion: None,
            password_callback: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::ValidationFailed("ssh address is required".into()));
        }
        if self.port == 0 {
            return Err(Error::ValidationFailed(format!(
                "ssh port {} is out of range",
                self.port
            )));
        }
        self.check_bastion_chain()?;
        if let Some(bastion) = &self.bastion {
            bastion.validate()?;
        }
        Ok(())
    }

    /// A bastion may itself have a bastion; the chain must not loop back on
    /// itself (compared by address, port and user).
    fn check_bastion_chain(&self) -> Result<()> {
        let mut seen = vec![(self.address.clone(), self.port, self.user.clone())];
        let mut hop = self.bastion.as_deref();
        while let Some(b) = hop {
            let id = (b.address.clone(), b.port, b.user.clone());
            if seen.contains(&id) {
                return Err(Error::ValidationFailed(format!(
                    "bastion chain loops back to {}:{}",
                    b.address, b.port
                )));
            }
            seen.push(id);
            hop = b.bastion.as_deref();
        }
        Ok(())
    }
}

fn default_winrm_user() -> String {
    "Administrator".into()
}

fn default_winrm_port() -> u16 {
    DEFAULT_WINRM_PORT
}

/// WinRM transport description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmSpec {
    pub address: String,
    #[serde(default = "default_winrm_user")]
    pub user: String,
    #[serde(default = "default_winrm_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "useHTTPS", default)]
    pub use_https: bool,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    #[serde(rename = "useNTLM", default)]
    pub use_ntlm: bool,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub tls_server_name: Option<String>,
    #[serde(default)]
    pub bastion: Option<Box<SshSpec>>,
}

impl WinRmSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: default_winrm_user(),
            port: default_winrm_port(),
            password: None,
            use_https: false,
            insecure: false,
            use_ntlm: false,
            ca_cert_path: None,
            cert_path: None,
            key_path: None,
            tls_server_name: None,
            bastion: None,
        }
    }

    /// Expands certificate paths and promotes the port to 5986 when HTTPS
    /// is requested while the port still carries the HTTP default.
    pub(crate) fn set_defaults(&mut self) {
        for slot in [
            &mut self.ca_cert_path,
            &mut self.cert_path,
            &mut self.key_path,
        ] {
            if let Some(p) = slot.as_deref() {
                if let Ok(expanded) = expand_path(p) {
                    *slot = Some(expanded.to_string_lossy().into_owned());
                }
            }
        }
        if self.port == DEFAULT_WINRM_PORT && self.use_https {
            self.port = DEFAULT_WINRM_TLS_PORT;
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::ValidationFailed("winrm address is required".into()));
        }
        if self.port == 0 {
            return Err(Error::ValidationFailed(format!(
                "winrm port {} is out of range",
                self.port
            )));
        }
        if let Some(bastion) = &self.bastion {
            bastion.validate()?;
        }
        Ok(())
    }
}

/// In-process loopback transport description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackSpec {
    #[serde(default)]
    pub enabled: bool,
}

/// Declarative description of a host. At most one transport slot may be
/// populated; when none is, an enabled loopback is the implicit default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSpec {
    #[serde(rename = "winRM", default)]
    pub winrm: Option<WinRmSpec>,
    #[serde(default)]
    pub ssh: Option<SshSpec>,
    #[serde(default)]
    pub loopback: Option<LoopbackSpec>,
}

impl HostSpec {
    pub fn ssh(spec: SshSpec) -> Self {
        Self {
            ssh: Some(spec),
            ..Default::default()
        }
    }

    pub fn winrm(spec: WinRmSpec) -> Self {
        Self {
            winrm: Some(spec),
            ..Default::default()
        }
    }

    pub fn loopback() -> Self {
        Self {
            loopback: Some(LoopbackSpec { enabled: true }),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let populated = usize::from(self.winrm.is_some())
            + usize::from(self.ssh.is_some())
            + usize::from(self.loopback.is_some());
        if populated > 1 {
            return Err(Error::ValidationFailed(
                "only one transport may be configured per host".into(),
            ));
        }
        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
        }
        if let Some(winrm) = &self.winrm {
            winrm.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winrm_port_promotion() {
        let mut spec = WinRmSpec::new("win.example.com");
        spec.use_https = true;
        spec.set_defaults();
        assert_eq!(spec.port, 5986);

        let mut spec = WinRmSpec::new("win.example.com");
        spec.port = 5986;
        spec.set_defaults();
        assert_eq!(spec.port, 5986);

        let mut spec = WinRmSpec::new("win.example.com");
        spec.set_defaults();
        assert_eq!(spec.port, 5985);
    }

    #[test]
    fn at_most_one_transport_slot() {
        let spec = HostSpec {
            ssh: Some(SshSpec::new("a")),
            loopback: Some(LoopbackSpec { enabled: true }),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(Error::ValidationFailed(_))
        ));
        assert!(HostSpec::default().validate().is_ok());
    }

    #[test]
    fn bastion_cycle_is_rejected() {
        let mut target = SshSpec::new("10.0.0.1");
        let mut hop = SshSpec::new("jump.example.com");
        hop.bastion = Some(Box::new(SshSpec::new("10.0.0.1")));
        target.bastion = Some(Box::new(hop));
        assert!(matches!(
            target.validate(),
            Err(Error::ValidationFailed(_))
        ));
    }

    #[test]
    fn bastion_chain_without_cycle_is_fine() {
        let mut target = SshSpec::new("10.0.0.1");
        let mut hop = SshSpec::new("jump.example.com");
        hop.bastion = Some(Box::new(SshSpec::new("outer.example.com")));
        target.bastion = Some(Box::new(hop));
        assert!(target.validate().is_ok());
    }

    #[test]
    fn deserializes_original_field_names() {
        let spec: HostSpec = serde_json::from_str(
            r#"{
                "winRM": {
                    "address": "10.0.0.2",
                    "useHTTPS": true,
                    "useNTLM": true,
                    "caCertPath": "/tmp/ca.pem"
                }
            }"#,
        )
        .unwrap();
        let winrm = spec.winrm.unwrap();
        assert!(winrm.use_https);
        assert!(winrm.use_ntlm);
        assert_eq!(winrm.user, "Administrator");
        assert_eq!(winrm.port, 5985);
        assert_eq!(winrm.ca_cert_path.as_deref(), Some("/tmp/ca.pem"));
    }

    #[test]
    fn ssh_defaults_apply() {
        let spec: HostSpec = serde_json::from_str(r#"{"ssh": {"address": "10.0.0.1"}}"#).unwrap();
        let ssh = spec.ssh.unwrap();
        assert_eq!(ssh.user, "root");
        assert_eq!(ssh.port, 22);
    }
}
