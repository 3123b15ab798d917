//! SSH transport: identity resolution, auth assembly, host-key policy,
//! connection bring-up (optionally through bastions) and the exec engines.

pub mod config;
pub(crate) mod auth;
pub(crate) mod client;
pub(crate) mod exec;
pub(crate) mod identity;
pub(crate) mod interactive;
pub(crate) mod known_hosts;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, OnceLock};

use parking_lot::Mutex;

pub use client::SshTransport;
pub use config::{SshConfigSource, SystemSshConfig};
pub use exec::SshWaiter;

use auth::CachedAuth;

/// Process-wide SSH state: the pluggable SSH-config source, the per-keypath
/// auth-method cache and the global-defaults set. One shared instance backs
/// every connection unless the consumer injects its own (tests do).
pub struct SshContext {
    pub(crate) config: Arc<dyn SshConfigSource>,
    pub(crate) auth_cache: Mutex<HashMap<PathBuf, CachedAuth>>,
    pub(crate) global_defaults: OnceLock<Vec<PathBuf>>,
}

impl SshContext {
    pub fn new(config: Arc<dyn SshConfigSource>) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth_cache: Mutex::new(HashMap::new()),
            global_defaults: OnceLock::new(),
        })
    }

    /// The process-global context reading the user's `~/.ssh/config`.
    pub fn global() -> Arc<Self> {
        static GLOBAL: LazyLock<Arc<SshContext>> =
            LazyLock::new(|| SshContext::new(Arc::new(SystemSshConfig::new())));
        GLOBAL.clone()
    }

    /// SSH-config lookup scoped to `host:port` first, plain `host` second.
    pub(crate) fn config_all(&self, address: &str, port: u16, key: &str) -> Vec<String> {
        let scoped = format!("{address}:{port}");
        let values = self.config.get_all(&scoped, key);
        if !values.is_empty() {
            return values;
        }
        self.config.get_all(address, key)
    }
}
