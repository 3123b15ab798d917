//! Host-key verification policy.
//!
//! Exactly one policy is selected per connection, in this precedence:
//! a literal key on the spec, the `SSH_KNOWN_HOSTS` environment override
//! (empty value disables verification entirely), the SSH config's
//! `UserKnownHostsFile`, and finally the default `~/.ssh/known_hosts`.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use super::SshContext;
use crate::error::{Error, Result};
use crate::host::SshSpec;
use crate::paths::expand_path;

pub(crate) const KNOWN_HOSTS_ENV: &str = "SSH_KNOWN_HOSTS";
const DEFAULT_KNOWN_HOSTS_PATH: &str = "~/.ssh/known_hosts";

// known-hosts files are not safe for concurrent update; every read or
// append goes through this process-wide lock.
static KNOWN_HOSTS_MUTEX: Mutex<()> = Mutex::new(());

/// Server key verification strategy for one connection.
#[derive(Debug, Clone)]
pub(crate) enum HostKeyPolicy {
    /// Accept only the literal key material from the host spec.
    Static(String),
    /// Check against a known-hosts file. `permissive` switches to
    /// accept-new / warn-on-mismatch.
    File { path: PathBuf, permissive: bool },
    /// Accept anything. Test environments only.
    InsecureIgnore,
}

pub(crate) fn select_policy(spec: &SshSpec, ctx: &SshContext, name: &str) -> Result<HostKeyPolicy> {
    if let Some(line) = spec.host_key.as_deref().filter(|l| !l.is_empty()) {
        debug!("{name}: using host key from the host spec");
        return Ok(HostKeyPolicy::Static(line.to_string()));
    }

    let permissive = ctx
        .config_all(&spec.address, spec.port, "StrictHostKeyChecking")
        .first()
        .is_some_and(|v| v == "no");
    if permissive {
        debug!("{name}: StrictHostKeyChecking is set to 'no'");
    }

    if let Ok(path) = env::var(KNOWN_HOSTS_ENV) {
        if path.is_empty() {
            warn!("{name}: host key verification disabled via {KNOWN_HOSTS_ENV}");
            return Ok(HostKeyPolicy::InsecureIgnore);
        }
        trace!("{name}: using known_hosts file from {KNOWN_HOSTS_ENV}: {path}");
        return Ok(HostKeyPolicy::File {
            path: PathBuf::from(path),
            permissive,
        });
    }

    // The config value is sometimes a single string of space separated
    // paths; take the first one that expands.
    let configured = ctx.config_all(&spec.address, spec.port, "UserKnownHostsFile");
    for candidate in shlex::split(&configured.join(" ")).unwrap_or_default() {
        if let Ok(path) = expand_path(&candidate) {
            trace!(
                "{name}: using known_hosts file from ssh config: {}",
                path.display()
            );
            return Ok(HostKeyPolicy::File { path, permissive });
        }
    }

    let path = expand_path(DEFAULT_KNOWN_HOSTS_PATH)?;
    trace!("{name}: using default known_hosts file {}", path.display());
    Ok(HostKeyPolicy::File { path, permissive })
}

impl HostKeyPolicy {
    pub(crate) fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        match self {
            HostKeyPolicy::InsecureIgnore => Ok(()),
            HostKeyPolicy::Static(line) => {
                if line.contains(&BASE64.encode(key.public_key_bytes())) {
                    Ok(())
                } else {
                    Err(Error::HostKeyMismatch(format!(
                        "server key for {host}:{port} does not match the configured host key \
                         (offered {})",
                        fingerprint(key)
                    )))
                }
            }
            HostKeyPolicy::File { path, permissive } => {
                let _guard = KNOWN_HOSTS_MUTEX.lock();
                verify_in_file(path, *permissive, host, port, key)
            }
        }
    }
}

struct KnownHostEntry {
    host: String,
    key_type: String,
    key_data: String,
}

fn verify_in_file(
    path: &PathBuf,
    permissive: bool,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<()> {
    let entries = load(path);
    let wanted = [lookup_key(host, port), host.to_lowercase()];
    let key_type = key.algorithm().to_string();
    let key_data = BASE64.encode(key.public_key_bytes());

    let mut known_mismatch = None;
    for entry in &entries {
        if entry.key_type != key_type || !wanted.contains(&entry.host) {
            continue;
        }
        if entry.key_data == key_data {
            debug!("host key verified for {host}:{port}");
            return Ok(());
        }
        known_mismatch = Some(fingerprint_from_b64(&entry.key_data));
    }

    if let Some(expected) = known_mismatch {
        if permissive {
            warn!(
                "host key for {host}:{port} changed (expected {expected}, got {}); \
                 accepting because strict checking is disabled",
                fingerprint(key)
            );
            return Ok(());
        }
        return Err(Error::HostKeyMismatch(format!(
            "key for {host}:{port} has changed: expected {expected}, got {}; \
             remove the old key from {} if this is legitimate",
            fingerprint(key),
            path.display()
        )));
    }

    if permissive {
        warn!(
            "unknown host {host}:{port} ({}), adding to {}",
            fingerprint(key),
            path.display()
        );
        append(path, host, port, &key_type, &key_data)?;
        return Ok(());
    }

    Err(Error::cant_connect(format!(
        "unknown host key for {host}:{port} ({}); add it to {} or point {KNOWN_HOSTS_ENV} \
         at a known_hosts file that lists it",
        fingerprint(key),
        path.display()
    )))
}

/// Parse a known-hosts file; a missing file is an empty one. Hashed
/// hostnames are skipped.
fn load(path: &PathBuf) -> Vec<KnownHostEntry> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(key_data)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        for host in hosts.split(',') {
            if host.starts_with('|') {
                continue;
            }
            entries.push(KnownHostEntry {
                host: host.to_lowercase(),
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            });
        }
    }
    entries
}

fn append(path: &PathBuf, host: &str, port: u16, key_type: &str, key_data: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| Error::Os(format!("create {}: {err}", parent.display())))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| Error::Os(format!("open {}: {err}", path.display())))?;
    writeln!(file, "{} {key_type} {key_data}", lookup_key(host, port))
        .map_err(|err| Error::Os(format!("write {}: {err}", path.display())))?;
    Ok(())
}

/// known-hosts lookup form: bare host for the default port, `[host]:port`
/// otherwise.
fn lookup_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{host}]:{port}")
    }
}

/// OpenSSH style SHA256 fingerprint.
fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
}

fn fingerprint_from_b64(stored: &str) -> String {
    match BASE64.decode(stored) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::tests::env_lock;
    use std::sync::Arc;

    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn key() -> PublicKey {
        PublicKey::from_openssh(&format!("ssh-ed25519 {KEY_B64} test")).unwrap()
    }

    fn ctx_with(config: impl Fn(&str, &str) -> Vec<String> + Send + Sync + 'static) -> Arc<SshContext> {
        SshContext::new(Arc::new(config))
    }

    #[test]
    fn lookup_key_form() {
        assert_eq!(lookup_key("Github.com", 22), "github.com");
        assert_eq!(lookup_key("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn file_verification_matches_and_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            format!("github.com,gh ssh-ed25519 {KEY_B64} comment\n"),
        )
        .unwrap();

        assert!(verify_in_file(&path, false, "github.com", 22, &key()).is_ok());
        // alias on the same line works too
        assert!(verify_in_file(&path, false, "gh", 22, &key()).is_ok());

        // same type, different data: mismatch
        std::fs::write(&path, format!("github.com ssh-ed25519 {}x AAAA\n", &KEY_B64[..KEY_B64.len() - 1])).unwrap();
        let err = verify_in_file(&path, false, "github.com", 22, &key()).unwrap_err();
        assert!(err.is_host_key_mismatch());
        // permissive mode warns but accepts
        assert!(verify_in_file(&path, true, "github.com", 22, &key()).is_ok());
    }

    #[test]
    fn unknown_host_strict_vs_accept_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let err = verify_in_file(&path, false, "new.example.com", 2222, &key()).unwrap_err();
        assert!(matches!(err, Error::CantConnect { .. }));
        assert!(!err.is_host_key_mismatch());

        // accept-new records the key, the next strict check passes
        assert!(verify_in_file(&path, true, "new.example.com", 2222, &key()).is_ok());
        let recorded = std::fs::read_to_string(&path).unwrap();
        assert!(recorded.contains("[new.example.com]:2222 ssh-ed25519"));
        assert!(verify_in_file(&path, false, "new.example.com", 2222, &key()).is_ok());
    }

    #[test]
    fn static_policy_compares_key_material() {
        let ok = HostKeyPolicy::Static(format!("h ssh-ed25519 {KEY_B64}"));
        assert!(ok.verify("h", 22, &key()).is_ok());

        let bad = HostKeyPolicy::Static("h ssh-ed25519 AAAAB3NzaC1yc2E".into());
        assert!(bad.verify("h", 22, &key()).unwrap_err().is_host_key_mismatch());
    }

    #[test]
    fn policy_precedence() {
        let _guard = env_lock();
        std::env::remove_var(KNOWN_HOSTS_ENV);

        let mut spec = SshSpec::new("h");
        spec.host_key = Some(format!("ssh-ed25519 {KEY_B64}"));
        let ctx = ctx_with(|_, _| Vec::new());

        // 1. literal host key wins
        assert!(matches!(
            select_policy(&spec, &ctx, "[ssh] h:22").unwrap(),
            HostKeyPolicy::Static(_)
        ));

        // 2. environment override
        let spec = SshSpec::new("h");
        std::env::set_var(KNOWN_HOSTS_ENV, "/tmp/kh");
        match select_policy(&spec, &ctx, "[ssh] h:22").unwrap() {
            HostKeyPolicy::File { path, permissive } => {
                assert_eq!(path, PathBuf::from("/tmp/kh"));
                assert!(!permissive);
            }
            other => panic!("unexpected policy {other:?}"),
        }

        // 2b. empty environment value disables verification
        std::env::set_var(KNOWN_HOSTS_ENV, "");
        assert!(matches!(
            select_policy(&spec, &ctx, "[ssh] h:22").unwrap(),
            HostKeyPolicy::InsecureIgnore
        ));
        std::env::remove_var(KNOWN_HOSTS_ENV);

        // 3. ssh config UserKnownHostsFile (space separated, first usable)
        let ctx = ctx_with(|_, k| {
            if k == "UserKnownHostsFile" {
                vec!["/etc/kh1 /etc/kh2".to_string()]
            } else {
                Vec::new()
            }
        });
        match select_policy(&spec, &ctx, "[ssh] h:22").unwrap() {
            HostKeyPolicy::File { path, .. } => assert_eq!(path, PathBuf::from("/etc/kh1")),
            other => panic!("unexpected policy {other:?}"),
        }

        // 4. default known_hosts under the home directory
        let home = tempfile::tempdir().unwrap();
        let saved = std::env::var_os("HOME");
        std::env::set_var("HOME", home.path());
        let ctx = ctx_with(|_, _| Vec::new());
        match select_policy(&spec, &ctx, "[ssh] h:22").unwrap() {
            HostKeyPolicy::File { path, .. } => {
                assert_eq!(path, home.path().join(".ssh/known_hosts"))
            }
            other => panic!("unexpected policy {other:?}"),
        }
        match saved {
            Some(v) => std::env::set_var("HOME", v),
            None => std::env::remove_var("HOME"),
        }
    }

    #[test]
    fn permissive_mode_follows_strict_host_key_checking() {
        let _guard = env_lock();
        std::env::remove_var(KNOWN_HOSTS_ENV);
        let home = tempfile::tempdir().unwrap();
        let saved = std::env::var_os("HOME");
        std::env::set_var("HOME", home.path());

        let ctx = ctx_with(|_, k| {
            if k == "StrictHostKeyChecking" {
                vec!["no".to_string()]
            } else {
                Vec::new()
            }
        });
        match select_policy(&SshSpec::new("h"), &ctx, "[ssh] h:22").unwrap() {
            HostKeyPolicy::File { permissive, .. } => assert!(permissive),
            other => panic!("unexpected policy {other:?}"),
        }

        match saved {
            Some(v) => std::env::set_var("HOME", v),
            None => std::env::remove_var("HOME"),
        }
    }
}
