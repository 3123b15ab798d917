//! Private key path discovery.

use std::path::PathBuf;

use tracing::{debug, trace};

use super::SshContext;
use crate::host::SshSpec;
use crate::paths::expand_and_validate_path;

/// Conventional fallback identities, consulted when neither the spec nor
/// the SSH config names a key.
pub(crate) const DEFAULT_KEY_PATHS: [&str; 3] =
    ["~/.ssh/id_rsa", "~/.ssh/identity", "~/.ssh/id_dsa"];

/// Host name that no sane SSH config matches explicitly; the identity files
/// it resolves to are whatever `Host *` style defaults the user carries.
const NONEXISTENT_HOST: &str = "thisH0stDoe5not3xist";

/// Outcome of identity resolution for one host.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResolvedIdentity {
    /// Existing, non-directory key paths in precedence order.
    pub key_paths: Vec<PathBuf>,
    /// Explicitly intended key: the configured `keyPath` (kept even when it
    /// fails to resolve), or the first discovered path that is not one of
    /// the user's global defaults.
    pub explicit: Option<String>,
}

pub(crate) fn resolve(spec: &SshSpec, ctx: &SshContext, name: &str) -> ResolvedIdentity {
    if let Some(key_path) = spec.key_path.as_deref().filter(|p| !p.is_empty()) {
        // Explicit intent is preserved even when the path does not resolve;
        // the failure surfaces at auth time.
        let mut id = ResolvedIdentity {
            key_paths: Vec::new(),
            explicit: Some(key_path.to_string()),
        };
        match expand_and_validate_path(key_path) {
            Ok(path) => id.key_paths.push(path),
            Err(err) => debug!("{name}: configured key path {key_path}: {err}"),
        }
        return id;
    }

    let mut candidates = ctx.config_all(&spec.address, spec.port, "IdentityFile");
    if candidates.is_empty() {
        trace!("{name}: no identity file paths found in ssh config");
        candidates = DEFAULT_KEY_PATHS.iter().map(|p| p.to_string()).collect();
    } else {
        trace!(
            "{name}: detected {} identity file paths from ssh config",
            candidates.len()
        );
    }

    let mut id = ResolvedIdentity::default();
    for candidate in &candidates {
        match expand_and_validate_path(candidate) {
            Ok(path) => {
                debug!("{name}: using identity file {}", path.display());
                id.key_paths.push(path);
            }
            Err(err) => trace!("{name}: {candidate}: {err}"),
        }
    }

    // A path outside the user's global defaults marks genuinely explicit
    // intent; its errors are fatal at auth time where defaulted ones are
    // skipped.
    let defaults = global_defaults(ctx);
    if let Some(uniq) = id.key_paths.iter().find(|p| !defaults.contains(*p)) {
        id.explicit = Some(uniq.to_string_lossy().into_owned());
    }

    id
}

/// Key paths the SSH config answers for a host that does not exist,
/// computed once per context. Only paths that expand and stat successfully
/// are recorded.
pub(crate) fn global_defaults(ctx: &SshContext) -> &[PathBuf] {
    ctx.global_defaults.get_or_init(|| {
        trace!("discovering global default keypaths");
        ctx.config
            .get_all(NONEXISTENT_HOST, "IdentityFile")
            .iter()
            .filter_map(|p| expand_and_validate_path(p).ok())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::tests::with_home;
    use std::fs;
    use std::sync::Arc;

    fn spec(address: &str) -> SshSpec {
        SshSpec::new(address)
    }

    #[test]
    fn explicit_key_path_wins_and_survives_stat_failure() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("deploy_key");
        fs::write(&key, b"material").unwrap();

        let ctx = SshContext::new(Arc::new(|_: &str, _: &str| Vec::<String>::new()));
        let mut s = spec("target");
        s.key_path = Some(key.to_str().unwrap().to_string());
        let id = resolve(&s, &ctx, "[ssh] target:22");
        assert_eq!(id.key_paths, vec![key.clone()]);
        assert_eq!(id.explicit.as_deref(), key.to_str());

        // Missing file: list stays empty, intent is preserved.
        let mut s = spec("target");
        s.key_path = Some("/nonexistent/deploy_key".into());
        let id = resolve(&s, &ctx, "[ssh] target:22");
        assert!(id.key_paths.is_empty());
        assert_eq!(id.explicit.as_deref(), Some("/nonexistent/deploy_key"));
    }

    #[test]
    fn config_paths_and_uniqueness_against_global_defaults() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(ssh_dir.join("id_rsa"), b"default").unwrap();
        fs::write(ssh_dir.join("work"), b"work").unwrap();

        with_home(home.path(), || {
            // "~/.ssh/id_rsa" answers for every host (a global default);
            // "~/.ssh/work" only for the real one.
            let ctx = SshContext::new(Arc::new(|host: &str, key: &str| {
                if key != "IdentityFile" {
                    return Vec::new();
                }
                if host.starts_with("work.example.com") {
                    vec!["~/.ssh/id_rsa".to_string(), "~/.ssh/work".to_string()]
                } else {
                    vec!["~/.ssh/id_rsa".to_string()]
                }
            }));

            let id = resolve(&spec("work.example.com"), &ctx, "[ssh] work.example.com:22");
            assert_eq!(id.key_paths.len(), 2);
            assert_eq!(
                id.explicit.as_deref(),
                ssh_dir.join("work").to_str(),
                "the non-default path is the implicit explicit key"
            );

            // Same call again: identical result (determinism).
            let again = resolve(&spec("work.example.com"), &ctx, "[ssh] work.example.com:22");
            assert_eq!(again.key_paths, id.key_paths);
            assert_eq!(again.explicit, id.explicit);
        });
    }

    #[test]
    fn all_defaults_means_no_explicit_hint() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(ssh_dir.join("id_rsa"), b"default").unwrap();

        with_home(home.path(), || {
            let ctx = SshContext::new(Arc::new(|_: &str, key: &str| {
                if key == "IdentityFile" {
                    vec!["~/.ssh/id_rsa".to_string()]
                } else {
                    Vec::new()
                }
            }));
            let id = resolve(&spec("plain.example.com"), &ctx, "[ssh] plain.example.com:22");
            assert_eq!(id.key_paths.len(), 1);
            assert!(id.explicit.is_none());
        });
    }

    #[test]
    fn falls_back_to_conventional_defaults() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(ssh_dir.join("identity"), b"old school").unwrap();

        with_home(home.path(), || {
            let ctx = SshContext::new(Arc::new(|_: &str, _: &str| Vec::<String>::new()));
            let id = resolve(&spec("h"), &ctx, "[ssh] h:22");
            assert_eq!(id.key_paths, vec![ssh_dir.join("identity")]);
            // Global defaults are empty for this context, so the surviving
            // path counts as explicit.
            assert_eq!(id.explicit.as_deref(), ssh_dir.join("identity").to_str());
        });
    }

    #[test]
    fn global_defaults_append_only_on_success() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(ssh_dir.join("id_rsa"), b"x").unwrap();

        with_home(home.path(), || {
            let ctx = SshContext::new(Arc::new(|_: &str, key: &str| {
                if key == "IdentityFile" {
                    vec!["~/.ssh/id_rsa".to_string(), "~/.ssh/missing".to_string()]
                } else {
                    Vec::new()
                }
            }));
            let defaults = global_defaults(&ctx);
            assert_eq!(defaults, [ssh_dir.join("id_rsa")]);
        });
    }
}
