//! Privilege elevation probes and command rewriters.

/// Rewrites a command into its privilege-elevated form.
pub type SudoFn = fn(&str) -> String;

/// Probe commands paired with the rewriter to use when one exits zero,
/// consulted in order on non-Windows hosts.
pub(crate) const SUDO_PROBES: [(&str, SudoFn); 3] = [
    (r#"[ "$(id -u)" = 0 ]"#, sudo_noop),
    ("sudo -n true", sudo_sudo),
    ("doas -n true", sudo_doas),
];

/// Probe used on Windows hosts.
pub(crate) const SUDO_PROBE_WINDOWS: &str = r#"whoami | findstr /i "administrator""#;

/// Already root, nothing to do.
pub(crate) fn sudo_noop(cmd: &str) -> String {
    cmd.to_string()
}

/// Wraps a command in `sudo -s`, preserving a leading `VAR=value` prefix as
/// environment passed to sudo and quoting every command token.
pub(crate) fn sudo_sudo(cmd: &str) -> String {
    let Some(parts) = shlex::split(cmd) else {
        return format!("sudo -s -- {cmd}");
    };

    let mut env_end = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.contains('=') {
            env_end = i + 1;
            continue;
        }
        break;
    }

    if env_end == 0 {
        return format!("sudo -s -- {cmd}");
    }

    let quoted: Vec<String> = parts[env_end..].iter().map(|p| quote(p)).collect();
    format!(
        "sudo -s {} -- {}",
        parts[..env_end].join(" "),
        quoted.join(" ")
    )
}

pub(crate) fn sudo_doas(cmd: &str) -> String {
    format!("doas -s -- {cmd}")
}

pub(crate) fn sudo_windows(cmd: &str) -> String {
    format!("runas /user:Administrator {cmd}")
}

/// Single-quotes a token for POSIX shells.
fn quote(token: &str) -> String {
    format!("'{}'", token.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_preserves_env_prefix_and_quotes_command() {
        assert_eq!(
            sudo_sudo("A=1 B=2 cmd arg"),
            "sudo -s A=1 B=2 -- 'cmd' 'arg'"
        );
        assert_eq!(
            sudo_sudo("FOO=1 BAR=2 ls /root"),
            "sudo -s FOO=1 BAR=2 -- 'ls' '/root'"
        );
    }

    #[test]
    fn sudo_without_env_prefix_passes_through() {
        assert_eq!(sudo_sudo("ls /root"), "sudo -s -- ls /root");
    }

    #[test]
    fn sudo_falls_back_on_unparseable_input() {
        assert_eq!(
            sudo_sudo(r#"A=1 echo "unterminated"#),
            r#"sudo -s -- A=1 echo "unterminated"#
        );
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(
            sudo_sudo(r#"X=1 echo "a'b""#),
            r"sudo -s X=1 -- 'echo' 'a'\''b'"
        );
    }

    #[test]
    fn quoted_arguments_survive_as_single_tokens() {
        assert_eq!(
            sudo_sudo(r#"X=1 echo "a b""#),
            "sudo -s X=1 -- 'echo' 'a b'"
        );
    }

    #[test]
    fn other_rewriters() {
        assert_eq!(sudo_noop("ls"), "ls");
        assert_eq!(sudo_doas("ls"), "doas -s -- ls");
        assert_eq!(sudo_windows("dir"), "runas /user:Administrator dir");
    }
}
