//! OpenSSH client configuration lookups.
//!
//! The resolver only ever asks "all values of key K for host H", so the
//! source is a small trait that tests can replace with a closure.

use std::fs;
use std::path::PathBuf;

use crate::paths::home_dir;

/// Answers SSH-config queries. The default implementation reads the user's
/// `~/.ssh/config`; tests plug in closures.
pub trait SshConfigSource: Send + Sync {
    /// All values recorded for `key` in sections matching `host`, in file
    /// order. An empty vec means "not configured".
    fn get_all(&self, host: &str, key: &str) -> Vec<String>;
}

impl<F> SshConfigSource for F
where
    F: Fn(&str, &str) -> Vec<String> + Send + Sync,
{
    fn get_all(&self, host: &str, key: &str) -> Vec<String> {
        self(host, key)
    }
}

/// Reads the OpenSSH client configuration file on every query; a missing or
/// unreadable file just means no answers.
#[derive(Debug, Default)]
pub struct SystemSshConfig {
    path: Option<PathBuf>,
}

impl SystemSshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    fn config_path(&self) -> Option<PathBuf> {
        match &self.path {
            Some(p) => Some(p.clone()),
            None => home_dir().ok().map(|h| h.join(".ssh").join("config")),
        }
    }
}

impl SshConfigSource for SystemSshConfig {
    fn get_all(&self, host: &str, key: &str) -> Vec<String> {
        let Some(path) = self.config_path() else {
            return Vec::new();
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        lookup(&parse(&content), host, key)
    }
}

struct Section {
    patterns: Vec<String>,
    entries: Vec<(String, String)>,
}

/// Parse into `Host` sections. Directives before the first `Host` line
/// apply to every host.
fn parse(content: &str) -> Vec<Section> {
    let mut sections = vec![Section {
        patterns: vec!["*".into()],
        entries: Vec::new(),
    }];

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // "Key Value" or "Key=Value"
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => {
                let mut it = line.splitn(2, char::is_whitespace);
                let k = it.next().unwrap_or_default();
                let v = it.next().unwrap_or_default().trim();
                (k, v)
            }
        };
        if value.is_empty() {
            continue;
        }

        if key.eq_ignore_ascii_case("host") {
            sections.push(Section {
                patterns: value.split_whitespace().map(str::to_string).collect(),
                entries: Vec::new(),
            });
        } else if let Some(section) = sections.last_mut() {
            section.entries.push((key.to_lowercase(), value.to_string()));
        }
    }

    sections
}

fn lookup(sections: &[Section], host: &str, key: &str) -> Vec<String> {
    let key = key.to_lowercase();
    let mut values = Vec::new();
    for section in sections {
        if !section_matches(section, host) {
            continue;
        }
        for (k, v) in &section.entries {
            if *k == key {
                values.push(v.clone());
            }
        }
    }
    values
}

fn section_matches(section: &Section, host: &str) -> bool {
    let mut matched = false;
    for pattern in &section.patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob(negated.as_bytes(), host.as_bytes()) {
                return false;
            }
        } else if glob(pattern.as_bytes(), host.as_bytes()) {
            matched = true;
        }
    }
    matched
}

/// OpenSSH-style pattern match: `*` any run, `?` any one, case-insensitive.
fn glob(pattern: &[u8], host: &[u8]) -> bool {
    match pattern.first() {
        None => host.is_empty(),
        Some(b'*') => {
            glob(&pattern[1..], host) || (!host.is_empty() && glob(pattern, &host[1..]))
        }
        Some(b'?') => !host.is_empty() && glob(&pattern[1..], &host[1..]),
        Some(&c) => {
            host.first()
                .is_some_and(|&h| h.eq_ignore_ascii_case(&c))
                && glob(&pattern[1..], &host[1..])
        }
    }
}
