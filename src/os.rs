//! Remote operating system identification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::Result;
use crate::exec::ExecOptions;

/// Identity of the operating system found on a connected host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    /// Machine-readable identifier (`linux` distros report their os-release
    /// `ID`, Windows hosts report `windows`).
    pub id: String,
    #[serde(default)]
    pub id_like: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
}

impl OsVersion {
    pub fn is_windows(&self) -> bool {
        self.id == "windows"
    }
}

/// Collaborator executed by the dispatcher right after the transport
/// connects, before a sudo strategy is chosen.
#[async_trait]
pub trait OsProbe: Send + Sync {
    async fn probe(&self, conn: &Connection) -> Result<OsVersion>;
}

/// Probe that reads `/etc/os-release` (falling back to `uname`) on
/// Unix-like hosts and `cmd.exe /c ver` on Windows ones.
pub struct DefaultOsProbe;

#[async_trait]
impl OsProbe for DefaultOsProbe {
    async fn probe(&self, conn: &Connection) -> Result<OsVersion> {
        if conn.is_windows().await {
            let banner = conn
                .exec_output("cmd.exe /c ver", ExecOptions::default().allow_win_stderr())
                .await
                .unwrap_or_default();
            return Ok(OsVersion {
                id: "windows".into(),
                id_like: String::new(),
                version: extract_windows_version(&banner),
                name: if banner.is_empty() {
                    "Windows".into()
                } else {
                    banner
                },
            });
        }

        let release = conn
            .exec_output(
                "cat /etc/os-release 2> /dev/null || uname -sr",
                ExecOptions::default(),
            )
            .await?;
        Ok(parse_os_release(&release))
    }
}

fn extract_windows_version(banner: &str) -> String {
    banner
        .split(['[', ']'])
        .nth(1)
        .map(|v| v.trim_start_matches("Version ").trim().to_string())
        .unwrap_or_default()
}

fn parse_os_release(data: &str) -> OsVersion {
    let mut os = OsVersion::default();
    for line in data.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "ID" => os.id = value.to_string(),
            "ID_LIKE" => os.id_like = value.to_string(),
            "VERSION_ID" => os.version = value.to_string(),
            "PRETTY_NAME" => os.name = value.to_string(),
            _ => {}
        }
    }
    if os.id.is_empty() {
        // uname -sr fallback: "Linux 6.1.0-18-amd64"
        let mut parts = data.split_whitespace();
        if let Some(kernel) = parts.next() {
            os.id = kernel.to_lowercase();
            os.name = kernel.to_string();
        }
        if let Some(rel) = parts.next() {
            os.version = rel.to_string();
        }
    }
    os
}
