//! Uniform remote-host connectivity.
//!
//! `hawser` executes commands and transfers files on hosts reachable over
//! SSH (optionally through bastion chains), WinRM, or an in-process
//! loopback, behind one transport-agnostic [`Connection`] API. Hosts are
//! described declaratively:
//!
//! ```no_run
//! use hawser::{Connection, ExecOptions, HostSpec, SshSpec};
//!
//! # async fn run() -> hawser::Result<()> {
//! let mut ssh = SshSpec::new("10.0.0.1");
//! ssh.port = 8022;
//! let host = Connection::new(HostSpec::ssh(ssh))?;
//! host.connect().await?;
//! let hello = host.exec_output("echo hello", ExecOptions::default()).await?;
//! println!("{hello}");
//! host.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! The specs derive `serde`, so inventories deserialize straight into
//! [`HostSpec`] values.

pub mod connection;
pub mod error;
pub mod exec;
pub mod fs;
pub mod host;
pub mod loopback;
pub mod os;
pub mod paths;
pub mod ssh;
pub mod winrm;

mod sudo;

pub use connection::{Client, Connection};
pub use error::{Error, Result};
pub use exec::{ExecOptions, ExecWaiter, OutputStream};
pub use fs::{FileInfo, FsFactory, OpenMode, Remote, RemoteFile, RemoteFs};
pub use host::{HostSpec, LoopbackSpec, PasswordCallback, SshSpec, WinRmSpec};
pub use os::{OsProbe, OsVersion};
pub use ssh::{SshConfigSource, SshContext, SshTransport, SystemSshConfig};
pub use winrm::WinRmTransport;
