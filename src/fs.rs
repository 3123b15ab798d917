//! Remote filesystem collaborator interfaces.
//!
//! The crate does not ship filesystem implementations; consumers register a
//! [`FsFactory`] and receive a [`Remote`] handle able to run commands on the
//! bound transport, elevated or not.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::connection::Client;
use crate::error::Result;
use crate::exec::{CommandRewriter, ExecOptions, ExecStdin, ExecSink, ExecWaiter};

/// Subset of file metadata the core needs.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

/// How a remote file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate for writing.
    Create,
    Append,
}

/// An open file on a remote host.
#[async_trait]
pub trait RemoteFile: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Filesystem operations on a remote host.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn open(&self, name: &str) -> Result<Box<dyn RemoteFile>>;
    async fn open_file(&self, name: &str, mode: OpenMode, perm: u32)
        -> Result<Box<dyn RemoteFile>>;
    async fn stat(&self, name: &str) -> Result<FileInfo>;
    /// Hex-encoded SHA-256 digest of the file's contents.
    async fn sha256(&self, name: &str) -> Result<String>;
    async fn read_dir(&self, name: &str) -> Result<Vec<FileInfo>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Builds a filesystem accessor for a connected host. `remote.is_windows()`
/// tells the factory which flavor to construct.
pub trait FsFactory: Send + Sync {
    fn create(&self, remote: Remote) -> Arc<dyn RemoteFs>;
}

impl<F> FsFactory for F
where
    F: Fn(Remote) -> Arc<dyn RemoteFs> + Send + Sync,
{
    fn create(&self, remote: Remote) -> Arc<dyn RemoteFs> {
        self(remote)
    }
}

/// Cloneable execution facade handed to filesystem implementations. Runs
/// commands on the connection's transport, applying the elevation rewriter
/// when one was attached.
#[derive(Clone)]
pub struct Remote {
    pub(crate) client: Arc<Client>,
    pub(crate) windows: bool,
    pub(crate) rewrite: Option<CommandRewriter>,
}

impl Remote {
    pub fn is_windows(&self) -> bool {
        self.windows
    }

    fn apply(&self, opts: ExecOptions) -> ExecOptions {
        match &self.rewrite {
            Some(f) => opts.rewrite(f.clone()),
            None => opts,
        }
    }

    pub async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<()> {
        self.client.exec(cmd, &self.apply(opts)).await
    }

    pub async fn exec_output(&self, cmd: &str, opts: ExecOptions) -> Result<String> {
        let buf = Arc::new(parking_lot::Mutex::new(String::new()));
        let opts = self.apply(opts).capture(buf.clone());
        self.client.exec(cmd, &opts).await?;
        let out = buf.lock().trim().to_string();
        Ok(out)
    }

    pub async fn exec_streams(
        &self,
        cmd: &str,
        stdin: Option<ExecStdin>,
        stdout: ExecSink,
        stderr: ExecSink,
        opts: ExecOptions,
    ) -> Result<ExecWaiter> {
        self.client
            .exec_streams(cmd, stdin, stdout, stderr, &self.apply(opts))
            .await
    }
}
