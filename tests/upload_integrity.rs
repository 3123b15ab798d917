//! Upload integrity against an in-memory remote filesystem: the transfer
//! succeeds iff the remote digest matches what was streamed, and any
//! corruption in the copy path surfaces as a checksum mismatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use hawser::{
    Connection, Error, FileInfo, FsFactory, HostSpec, OpenMode, Remote, RemoteFile, RemoteFs,
};

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

struct MemFs {
    files: Files,
    flip_byte: bool,
}

struct MemFile {
    name: String,
    buf: Vec<u8>,
    files: Files,
    flip_byte: bool,
}

#[async_trait]
impl RemoteFile for MemFile {
    async fn read(&mut self, _buf: &mut [u8]) -> hawser::Result<usize> {
        Err(Error::NotImplemented("read-back not needed here".into()))
    }

    async fn write(&mut self, buf: &[u8]) -> hawser::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(mut self: Box<Self>) -> hawser::Result<()> {
        if self.flip_byte {
            let mid = self.buf.len() / 2;
            self.buf[mid] ^= 0x01;
        }
        self.files.lock().insert(self.name.clone(), self.buf);
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemFs {
    async fn open(&self, name: &str) -> hawser::Result<Box<dyn RemoteFile>> {
        Err(Error::NotImplemented(format!("open {name}")))
    }

    async fn open_file(
        &self,
        name: &str,
        _mode: OpenMode,
        _perm: u32,
    ) -> hawser::Result<Box<dyn RemoteFile>> {
        Ok(Box::new(MemFile {
            name: name.to_string(),
            buf: Vec::new(),
            files: self.files.clone(),
            flip_byte: self.flip_byte,
        }))
    }

    async fn stat(&self, name: &str) -> hawser::Result<FileInfo> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| Error::InvalidPath(name.to_string()))?;
        Ok(FileInfo {
            name: name.to_string(),
            size: data.len() as u64,
            ..Default::default()
        })
    }

    async fn sha256(&self, name: &str) -> hawser::Result<String> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| Error::InvalidPath(name.to_string()))?;
        Ok(format!("{:x}", Sha256::digest(data)))
    }

    async fn read_dir(&self, _name: &str) -> hawser::Result<Vec<FileInfo>> {
        Ok(Vec::new())
    }

    async fn delete(&self, name: &str) -> hawser::Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }
}

struct MemFsFactory {
    files: Files,
    flip_byte: bool,
}

impl FsFactory for MemFsFactory {
    fn create(&self, _remote: Remote) -> Arc<dyn RemoteFs> {
        Arc::new(MemFs {
            files: self.files.clone(),
            flip_byte: self.flip_byte,
        })
    }
}

fn test_payload() -> Vec<u8> {
    // deterministic pseudo-random megabyte
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

async fn connected(flip_byte: bool) -> (Connection, Files) {
    let files: Files = Arc::new(Mutex::new(HashMap::new()));
    let conn = Connection::new(HostSpec::loopback())
        .unwrap()
        .with_fs_factory(Arc::new(MemFsFactory {
            files: files.clone(),
            flip_byte,
        }));
    conn.connect().await.unwrap();
    (conn, files)
}

#[cfg(unix)]
#[tokio::test]
async fn upload_verifies_matching_digest() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.bin");
    let payload = test_payload();
    std::fs::write(&src, &payload).unwrap();

    let (conn, files) = connected(false).await;
    conn.upload(&src, "/tmp/x").await.unwrap();

    let stored = files.lock().get("/tmp/x").cloned().unwrap();
    assert_eq!(stored, payload);
}

#[cfg(unix)]
#[tokio::test]
async fn corrupted_transfer_is_a_checksum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.bin");
    std::fs::write(&src, test_payload()).unwrap();

    let (conn, _files) = connected(true).await;
    match conn.upload(&src, "/tmp/x").await {
        Err(Error::ChecksumMismatch(_)) => {}
        other => panic!("expected a checksum mismatch, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn upload_of_missing_source_is_invalid_path() {
    let (conn, _files) = connected(false).await;
    match conn.upload("/definitely/not/here", "/tmp/x").await {
        Err(Error::InvalidPath(_)) => {}
        other => panic!("expected invalid path, got {other:?}"),
    }
}
