//! File transfer to and from the remote host.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use futures::Future;

use crate::error::{NodeError, Result};
use crate::transport::{RemoteFs, RemoteKind, Transport};

type Recurse<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Uploads and downloads single files or whole directories.
#[derive(Clone)]
pub struct File {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("host", &self.transport.host())
            .finish()
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn remote_basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

impl File {
    /// File transfers over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Copy `local` to `remote`.
    ///
    /// A file lands at `remote`, or inside it when `remote` is a directory.
    /// A directory is mirrored into `remote`.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let local_display = local.display().to_string();
        let metadata = tokio::fs::metadata(local)
            .await
            .map_err(|e| NodeError::file(&local_display, "failed to open local file", e))?;
        let fs = self.transport.open_fs().await?;

        if metadata.is_dir() {
            tracing::debug!(local = %local_display, remote, "Uploading directory");
            fs.create_dir(remote.to_string()).await?;
            upload_dir(fs.as_ref(), local, remote).await
        } else if metadata.is_file() {
            let target = match fs.stat(remote.to_string()).await? {
                Some(RemoteKind::Dir) => {
                    let name = local
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    join_remote(remote, &name)
                }
                _ => remote.to_string(),
            };
            tracing::debug!(local = %local_display, remote = %target, "Uploading file");
            upload_file(fs.as_ref(), local, &target).await
        } else {
            Err(NodeError::file(
                local_display,
                "failed to copy file to remote host",
                "is not a directory or file",
            ))
        }
    }

    /// Copy `remote` to `local`.
    ///
    /// A remote directory is mirrored into `local`. A remote file lands at
    /// `local`, or inside it when `local` is a directory.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let fs = self.transport.open_fs().await?;
        match fs.stat(remote.to_string()).await? {
            Some(RemoteKind::Dir) => {
                tracing::debug!(remote, local = %local.display(), "Downloading directory");
                tokio::fs::create_dir_all(local).await.map_err(|e| {
                    NodeError::file(local.display().to_string(), "could not create directory", e)
                })?;
                download_dir(fs.as_ref(), remote, local).await
            }
            Some(RemoteKind::File) => {
                let target = if tokio::fs::metadata(local).await.is_ok_and(|m| m.is_dir()) {
                    local.join(remote_basename(remote))
                } else {
                    local.to_path_buf()
                };
                tracing::debug!(remote, local = %target.display(), "Downloading file");
                download_file(fs.as_ref(), remote, &target).await
            }
            Some(RemoteKind::Other) => Err(NodeError::file(
                remote,
                "failed to copy file from remote host",
                "is not a directory or file",
            )),
            None => Err(NodeError::file(
                remote,
                "failed to copy file from remote host",
                "no such file or directory",
            )),
        }
    }

    /// Write `data` to `remote`, staging it in a local temporary file.
    pub async fn upload_bytes(&self, data: &[u8], remote: &str) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()
            .map_err(|e| NodeError::io_context("failed to create temporary file", e))?;
        staged
            .write_all(data)
            .and_then(|()| staged.flush())
            .map_err(|e| NodeError::io_context("failed to write temporary file", e))?;
        self.upload(staged.path(), remote).await
    }

    /// Read `remote` into memory, staging it in a local temporary directory.
    pub async fn download_bytes(&self, remote: &str) -> Result<Vec<u8>> {
        let staging = tempfile::tempdir()
            .map_err(|e| NodeError::io_context("failed to create temporary directory", e))?;
        let target: PathBuf = staging.path().join("download");
        self.download(remote, &target).await?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| NodeError::io_context("failed to read downloaded file", e))
    }
}

async fn upload_file(fs: &dyn RemoteFs, local: &Path, remote: &str) -> Result<()> {
    let data = tokio::fs::read(local).await.map_err(|e| {
        NodeError::file(local.display().to_string(), "failed to open local file", e)
    })?;
    fs.write_file(remote.to_string(), data)
        .await
        .map_err(|e| NodeError::file(remote, "failed to copy file to remote host", e))
}

fn upload_dir<'a>(fs: &'a dyn RemoteFs, local: &'a Path, remote: &'a str) -> Recurse<'a> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(local).await.map_err(|e| {
            NodeError::file(local.display().to_string(), "could not read directory", e)
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            NodeError::file(local.display().to_string(), "could not read directory", e)
        })? {
            let path = entry.path();
            let target = join_remote(remote, &entry.file_name().to_string_lossy());
            let file_type = entry.file_type().await.map_err(|e| {
                NodeError::file(path.display().to_string(), "failed to open local file", e)
            })?;
            if file_type.is_dir() {
                fs.create_dir(target.clone()).await?;
                upload_dir(fs, &path, &target).await?;
            } else if file_type.is_file() {
                upload_file(fs, &path, &target).await?;
            } else {
                tracing::debug!(path = %path.display(), "Skipping special file");
            }
        }
        Ok(())
    })
}

async fn download_file(fs: &dyn RemoteFs, remote: &str, local: &Path) -> Result<()> {
    let data = fs
        .read_file(remote.to_string())
        .await
        .map_err(|e| NodeError::file(remote, "failed to copy file from remote host", e))?;
    tokio::fs::write(local, data).await.map_err(|e| {
        NodeError::file(local.display().to_string(), "failed to copy file from remote host", e)
    })
}

fn download_dir<'a>(fs: &'a dyn RemoteFs, remote: &'a str, local: &'a Path) -> Recurse<'a> {
    Box::pin(async move {
        let entries = fs
            .read_dir(remote.to_string())
            .await
            .map_err(|e| NodeError::file(remote, "could not read directory", e))?;
        for entry in entries {
            let source = join_remote(remote, &entry.name);
            let target = local.join(&entry.name);
            match entry.kind {
                RemoteKind::Dir => {
                    tokio::fs::create_dir_all(&target).await.map_err(|e| {
                        NodeError::file(target.display().to_string(), "could not create directory", e)
                    })?;
                    download_dir(fs, &source, &target).await?;
                }
                RemoteKind::File => download_file(fs, &source, &target).await?,
                RemoteKind::Other => tracing::debug!(path = %source, "Skipping special file"),
            }
        }
        Ok(())
    })
}
