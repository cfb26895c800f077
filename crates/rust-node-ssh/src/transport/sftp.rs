//! [`RemoteFs`] over the SFTP subsystem.

use futures::future::BoxFuture;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileType, OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{RemoteEntry, RemoteFs, RemoteKind};
use crate::error::{NodeError, Result};

/// An open SFTP session on one host.
pub(crate) struct SftpFs {
    host: String,
    sftp: SftpSession,
}

impl SftpFs {
    pub(crate) const fn new(host: String, sftp: SftpSession) -> Self {
        Self { host, sftp }
    }

    fn err(&self, e: impl std::fmt::Display) -> NodeError {
        NodeError::channel(&self.host, format!("sftp: {e}"))
    }
}

fn kind_of(file_type: &FileType) -> RemoteKind {
    if file_type.is_dir() {
        RemoteKind::Dir
    } else if file_type.is_file() {
        RemoteKind::File
    } else {
        RemoteKind::Other
    }
}

impl RemoteFs for SftpFs {
    fn stat(&self, path: String) -> BoxFuture<'_, Result<Option<RemoteKind>>> {
        Box::pin(async move {
            match self.sftp.metadata(path).await {
                Ok(attrs) => Ok(Some(kind_of(&attrs.file_type()))),
                Err(SftpError::Status(status)) if status.status_code == StatusCode::NoSuchFile => {
                    Ok(None)
                }
                Err(e) => Err(self.err(e)),
            }
        })
    }

    fn create_dir(&self, path: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Err(e) = self.sftp.create_dir(path.clone()).await {
                if self.stat(path).await? != Some(RemoteKind::Dir) {
                    return Err(self.err(e));
                }
            }
            Ok(())
        })
    }

    fn write_file(&self, path: String, data: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut file = self
                .sftp
                .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
                .await
                .map_err(|e| self.err(e))?;
            file.write_all(&data).await.map_err(|e| self.err(e))?;
            file.flush().await.map_err(|e| self.err(e))?;
            file.shutdown().await.map_err(|e| self.err(e))?;
            Ok(())
        })
    }

    fn read_file(&self, path: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let mut file = self
                .sftp
                .open_with_flags(path, OpenFlags::READ)
                .await
                .map_err(|e| self.err(e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).await.map_err(|e| self.err(e))?;
            Ok(data)
        })
    }

    fn read_dir(&self, path: String) -> BoxFuture<'_, Result<Vec<RemoteEntry>>> {
        Box::pin(async move {
            let entries = self.sftp.read_dir(path).await.map_err(|e| self.err(e))?;
            Ok(entries
                .filter(|entry| {
                    let name = entry.file_name();
                    name != "." && name != ".."
                })
                .map(|entry| RemoteEntry {
                    name: entry.file_name(),
                    kind: kind_of(&entry.metadata().file_type()),
                })
                .collect())
        })
    }

    fn remove_file(&self, path: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.sftp.remove_file(path).await.map_err(|e| self.err(e)) })
    }
}
