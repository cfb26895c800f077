//! In-memory remote filesystem.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;

use crate::error::{NodeError, Result};
use crate::transport::{RemoteEntry, RemoteFs, RemoteKind};

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// A [`RemoteFs`] kept in memory. Clones share contents.
///
/// `/` and `.` always exist. Like SFTP, creating a file or directory needs
/// the parent directory to exist.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

fn normalize(path: &str) -> String {
    let mut path = path;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        if path.starts_with('/') { "/" } else { "." }.to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

fn name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn not_found(path: &str) -> NodeError {
    NodeError::channel("memory", format!("{path}: no such file"))
}

impl MemoryFs {
    /// Empty filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kind(nodes: &BTreeMap<String, Node>, path: &str) -> Option<RemoteKind> {
        if path == "/" || path == "." {
            return Some(RemoteKind::Dir);
        }
        nodes.get(path).map(|node| match node {
            Node::File(_) => RemoteKind::File,
            Node::Dir => RemoteKind::Dir,
        })
    }

    /// Create `path` and its parents.
    pub fn with_dir(&self, path: &str) -> &Self {
        let path = normalize(path);
        let mut nodes = self.nodes();
        let mut current = path.as_str();
        while Self::kind(&nodes, current).is_none() {
            nodes.insert(current.to_string(), Node::Dir);
            current = parent(current);
        }
        self
    }

    /// Create a file, with its parents.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) -> &Self {
        let path = normalize(path);
        self.with_dir(parent(&path));
        self.nodes().insert(path, Node::File(data.into()));
        self
    }

    /// Contents of a file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether `path` is a directory.
    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        Self::kind(&self.nodes(), &normalize(path)) == Some(RemoteKind::Dir)
    }

    /// Every stored path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.nodes().keys().cloned().collect()
    }

    fn require_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<()> {
        match Self::kind(nodes, parent(path)) {
            Some(RemoteKind::Dir) => Ok(()),
            _ => Err(not_found(parent(path))),
        }
    }

    fn create_dir_sync(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes();
        match Self::kind(&nodes, &path) {
            Some(RemoteKind::Dir) => Ok(()),
            Some(_) => Err(NodeError::channel("memory", format!("{path}: file exists"))),
            None => {
                Self::require_parent_dir(&nodes, &path)?;
                nodes.insert(path, Node::Dir);
                Ok(())
            }
        }
    }

    fn write_file_sync(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes();
        if Self::kind(&nodes, &path) == Some(RemoteKind::Dir) {
            return Err(NodeError::channel("memory", format!("{path}: is a directory")));
        }
        Self::require_parent_dir(&nodes, &path)?;
        nodes.insert(path, Node::File(data));
        Ok(())
    }

    fn read_dir_sync(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = normalize(path);
        let nodes = self.nodes();
        if Self::kind(&nodes, &path) != Some(RemoteKind::Dir) {
            return Err(not_found(&path));
        }
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != path && parent(p) == path)
            .map(|(p, node)| RemoteEntry {
                name: name(p).to_string(),
                kind: match node {
                    Node::File(_) => RemoteKind::File,
                    Node::Dir => RemoteKind::Dir,
                },
            })
            .collect())
    }
}

impl RemoteFs for MemoryFs {
    fn stat(&self, path: String) -> BoxFuture<'_, Result<Option<RemoteKind>>> {
        let kind = Self::kind(&self.nodes(), &normalize(&path));
        Box::pin(std::future::ready(Ok(kind)))
    }

    fn create_dir(&self, path: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(std::future::ready(self.create_dir_sync(&path)))
    }

    fn write_file(&self, path: String, data: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(std::future::ready(self.write_file_sync(&path, data)))
    }

    fn read_file(&self, path: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(std::future::ready(
            self.file(&path).ok_or_else(|| not_found(&path)),
        ))
    }

    fn read_dir(&self, path: String) -> BoxFuture<'_, Result<Vec<RemoteEntry>>> {
        Box::pin(std::future::ready(self.read_dir_sync(&path)))
    }

    fn remove_file(&self, path: String) -> BoxFuture<'_, Result<()>> {
        let path = normalize(&path);
        let mut nodes = self.nodes();
        let result = if matches!(nodes.get(&path), Some(Node::File(_))) {
            nodes.remove(&path);
            Ok(())
        } else {
            Err(not_found(&path))
        };
        drop(nodes);
        Box::pin(std::future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(normalize("./check.sh"), "check.sh");
        assert_eq!(normalize("/tmp/dir/"), "/tmp/dir");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("."), ".");
        assert_eq!(parent("/tmp"), "/");
        assert_eq!(parent("/tmp/a"), "/tmp");
        assert_eq!(parent("a"), ".");
    }

    #[tokio::test]
    async fn files_need_a_parent() {
        let fs = MemoryFs::new();
        assert!(fs.write_file("/missing/a".into(), vec![1]).await.is_err());
        fs.with_dir("/missing");
        fs.write_file("/missing/a".into(), vec![1]).await.unwrap();
        assert_eq!(fs.file("/missing/a"), Some(vec![1]));
        assert_eq!(
            fs.read_dir("/missing".into()).await.unwrap(),
            vec![RemoteEntry {
                name: "a".into(),
                kind: RemoteKind::File
            }]
        );
    }
}
