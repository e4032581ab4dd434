//! Workspace sandbox
//!
//! Every path the pipeline touches is resolved here first. Containment is a
//! component-wise prefix test on the lexically normalized path, followed by a
//! canonical check of the deepest existing ancestor so symlinks cannot lead
//! outside the root.

use crate::error::{NebulaError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| NebulaError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative (or absolute) path to an absolute path
    /// inside the root. The target does not need to exist.
    pub fn resolve(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let candidate = candidate.as_ref();
        if candidate.as_os_str().is_empty() {
            return Err(NebulaError::InvalidPath("path is empty".to_string()));
        }

        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let escape = || NebulaError::PathEscape {
            path: candidate.to_path_buf(),
            root: self.root.clone(),
        };

        let normalized = normalize_lexically(&joined).ok_or_else(escape)?;
        if normalized.strip_prefix(&self.root).is_err() {
            return Err(escape());
        }

        let ancestor = canonicalize_existing_ancestor(&normalized)?;
        if !ancestor.starts_with(&self.root) {
            return Err(escape());
        }

        Ok(normalized)
    }

    /// Workspace-relative form of an absolute path produced by [`resolve`].
    ///
    /// [`resolve`]: Workspace::resolve
    pub fn relative(&self, absolute: &Path) -> PathBuf {
        absolute
            .strip_prefix(&self.root)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| absolute.to_path_buf())
    }
}

fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        // symlink_metadata so a dangling link still counts as existing
        if std::fs::symlink_metadata(&current).is_ok() {
            return current
                .canonicalize()
                .map_err(|e| NebulaError::io(&current, e));
        }
        if !current.pop() {
            return Err(NebulaError::InvalidPath(format!(
                "no existing ancestor for {}",
                path.display()
            )));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Text filesystem primitives, all routed through the [`Workspace`] guard.
#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    workspace: Workspace,
}

impl WorkspaceFs {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn stat(&self, path: &Path) -> Result<Option<EntryKind>> {
        let absolute = self.workspace.resolve(path)?;
        match tokio::fs::metadata(&absolute).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
            Ok(_) => Ok(Some(EntryKind::File)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NebulaError::io(path, e)),
        }
    }

    /// Read a file as text. Missing files read as `None`; bytes that are not
    /// valid UTF-8 are an error, never decoded lossily.
    pub async fn read_text(&self, path: &Path) -> Result<Option<String>> {
        match self.read_bytes(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| NebulaError::NotText {
                    path: path.to_path_buf(),
                }),
            None => Ok(None),
        }
    }

    pub async fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let absolute = self.workspace.resolve(path)?;
        match tokio::fs::read(&absolute).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NebulaError::io(path, e)),
        }
    }

    pub async fn write_text(&self, path: &Path, content: &str) -> Result<()> {
        self.write_bytes(path, content.as_bytes()).await
    }

    pub async fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<()> {
        let absolute = self.workspace.resolve(path)?;
        if absolute == self.workspace.root() {
            return Err(NebulaError::InvalidPath(
                "cannot write to the workspace root".to_string(),
            ));
        }
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NebulaError::io(parent, e))?;
        }
        tokio::fs::write(&absolute, content)
            .await
            .map_err(|e| NebulaError::io(path, e))
    }

    /// Remove a file or directory tree. Returns `false` when nothing existed.
    pub async fn remove_recursive(&self, path: &Path) -> Result<bool> {
        let absolute = self.workspace.resolve(path)?;
        if absolute == self.workspace.root() {
            return Err(NebulaError::InvalidPath(
                "cannot delete the workspace root".to_string(),
            ));
        }
        let meta = match tokio::fs::symlink_metadata(&absolute).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(NebulaError::io(path, e)),
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&absolute).await
        } else {
            tokio::fs::remove_file(&absolute).await
        };
        removed.map_err(|e| NebulaError::io(path, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_accepts_missing_nested_file() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let resolved = ws.resolve("new_dir/new_file.rs").unwrap();
        assert!(resolved.ends_with("new_dir/new_file.rs"));
        assert_eq!(ws.relative(&resolved), PathBuf::from("new_dir/new_file.rs"));
    }

    #[test]
    fn resolve_rejects_parent_traversal() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let err = ws.resolve("../outside.txt").unwrap_err();
        assert!(matches!(err, NebulaError::PathEscape { .. }));
    }

    #[test]
    fn resolve_allows_inner_parent_segments() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let resolved = ws.resolve("src/../lib.rs").unwrap();
        assert_eq!(ws.relative(&resolved), PathBuf::from("lib.rs"));
    }

    #[test]
    fn resolve_rejects_sibling_with_shared_prefix() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("root");
        let sibling = parent.path().join("root2");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();
        let ws = Workspace::new(&root).unwrap();

        let sibling_file = sibling.canonicalize().unwrap().join("x.txt");
        let err = ws.resolve(&sibling_file).unwrap_err();
        assert!(matches!(err, NebulaError::PathEscape { .. }));
    }

    #[test]
    fn resolve_accepts_absolute_path_inside_root() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let inside = ws.root().join("a/b.txt");
        assert_eq!(ws.resolve(&inside).unwrap(), inside);
    }

    #[test]
    fn resolve_rejects_empty_path() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        assert!(matches!(
            ws.resolve("").unwrap_err(),
            NebulaError::InvalidPath(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = tempdir().unwrap();
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let err = ws.resolve("link/secret.txt").unwrap_err();
        assert!(matches!(err, NebulaError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn fs_round_trips_text_and_removes_trees() {
        let dir = tempdir().unwrap();
        let fs = WorkspaceFs::new(Workspace::new(dir.path()).unwrap());
        let path = Path::new("nested/deeper/file.txt");

        assert_eq!(fs.read_text(path).await.unwrap(), None);
        fs.write_text(path, "hello").await.unwrap();
        assert_eq!(fs.read_text(path).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(fs.stat(Path::new("nested")).await.unwrap(), Some(EntryKind::Directory));

        assert!(fs.remove_recursive(Path::new("nested")).await.unwrap());
        assert!(!fs.remove_recursive(Path::new("nested")).await.unwrap());
        assert_eq!(fs.stat(path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_not_read_as_text() {
        let dir = tempdir().unwrap();
        let fs = WorkspaceFs::new(Workspace::new(dir.path()).unwrap());
        let raw = [0x63, 0x61, 0x66, 0xE9, 0x0A, 0xFF];
        std::fs::write(dir.path().join("latin1.txt"), raw).unwrap();

        let err = fs.read_text(Path::new("latin1.txt")).await.unwrap_err();
        assert!(matches!(err, NebulaError::NotText { .. }));
        assert_eq!(
            fs.read_bytes(Path::new("latin1.txt")).await.unwrap().as_deref(),
            Some(&raw[..])
        );
    }

    #[tokio::test]
    async fn fs_refuses_to_delete_root() {
        let dir = tempdir().unwrap();
        let fs = WorkspaceFs::new(Workspace::new(dir.path()).unwrap());
        assert!(fs.remove_recursive(Path::new(".")).await.is_err());
    }
}
