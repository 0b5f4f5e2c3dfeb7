//! Filesystem object store. Keys map to paths below a root directory.

use super::{paginate, validate_key, ListPage, StorageBackend};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write the full content to a sibling temp file so readers never see a
    /// partial object.
    async fn write_temp(&self, path: &Path, data: &[u8]) -> Result<PathBuf> {
        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4().simple()));

        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(tmp)
    }

    async fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = self.write_temp(path, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn list_blocking(root: &Path, prefix: &str) -> Result<Vec<String>> {
        // Walk from the deepest directory fully covered by the prefix.
        let start = match prefix.rfind('/') {
            Some(idx) => root.join(&prefix[..idx]),
            None => root.to_path_buf(),
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&start) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => continue,
                Err(e) => return Err(BackupError::Io(e.into())),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') && name.contains(".tmp-") {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn label(&self) -> &str {
        "local"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        self.atomic_write(&path, &data).await
    }

    /// Hard-linking fails if the target exists, which makes this atomic.
    async fn put_new(&self, key: &str, data: Bytes) -> Result<bool> {
        let path = self.resolve(key)?;
        let tmp = self.write_temp(&path, &data).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let root = self.root.clone();
        let prefix_owned = prefix.to_string();
        let keys =
            tokio::task::spawn_blocking(move || Self::list_blocking(&root, &prefix_owned)).await??;
        Ok(paginate(keys, prefix, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();

        backend
            .put("data/ab/abcd", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(backend.exists("data/ab/abcd").await.unwrap());
        assert_eq!(
            backend.get("data/ab/abcd").await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );

        assert!(backend.delete("data/ab/abcd").await.unwrap());
        assert!(!backend.delete("data/ab/abcd").await.unwrap());
        assert!(backend.get("data/ab/abcd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_without_leaving_temp_files() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();

        backend.put("backups/b1/manifest.json", Bytes::from_static(b"1")).await.unwrap();
        backend.put("backups/b1/manifest.json", Bytes::from_static(b"2")).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("backups/b1"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            backend.get("backups/b1/manifest.json").await.unwrap().unwrap(),
            Bytes::from_static(b"2")
        );
    }

    #[tokio::test]
    async fn put_new_never_replaces() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let key = "backups/b1/manifest.json";

        assert!(backend.put_new(key, Bytes::from_static(b"first")).await.unwrap());
        assert!(!backend.put_new(key, Bytes::from_static(b"second")).await.unwrap());
        assert_eq!(backend.get(key).await.unwrap().unwrap(), Bytes::from_static(b"first"));

        let entries = std::fs::read_dir(dir.path().join("backups/b1")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn list_filters_by_partial_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        for key in ["data/ab/ab01", "data/ab/ab02", "data/cd/cd01", "backups/x/manifest.json"] {
            backend.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        let page = backend.list_page("data/ab/", None).await.unwrap();
        assert_eq!(page.keys, vec!["data/ab/ab01", "data/ab/ab02"]);

        let page = backend.list_page("data/", None).await.unwrap();
        assert_eq!(page.keys.len(), 3);

        let page = backend.list_page("nothing/", None).await.unwrap();
        assert!(page.keys.is_empty());
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.get("../outside").await.is_err());
        assert!(backend.put("/etc/passwd", Bytes::new()).await.is_err());
    }
}
