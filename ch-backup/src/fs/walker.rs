//! Traversal of frozen part directories.
//!
//! A frozen part is a flat-ish directory of column files and checksums. The
//! walker returns regular files only, in a stable order, with paths relative
//! to the part root.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names never included (exact match)
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            // FREEZE produces hard links, never symlinks worth following.
            follow_links: false,
            exclude_names: vec!["frozen_metadata.txt".to_string()],
        }
    }
}

/// A file discovered inside a part directory
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// `/`-separated path relative to the part root
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Returns None for entries that are not regular files once symlinks are
    /// resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) => resolved,
                // Broken symlink
                Err(_) => return Ok(None),
            }
        } else {
            entry.metadata()?
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
        }))
    }
}

/// Walk a part directory and collect its files sorted by relative path.
pub fn walk_part(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if options.exclude_names.iter().any(|n| *n == name) {
            continue;
        }
        if let Some(info) = FileInfo::from_entry(&entry, root)? {
            files.push(info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Names of the immediate subdirectories of `dir`, sorted. Missing `dir`
/// yields an empty list.
pub fn list_subdirs(dir: &Path) -> std::io::Result<Vec<String>> {
    let read = match std::fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in read {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
