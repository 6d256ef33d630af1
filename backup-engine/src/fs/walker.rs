//! Directory traversal for capture, validation and replication.

use super::metadata::FileStamp;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entries whose file name contains any of these are skipped
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: Vec::new(),
        }
    }
}

impl WalkOptions {
    pub fn excluding<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_patterns: patterns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,

    pub stamp: FileStamp,
}

impl FileInfo {
    /// Symlinks resolve to their target. Returns None for symlinks to
    /// directories and broken links.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) if entry.path_is_symlink() => return Ok(None),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            return Ok(None);
        }

        let relative_path = relative_string(path.strip_prefix(root).unwrap_or(&path));

        Ok(Some(Self {
            path,
            relative_path,
            stamp: FileStamp::from_metadata(&metadata),
        }))
    }
}

/// Walk a directory tree and collect all regular files, sorted by relative path.
///
/// A missing root yields an empty list.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> crate::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut walker = WalkDir::new(root).follow_links(options.follow_links);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = &options.exclude_patterns;
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, patterns))
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Copy every file under `src` into `dst`, preserving relative layout.
/// Files named in `skip_names` at the top level of `src` are left behind.
pub fn copy_tree(src: &Path, dst: &Path, skip_names: &[&str]) -> crate::Result<u64> {
    let mut copied = 0u64;
    std::fs::create_dir_all(dst)?;

    for file in walk_directory(src, &WalkOptions::default())? {
        if skip_names.contains(&file.relative_path.as_str()) {
            continue;
        }
        let target = dst.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copied += std::fs::copy(&file.path, &target)?;
    }

    Ok(copied)
}

pub(crate) fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name.contains(p.as_str()))
}
