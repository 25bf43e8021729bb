//! Source enumeration.
//!
//! Builds the immutable [`Manifest`] for a job by walking the mounted source
//! volume once. Runs synchronously; callers move it onto the blocking pool.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::verifier::hash_file;

/// OS metadata directories and files that are never footage.
const SYSTEM_ENTRIES: &[&str] = &[
    ".Spotlight-V100",
    ".fseventsd",
    ".Trashes",
    ".TemporaryItems",
    ".DS_Store",
    ".journal",
    ".VolumeIcon.icns",
    "System Volume Information",
    "$RECYCLE.BIN",
    "RECYCLER",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub relative_path: PathBuf,
    pub size: u64,
    /// BLAKE3 of the source contents, recorded when verification is enabled
    #[serde(skip)]
    pub hash: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    files: Vec<FileDescriptor>,
    total_bytes: u64,
}

impl Manifest {
    /// Build a manifest from descriptors, sorting them by relative path.
    pub fn new(mut files: Vec<FileDescriptor>) -> Self {
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let total_bytes = files.iter().map(|f| f.size).sum();
        Self { files, total_bytes }
    }

    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnumerationError {
    #[error("no files to transfer")]
    Empty,
    #[error("cannot read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },
}

impl EnumerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Unreadable { .. } => "unreadable",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Files smaller than this are skipped; 0 keeps everything
    pub min_file_size: u64,
    /// Record a BLAKE3 hash of every file
    pub hash: bool,
    /// Restrict the manifest to these relative paths
    pub selection: Option<Vec<PathBuf>>,
}

/// Walk `source_root/subfolder` and describe every regular file in it.
pub fn enumerate(
    source_root: &Path,
    subfolder: &str,
    options: &ScanOptions,
) -> Result<Manifest, EnumerationError> {
    let root = resolve_subfolder(source_root, subfolder)?;

    let metadata = fs::metadata(&root).map_err(|e| EnumerationError::Unreadable {
        path: root.clone(),
        reason: e.to_string(),
    })?;
    if !metadata.is_dir() {
        return Err(EnumerationError::Unreadable {
            path: root,
            reason: "not a directory".to_string(),
        });
    }

    let mut files = Vec::new();
    walk(&root, &root, options, &mut files)?;

    if let Some(selection) = &options.selection {
        let wanted: HashSet<&Path> = selection.iter().map(PathBuf::as_path).collect();
        files.retain(|f| wanted.contains(f.relative_path.as_path()));
    }

    if files.is_empty() {
        return Err(EnumerationError::Empty);
    }

    if options.hash {
        for file in &mut files {
            let path = root.join(&file.relative_path);
            let hash = hash_file(&path).map_err(|e| EnumerationError::Unreadable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            file.hash = Some(*hash.as_bytes());
        }
    }

    Ok(Manifest::new(files))
}

fn resolve_subfolder(source_root: &Path, subfolder: &str) -> Result<PathBuf, EnumerationError> {
    let subfolder = subfolder.trim_matches('/');
    if subfolder.is_empty() {
        return Ok(source_root.to_path_buf());
    }

    let relative = Path::new(subfolder);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(EnumerationError::Unreadable {
            path: relative.to_path_buf(),
            reason: "subfolder must be a relative path inside the volume".to_string(),
        });
    }

    Ok(source_root.join(relative))
}

fn is_skipped_name(name: &str) -> bool {
    name.starts_with('.') || SYSTEM_ENTRIES.contains(&name)
}

fn walk(
    base: &Path,
    current: &Path,
    options: &ScanOptions,
    files: &mut Vec<FileDescriptor>,
) -> Result<(), EnumerationError> {
    let unreadable = |path: &Path, e: std::io::Error| EnumerationError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let entries = fs::read_dir(current).map_err(|e| unreadable(current, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| unreadable(current, e))?;
        let path = entry.path();

        if is_skipped_name(&entry.file_name().to_string_lossy()) {
            debug!(path = %path.display(), "Skipping hidden or system entry");
            continue;
        }

        // symlink_metadata so links are never followed
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            walk(base, &path, options, files)?;
        } else if metadata.is_file() {
            let size = metadata.len();
            if size < options.min_file_size {
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            files.push(FileDescriptor {
                relative_path: relative.to_path_buf(),
                size,
                hash: None,
            });
        }
    }

    Ok(())
}
