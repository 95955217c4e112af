//! Project file snapshots.
//!
//! A [`FileSet`] is a complete description of the project at one point in
//! time. It is handed to the sandbox whole, never as a diff.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Directories skipped when loading a snapshot from disk.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// A single project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Path relative to the project root, using `/` separators.
    pub path: String,
    /// Raw file contents.
    pub content: Vec<u8>,
    /// Whether the contents are binary rather than text.
    pub is_binary: bool,
}

impl FileArtifact {
    /// Creates a text file.
    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into().into_bytes(),
            is_binary: false,
        }
    }

    /// Creates a binary file.
    pub fn binary(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_binary: true,
        }
    }
}

/// A snapshot of project files with unique paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: Vec<FileArtifact>,
}

impl FileSet {
    /// Builds a snapshot, rejecting duplicate paths.
    pub fn new(files: Vec<FileArtifact>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(files.len());
        for file in &files {
            if !seen.insert(file.path.as_str()) {
                return Err(Error::DuplicatePath(file.path.clone()));
            }
        }
        Ok(Self { files })
    }

    /// Loads every file under `root`, skipping dependency and VCS directories.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut files = Vec::new();

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false)
        });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::InvalidPath(entry.path().to_path_buf()))?;
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let content = std::fs::read(entry.path())?;
            let is_binary = std::str::from_utf8(&content).is_err();
            files.push(FileArtifact {
                path,
                content,
                is_binary,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self::new(files)
    }

    /// Returns the files in this snapshot.
    pub fn files(&self) -> &[FileArtifact] {
        &self.files
    }

    /// Returns the number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the snapshot has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns true if a file with the given path exists.
    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Returns the file at `path`, if present.
    pub fn get(&self, path: &str) -> Option<&FileArtifact> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Content hash of the snapshot, independent of file order.
    pub fn fingerprint(&self) -> String {
        let mut ordered: Vec<&FileArtifact> = self.files.iter().collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for file in ordered {
            hasher.update((file.path.len() as u64).to_le_bytes());
            hasher.update(file.path.as_bytes());
            hasher.update([u8::from(file.is_binary)]);
            hasher.update((file.content.len() as u64).to_le_bytes());
            hasher.update(&file.content);
        }
        hex::encode(hasher.finalize())
    }
}

impl IntoIterator for FileSet {
    type Item = FileArtifact;
    type IntoIter = std::vec::IntoIter<FileArtifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a FileArtifact;
    type IntoIter = std::slice::Iter<'a, FileArtifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}
