//! FileSystem trait abstraction for the synced directory.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in olsync-daemon) - Uses tokio::fs
//!
//! All paths are relative to the sync root and use `/` separators.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl FsError {
    /// Whether this error is the "path vanished" race the pipelines swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must report a missing path as [`FsError::NotFound`] so the
/// sync pipelines can tell a vanished file apart from a real failure.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a file or a directory with everything below it
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Rename a file or directory (creates the target's parents if needed)
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Walk `root` recursively and return every file path below it.
pub async fn list_files_recursive<F: FileSystem + ?Sized>(fs: &F, root: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.trim_matches('/').to_string()];

    while let Some(dir) = pending.pop() {
        let entries = match fs.list(&dir).await {
            Ok(entries) => entries,
            Err(FsError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = if dir.is_empty() {
                entry.name
            } else {
                format!("{}/{}", dir, entry.name)
            };
            if entry.is_dir {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    /// Number of successful `write` calls, for asserting "no write happened"
    writes: AtomicUsize,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a file without counting it as a write.
    pub fn seed(&self, path: &str, content: &[u8]) {
        let path = Self::normalize_path(path);
        let mut parent = Self::parent_path(&path);
        {
            let mut dirs = self.dirs.write().unwrap();
            while let Some(dir) = parent {
                parent = Self::parent_path(&dir);
                dirs.insert(dir);
            }
        }
        self.files.write().unwrap().insert(path, content.to_vec());
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn is_below(path: &str, dir: &str) -> bool {
        path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        self.files.write().unwrap().insert(path, content.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let is_child = |candidate: &str| -> Option<String> {
            let rest = if path.is_empty() {
                candidate
            } else if Self::is_below(candidate, &path) {
                &candidate[path.len() + 1..]
            } else {
                return None;
            };
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some(rest.to_string())
            }
        };

        let mut entries = Vec::new();
        for dir in dirs.iter() {
            if let Some(name) = is_child(dir) {
                entries.push(FileEntry { name, is_dir: true });
            }
        }
        let files = self.files.read().unwrap();
        for file in files.keys() {
            if let Some(name) = is_child(file) {
                entries.push(FileEntry {
                    name,
                    is_dir: false,
                });
            }
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        if self.files.write().unwrap().remove(&path).is_some() {
            return Ok(());
        }

        // Try to delete as (empty) directory
        let has_children = {
            let files = self.files.read().unwrap();
            let dirs = self.dirs.read().unwrap();
            files.keys().any(|f| Self::is_below(f, &path))
                || dirs.iter().any(|d| Self::is_below(d, &path))
        };
        if has_children {
            return Err(FsError::Io(format!("Directory not empty: {}", path)));
        }
        if self.dirs.write().unwrap().remove(&path) {
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap();
        let mut dirs = self.dirs.write().unwrap();

        let mut found = files.remove(&path).is_some() || dirs.remove(&path);
        let before = files.len() + dirs.len();
        files.retain(|f, _| !Self::is_below(f, &path));
        dirs.retain(|d| !Self::is_below(d, &path));
        found |= before != files.len() + dirs.len();

        if found {
            Ok(())
        } else {
            Err(FsError::NotFound(path))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        if let Some(parent) = Self::parent_path(&to) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap();
        let mut dirs = self.dirs.write().unwrap();

        if let Some(content) = files.remove(&from) {
            files.insert(to, content);
            return Ok(());
        }
        if !dirs.remove(&from) {
            return Err(FsError::NotFound(from));
        }
        dirs.insert(to.clone());

        let moved_dirs: Vec<String> = dirs
            .iter()
            .filter(|d| Self::is_below(d, &from))
            .cloned()
            .collect();
        for dir in moved_dirs {
            dirs.remove(&dir);
            dirs.insert(format!("{}{}", to, &dir[from.len()..]));
        }
        let moved_files: Vec<String> = files
            .keys()
            .filter(|f| Self::is_below(f, &from))
            .cloned()
            .collect();
        for file in moved_files {
            if let Some(content) = files.remove(&file) {
                files.insert(format!("{}{}", to, &file[from.len()..]), content);
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self.files.read().unwrap().get(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap().contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.files.read().unwrap().contains_key(&path) {
            return Err(FsError::NotDirectory(path));
        }

        let mut dirs = self.dirs.write().unwrap();
        let mut current = Some(path);
        while let Some(dir) = current {
            current = Self::parent_path(&dir);
            dirs.insert(dir);
        }
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows tests to keep a handle on the filesystem the engine owns
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        (**self).remove_all(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
