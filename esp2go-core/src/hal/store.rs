use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

/// Open file on the block store, positioned at the start.
pub trait ReadHandle: Read + Send {
    fn size(&self) -> u64;
}

/// Writable file on the block store. Seek is needed to patch headers in place.
pub trait WriteHandle: Write + Seek + Send {}

impl<T: Write + Seek + Send> WriteHandle for T {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl StoreUsage {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Hierarchical file store (the FAT data partition on the device).
///
/// Paths are absolute, `/`-separated, rooted at the store.
pub trait BlockStore: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn open(&self, path: &str) -> io::Result<Box<dyn ReadHandle>>;

    /// Creates or truncates `path`, creating missing parent directories.
    fn create(&self, path: &str) -> io::Result<Box<dyn WriteHandle>>;

    fn remove(&self, path: &str) -> io::Result<()>;

    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Creates `path` and any missing parents.
    fn mkdir(&self, path: &str) -> io::Result<()>;

    fn list(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    fn usage(&self) -> io::Result<StoreUsage>;

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let mut file = self.open(path)?;
        let mut contents = String::with_capacity(file.size() as usize);
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    fn write_string(&self, path: &str, contents: &str) -> io::Result<()> {
        let mut file = self.create(path)?;
        file.write_all(contents.as_bytes())?;
        file.flush()
    }
}

type UsageProbe = Box<dyn Fn() -> io::Result<StoreUsage> + Send + Sync>;

/// [`BlockStore`] over `std::fs`, rooted at a mount point such as `/store`.
pub struct FsStore {
    root: PathBuf,
    usage_probe: Option<UsageProbe>,
}

struct FsReadHandle {
    file: File,
    size: u64,
}

impl Read for FsReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ReadHandle for FsReadHandle {
    fn size(&self) -> u64 {
        self.size
    }
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            usage_probe: None,
        }
    }

    /// Filesystem capacity is not available through `std`; the device
    /// supplies a probe backed by the FAT driver. Without one, `usage`
    /// fails with [`io::ErrorKind::Unsupported`].
    pub fn with_usage_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> io::Result<StoreUsage> + Send + Sync + 'static,
    {
        self.usage_probe = Some(Box::new(probe));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes store root: {path}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl BlockStore for FsStore {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn ReadHandle>> {
        let file = File::open(self.resolve(path)?)?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            ));
        }
        Ok(Box::new(FsReadHandle {
            file,
            size: meta.len(),
        }))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn WriteHandle>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(full)?))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if full.is_dir() {
            fs::remove_dir_all(full)
        } else {
            fs::remove_file(full)
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path)?)
    }

    fn list(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn usage(&self) -> io::Result<StoreUsage> {
        match &self.usage_probe {
            Some(probe) => probe(),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "filesystem capacity unknown",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn create_makes_parent_directories() {
        let (_dir, store) = temp_store();
        store.write_string("/os/wifi_config.json", "{}").unwrap();
        assert!(store.exists("/os/wifi_config.json"));
        assert_eq!(store.read_to_string("/os/wifi_config.json").unwrap(), "{}");
    }

    #[test]
    fn rejects_parent_traversal() {
        let (_dir, store) = temp_store();
        assert!(store.open("/../etc/passwd").is_err());
        assert!(!store.exists("/../etc/passwd"));
    }

    #[test]
    fn listing_sorts_and_flags_directories() {
        let (_dir, store) = temp_store();
        store.write_string("/b.bin", "12345").unwrap();
        store.write_string("/a/c.bin", "123").unwrap();
        let listing = store.list("/").unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, "a");
        assert!(listing[0].is_dir);
        assert_eq!(listing[1].size, 5);
    }

    #[test]
    fn usage_without_probe_is_unsupported() {
        let (_dir, store) = temp_store();
        store.write_string("/a.bin", "12345").unwrap();
        let err = store.usage().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn usage_probe_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).with_usage_probe(|| {
            Ok(StoreUsage {
                total_bytes: 4096,
                used_bytes: 1024,
            })
        });
        assert_eq!(store.usage().unwrap().free_bytes(), 3072);
    }
}
