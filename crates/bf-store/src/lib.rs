#![forbid(unsafe_code)]
//! Backing store adapters.
//!
//! The interceptor talks to storage through the [`Backing`] trait using
//! paths relative to the backing root. [`DirBacking`] forwards to a host
//! directory with real syscalls; [`MemBacking`] is the synthetic in-memory
//! store used when no backing directory is configured.
//!
//! Both adapters are deliberately thin: no caching, no retries, no
//! ordering beyond what the host filesystem provides.

use bf_error::{BfError, Result};
use bf_types::NodeKind;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// ── Attributes ──────────────────────────────────────────────────────────────

/// Metadata of one backing entry.
#[derive(Debug, Clone)]
pub struct BackingAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Synthetic filesystem-level usage numbers for statfs.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    pub blocks: u64,
    pub blocks_free: u64,
}

// ── Trait ───────────────────────────────────────────────────────────────────

/// Translation between interceptor operations and underlying storage.
///
/// All paths are relative to the backing root; the empty path names the
/// root itself.
pub trait Backing: Send + Sync {
    fn stat(&self, path: &Path) -> Result<BackingAttr>;
    fn list(&self, path: &Path) -> Result<Vec<(String, NodeKind)>>;

    fn create_file(&self, path: &Path, mode: u32) -> Result<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;
    fn unlink(&self, path: &Path) -> Result<()>;
    fn rmdir(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn read(&self, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<u32>;
    fn truncate(&self, path: &Path, size: u64) -> Result<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
    fn set_times(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>)
        -> Result<()>;

    fn symlink(&self, path: &Path, target: &Path) -> Result<()>;
    fn readlink(&self, path: &Path) -> Result<PathBuf>;

    /// Host extended attributes (non-`bf.*` names only).
    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>>;
    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;
    fn remove_xattr(&self, path: &Path, name: &str) -> Result<()>;
    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>>;

    /// Total file bytes in the subtree rooted at `path`.
    fn tree_size(&self, path: &Path) -> Result<u64>;

    fn usage(&self) -> FsUsage;
}

fn not_found(path: &Path) -> BfError {
    BfError::NotFound(path.display().to_string())
}

fn map_io(path: &Path, err: std::io::Error) -> BfError {
    match err.kind() {
        ErrorKind::NotFound => not_found(path),
        ErrorKind::AlreadyExists => BfError::Exists,
        _ => BfError::Io(err),
    }
}

// ── Directory passthrough ───────────────────────────────────────────────────

/// Backing store over an existing host directory.
#[derive(Debug)]
pub struct DirBacking {
    root: PathBuf,
}

impl DirBacking {
    /// Open an existing directory as the backing root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| map_io(&root, e))?;
        if !meta.is_dir() {
            return Err(BfError::NotDirectory);
        }
        Ok(Self { root })
    }

    fn abs(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn attr_from_metadata(meta: &fs::Metadata) -> Result<BackingAttr> {
        let kind = if meta.file_type().is_dir() {
            NodeKind::Dir
        } else if meta.file_type().is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::File
        };
        let epoch = SystemTime::UNIX_EPOCH;
        Ok(BackingAttr {
            kind,
            size: meta.len(),
            perm: (meta.mode() & 0o7777) as u16,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.accessed().unwrap_or(epoch),
            mtime: meta.modified().unwrap_or(epoch),
            ctime: epoch
                + std::time::Duration::new(
                    u64::try_from(meta.ctime()).unwrap_or(0),
                    u32::try_from(meta.ctime_nsec()).unwrap_or(0),
                ),
        })
    }

    fn sum_tree(path: &Path) -> Result<u64> {
        let meta = fs::symlink_metadata(path).map_err(|e| map_io(path, e))?;
        if !meta.is_dir() {
            return Ok(meta.len());
        }
        let mut total = 0_u64;
        for entry in fs::read_dir(path).map_err(|e| map_io(path, e))? {
            let entry = entry.map_err(BfError::Io)?;
            total = total.saturating_add(Self::sum_tree(&entry.path())?);
        }
        Ok(total)
    }
}

impl Backing for DirBacking {
    fn stat(&self, path: &Path) -> Result<BackingAttr> {
        let abs = self.abs(path);
        let meta = fs::symlink_metadata(&abs).map_err(|e| map_io(&abs, e))?;
        Self::attr_from_metadata(&meta)
    }

    fn list(&self, path: &Path) -> Result<Vec<(String, NodeKind)>> {
        let abs = self.abs(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&abs).map_err(|e| map_io(&abs, e))? {
            let entry = entry.map_err(BfError::Io)?;
            let ft = entry.file_type().map_err(BfError::Io)?;
            let kind = if ft.is_dir() {
                NodeKind::Dir
            } else if ft.is_symlink() {
                NodeKind::Symlink
            } else {
                NodeKind::File
            };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        Ok(entries)
    }

    fn create_file(&self, path: &Path, mode: u32) -> Result<()> {
        let abs = self.abs(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .map_err(|e| map_io(&abs, e))?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
            .map_err(BfError::Io)?;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let abs = self.abs(path);
        fs::create_dir(&abs).map_err(|e| map_io(&abs, e))?;
        fs::set_permissions(&abs, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(BfError::Io)?;
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let abs = self.abs(path);
        fs::remove_file(&abs).map_err(|e| map_io(&abs, e))
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        let abs = self.abs(path);
        fs::remove_dir(&abs).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOTEMPTY) {
                BfError::NotEmpty
            } else {
                map_io(&abs, e)
            }
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_abs = self.abs(from);
        let to_abs = self.abs(to);
        fs::rename(&from_abs, &to_abs).map_err(|e| map_io(&from_abs, e))
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        let abs = self.abs(path);
        let file = fs::File::open(&abs).map_err(|e| map_io(&abs, e))?;
        let mut buf = vec![0_u8; size as usize];
        let mut filled = 0_usize;
        while filled < buf.len() {
            let n = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(BfError::Io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<u32> {
        let abs = self.abs(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&abs)
            .map_err(|e| map_io(&abs, e))?;
        file.write_all_at(data, offset).map_err(BfError::Io)?;
        Ok(u32::try_from(data.len()).unwrap_or(u32::MAX))
    }

    fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let abs = self.abs(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&abs)
            .map_err(|e| map_io(&abs, e))?;
        file.set_len(size).map_err(BfError::Io)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        let abs = self.abs(path);
        fs::set_permissions(&abs, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| map_io(&abs, e))
    }

    fn set_times(&self, _path: &Path, _atime: Option<SystemTime>, _mtime: Option<SystemTime>)
        -> Result<()> {
        // Host timestamps follow the host's own updates on read/write.
        Ok(())
    }

    fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let abs = self.abs(path);
        std::os::unix::fs::symlink(target, &abs).map_err(|e| map_io(&abs, e))
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let abs = self.abs(path);
        fs::read_link(&abs).map_err(|e| map_io(&abs, e))
    }

    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let abs = self.abs(path);
        xattr::get(&abs, name).map_err(|e| map_io(&abs, e))
    }

    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let abs = self.abs(path);
        xattr::set(&abs, name, value).map_err(|e| map_io(&abs, e))
    }

    fn remove_xattr(&self, path: &Path, name: &str) -> Result<()> {
        let abs = self.abs(path);
        xattr::remove(&abs, name).map_err(|e| match e.raw_os_error() {
            Some(libc::ENODATA) => BfError::NoData(name.to_owned()),
            _ => map_io(&abs, e),
        })
    }

    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>> {
        let abs = self.abs(path);
        let names = xattr::list(&abs).map_err(|e| map_io(&abs, e))?;
        Ok(names
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn tree_size(&self, path: &Path) -> Result<u64> {
        Self::sum_tree(&self.abs(path))
    }

    fn usage(&self) -> FsUsage {
        FsUsage {
            blocks: 1 << 20,
            blocks_free: 1 << 19,
        }
    }
}

// ── In-memory synthetic store ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemEntry {
    kind: NodeKind,
    data: Vec<u8>,
    target: PathBuf,
    mode: u32,
    atime: SystemTime,
    mtime: SystemTime,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl MemEntry {
    fn new(kind: NodeKind, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            data: Vec::new(),
            target: PathBuf::new(),
            mode,
            atime: now,
            mtime: now,
            xattrs: BTreeMap::new(),
        }
    }
}

/// Synthetic in-memory backing store, initially an empty root directory.
pub struct MemBacking {
    entries: RwLock<BTreeMap<PathBuf, MemEntry>>,
}

impl MemBacking {
    #[must_use]
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::new(), MemEntry::new(NodeKind::Dir, 0o755));
        Self {
            entries: RwLock::new(entries),
        }
    }

    fn require_parent_dir(entries: &BTreeMap<PathBuf, MemEntry>, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        match entries.get(parent) {
            Some(entry) if entry.kind.is_dir() => Ok(()),
            Some(_) => Err(BfError::NotDirectory),
            None => Err(not_found(parent)),
        }
    }

    fn insert_new(&self, path: &Path, entry: MemEntry) -> Result<()> {
        let mut entries = self.entries.write();
        Self::require_parent_dir(&entries, path)?;
        if entries.contains_key(path) {
            return Err(BfError::Exists);
        }
        entries.insert(path.to_path_buf(), entry);
        Self::touch_parent(&mut entries, path);
        Ok(())
    }

    fn touch_parent(entries: &mut BTreeMap<PathBuf, MemEntry>, path: &Path) {
        if let Some(parent) = path.parent().and_then(|p| entries.get_mut(p)) {
            parent.mtime = SystemTime::now();
        }
    }
}

impl Default for MemBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl Backing for MemBacking {
    fn stat(&self, path: &Path) -> Result<BackingAttr> {
        let entries = self.entries.read();
        let entry = entries.get(path).ok_or_else(|| not_found(path))?;
        let size = match entry.kind {
            NodeKind::File => entry.data.len() as u64,
            NodeKind::Symlink => entry.target.as_os_str().len() as u64,
            NodeKind::Dir => 0,
        };
        Ok(BackingAttr {
            kind: entry.kind,
            size,
            perm: (entry.mode & 0o7777) as u16,
            uid: 0,
            gid: 0,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.mtime,
        })
    }

    fn list(&self, path: &Path) -> Result<Vec<(String, NodeKind)>> {
        let entries = self.entries.read();
        let dir = entries.get(path).ok_or_else(|| not_found(path))?;
        if !dir.kind.is_dir() {
            return Err(BfError::NotDirectory);
        }
        Ok(entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path) && !p.as_os_str().is_empty())
            .filter_map(|(p, e)| {
                p.file_name()
                    .map(|n| (n.to_string_lossy().into_owned(), e.kind))
            })
            .collect())
    }

    fn create_file(&self, path: &Path, mode: u32) -> Result<()> {
        self.insert_new(path, MemEntry::new(NodeKind::File, mode))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.insert_new(path, MemEntry::new(NodeKind::Dir, mode))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(entry) if entry.kind.is_dir() => Err(BfError::IsDirectory),
            Some(_) => {
                entries.remove(path);
                Self::touch_parent(&mut entries, path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(entry) if !entry.kind.is_dir() => Err(BfError::NotDirectory),
            Some(_) => {
                if entries.keys().any(|p| p.parent() == Some(path)) {
                    return Err(BfError::NotEmpty);
                }
                entries.remove(path);
                Self::touch_parent(&mut entries, path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut entries = self.entries.write();
        if !entries.contains_key(from) {
            return Err(not_found(from));
        }
        Self::require_parent_dir(&entries, to)?;
        // Move the entry and everything beneath it.
        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|p| p.as_path() == from || p.starts_with(from))
            .cloned()
            .collect();
        // Replacing an existing destination mirrors rename(2).
        let replaced: Vec<PathBuf> = entries
            .keys()
            .filter(|p| p.as_path() == to || p.starts_with(to))
            .cloned()
            .collect();
        for p in replaced {
            entries.remove(&p);
        }
        for p in moved {
            if let Some(entry) = entries.remove(&p) {
                let suffix = p.strip_prefix(from).unwrap_or(Path::new("")).to_path_buf();
                let dest = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                entries.insert(dest, entry);
            }
        }
        Ok(())
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        if entry.kind.is_dir() {
            return Err(BfError::IsDirectory);
        }
        entry.atime = SystemTime::now();
        let len = entry.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(u64::from(size)).min(len) as usize;
        Ok(entry.data[start..end].to_vec())
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<u32> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        if entry.kind.is_dir() {
            return Err(BfError::IsDirectory);
        }
        let offset = usize::try_from(offset).map_err(|_| BfError::NoSpace)?;
        let end = offset + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset..end].copy_from_slice(data);
        entry.mtime = SystemTime::now();
        Ok(u32::try_from(data.len()).unwrap_or(u32::MAX))
    }

    fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        if entry.kind.is_dir() {
            return Err(BfError::IsDirectory);
        }
        let size = usize::try_from(size).map_err(|_| BfError::NoSpace)?;
        entry.data.resize(size, 0);
        entry.mtime = SystemTime::now();
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        entry.mode = mode & 0o7777;
        Ok(())
    }

    fn set_times(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>)
        -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        if let Some(atime) = atime {
            entry.atime = atime;
        }
        if let Some(mtime) = mtime {
            entry.mtime = mtime;
        }
        Ok(())
    }

    fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let mut entry = MemEntry::new(NodeKind::Symlink, 0o777);
        entry.target = target.to_path_buf();
        self.insert_new(path, entry)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let entries = self.entries.read();
        let entry = entries.get(path).ok_or_else(|| not_found(path))?;
        if entry.kind != NodeKind::Symlink {
            return Err(BfError::InvalidConfig("not a symlink".to_owned()));
        }
        Ok(entry.target.clone())
    }

    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read();
        let entry = entries.get(path).ok_or_else(|| not_found(path))?;
        Ok(entry.xattrs.get(name).cloned())
    }

    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        entry.xattrs.insert(name.to_owned(), value.to_vec());
        Ok(())
    }

    fn remove_xattr(&self, path: &Path, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        entry
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BfError::NoData(name.to_owned()))
    }

    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let entry = entries.get(path).ok_or_else(|| not_found(path))?;
        Ok(entry.xattrs.keys().cloned().collect())
    }

    fn tree_size(&self, path: &Path) -> Result<u64> {
        let entries = self.entries.read();
        if !entries.contains_key(path) {
            return Err(not_found(path));
        }
        Ok(entries
            .iter()
            .filter(|(p, _)| p.as_path() == path || p.starts_with(path))
            .map(|(_, e)| e.data.len() as u64)
            .sum())
    }

    fn usage(&self) -> FsUsage {
        FsUsage {
            blocks: 1 << 16,
            blocks_free: 1 << 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(backing: &dyn Backing, path: &str, contents: &[u8]) {
        backing.create_file(Path::new(path), 0o644).unwrap();
        backing.write(Path::new(path), 0, contents).unwrap();
    }

    #[test]
    fn mem_create_write_read_roundtrip() {
        let backing = MemBacking::new();
        file(&backing, "a.txt", b"hello");
        assert_eq!(backing.read(Path::new("a.txt"), 0, 16).unwrap(), b"hello");
        assert_eq!(backing.read(Path::new("a.txt"), 1, 3).unwrap(), b"ell");
        assert_eq!(backing.read(Path::new("a.txt"), 10, 4).unwrap(), b"");
        assert_eq!(backing.stat(Path::new("a.txt")).unwrap().size, 5);
    }

    #[test]
    fn mem_sparse_write_zero_fills() {
        let backing = MemBacking::new();
        backing.create_file(Path::new("f"), 0o644).unwrap();
        backing.write(Path::new("f"), 4, b"xy").unwrap();
        assert_eq!(backing.read(Path::new("f"), 0, 16).unwrap(), b"\0\0\0\0xy");
    }

    #[test]
    fn mem_rejects_orphan_creation() {
        let backing = MemBacking::new();
        let err = backing.create_file(Path::new("no/such/dir"), 0o644).unwrap_err();
        assert!(matches!(err, BfError::NotFound(_)));
    }

    #[test]
    fn mem_list_is_single_level() {
        let backing = MemBacking::new();
        backing.mkdir(Path::new("d"), 0o755).unwrap();
        file(&backing, "d/inner.txt", b"x");
        file(&backing, "top.txt", b"y");
        let mut names: Vec<String> = backing
            .list(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        names.sort();
        assert_eq!(names, vec!["d", "top.txt"]);
        let inner = backing.list(Path::new("d")).unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].0, "inner.txt");
    }

    #[test]
    fn mem_rename_moves_subtree() {
        let backing = MemBacking::new();
        backing.mkdir(Path::new("src"), 0o755).unwrap();
        file(&backing, "src/f.txt", b"data");
        backing.mkdir(Path::new("dst"), 0o755).unwrap();
        backing
            .rename(Path::new("src"), Path::new("dst/moved"))
            .unwrap();
        assert!(backing.stat(Path::new("src")).is_err());
        assert_eq!(
            backing.read(Path::new("dst/moved/f.txt"), 0, 16).unwrap(),
            b"data"
        );
    }

    #[test]
    fn mem_rmdir_refuses_nonempty() {
        let backing = MemBacking::new();
        backing.mkdir(Path::new("d"), 0o755).unwrap();
        file(&backing, "d/f", b"x");
        assert!(matches!(
            backing.rmdir(Path::new("d")).unwrap_err(),
            BfError::NotEmpty
        ));
        backing.unlink(Path::new("d/f")).unwrap();
        backing.rmdir(Path::new("d")).unwrap();
    }

    #[test]
    fn mem_tree_size_counts_files_recursively() {
        let backing = MemBacking::new();
        backing.mkdir(Path::new("d"), 0o755).unwrap();
        backing.mkdir(Path::new("d/sub"), 0o755).unwrap();
        file(&backing, "d/a", b"12345");
        file(&backing, "d/sub/b", b"123");
        assert_eq!(backing.tree_size(Path::new("d")).unwrap(), 8);
        assert_eq!(backing.tree_size(Path::new("d/sub")).unwrap(), 3);
        assert_eq!(backing.tree_size(Path::new("d/a")).unwrap(), 5);
    }

    #[test]
    fn mem_xattrs_roundtrip() {
        let backing = MemBacking::new();
        file(&backing, "f", b"x");
        backing
            .set_xattr(Path::new("f"), "user.tag", b"blue")
            .unwrap();
        assert_eq!(
            backing.get_xattr(Path::new("f"), "user.tag").unwrap(),
            Some(b"blue".to_vec())
        );
        assert_eq!(backing.list_xattrs(Path::new("f")).unwrap(), vec!["user.tag"]);
        backing.remove_xattr(Path::new("f"), "user.tag").unwrap();
        assert_eq!(backing.get_xattr(Path::new("f"), "user.tag").unwrap(), None);
        assert!(matches!(
            backing.remove_xattr(Path::new("f"), "user.tag").unwrap_err(),
            BfError::NoData(_)
        ));
    }

    #[test]
    fn mem_symlink_roundtrip() {
        let backing = MemBacking::new();
        backing
            .symlink(Path::new("link"), Path::new("target/file"))
            .unwrap();
        assert_eq!(
            backing.readlink(Path::new("link")).unwrap(),
            PathBuf::from("target/file")
        );
        assert_eq!(backing.stat(Path::new("link")).unwrap().kind, NodeKind::Symlink);
    }

    #[test]
    fn dir_backing_passthrough_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let backing = DirBacking::open(tmp.path()).unwrap();
        backing.mkdir(Path::new("d"), 0o755).unwrap();
        backing.create_file(Path::new("d/f.txt"), 0o644).unwrap();
        backing.write(Path::new("d/f.txt"), 0, b"payload").unwrap();
        assert_eq!(
            backing.read(Path::new("d/f.txt"), 3, 16).unwrap(),
            b"load"
        );
        assert_eq!(backing.stat(Path::new("d/f.txt")).unwrap().size, 7);
        assert_eq!(backing.tree_size(Path::new("")).unwrap(), 7);

        // State is visible directly on the host.
        assert_eq!(
            std::fs::read(tmp.path().join("d/f.txt")).unwrap(),
            b"payload"
        );

        backing.truncate(Path::new("d/f.txt"), 3).unwrap();
        assert_eq!(backing.stat(Path::new("d/f.txt")).unwrap().size, 3);
        backing.unlink(Path::new("d/f.txt")).unwrap();
        backing.rmdir(Path::new("d")).unwrap();
        assert!(backing.list(Path::new("")).unwrap().is_empty());
    }

    #[test]
    fn dir_backing_requires_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(DirBacking::open(tmp.path().join("missing")).is_err());
        let file_path = tmp.path().join("plain");
        std::fs::write(&file_path, b"x").unwrap();
        assert!(matches!(
            DirBacking::open(&file_path).unwrap_err(),
            BfError::NotDirectory
        ));
    }

    #[test]
    fn dir_backing_rename_keeps_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let backing = DirBacking::open(tmp.path()).unwrap();
        backing.create_file(Path::new("a"), 0o644).unwrap();
        backing.write(Path::new("a"), 0, b"abc").unwrap();
        backing.rename(Path::new("a"), Path::new("b")).unwrap();
        assert!(backing.stat(Path::new("a")).is_err());
        assert_eq!(backing.read(Path::new("b"), 0, 8).unwrap(), b"abc");
    }
}
