#![forbid(unsafe_code)]
//! FUSE adapter for Broken Fuse.
//!
//! A thin translation layer: kernel requests arrive via the `fuser`
//! crate, get forwarded to [`BrokenFs`], and errors are mapped through
//! `BfError::to_errno()`.
//!
//! Operations that evaluate effects (and may therefore sleep in a Delay)
//! are handed to a worker thread before replying, so one delayed request
//! never stalls the kernel channel for unrelated nodes. Metadata and
//! control-plane traffic replies inline.

use bf_clock::CancelToken;
use bf_core::{BrokenFs, DirEntry, NodeAttr, OpCtx, SetAttr};
use bf_error::BfError;
use bf_types::{Ino, NodeKind};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{error, warn};

/// TTL for cached attributes and entries. Short, because effects change
/// observable behavior at any moment.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Dir => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(attr: &NodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::Now => SystemTime::now(),
        TimeOrNow::SpecificTime(time) => time,
    }
}

/// Map an error to an errno for the reply. Internal invariant violations
/// are fatal: unmount by exiting with code 10.
fn reply_errno(err: &BfError) -> c_int {
    if err.is_fatal() {
        error!(error = %err, "internal invariant violated, aborting");
        std::process::exit(10);
    }
    err.to_errno()
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::RW,
        MountOption::FSName("brokenfuse".to_owned()),
        MountOption::Subtype("bf".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating all operations to a [`BrokenFs`].
pub struct BrokenFuse {
    fs: Arc<BrokenFs>,
    /// Session-wide cancel signal: unmount aborts in-flight delays.
    cancel: CancelToken,
}

impl BrokenFuse {
    #[must_use]
    pub fn new(fs: Arc<BrokenFs>) -> Self {
        Self {
            fs,
            cancel: CancelToken::new(),
        }
    }

    fn cx(&self) -> OpCtx {
        OpCtx::with_cancel(self.cancel.clone())
    }

    /// Run a potentially-delaying operation on its own worker. The reply
    /// types are Send, so the kernel channel keeps draining while this
    /// request sleeps or waits on the backing store.
    fn offload(&self, op: impl FnOnce(Arc<BrokenFs>, OpCtx) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        let cx = self.cx();
        std::thread::spawn(move || op(fs, cx));
    }
}

fn add_dir_entries(entries: &[DirEntry], reply: &mut ReplyDirectory) {
    for entry in entries {
        let full = reply.add(
            entry.ino.0,
            i64::try_from(entry.offset).unwrap_or(i64::MAX),
            to_fuser_file_type(entry.kind),
            OsStr::new(&entry.name),
        );
        if full {
            break;
        }
    }
}

impl Filesystem for BrokenFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.cancel.cancel();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.fs.lookup(Ino(parent), &name.to_string_lossy()) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(Ino(ino), nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(Ino(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        self.offload(move |fs, cx| match fs.setattr(&cx, Ino(ino), changes) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(Ino(ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        self.offload(move |fs, cx| match fs.mkdir(&cx, Ino(parent), &name, mode) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        self.offload(move |fs, cx| match fs.unlink(&cx, Ino(parent), &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        self.offload(move |fs, cx| match fs.rmdir(&cx, Ino(parent), &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name = link_name.to_string_lossy().into_owned();
        let target = target.to_path_buf();
        self.offload(
            move |fs, cx| match fs.symlink(&cx, Ino(parent), &name, &target) {
                Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
                Err(e) => reply.error(reply_errno(&e)),
            },
        );
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        self.offload(move |fs, cx| {
            match fs.rename(&cx, Ino(parent), &name, Ino(newparent), &newname) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(reply_errno(&e)),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.open(Ino(ino)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        self.offload(move |fs, cx| match fs.read(&cx, Ino(ino), offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        let data = data.to_vec();
        self.offload(move |fs, cx| match fs.write(&cx, Ino(ino), offset, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(Ino(ino));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        self.offload(move |fs, cx| match fs.readdir(&cx, Ino(ino), offset) {
            Ok(entries) => {
                add_dir_entries(&entries, &mut reply);
                reply.ok();
            }
            Err(e) => {
                if e.to_errno() != libc::ENOENT {
                    warn!(ino, offset, error = %e, "readdir failed");
                }
                reply.error(reply_errno(&e));
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        reply.statfs(
            stat.blocks,
            stat.blocks_free,
            stat.blocks_free,
            stat.files,
            0,
            stat.block_size,
            stat.name_len,
            stat.block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.fs.setxattr(Ino(ino), &name.to_string_lossy(), value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self.fs.getxattr(Ino(ino), &name.to_string_lossy()) {
            Ok(value) => {
                let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(len);
                } else if len <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(Ino(ino)) {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                let len = u32::try_from(packed.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(len);
                } else if len <= size {
                    reply.data(&packed);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.removexattr(Ino(ino), &name.to_string_lossy()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy().into_owned();
        self.offload(move |fs, cx| match fs.create(&cx, Ino(parent), &name, mode) {
            Ok(attr) => {
                // Creation implies an open handle on the new file.
                let _ = fs.open(attr.ino);
                reply.created(&ATTR_TTL, &to_file_attr(&attr), 0, 0, 0);
            }
            Err(e) => reply.error(reply_errno(&e)),
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn validate_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount at `mountpoint` and block until unmounted.
pub fn mount(
    fs: Arc<BrokenFs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    fuser::mount2(BrokenFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; unmounts when the session handle drops.
pub fn mount_background(
    fs: Arc<BrokenFs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(BrokenFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::MemBacking;
    use bf_types::ROOT_INO;
    use std::time::UNIX_EPOCH;

    fn memfs() -> Arc<BrokenFs> {
        Arc::new(BrokenFs::with_defaults(Arc::new(MemBacking::new())))
    }

    #[test]
    fn file_type_conversion() {
        assert_eq!(to_fuser_file_type(NodeKind::File), FileType::RegularFile);
        assert_eq!(to_fuser_file_type(NodeKind::Dir), FileType::Directory);
        assert_eq!(to_fuser_file_type(NodeKind::Symlink), FileType::Symlink);
    }

    #[test]
    fn node_attr_conversion() {
        let attr = NodeAttr {
            ino: Ino(42),
            size: 1024,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            kind: NodeKind::File,
            perm: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            blksize: 4096,
        };
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.crtime, fattr.ctime);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn mount_options_build() {
        let opts = build_mount_options(&MountOptions::default());
        assert!(opts.contains(&MountOption::RW));
        assert!(opts.contains(&MountOption::AutoUnmount));
        assert!(!opts.contains(&MountOption::AllowOther));

        let opts = build_mount_options(&MountOptions {
            allow_other: true,
            auto_unmount: false,
        });
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(!opts.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(memfs(), "", &MountOptions::default()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn destroy_cancels_in_flight_delays() {
        let fs = memfs();
        let mut fuse = BrokenFuse::new(Arc::clone(&fs));
        let cx = fuse.cx();
        assert!(!cx.cancel.is_cancelled());
        fuse.destroy();
        assert!(cx.cancel.is_cancelled());
    }

    #[test]
    fn adapter_serves_root_attr() {
        let fs = memfs();
        let fuse = BrokenFuse::new(Arc::clone(&fs));
        let attr = fuse.fs.getattr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, NodeKind::Dir);
        assert_eq!(attr.ino, ROOT_INO);
    }
}
