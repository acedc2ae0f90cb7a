#![forbid(unsafe_code)]
//! Operation interceptor and core filesystem surface.
//!
//! Every inbound operation follows the same path: gather the effective
//! effect list by walking from the mount root down to the target node,
//! run pre effects (ancestors first, oldest first) accumulating delays
//! and reservations until the first failure, sleep the accumulated delay,
//! invoke the backing store, run post effects, settle or roll back
//! reservations, and update the target node's counters last.
//!
//! Metadata-only operations (lookup, getattr, open, statfs, readlink)
//! bypass effect evaluation entirely; `bf.*` xattr traffic is routed to
//! the control plane and never reaches the backing store.

use bf_clock::{CancelToken, Clock, FaultRng, SleepOutcome};
use bf_effect::{Effect, EvalInput, Phase, PreOutcome};
use bf_error::Result;
use bf_tree::{Node, NodeTable};
use bf_types::{Ino, NodeKind, OpKind, BLOCK_SIZE, ROOT_INO};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

pub use bf_clock::{ManualClock, SystemClock};
pub use bf_error::{BfError, Result as BfResult};
pub use bf_store::{Backing, DirBacking, FsUsage, MemBacking};
pub use bf_types::CounterSnapshot;

// ── Request context ─────────────────────────────────────────────────────────

/// Per-request context: the cancellation signal honored at suspension
/// points. Cancelling mid-delay yields EINTR.
#[derive(Clone, Debug, Default)]
pub struct OpCtx {
    pub cancel: CancelToken,
}

impl OpCtx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

// ── Attributes ──────────────────────────────────────────────────────────────

/// Node attributes as served to the FUSE layer.
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub ino: Ino,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

/// Attribute changes requested through setattr.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub kind: NodeKind,
    /// Cookie for resuming the listing after this entry.
    pub offset: u64,
}

/// Filesystem-level numbers for statfs.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub block_size: u32,
    pub name_len: u32,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// The mounted filesystem: node table, backing adapter, and the injected
/// clock/RNG singletons.
pub struct BrokenFs {
    table: NodeTable,
    backing: Arc<dyn Backing>,
    clock: Arc<dyn Clock>,
    rng: FaultRng,
}

impl BrokenFs {
    #[must_use]
    pub fn new(backing: Arc<dyn Backing>, clock: Arc<dyn Clock>, rng: FaultRng) -> Self {
        Self {
            table: NodeTable::new(),
            backing,
            clock,
            rng,
        }
    }

    /// Production wiring: wall clock, RNG seeded from `BF_SEED` or OS
    /// entropy.
    #[must_use]
    pub fn with_defaults(backing: Arc<dyn Backing>) -> Self {
        Self::new(backing, Arc::new(SystemClock::new()), FaultRng::from_env())
    }

    #[must_use]
    pub fn node_count(&self) -> u64 {
        self.table.count()
    }

    /// Direct node-table access for inspection in tests.
    #[must_use]
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    // ── Interceptor core ────────────────────────────────────────────

    /// Run `backing_op` under the effective effect set of `target`.
    ///
    /// `backing_op` returns `(value, size_delta, volume)`: the op result,
    /// the change in live subtree bytes it caused, and the byte volume
    /// charged to the target's counters.
    fn intercept<T>(
        &self,
        cx: &OpCtx,
        target: Ino,
        op: OpKind,
        offset: u64,
        length: u64,
        backing_op: impl FnOnce() -> Result<(T, i64, u64)>,
    ) -> Result<T> {
        let chain = self.table.chain_from_root(target)?;
        let input = EvalInput {
            op,
            offset,
            length,
            now_ms: self.clock.now_ms(),
        };

        // Pre pass: ancestors first, then the node's own effects, oldest
        // first. Delays accumulate; the first failure short-circuits the
        // rest of the pass.
        let mut delay_ms = 0_u64;
        let mut injected: Option<i32> = None;
        let mut reservations: Vec<(Arc<Effect>, u64)> = Vec::new();
        'pre: for node in &chain {
            for effect in node.effects() {
                if effect.phase() != Phase::Pre || !effect.applies_to(op) {
                    continue;
                }
                let subtree_bytes = if effect.needs_subtree_init() {
                    let path = self.table.path_of(node.ino)?;
                    Some(self.backing.tree_size(&path)?)
                } else {
                    None
                };
                match effect.evaluate_pre(&input, &self.rng, subtree_bytes) {
                    PreOutcome::Continue { reserved: None } => {}
                    PreOutcome::Continue {
                        reserved: Some(amount),
                    } => reservations.push((effect, amount)),
                    PreOutcome::Delay(ms) => delay_ms += ms,
                    PreOutcome::Fail(errno) => {
                        injected = Some(errno);
                        break 'pre;
                    }
                }
            }
        }

        // Accumulated delay sleeps on the serving worker, locks released.
        if delay_ms > 0 && self.clock.sleep(delay_ms, &cx.cancel) == SleepOutcome::Cancelled {
            for (effect, amount) in &reservations {
                effect.rollback(*amount);
            }
            Self::run_post(&chain, op, &input);
            if let Ok(node) = self.table.get(target) {
                node.counters.record_error();
            }
            return Err(BfError::Interrupted);
        }

        let result = match injected {
            Some(errno) => Err(BfError::Injected(errno)),
            None => backing_op(),
        };

        // Post pass runs on failures too: heatmaps record attempts.
        Self::run_post(&chain, op, &input);

        match &result {
            Ok((_, size_delta, _)) => {
                for (effect, amount) in &reservations {
                    effect.settle(*amount, *size_delta);
                }
            }
            Err(_) => {
                for (effect, amount) in &reservations {
                    effect.rollback(*amount);
                }
            }
        }

        // Counters update last, on the op's node.
        if let Ok(node) = self.table.get(target) {
            match &result {
                Ok((_, _, volume)) => match op {
                    OpKind::Read => node.counters.record_read(*volume),
                    OpKind::Write => node.counters.record_write(*volume),
                },
                Err(_) => node.counters.record_error(),
            }
        }

        result.map(|(value, _, _)| value)
    }

    fn run_post(chain: &[Arc<Node>], op: OpKind, input: &EvalInput) {
        for node in chain {
            for effect in node.effects() {
                if effect.phase() == Phase::Post && effect.applies_to(op) {
                    effect.record_post(input);
                }
            }
        }
    }

    /// Reduce MaxSize running sums along the root→`target` chain after
    /// bytes left the tree (unlink, truncate-shrink).
    fn shrink_live_bytes(&self, target: Ino, removed: u64) -> Result<()> {
        if removed == 0 {
            return Ok(());
        }
        let delta = -i64::try_from(removed).unwrap_or(i64::MAX);
        for node in self.table.chain_from_root(target)? {
            for effect in node.effects() {
                effect.adjust_live_bytes(delta);
            }
        }
        Ok(())
    }

    // ── Node helpers ────────────────────────────────────────────────

    fn ensure_child(&self, parent: Ino, name: &str, kind: NodeKind) -> Result<Arc<Node>> {
        if let Some(existing) = self.table.child(parent, name)? {
            return Ok(existing);
        }
        match self.table.insert_child(parent, name, kind) {
            Ok(node) => Ok(node),
            // Raced with another worker discovering the same entry.
            Err(BfError::Exists) => self.table.child(parent, name)?.ok_or_else(|| {
                BfError::Internal(format!("child '{name}' vanished during discovery"))
            }),
            Err(e) => Err(e),
        }
    }

    fn attr_for(&self, node: &Node) -> Result<NodeAttr> {
        let path = self.table.path_of(node.ino)?;
        let backing = self.backing.stat(&path)?;
        Ok(NodeAttr {
            ino: node.ino,
            size: backing.size,
            blocks: backing.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: backing.atime,
            mtime: backing.mtime,
            ctime: backing.ctime,
            kind: backing.kind,
            perm: backing.perm,
            nlink: 1,
            uid: backing.uid,
            gid: backing.gid,
            blksize: BLOCK_SIZE,
        })
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(BfError::InvalidConfig(format!("bad name '{name}'")));
        }
        if name.len() > 255 {
            return Err(BfError::NameTooLong);
        }
        Ok(())
    }

    // ── Metadata operations (bypass effects) ────────────────────────

    pub fn getattr(&self, ino: Ino) -> Result<NodeAttr> {
        let node = self.table.get(ino)?;
        self.attr_for(&node)
    }

    /// Resolve `name` under `parent`, lazily mirroring backing entries
    /// into the node table. Each successful reply takes one kernel
    /// reference, dropped later via forget.
    pub fn lookup(&self, parent: Ino, name: &str) -> Result<NodeAttr> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        match self.backing.stat(&path) {
            Ok(backing) => {
                let node = self.ensure_child(parent, name, backing.kind)?;
                node.inc_lookup();
                self.attr_for(&node)
            }
            Err(err) => {
                // Keep the mirror honest if the entry vanished behind us.
                if matches!(err, BfError::NotFound(_))
                    && self.table.child(parent, name)?.is_some()
                {
                    let _ = self.table.unlink_child(parent, name);
                }
                Err(err)
            }
        }
    }

    pub fn forget(&self, ino: Ino, nlookup: u64) {
        self.table.forget(ino, nlookup);
    }

    pub fn open(&self, ino: Ino) -> Result<()> {
        self.table.get(ino)?.inc_open();
        Ok(())
    }

    pub fn release(&self, ino: Ino) {
        self.table.release(ino);
    }

    pub fn readlink(&self, ino: Ino) -> Result<Vec<u8>> {
        let path = self.table.path_of(ino)?;
        let target = self.backing.readlink(&path)?;
        Ok(target.into_os_string().into_encoded_bytes())
    }

    pub fn statfs(&self) -> StatFs {
        let usage = self.backing.usage();
        StatFs {
            blocks: usage.blocks,
            blocks_free: usage.blocks_free,
            files: self.table.count(),
            block_size: BLOCK_SIZE,
            name_len: 255,
        }
    }

    // ── Data operations (run the interceptor) ───────────────────────

    pub fn read(&self, cx: &OpCtx, ino: Ino, offset: u64, size: u32) -> Result<Vec<u8>> {
        let path = self.table.path_of(ino)?;
        self.intercept(cx, ino, OpKind::Read, offset, u64::from(size), || {
            let data = self.backing.read(&path, offset, size)?;
            let volume = data.len() as u64;
            Ok((data, 0, volume))
        })
    }

    pub fn write(&self, cx: &OpCtx, ino: Ino, offset: u64, data: &[u8]) -> Result<u32> {
        let path = self.table.path_of(ino)?;
        let length = data.len() as u64;
        self.intercept(cx, ino, OpKind::Write, offset, length, || {
            let old_size = self.backing.stat(&path)?.size;
            let written = self.backing.write(&path, offset, data)?;
            let new_size = old_size.max(offset + length);
            let delta = i64::try_from(new_size - old_size).unwrap_or(i64::MAX);
            Ok((written, delta, u64::from(written)))
        })
    }

    pub fn readdir(&self, cx: &OpCtx, ino: Ino, offset: u64) -> Result<Vec<DirEntry>> {
        let path = self.table.path_of(ino)?;
        let parent = self.table.get(ino)?.parent();
        let listing = self.intercept(cx, ino, OpKind::Read, 0, 0, || {
            let entries = self.backing.list(&path)?;
            Ok((entries, 0, 0))
        })?;

        let mut out = vec![
            DirEntry {
                ino,
                name: ".".to_owned(),
                kind: NodeKind::Dir,
                offset: 1,
            },
            DirEntry {
                ino: parent,
                name: "..".to_owned(),
                kind: NodeKind::Dir,
                offset: 2,
            },
        ];
        for (name, kind) in listing {
            let node = self.ensure_child(ino, &name, kind)?;
            let offset = out.len() as u64 + 1;
            out.push(DirEntry {
                ino: node.ino,
                name,
                kind,
                offset,
            });
        }
        Ok(out.into_iter().skip(offset as usize).collect())
    }

    pub fn create(&self, cx: &OpCtx, parent: Ino, name: &str, mode: u32) -> Result<NodeAttr> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            self.backing.create_file(&path, mode)?;
            Ok(((), 0, 0))
        })?;
        let node = self.ensure_child(parent, name, NodeKind::File)?;
        node.inc_lookup();
        self.attr_for(&node)
    }

    pub fn mkdir(&self, cx: &OpCtx, parent: Ino, name: &str, mode: u32) -> Result<NodeAttr> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            self.backing.mkdir(&path, mode)?;
            Ok(((), 0, 0))
        })?;
        let node = self.ensure_child(parent, name, NodeKind::Dir)?;
        node.inc_lookup();
        self.attr_for(&node)
    }

    pub fn symlink(&self, cx: &OpCtx, parent: Ino, name: &str, target: &Path) -> Result<NodeAttr> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            self.backing.symlink(&path, target)?;
            Ok(((), 0, 0))
        })?;
        let node = self.ensure_child(parent, name, NodeKind::Symlink)?;
        node.inc_lookup();
        self.attr_for(&node)
    }

    pub fn unlink(&self, cx: &OpCtx, parent: Ino, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            let size = self.backing.stat(&path)?.size;
            self.backing.unlink(&path)?;
            if self.table.child(parent, name)?.is_some() {
                self.table.unlink_child(parent, name)?;
            }
            self.shrink_live_bytes(parent, size)?;
            Ok(((), -i64::try_from(size).unwrap_or(i64::MAX), 0))
        })
    }

    pub fn rmdir(&self, cx: &OpCtx, parent: Ino, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let parent_path = self.table.path_of(parent)?;
        let path = parent_path.join(name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            self.backing.rmdir(&path)?;
            if self.table.child(parent, name)?.is_some() {
                self.table.unlink_child(parent, name)?;
            }
            Ok(((), 0, 0))
        })
    }

    pub fn rename(
        &self,
        cx: &OpCtx,
        parent: Ino,
        name: &str,
        new_parent: Ino,
        new_name: &str,
    ) -> Result<()> {
        Self::check_name(name)?;
        Self::check_name(new_name)?;
        let old_path = self.table.path_of(parent)?.join(name);
        let new_path = self.table.path_of(new_parent)?.join(new_name);
        self.intercept(cx, parent, OpKind::Write, 0, 0, || {
            let source_kind = self.backing.stat(&old_path)?.kind;
            let moved = self.backing.tree_size(&old_path)?;
            let replaced = match self.backing.stat(&new_path) {
                Ok(_) => self.backing.tree_size(&new_path)?,
                Err(BfError::NotFound(_)) => 0,
                Err(e) => return Err(e),
            };

            // Ancestor chains snapshot before the edges move.
            let src_chain = self.table.chain_from_root(parent)?;
            let dst_chain = self.table.chain_from_root(new_parent)?;

            self.backing.rename(&old_path, &new_path)?;
            // The source node must be mirrored so the edge can move.
            self.ensure_child(parent, name, source_kind)?;
            self.table.rename(parent, name, new_parent, new_name)?;

            Self::rebalance_rename(&src_chain, &dst_chain, moved, replaced);
            Ok(((), 0, 0))
        })
    }

    /// Detach + attach accounting: the moved subtree's bytes leave the
    /// source ancestry's running sums and enter the destination's; a
    /// replaced destination entry leaves every chain it was under.
    fn rebalance_rename(
        src_chain: &[Arc<Node>],
        dst_chain: &[Arc<Node>],
        moved: u64,
        replaced: u64,
    ) {
        let common = src_chain
            .iter()
            .zip(dst_chain.iter())
            .take_while(|(a, b)| a.ino == b.ino)
            .count();
        let moved_delta = i64::try_from(moved).unwrap_or(i64::MAX);
        let replaced_delta = i64::try_from(replaced).unwrap_or(i64::MAX);

        for node in &src_chain[common..] {
            for effect in node.effects() {
                effect.adjust_live_bytes(-moved_delta);
                effect.transfer_volume(-moved_delta);
            }
        }
        for node in &dst_chain[common..] {
            for effect in node.effects() {
                effect.adjust_live_bytes(moved_delta - replaced_delta);
                effect.transfer_volume(moved_delta - replaced_delta);
            }
        }
        if replaced > 0 {
            for node in &src_chain[..common] {
                for effect in node.effects() {
                    effect.adjust_live_bytes(-replaced_delta);
                    effect.transfer_volume(-replaced_delta);
                }
            }
        }
    }

    /// Apply attribute changes. A size change is a truncate: it runs the
    /// interceptor as a write whose length is the grow amount, so MaxSize
    /// checks the delta and shrinks release budget.
    pub fn setattr(&self, cx: &OpCtx, ino: Ino, changes: SetAttr) -> Result<NodeAttr> {
        let path = self.table.path_of(ino)?;

        if let Some(size) = changes.size {
            let old_size = self.backing.stat(&path)?.size;
            let grow = size.saturating_sub(old_size);
            self.intercept(cx, ino, OpKind::Write, old_size.min(size), grow, || {
                self.backing.truncate(&path, size)?;
                if size < old_size {
                    self.shrink_live_bytes(ino, old_size - size)?;
                }
                let delta = i64::try_from(grow).unwrap_or(i64::MAX);
                Ok(((), delta, grow))
            })?;
        }

        if let Some(mode) = changes.mode {
            self.backing.set_mode(&path, mode)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            self.backing.set_times(&path, changes.atime, changes.mtime)?;
        }

        let node = self.table.get(ino)?;
        self.attr_for(&node)
    }

    // ── Xattr operations ────────────────────────────────────────────

    /// Get an extended attribute. `bf.*` names are served by the control
    /// plane; everything else passes through to the backing store.
    pub fn getxattr(&self, ino: Ino, name: &str) -> Result<Vec<u8>> {
        if bf_xattr::is_control_name(name) {
            return bf_xattr::get(&self.table, ino, name).map(String::into_bytes);
        }
        let path = self.table.path_of(ino)?;
        self.backing
            .get_xattr(&path, name)?
            .ok_or_else(|| BfError::NoData(name.to_owned()))
    }

    pub fn setxattr(&self, ino: Ino, name: &str, value: &[u8]) -> Result<()> {
        if bf_xattr::is_control_name(name) {
            debug!(%ino, name, "control plane set");
            return bf_xattr::set(&self.table, ino, name, value, self.clock.now_ms());
        }
        let path = self.table.path_of(ino)?;
        self.backing.set_xattr(&path, name, value)
    }

    pub fn removexattr(&self, ino: Ino, name: &str) -> Result<()> {
        if bf_xattr::is_control_name(name) {
            debug!(%ino, name, "control plane remove");
            return bf_xattr::remove(&self.table, ino, name);
        }
        let path = self.table.path_of(ino)?;
        self.backing.remove_xattr(&path, name)
    }

    pub fn listxattr(&self, ino: Ino) -> Result<Vec<String>> {
        let node = self.table.get(ino)?;
        let mut names = bf_xattr::list(&node);
        let path = self.table.path_of(ino)?;
        names.extend(self.backing.list_xattrs(&path)?);
        Ok(names)
    }

    /// Root of the mounted tree (always inode 1).
    pub fn root_attr(&self) -> Result<NodeAttr> {
        self.getattr(ROOT_INO)
    }

    /// Backing path of a node, exposed for diagnostics.
    pub fn backing_path(&self, ino: Ino) -> Result<PathBuf> {
        self.table.path_of(ino)
    }
}
