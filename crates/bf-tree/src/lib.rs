#![forbid(unsafe_code)]
//! Node table.
//!
//! One entry per live inode in the mounted tree: backing path, parent
//! edge, attached effects, and cumulative counters. Nodes are created
//! lazily on first lookup against the backing store and collected once
//! they are unlinked with no kernel references and no open handles.
//!
//! Locking: a single structural lock serializes insert/remove/rename and
//! path resolution; each node has its own lock for metadata and effect
//! lists; effect state carries a third, innermost lock. The order is
//! always table → node → effect, never the reverse.

use bf_effect::Effect;
use bf_error::{BfError, Result};
use bf_types::{CounterSnapshot, Ino, NodeKind, ROOT_INO};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── Counters ────────────────────────────────────────────────────────────────

/// Per-node cumulative operation counters.
///
/// Monotonic except for explicit reset via `bf.stats`; incremented with
/// relaxed atomics since only totals are observable.
#[derive(Debug, Default)]
pub struct Counters {
    reads: AtomicU64,
    read_volume: AtomicU64,
    writes: AtomicU64,
    write_volume: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    pub fn record_read(&self, volume: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_volume.fetch_add(volume, Ordering::Relaxed);
    }

    pub fn record_write(&self, volume: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_volume.fetch_add(volume, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_volume: self.read_volume.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_volume: self.write_volume.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.read_volume.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.write_volume.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

// ── Node ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct NodeMeta {
    parent: Ino,
    name: String,
    kind: NodeKind,
    children: BTreeMap<String, Ino>,
    /// Kernel references from lookup/create replies.
    nlookup: u64,
    open_handles: u64,
    unlinked: bool,
}

/// A tracked inode.
#[derive(Debug)]
pub struct Node {
    pub ino: Ino,
    meta: Mutex<NodeMeta>,
    pub counters: Counters,
    effects: Mutex<Vec<Arc<Effect>>>,
}

impl Node {
    fn new(ino: Ino, parent: Ino, name: String, kind: NodeKind) -> Arc<Self> {
        Arc::new(Self {
            ino,
            meta: Mutex::new(NodeMeta {
                parent,
                name,
                kind,
                children: BTreeMap::new(),
                nlookup: 0,
                open_handles: 0,
                unlinked: false,
            }),
            counters: Counters::default(),
            effects: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.meta.lock().kind
    }

    #[must_use]
    pub fn parent(&self) -> Ino {
        self.meta.lock().parent
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.meta.lock().unlinked
    }

    /// Record one kernel reference (a lookup/create reply).
    pub fn inc_lookup(&self) {
        self.meta.lock().nlookup += 1;
    }

    pub fn inc_open(&self) {
        self.meta.lock().open_handles += 1;
    }

    // ── Effects ─────────────────────────────────────────────────────

    /// Attach an effect, replacing any previous instance with the same
    /// `(kind, suffix)` identity. The list stays in attachment order.
    pub fn attach_effect(&self, effect: Arc<Effect>) {
        let mut effects = self.effects.lock();
        effects.retain(|e| e.label() != effect.label());
        effects.push(effect);
    }

    /// Detach the effect named by `label`; false if absent.
    pub fn remove_effect(&self, label: &str) -> bool {
        let mut effects = self.effects.lock();
        let before = effects.len();
        effects.retain(|e| e.label() != label);
        effects.len() != before
    }

    /// Detach everything on this node (never touches ancestors).
    pub fn clear_effects(&self) {
        self.effects.lock().clear();
    }

    /// Find one effect by its attribute label.
    #[must_use]
    pub fn effect_by_label(&self, label: &str) -> Option<Arc<Effect>> {
        self.effects.lock().iter().find(|e| e.label() == label).cloned()
    }

    /// Own effects in attachment order.
    #[must_use]
    pub fn effects(&self) -> Vec<Arc<Effect>> {
        self.effects.lock().clone()
    }
}

// ── Table ───────────────────────────────────────────────────────────────────

struct TableState {
    nodes: HashMap<u64, Arc<Node>>,
    next_ino: u64,
}

/// Mapping from inode id to node, mirroring the backing store's tree.
pub struct NodeTable {
    state: Mutex<TableState>,
}

impl NodeTable {
    /// Create a table holding only the mount root.
    #[must_use]
    pub fn new() -> Self {
        let root = Node::new(ROOT_INO, ROOT_INO, String::new(), NodeKind::Dir);
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO.0, root);
        Self {
            state: Mutex::new(TableState {
                nodes,
                next_ino: ROOT_INO.0 + 1,
            }),
        }
    }

    #[must_use]
    pub fn root(&self) -> Arc<Node> {
        self.state
            .lock()
            .nodes
            .get(&ROOT_INO.0)
            .cloned()
            .expect("root node always present")
    }

    pub fn get(&self, ino: Ino) -> Result<Arc<Node>> {
        self.state
            .lock()
            .nodes
            .get(&ino.0)
            .cloned()
            .ok_or_else(|| BfError::NotFound(format!("inode {ino}")))
    }

    /// Number of live nodes.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.lock().nodes.len() as u64
    }

    /// Known child of a directory, if already discovered.
    pub fn child(&self, parent: Ino, name: &str) -> Result<Option<Arc<Node>>> {
        let state = self.state.lock();
        let parent = state
            .nodes
            .get(&parent.0)
            .ok_or_else(|| BfError::NotFound(format!("inode {parent}")))?;
        let child_ino = parent.meta.lock().children.get(name).copied();
        Ok(child_ino.and_then(|ino| state.nodes.get(&ino.0).cloned()))
    }

    /// Insert a node for `name` under `parent`, allocating a fresh inode.
    /// Used both for explicit creation and lazy discovery of backing
    /// entries.
    pub fn insert_child(&self, parent: Ino, name: &str, kind: NodeKind) -> Result<Arc<Node>> {
        let mut state = self.state.lock();
        let parent_node = state
            .nodes
            .get(&parent.0)
            .cloned()
            .ok_or_else(|| BfError::NotFound(format!("inode {parent}")))?;
        {
            let mut meta = parent_node.meta.lock();
            if !meta.kind.is_dir() {
                return Err(BfError::NotDirectory);
            }
            if meta.children.contains_key(name) {
                return Err(BfError::Exists);
            }
            let ino = Ino(state.next_ino);
            meta.children.insert(name.to_owned(), ino);
        }
        let ino = Ino(state.next_ino);
        state.next_ino += 1;
        let node = Node::new(ino, parent, name.to_owned(), kind);
        state.nodes.insert(ino.0, Arc::clone(&node));
        Ok(node)
    }

    /// Backing path of a node: the name chain from the root, computed
    /// under the structural lock so it is atomic with renames.
    pub fn path_of(&self, ino: Ino) -> Result<PathBuf> {
        let state = self.state.lock();
        Self::path_locked(&state, ino)
    }

    fn path_locked(state: &TableState, ino: Ino) -> Result<PathBuf> {
        let mut segments = Vec::new();
        let mut cur = ino;
        loop {
            let node = state
                .nodes
                .get(&cur.0)
                .ok_or_else(|| BfError::Internal(format!("dangling parent edge at inode {cur}")))?;
            if node.ino == ROOT_INO {
                break;
            }
            let meta = node.meta.lock();
            segments.push(meta.name.clone());
            cur = meta.parent;
        }
        let mut path = PathBuf::new();
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        Ok(path)
    }

    /// Nodes from the mount root down to `ino` inclusive, the ancestry
    /// order in which effects compose.
    pub fn chain_from_root(&self, ino: Ino) -> Result<Vec<Arc<Node>>> {
        let state = self.state.lock();
        let mut chain = Vec::new();
        let mut cur = ino;
        loop {
            let node = state
                .nodes
                .get(&cur.0)
                .cloned()
                .ok_or_else(|| BfError::NotFound(format!("inode {cur}")))?;
            let parent = node.meta.lock().parent;
            let at_root = node.ino == ROOT_INO;
            chain.push(node);
            if at_root {
                break;
            }
            cur = parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Remove the name edge for a child and mark it unlinked. The node
    /// itself survives until the kernel drops its references.
    pub fn unlink_child(&self, parent: Ino, name: &str) -> Result<Arc<Node>> {
        let mut state = self.state.lock();
        let parent_node = state
            .nodes
            .get(&parent.0)
            .cloned()
            .ok_or_else(|| BfError::NotFound(format!("inode {parent}")))?;
        let child_ino = parent_node
            .meta
            .lock()
            .children
            .remove(name)
            .ok_or_else(|| BfError::NotFound(name.to_owned()))?;
        let child = state
            .nodes
            .get(&child_ino.0)
            .cloned()
            .ok_or_else(|| BfError::Internal(format!("child edge to missing inode {child_ino}")))?;
        let collectable = {
            let mut meta = child.meta.lock();
            meta.unlinked = true;
            meta.nlookup == 0 && meta.open_handles == 0
        };
        if collectable {
            state.nodes.remove(&child_ino.0);
        }
        Ok(child)
    }

    /// Move a child edge, atomically updating the backing-path-defining
    /// name and parent. Returns the moved node.
    pub fn rename(
        &self,
        parent: Ino,
        name: &str,
        new_parent: Ino,
        new_name: &str,
    ) -> Result<Arc<Node>> {
        let state = self.state.lock();
        let old_parent = state
            .nodes
            .get(&parent.0)
            .cloned()
            .ok_or_else(|| BfError::NotFound(format!("inode {parent}")))?;
        let dest_parent = state
            .nodes
            .get(&new_parent.0)
            .cloned()
            .ok_or_else(|| BfError::NotFound(format!("inode {new_parent}")))?;
        if !dest_parent.meta.lock().kind.is_dir() {
            return Err(BfError::NotDirectory);
        }

        let child_ino = old_parent
            .meta
            .lock()
            .children
            .remove(name)
            .ok_or_else(|| BfError::NotFound(name.to_owned()))?;
        let child = state
            .nodes
            .get(&child_ino.0)
            .cloned()
            .ok_or_else(|| BfError::Internal(format!("child edge to missing inode {child_ino}")))?;

        // A replaced destination entry is dropped from the table; the
        // backing store has already overwritten it.
        let displaced = dest_parent
            .meta
            .lock()
            .children
            .insert(new_name.to_owned(), child_ino);

        {
            let mut meta = child.meta.lock();
            meta.parent = new_parent;
            meta.name = new_name.to_owned();
        }

        if let Some(old_ino) = displaced {
            if old_ino != child_ino {
                let mut state = state;
                if let Some(old_node) = state.nodes.get(&old_ino.0).cloned() {
                    let collectable = {
                        let mut meta = old_node.meta.lock();
                        meta.unlinked = true;
                        meta.nlookup == 0 && meta.open_handles == 0
                    };
                    if collectable {
                        state.nodes.remove(&old_ino.0);
                    }
                }
            }
        }

        Ok(child)
    }

    /// Drop kernel references after a FUSE forget; collects the node when
    /// it is unlinked and has no remaining references or open handles.
    pub fn forget(&self, ino: Ino, nlookup: u64) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get(&ino.0).cloned() else {
            return;
        };
        let collectable = {
            let mut meta = node.meta.lock();
            meta.nlookup = meta.nlookup.saturating_sub(nlookup);
            meta.unlinked && meta.nlookup == 0 && meta.open_handles == 0
        };
        if collectable && ino != ROOT_INO {
            state.nodes.remove(&ino.0);
        }
    }

    /// Release one open handle; collects the node when eligible.
    pub fn release(&self, ino: Ino) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get(&ino.0).cloned() else {
            return;
        };
        let collectable = {
            let mut meta = node.meta.lock();
            meta.open_handles = meta.open_handles.saturating_sub(1);
            meta.unlinked && meta.nlookup == 0 && meta.open_handles == 0
        };
        if collectable && ino != ROOT_INO {
            state.nodes.remove(&ino.0);
        }
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_effect::{parse_value, Kind};

    fn delay_effect(ms: u32, suffix: &str) -> Arc<Effect> {
        let (config, op) =
            parse_value(Kind::Delay, &format!(r#"{{"duration_ms":{ms}}}"#)).unwrap();
        Arc::new(Effect::new(config, op, suffix.to_owned(), 0))
    }

    #[test]
    fn root_is_always_present() {
        let table = NodeTable::new();
        let root = table.root();
        assert_eq!(root.ino, ROOT_INO);
        assert_eq!(root.parent(), ROOT_INO);
        assert_eq!(table.count(), 1);
        assert_eq!(table.path_of(ROOT_INO).unwrap(), PathBuf::new());
    }

    #[test]
    fn insert_and_lookup_children() {
        let table = NodeTable::new();
        let dir = table.insert_child(ROOT_INO, "dir", NodeKind::Dir).unwrap();
        let file = table.insert_child(dir.ino, "f.txt", NodeKind::File).unwrap();
        assert_eq!(
            table.child(ROOT_INO, "dir").unwrap().unwrap().ino,
            dir.ino
        );
        assert_eq!(table.path_of(file.ino).unwrap(), PathBuf::from("dir/f.txt"));
        assert!(table.child(ROOT_INO, "nope").unwrap().is_none());
        assert!(matches!(
            table.insert_child(ROOT_INO, "dir", NodeKind::Dir).unwrap_err(),
            BfError::Exists
        ));
        assert!(matches!(
            table.insert_child(file.ino, "x", NodeKind::File).unwrap_err(),
            BfError::NotDirectory
        ));
    }

    #[test]
    fn chain_runs_root_first() {
        let table = NodeTable::new();
        let a = table.insert_child(ROOT_INO, "a", NodeKind::Dir).unwrap();
        let b = table.insert_child(a.ino, "b", NodeKind::Dir).unwrap();
        let c = table.insert_child(b.ino, "c", NodeKind::File).unwrap();
        let chain = table.chain_from_root(c.ino).unwrap();
        let inos: Vec<Ino> = chain.iter().map(|n| n.ino).collect();
        assert_eq!(inos, vec![ROOT_INO, a.ino, b.ino, c.ino]);
    }

    #[test]
    fn rename_updates_path_atomically_with_edge() {
        let table = NodeTable::new();
        let src = table.insert_child(ROOT_INO, "src", NodeKind::Dir).unwrap();
        let dst = table.insert_child(ROOT_INO, "dst", NodeKind::Dir).unwrap();
        let file = table.insert_child(src.ino, "f", NodeKind::File).unwrap();

        let moved = table.rename(src.ino, "f", dst.ino, "g").unwrap();
        assert_eq!(moved.ino, file.ino);
        assert_eq!(table.path_of(file.ino).unwrap(), PathBuf::from("dst/g"));
        assert!(table.child(src.ino, "f").unwrap().is_none());
        assert_eq!(table.child(dst.ino, "g").unwrap().unwrap().ino, file.ino);
        // Descendant paths follow the moved edge.
        let sub = table.insert_child(dst.ino, "sub", NodeKind::Dir).unwrap();
        table.rename(dst.ino, "g", sub.ino, "g").unwrap();
        assert_eq!(table.path_of(file.ino).unwrap(), PathBuf::from("dst/sub/g"));
    }

    #[test]
    fn unlink_defers_collection_until_forget_and_release() {
        let table = NodeTable::new();
        let file = table.insert_child(ROOT_INO, "f", NodeKind::File).unwrap();
        file.inc_lookup();
        file.inc_open();

        table.unlink_child(ROOT_INO, "f").unwrap();
        assert!(file.is_unlinked());
        // Still referenced: stays in the table.
        assert!(table.get(file.ino).is_ok());

        table.release(file.ino);
        assert!(table.get(file.ino).is_ok());
        table.forget(file.ino, 1);
        assert!(table.get(file.ino).is_err());
    }

    #[test]
    fn unlink_without_references_collects_immediately() {
        let table = NodeTable::new();
        let file = table.insert_child(ROOT_INO, "f", NodeKind::File).unwrap();
        table.unlink_child(ROOT_INO, "f").unwrap();
        assert!(table.get(file.ino).is_err());
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn attach_replaces_same_identity() {
        let table = NodeTable::new();
        let node = table.insert_child(ROOT_INO, "f", NodeKind::File).unwrap();
        node.attach_effect(delay_effect(100, ""));
        node.attach_effect(delay_effect(100, "1"));
        assert_eq!(node.effects().len(), 2);

        // Same (kind, suffix) replaces; different suffix coexists.
        node.attach_effect(delay_effect(200, ""));
        let effects = node.effects();
        assert_eq!(effects.len(), 2);
        // Replacement moves the instance to the end (new attachment time).
        assert_eq!(effects[0].label(), "delay-1");
        assert_eq!(effects[1].label(), "delay");
    }

    #[test]
    fn remove_effect_is_exact() {
        let table = NodeTable::new();
        let node = table.insert_child(ROOT_INO, "f", NodeKind::File).unwrap();
        node.attach_effect(delay_effect(1, ""));
        node.attach_effect(delay_effect(2, "x"));
        assert!(node.remove_effect("delay-x"));
        assert!(!node.remove_effect("delay-x"));
        assert_eq!(node.effects().len(), 1);
        node.clear_effects();
        assert!(node.effects().is_empty());
    }

    #[test]
    fn counters_accumulate_and_reset() {
        let counters = Counters::default();
        counters.record_read(100);
        counters.record_read(50);
        counters.record_write(10);
        counters.record_error();
        let snap = counters.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.read_volume, 150);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.write_volume, 10);
        assert_eq!(snap.errors, 1);
        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
