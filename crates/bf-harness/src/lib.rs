#![forbid(unsafe_code)]
//! Test fixture for driving the full Broken Fuse core stack.
//!
//! Wires a [`BrokenFs`] to a manual clock and a seeded RNG so scenario
//! and property tests run deterministically and without real sleeping.

use bf_clock::{Clock, FaultRng, ManualClock};
use bf_core::{Backing, BfResult, BrokenFs, MemBacking, OpCtx};
use bf_types::{CounterSnapshot, Ino, ROOT_INO};
use std::sync::Arc;

/// A core filesystem with injected time and randomness.
pub struct TestFs {
    pub fs: Arc<BrokenFs>,
    pub clock: Arc<ManualClock>,
    pub cx: OpCtx,
}

impl TestFs {
    /// In-memory backing, default seed.
    #[must_use]
    pub fn mem() -> Self {
        Self::with_backing(Arc::new(MemBacking::new()), 42)
    }

    #[must_use]
    pub fn mem_seeded(seed: u64) -> Self {
        Self::with_backing(Arc::new(MemBacking::new()), seed)
    }

    #[must_use]
    pub fn with_backing(backing: Arc<dyn Backing>, seed: u64) -> Self {
        let clock = Arc::new(ManualClock::new());
        let fs = BrokenFs::new(
            backing,
            Arc::clone(&clock) as Arc<dyn Clock>,
            FaultRng::seeded(seed),
        );
        Self {
            fs: Arc::new(fs),
            clock,
            cx: OpCtx::new(),
        }
    }

    pub fn mkdir(&self, parent: Ino, name: &str) -> Ino {
        self.fs.mkdir(&self.cx, parent, name, 0o755).unwrap().ino
    }

    pub fn mkfile(&self, parent: Ino, name: &str) -> Ino {
        self.fs.create(&self.cx, parent, name, 0o644).unwrap().ino
    }

    pub fn mkfile_at_root(&self, name: &str) -> Ino {
        self.mkfile(ROOT_INO, name)
    }

    pub fn write(&self, ino: Ino, offset: u64, data: &[u8]) -> BfResult<u32> {
        self.fs.write(&self.cx, ino, offset, data)
    }

    pub fn read(&self, ino: Ino, offset: u64, size: u32) -> BfResult<Vec<u8>> {
        self.fs.read(&self.cx, ino, offset, size)
    }

    /// Attach or replace an effect through the control plane.
    pub fn attach(&self, ino: Ino, attr: &str, value: &str) {
        self.fs.setxattr(ino, attr, value.as_bytes()).unwrap();
    }

    pub fn detach(&self, ino: Ino, attr: &str) {
        self.fs.removexattr(ino, attr).unwrap();
    }

    pub fn stats(&self, ino: Ino) -> CounterSnapshot {
        serde_json::from_slice(&self.fs.getxattr(ino, "bf.stats").unwrap()).unwrap()
    }

    pub fn control_json(&self, ino: Ino, attr: &str) -> serde_json::Value {
        serde_json::from_slice(&self.fs.getxattr(ino, attr).unwrap()).unwrap()
    }
}
