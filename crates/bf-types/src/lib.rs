#![forbid(unsafe_code)]
//! Shared types for Broken Fuse.
//!
//! Newtypes and small enums used across the workspace: inode numbers,
//! operation classification, effect scope filters, and counter snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inode number of the mount root, as expected by the FUSE protocol.
pub const ROOT_INO: Ino = Ino(1);

/// Block size reported in attributes and statfs replies.
pub const BLOCK_SIZE: u32 = 4096;

/// Environment variable holding the deterministic RNG seed.
pub const SEED_ENV: &str = "BF_SEED";

/// Stable inode identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ino(pub u64);

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of an inbound operation for effect scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// Scope filter restricting an effect to reads, writes, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpFilter {
    Read,
    Write,
    #[default]
    Both,
}

impl OpFilter {
    /// Whether an operation of the given kind falls under this filter.
    #[must_use]
    pub fn matches(self, kind: OpKind) -> bool {
        match self {
            Self::Read => kind == OpKind::Read,
            Self::Write => kind == OpKind::Write,
            Self::Both => true,
        }
    }

    /// Parse the `op` field of an effect value (`"r"`, `"w"`, `"rw"`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut read = false;
        let mut write = false;
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'r' => read = true,
                'w' => write = true,
                _ => return None,
            }
        }
        match (read, write) {
            (true, false) => Some(Self::Read),
            (false, true) => Some(Self::Write),
            (true, true) => Some(Self::Both),
            (false, false) => None,
        }
    }

    /// Canonical wire form, `None` when the filter covers both kinds.
    #[must_use]
    pub fn as_wire(self) -> Option<&'static str> {
        match self {
            Self::Read => Some("r"),
            Self::Write => Some("w"),
            Self::Both => None,
        }
    }
}

/// Kind of a tracked node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

impl NodeKind {
    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Dir)
    }
}

/// Point-in-time view of a node's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub reads: u64,
    pub read_volume: u64,
    pub writes: u64,
    pub write_volume: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_kinds() {
        assert!(OpFilter::Read.matches(OpKind::Read));
        assert!(!OpFilter::Read.matches(OpKind::Write));
        assert!(OpFilter::Write.matches(OpKind::Write));
        assert!(!OpFilter::Write.matches(OpKind::Read));
        assert!(OpFilter::Both.matches(OpKind::Read));
        assert!(OpFilter::Both.matches(OpKind::Write));
    }

    #[test]
    fn filter_parse_accepts_combined_forms() {
        assert_eq!(OpFilter::parse("r"), Some(OpFilter::Read));
        assert_eq!(OpFilter::parse("w"), Some(OpFilter::Write));
        assert_eq!(OpFilter::parse("rw"), Some(OpFilter::Both));
        assert_eq!(OpFilter::parse("wr"), Some(OpFilter::Both));
        assert_eq!(OpFilter::parse("R"), Some(OpFilter::Read));
        assert_eq!(OpFilter::parse(""), None);
        assert_eq!(OpFilter::parse("x"), None);
    }

    #[test]
    fn filter_wire_form_omits_both() {
        assert_eq!(OpFilter::Read.as_wire(), Some("r"));
        assert_eq!(OpFilter::Write.as_wire(), Some("w"));
        assert_eq!(OpFilter::Both.as_wire(), None);
    }

    #[test]
    fn counter_snapshot_serializes_all_fields() {
        let snap = CounterSnapshot {
            reads: 1,
            read_volume: 100,
            writes: 2,
            write_volume: 200,
            errors: 3,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["reads"], 1);
        assert_eq!(json["read_volume"], 100);
        assert_eq!(json["writes"], 2);
        assert_eq!(json["write_volume"], 200);
        assert_eq!(json["errors"], 3);
    }
}
