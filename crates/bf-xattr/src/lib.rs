#![forbid(unsafe_code)]
//! `bf.*` xattr control plane.
//!
//! Interprets get/set/remove requests on the reserved `bf.` namespace and
//! mutates the node table accordingly. Everything outside the namespace is
//! left to the caller to pass through to the backing store.
//!
//! Name grammar:
//!
//! - `bf.effect.<kind>` / `bf.effect.<kind>-<suffix>`: one effect
//! - `bf.effect`: all effects on the node (`/self` is a get alias)
//! - `bf.effect/all`: the effective (inherited + own) set
//! - `bf.stats`: per-node counters; any set resets them
//! - `bf.ino`: the node's inode number

use bf_effect::{parse_effect_name, parse_value, Effect};
use bf_error::{BfError, Result};
use bf_tree::{Node, NodeTable};
use bf_types::Ino;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Reserved attribute namespace.
pub const CONTROL_PREFIX: &str = "bf.";

const EFFECT_ATTR: &str = "bf.effect";
const EFFECT_SELF_ATTR: &str = "bf.effect/self";
const EFFECT_ALL_ATTR: &str = "bf.effect/all";
const EFFECT_KIND_PREFIX: &str = "bf.effect.";
const STATS_ATTR: &str = "bf.stats";
const INO_ATTR: &str = "bf.ino";

/// Whether an xattr name belongs to the control plane. Control names
/// never trigger effects and never reach the backing store.
#[must_use]
pub fn is_control_name(name: &str) -> bool {
    name.starts_with(CONTROL_PREFIX)
}

fn own_effects_json(node: &Node) -> Value {
    let mut obj = Map::new();
    for effect in node.effects() {
        obj.insert(effect.label(), effect.to_json());
    }
    Value::Object(obj)
}

/// Serve a control-plane get. The caller has already checked
/// [`is_control_name`].
pub fn get(table: &NodeTable, ino: Ino, name: &str) -> Result<String> {
    let node = table.get(ino)?;
    match name {
        EFFECT_ATTR | EFFECT_SELF_ATTR => Ok(own_effects_json(&node).to_string()),
        EFFECT_ALL_ATTR => {
            let chain = table.chain_from_root(ino)?;
            let mut all = Vec::new();
            for ancestor in &chain {
                for effect in ancestor.effects() {
                    let mut entry = match effect.to_json() {
                        Value::Object(obj) => obj,
                        other => {
                            let mut obj = Map::new();
                            obj.insert("value".to_owned(), other);
                            obj
                        }
                    };
                    entry.insert("ino".to_owned(), ancestor.ino.0.into());
                    entry.insert("name".to_owned(), effect.label().into());
                    all.push(Value::Object(entry));
                }
            }
            Ok(Value::Array(all).to_string())
        }
        STATS_ATTR => serde_json::to_string(&node.counters.snapshot())
            .map_err(|e| BfError::Internal(format!("stats serialization: {e}"))),
        INO_ATTR => Ok(ino.0.to_string()),
        _ => match name.strip_prefix(EFFECT_KIND_PREFIX) {
            Some(rest) => {
                let (kind, suffix) = parse_effect_name(rest)
                    .ok_or_else(|| BfError::NoData(name.to_owned()))?;
                let label = effect_label(kind, &suffix);
                let effect = node
                    .effect_by_label(&label)
                    .ok_or_else(|| BfError::NoData(name.to_owned()))?;
                Ok(effect.to_json().to_string())
            }
            None => Err(BfError::NoData(name.to_owned())),
        },
    }
}

/// Serve a control-plane set. Parse failure yields EINVAL with no state
/// change; a valid value creates or replaces the named effect.
pub fn set(table: &NodeTable, ino: Ino, name: &str, value: &[u8], now_ms: u64) -> Result<()> {
    let node = table.get(ino)?;
    match name {
        STATS_ATTR => {
            // Any value resets the counters.
            node.counters.reset();
            Ok(())
        }
        EFFECT_ATTR | EFFECT_SELF_ATTR | EFFECT_ALL_ATTR | INO_ATTR => Err(BfError::InvalidConfig(
            format!("attribute '{name}' is not writable"),
        )),
        _ => {
            let rest = name
                .strip_prefix(EFFECT_KIND_PREFIX)
                .ok_or_else(|| BfError::InvalidConfig(format!("unknown attribute '{name}'")))?;
            let (kind, suffix) = parse_effect_name(rest)
                .ok_or_else(|| BfError::InvalidConfig(format!("unknown effect kind in '{name}'")))?;
            let text = std::str::from_utf8(value)
                .map_err(|_| BfError::InvalidConfig("effect value must be UTF-8".to_owned()))?;
            let (config, op) = parse_value(kind, text)?;
            let effect = Arc::new(Effect::new(config, op, suffix, now_ms));
            node.attach_effect(effect);
            Ok(())
        }
    }
}

/// Serve a control-plane remove. Removing `bf.effect` clears the node's
/// own effects (never ancestors); removing an absent effect is ENODATA
/// and changes nothing.
pub fn remove(table: &NodeTable, ino: Ino, name: &str) -> Result<()> {
    let node = table.get(ino)?;
    match name {
        EFFECT_ATTR => {
            node.clear_effects();
            Ok(())
        }
        _ => match name.strip_prefix(EFFECT_KIND_PREFIX) {
            Some(rest) => {
                let (kind, suffix) = parse_effect_name(rest)
                    .ok_or_else(|| BfError::NoData(name.to_owned()))?;
                if node.remove_effect(&effect_label(kind, &suffix)) {
                    Ok(())
                } else {
                    Err(BfError::NoData(name.to_owned()))
                }
            }
            None => Err(BfError::NoData(name.to_owned())),
        },
    }
}

/// Control names present on a node, for listxattr merging.
#[must_use]
pub fn list(node: &Node) -> Vec<String> {
    let mut names: Vec<String> = node
        .effects()
        .iter()
        .map(|e| format!("{EFFECT_KIND_PREFIX}{}", e.label()))
        .collect();
    names.push(STATS_ATTR.to_owned());
    names.push(INO_ATTR.to_owned());
    names
}

fn effect_label(kind: bf_effect::Kind, suffix: &str) -> String {
    if suffix.is_empty() {
        kind.as_str().to_owned()
    } else {
        format!("{}-{suffix}", kind.as_str())
    }
}
