#![forbid(unsafe_code)]
//! Fault-injection effect registry.
//!
//! Every effect kind declares a config schema, a mutable state type, a
//! phase (`pre` runs before the backing call and may delay or fail the
//! operation; `post` observes the outcome), and an evaluator. The kinds
//! form a closed set, so the registry is a tagged enum with a match per
//! operation rather than open subtype polymorphism.
//!
//! Effect state lives behind a per-instance lock. Evaluators take the
//! lock, compute their verdict, and release it before the caller sleeps
//! or calls into the backing store; budgeted kinds (MaxSize, Quota)
//! reserve their amount inside that critical section so concurrent
//! writers cannot both pass a check their combined length would overflow.

use bf_clock::FaultRng;
use bf_error::{BfError, Result};
use bf_types::{OpFilter, OpKind};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ── Kinds ───────────────────────────────────────────────────────────────────

/// The closed set of effect kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Delay,
    Flakey,
    MaxSize,
    Heatmap,
    Quota,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Flakey => "flakey",
            Self::MaxSize => "maxsize",
            Self::Heatmap => "heatmap",
            Self::Quota => "quota",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "delay" => Some(Self::Delay),
            "flakey" => Some(Self::Flakey),
            "maxsize" => Some(Self::MaxSize),
            "heatmap" => Some(Self::Heatmap),
            "quota" => Some(Self::Quota),
            _ => None,
        }
    }
}

/// Whether an effect runs before or after the backing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

// ── Configs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayConfig {
    pub duration_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlakeyMode {
    /// Fail each matching op with probability `prob`.
    Prob(f64),
    /// Repeating available/unavailable windows, anchored at attach time.
    Window { avail_ms: u32, unavail_ms: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlakeyConfig {
    pub mode: FlakeyMode,
    pub errno: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxSizeConfig {
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatmapConfig {
    pub align: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    pub limit: u64,
    pub align: u64,
}

/// Parsed, validated configuration of one effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Config {
    Delay(DelayConfig),
    Flakey(FlakeyConfig),
    MaxSize(MaxSizeConfig),
    Heatmap(HeatmapConfig),
    Quota(QuotaConfig),
}

impl Config {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Delay(_) => Kind::Delay,
            Self::Flakey(_) => Kind::Flakey,
            Self::MaxSize(_) => Kind::MaxSize,
            Self::Heatmap(_) => Kind::Heatmap,
            Self::Quota(_) => Kind::Quota,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Heatmap(_) => Phase::Post,
            _ => Phase::Pre,
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────────────────

/// Split an effect attribute suffix (`delay`, `delay-slow`) into kind and
/// instance suffix. The suffix defaults to empty.
#[must_use]
pub fn parse_effect_name(name: &str) -> Option<(Kind, String)> {
    let (kind_str, suffix) = match name.split_once('-') {
        Some((k, s)) => (k, s),
        None => (name, ""),
    };
    Kind::from_str(kind_str).map(|kind| (kind, suffix.to_owned()))
}

fn invalid(msg: impl Into<String>) -> BfError {
    BfError::InvalidConfig(msg.into())
}

fn take_u64(obj: &mut Map<String, Value>, field: &str) -> Result<Option<u64>> {
    match obj.remove(field) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(format!("field '{field}' must be an unsigned integer"))),
    }
}

fn take_u32(obj: &mut Map<String, Value>, field: &str) -> Result<Option<u32>> {
    match take_u64(obj, field)? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| invalid(format!("field '{field}' out of range"))),
    }
}

fn reject_unknown(obj: &Map<String, Value>, kind: Kind) -> Result<()> {
    if let Some(field) = obj.keys().next() {
        return Err(invalid(format!(
            "unknown field '{field}' for effect kind '{}'",
            kind.as_str()
        )));
    }
    Ok(())
}

/// Parse a `bf.effect.*` xattr value against the kind's schema.
///
/// Returns the validated config plus the generic `op` scope filter.
/// Failure is EINVAL and implies no state change in the caller.
pub fn parse_value(kind: Kind, value: &str) -> Result<(Config, OpFilter)> {
    let parsed: Value =
        serde_json::from_str(value).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
    let Value::Object(mut obj) = parsed else {
        return Err(invalid("effect value must be a JSON object"));
    };

    let op = match obj.remove("op") {
        None => OpFilter::Both,
        Some(Value::String(s)) => {
            OpFilter::parse(&s).ok_or_else(|| invalid(format!("bad op filter '{s}'")))?
        }
        Some(_) => return Err(invalid("field 'op' must be a string")),
    };

    let config = match kind {
        Kind::Delay => {
            let duration_ms = take_u32(&mut obj, "duration_ms")?
                .ok_or_else(|| invalid("delay requires 'duration_ms'"))?;
            reject_unknown(&obj, kind)?;
            Config::Delay(DelayConfig { duration_ms })
        }
        Kind::Flakey => {
            let prob = match obj.remove("prob") {
                None => None,
                Some(v) => Some(
                    v.as_f64()
                        .ok_or_else(|| invalid("field 'prob' must be a number"))?,
                ),
            };
            let avail = take_u32(&mut obj, "avail")?;
            let unavail = take_u32(&mut obj, "unavail")?;
            let errno = match obj.remove("errno") {
                None => libc::EIO,
                Some(v) => {
                    let raw = v
                        .as_i64()
                        .ok_or_else(|| invalid("field 'errno' must be an integer"))?;
                    i32::try_from(raw).map_err(|_| invalid("field 'errno' out of range"))?
                }
            };
            reject_unknown(&obj, kind)?;
            if errno <= 0 {
                return Err(invalid("errno must be positive"));
            }
            let mode = match (prob, avail, unavail) {
                (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                    return Err(invalid("'prob' cannot be combined with 'avail'/'unavail'"));
                }
                (Some(p), None, None) => {
                    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                        return Err(invalid("'prob' must be within [0, 1]"));
                    }
                    FlakeyMode::Prob(p)
                }
                (None, Some(avail_ms), Some(unavail_ms)) => {
                    if avail_ms == 0 && unavail_ms == 0 {
                        return Err(invalid("'avail' and 'unavail' cannot both be zero"));
                    }
                    FlakeyMode::Window {
                        avail_ms,
                        unavail_ms,
                    }
                }
                _ => {
                    return Err(invalid(
                        "flakey requires 'prob' or both 'avail' and 'unavail'",
                    ));
                }
            };
            Config::Flakey(FlakeyConfig { mode, errno })
        }
        Kind::MaxSize => {
            let limit =
                take_u64(&mut obj, "limit")?.ok_or_else(|| invalid("maxsize requires 'limit'"))?;
            reject_unknown(&obj, kind)?;
            Config::MaxSize(MaxSizeConfig { limit })
        }
        Kind::Heatmap => {
            let align =
                take_u64(&mut obj, "align")?.ok_or_else(|| invalid("heatmap requires 'align'"))?;
            reject_unknown(&obj, kind)?;
            if align == 0 {
                return Err(invalid("heatmap 'align' must be >= 1"));
            }
            Config::Heatmap(HeatmapConfig { align })
        }
        Kind::Quota => {
            let limit =
                take_u64(&mut obj, "limit")?.ok_or_else(|| invalid("quota requires 'limit'"))?;
            let align =
                take_u64(&mut obj, "align")?.ok_or_else(|| invalid("quota requires 'align'"))?;
            reject_unknown(&obj, kind)?;
            if align == 0 {
                return Err(invalid("quota 'align' must be >= 1"));
            }
            Config::Quota(QuotaConfig { limit, align })
        }
    };

    Ok((config, op))
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeatBucket {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug)]
enum State {
    Stateless,
    Window { attached_at_ms: u64 },
    /// MaxSize: live subtree byte sum, `None` until recomputed on first use.
    SubtreeBytes { current: Option<u64> },
    /// Quota: align-rounded volume consumed so far.
    Volume { used: u64 },
    Heat { buckets: BTreeMap<u64, HeatBucket> },
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Per-operation inputs shared by all evaluators.
#[derive(Debug, Clone, Copy)]
pub struct EvalInput {
    pub op: OpKind,
    pub offset: u64,
    pub length: u64,
    pub now_ms: u64,
}

/// Verdict of one pre-phase evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreOutcome {
    /// Proceed; `reserved` is set for budgeted kinds and must be settled
    /// or rolled back by the caller.
    Continue { reserved: Option<u64> },
    Fail(i32),
    Delay(u64),
}

/// One attached effect instance: parsed config plus locked runtime state.
pub struct Effect {
    kind: Kind,
    suffix: String,
    op: OpFilter,
    config: Config,
    state: Mutex<State>,
}

impl Effect {
    /// Instantiate an effect; `now_ms` anchors windowed Flakey timelines.
    #[must_use]
    pub fn new(config: Config, op: OpFilter, suffix: String, now_ms: u64) -> Self {
        let state = match &config {
            Config::Flakey(c) if matches!(c.mode, FlakeyMode::Window { .. }) => State::Window {
                attached_at_ms: now_ms,
            },
            Config::MaxSize(_) => State::SubtreeBytes { current: None },
            Config::Quota(_) => State::Volume { used: 0 },
            Config::Heatmap(_) => State::Heat {
                buckets: BTreeMap::new(),
            },
            _ => State::Stateless,
        };
        Self {
            kind: config.kind(),
            suffix,
            op,
            config,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.config.phase()
    }

    /// Attribute name suffix: `delay` or `delay-slow`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.suffix.is_empty() {
            self.kind.as_str().to_owned()
        } else {
            format!("{}-{}", self.kind.as_str(), self.suffix)
        }
    }

    /// Whether this effect applies to the given op kind, combining the
    /// user scope filter with kind-implied scoping (MaxSize guards writes).
    #[must_use]
    pub fn applies_to(&self, op: OpKind) -> bool {
        let implied = match self.config {
            Config::MaxSize(_) => op == OpKind::Write,
            _ => true,
        };
        implied && self.op.matches(op)
    }

    /// MaxSize state that still needs its first recompute from the backing
    /// store. The caller supplies the subtree byte sum to `evaluate_pre`.
    #[must_use]
    pub fn needs_subtree_init(&self) -> bool {
        matches!(*self.state.lock(), State::SubtreeBytes { current: None })
    }

    /// Run the pre-phase evaluator. Never sleeps; the caller applies any
    /// returned delay after all pre effects have been consulted.
    #[must_use]
    pub fn evaluate_pre(
        &self,
        input: &EvalInput,
        rng: &FaultRng,
        subtree_bytes: Option<u64>,
    ) -> PreOutcome {
        match &self.config {
            Config::Delay(c) => PreOutcome::Delay(u64::from(c.duration_ms)),
            Config::Flakey(c) => match c.mode {
                FlakeyMode::Prob(prob) => {
                    if rng.next_unit() < prob {
                        PreOutcome::Fail(c.errno)
                    } else {
                        PreOutcome::Continue { reserved: None }
                    }
                }
                FlakeyMode::Window {
                    avail_ms,
                    unavail_ms,
                } => {
                    let state = self.state.lock();
                    let State::Window { attached_at_ms } = *state else {
                        return PreOutcome::Continue { reserved: None };
                    };
                    let period = u64::from(avail_ms) + u64::from(unavail_ms);
                    let elapsed = input.now_ms.saturating_sub(attached_at_ms);
                    if elapsed % period < u64::from(avail_ms) {
                        PreOutcome::Continue { reserved: None }
                    } else {
                        PreOutcome::Fail(c.errno)
                    }
                }
            },
            Config::MaxSize(c) => {
                let mut state = self.state.lock();
                let State::SubtreeBytes { current } = &mut *state else {
                    return PreOutcome::Continue { reserved: None };
                };
                let cur = current.get_or_insert(subtree_bytes.unwrap_or(0));
                // Zero-length writes (unlink, truncate-shrink) never fail
                // the check, even when the subtree is already over limit.
                if input.length == 0 {
                    return PreOutcome::Continue { reserved: None };
                }
                if cur.saturating_add(input.length) > c.limit {
                    PreOutcome::Fail(libc::ENOSPC)
                } else {
                    *cur += input.length;
                    PreOutcome::Continue {
                        reserved: Some(input.length),
                    }
                }
            }
            Config::Quota(c) => {
                let rounded = input.length.div_ceil(c.align).saturating_mul(c.align);
                if rounded == 0 {
                    return PreOutcome::Continue { reserved: None };
                }
                let mut state = self.state.lock();
                let State::Volume { used } = &mut *state else {
                    return PreOutcome::Continue { reserved: None };
                };
                if used.saturating_add(rounded) > c.limit {
                    PreOutcome::Fail(libc::EDQUOT)
                } else {
                    *used += rounded;
                    PreOutcome::Continue {
                        reserved: Some(rounded),
                    }
                }
            }
            // Post-phase kinds never run in the pre pass.
            Config::Heatmap(_) => PreOutcome::Continue { reserved: None },
        }
    }

    /// Run the post-phase observer. Heatmaps record attempts, so this is
    /// called for failed ops too; it cannot change the outcome.
    pub fn record_post(&self, input: &EvalInput) {
        let Config::Heatmap(c) = &self.config else {
            return;
        };
        if input.length == 0 {
            return;
        }
        let mut state = self.state.lock();
        let State::Heat { buckets } = &mut *state else {
            return;
        };
        let first = input.offset / c.align;
        let last = input.offset.saturating_add(input.length).div_ceil(c.align);
        for index in first..last {
            let bucket = buckets.entry(index.saturating_mul(c.align)).or_default();
            match input.op {
                OpKind::Read => bucket.reads += 1,
                OpKind::Write => bucket.writes += 1,
            }
        }
    }

    /// Settle a reservation after the backing call succeeded. MaxSize
    /// replaces the pessimistic reservation with the real size delta;
    /// Quota keeps the rounded volume.
    pub fn settle(&self, reserved: u64, actual_delta: i64) {
        if let State::SubtreeBytes {
            current: Some(cur), ..
        } = &mut *self.state.lock()
        {
            let settled = cur.saturating_sub(reserved);
            *cur = apply_delta(settled, actual_delta);
        }
    }

    /// Roll a reservation back after a failed or cancelled op.
    pub fn rollback(&self, reserved: u64) {
        match &mut *self.state.lock() {
            State::SubtreeBytes {
                current: Some(cur), ..
            } => *cur = cur.saturating_sub(reserved),
            State::Volume { used } => *used = used.saturating_sub(reserved),
            _ => {}
        }
    }

    /// Apply an out-of-band change in live subtree bytes (unlink,
    /// truncate, rename) to a MaxSize running sum. Uninitialized sums are
    /// left alone; their first recompute will observe the new state.
    pub fn adjust_live_bytes(&self, delta: i64) {
        if let State::SubtreeBytes {
            current: Some(cur), ..
        } = &mut *self.state.lock()
        {
            *cur = apply_delta(*cur, delta);
        }
    }

    /// Move bytes into or out of a Quota running sum. Only rename uses
    /// this: accounting treats a cross-subtree move as detach + attach.
    pub fn transfer_volume(&self, delta: i64) {
        if let State::Volume { used } = &mut *self.state.lock() {
            *used = apply_delta(*used, delta);
        }
    }

    /// Current running sum of a budgeted effect (for inspection in tests).
    #[must_use]
    pub fn current_budget(&self) -> Option<u64> {
        match &*self.state.lock() {
            State::SubtreeBytes { current } => *current,
            State::Volume { used } => Some(*used),
            _ => None,
        }
    }

    /// Canonical JSON exposure: config fields in sorted order, defaults
    /// materialized, `op` omitted when it covers both kinds. Heatmap adds
    /// its bucket state, which is the whole point of reading it back.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        match &self.config {
            Config::Delay(c) => {
                obj.insert("duration_ms".to_owned(), c.duration_ms.into());
            }
            Config::Flakey(c) => {
                match c.mode {
                    FlakeyMode::Prob(p) => {
                        obj.insert("prob".to_owned(), p.into());
                    }
                    FlakeyMode::Window {
                        avail_ms,
                        unavail_ms,
                    } => {
                        obj.insert("avail".to_owned(), avail_ms.into());
                        obj.insert("unavail".to_owned(), unavail_ms.into());
                    }
                }
                obj.insert("errno".to_owned(), c.errno.into());
            }
            Config::MaxSize(c) => {
                obj.insert("limit".to_owned(), c.limit.into());
            }
            Config::Heatmap(c) => {
                obj.insert("align".to_owned(), c.align.into());
                let state = self.state.lock();
                let mut buckets = Map::new();
                if let State::Heat { buckets: map } = &*state {
                    for (offset, bucket) in map {
                        let mut counts = Map::new();
                        if bucket.reads > 0 {
                            counts.insert("r".to_owned(), bucket.reads.into());
                        }
                        if bucket.writes > 0 {
                            counts.insert("w".to_owned(), bucket.writes.into());
                        }
                        buckets.insert(offset.to_string(), Value::Object(counts));
                    }
                }
                obj.insert("buckets".to_owned(), Value::Object(buckets));
            }
            Config::Quota(c) => {
                obj.insert("align".to_owned(), c.align.into());
                obj.insert("limit".to_owned(), c.limit.into());
            }
        }
        if let Some(wire) = self.op.as_wire() {
            obj.insert("op".to_owned(), wire.into());
        }
        Value::Object(obj)
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("label", &self.label())
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
