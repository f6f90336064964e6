//! Key specifications and consumer descriptions
//!
//! Everything a collector needs to know about its tensors is fixed here, at
//! registration time. A game publishes a [`KeyTable`] describing every key it
//! can produce; each consumer registers a [`BatchDesc`] naming the keys it
//! wants per batch row and per reply. [`ResolvedDesc::resolve`] binds the
//! description against the table once, so the hot extraction path works on
//! pre-computed column indices instead of string lookups.
//!
//! ## Key name conventions
//!
//! - `last_X` in an input set means "value of `X` from the event one step
//!   after the window row". If the episode broke between the two events the
//!   value is zeroed and the terminal sentinel is raised instead.
//! - `histK_X` (K >= 1) means "value of `X` from K steps before the window",
//!   filled on row 0 only. Larger K is older.
//! - A plain key missing from the table falls back to the game's `last_`
//!   form read one step ahead, which denotes the same quantity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{ Deserialize, Serialize };

use crate::constants::{
    DEFAULT_REPLY_CACHE_CAPACITY,
    DEFAULT_REPLY_T,
    DEFAULT_SENDER_QUEUE_BOUND,
    DEFAULT_SLOT_POOL_SIZE,
    HISTORY_CAPACITY_FACTOR,
};
use crate::error::{ ConvoyError, Result };

/// Element type of a tensor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit float
    F32,
    /// Unsigned byte (also used for chars and flags)
    U8,
}

impl ElemType {
    /// Size of one element in bytes
    pub const fn size_of(self) -> usize {
        match self {
            ElemType::I32 => 4,
            ElemType::I64 => 8,
            ElemType::F32 => 4,
            ElemType::U8 => 1,
        }
    }

    /// Whether a value of type `from` may be widened into `self` without loss
    pub fn accepts(self, from: ElemType) -> bool {
        self == from ||
            matches!(
                (from, self),
                (ElemType::I32, ElemType::I64) |
                    (ElemType::U8, ElemType::I32) |
                    (ElemType::U8, ElemType::I64)
            )
    }
}

/// Specification of a single tensor slot: element type, logical shape
/// (excluding the leading time and batch axes) and placement hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Element type
    pub dtype: ElemType,
    /// Logical per-event shape; empty means scalar
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Allocate the batch column in page-locked memory
    #[serde(default)]
    pub pinned: bool,
}

impl KeySpec {
    /// Scalar slot of the given element type
    pub fn scalar(dtype: ElemType) -> Self {
        Self { dtype, shape: Vec::new(), pinned: false }
    }

    /// Tensor slot of the given element type and logical shape
    pub fn tensor(dtype: ElemType, shape: &[usize]) -> Self {
        Self { dtype, shape: shape.to_vec(), pinned: false }
    }

    /// Request page-locked backing storage for this key
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Number of elements one event contributes under this spec
    pub fn numel(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

/// The game-side description of every key a simulator can produce.
///
/// Keys get stable integer indices in insertion order; events carry their
/// values as a flat column array addressed by those indices.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    keys: Vec<(Arc<str>, KeySpec)>,
    index: HashMap<Arc<str>, usize>,
}

impl KeyTable {
    /// Create an empty key table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to the table
    pub fn with_key(mut self, name: &str, spec: KeySpec) -> Result<Self> {
        if self.index.contains_key(name) {
            return Err(ConvoyError::config(format!("duplicate key '{name}' in key table")));
        }
        let name: Arc<str> = Arc::from(name);
        self.index.insert(name.clone(), self.keys.len());
        self.keys.push((name, spec));
        Ok(self)
    }

    /// Number of keys in the table
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Look up a key by name
    pub fn get(&self, name: &str) -> Option<(usize, &KeySpec)> {
        self.index.get(name).map(|&i| (i, &self.keys[i].1))
    }

    /// Key name at the given column index
    pub fn name(&self, col: usize) -> &Arc<str> {
        &self.keys[col].0
    }

    /// Key spec at the given column index
    pub fn spec(&self, col: usize) -> &KeySpec {
        &self.keys[col].1
    }

    /// Iterate over `(name, spec)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &KeySpec)> {
        self.keys.iter().map(|(n, s)| (n, s))
    }
}

/// Predicate over event meta deciding whether a collector accepts an event.
///
/// Simulators submit to every collector of a declared consumer; the filter is
/// the secondary accept/reject at the collector boundary, used e.g. to feed a
/// trainer only one side of a self-play pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Accept every event
    #[default]
    None,
    /// Accept events whose agent name equals the given string
    AgentIs(String),
    /// Accept events whose agent name starts with the given prefix
    AgentPrefix(String),
}

impl Filter {
    /// Apply the predicate to an agent name
    pub fn accepts(&self, agent: &str) -> bool {
        match self {
            Filter::None => true,
            Filter::AgentIs(name) => agent == name,
            Filter::AgentPrefix(prefix) => agent.starts_with(prefix.as_str()),
        }
    }
}

/// Registration-time description of one consumer's batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDesc {
    /// Rows per batch
    pub batchsize: usize,
    /// History length: consecutive events per batch row
    pub t: usize,
    /// Input key names (may use `last_` and `histK_` prefixes)
    pub input: Vec<String>,
    /// Reply key names; empty means the consumer never replies
    #[serde(default)]
    pub reply: Vec<String>,
    /// Time steps covered by one reply batch
    #[serde(default = "default_reply_t")]
    pub reply_t: usize,
    /// Optional accept/reject predicate at the collector boundary
    #[serde(default)]
    pub filter: Filter,
    /// Microseconds a partial batch may wait before early dispatch; 0 disables
    #[serde(default)]
    pub timeout_usec: u64,
    /// Allow dispatching a batch with fewer than `batchsize` rows on timeout
    #[serde(default)]
    pub allow_incomplete_batch: bool,
}

fn default_reply_t() -> usize {
    DEFAULT_REPLY_T
}

impl BatchDesc {
    /// Create a description with the given batch size and history length
    pub fn new(batchsize: usize, t: usize) -> Self {
        Self {
            batchsize,
            t,
            input: Vec::new(),
            reply: Vec::new(),
            reply_t: DEFAULT_REPLY_T,
            filter: Filter::None,
            timeout_usec: 0,
            allow_incomplete_batch: false,
        }
    }

    /// Declare the input key set
    pub fn with_input(mut self, keys: &[&str]) -> Self {
        self.input = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Declare the reply key set
    pub fn with_reply(mut self, keys: &[&str]) -> Self {
        self.reply = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Set the accept/reject filter
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Bound how long a partial batch may wait before early dispatch
    pub fn with_timeout(mut self, timeout_usec: u64) -> Self {
        self.timeout_usec = timeout_usec;
        self.allow_incomplete_batch = timeout_usec > 0;
        self
    }
}

/// Context-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Collector shards per consumer name; agents hash onto a fixed shard
    #[serde(default = "default_one")]
    pub num_shards: usize,
    /// Pre-allocated batch slots per collector
    #[serde(default = "default_pool")]
    pub slot_pool_size: usize,
    /// Bound of each simulator-to-collector event channel
    #[serde(default = "default_queue_bound")]
    pub sender_queue_bound: usize,
    /// Capacity of each collector's reply cache
    #[serde(default = "default_cache")]
    pub reply_cache_capacity: usize,
    /// Pin collector shard threads to these CPUs, round-robin
    #[serde(default)]
    pub pin_cpus: Vec<usize>,
}

fn default_one() -> usize {
    1
}

fn default_pool() -> usize {
    DEFAULT_SLOT_POOL_SIZE
}

fn default_queue_bound() -> usize {
    DEFAULT_SENDER_QUEUE_BOUND
}

fn default_cache() -> usize {
    DEFAULT_REPLY_CACHE_CAPACITY
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            num_shards: 1,
            slot_pool_size: DEFAULT_SLOT_POOL_SIZE,
            sender_queue_bound: DEFAULT_SENDER_QUEUE_BOUND,
            reply_cache_capacity: DEFAULT_REPLY_CACHE_CAPACITY,
            pin_cpus: Vec::new(),
        }
    }
}

impl ContextConfig {
    /// Set the number of collector shards per consumer
    pub fn with_shards(mut self, num_shards: usize) -> Result<Self> {
        if num_shards == 0 {
            return Err(ConvoyError::config("shard count must be greater than 0"));
        }
        self.num_shards = num_shards;
        Ok(self)
    }

    /// Set the batch slot pool size per collector
    pub fn with_slot_pool(mut self, size: usize) -> Result<Self> {
        if size < 2 {
            return Err(ConvoyError::config("slot pool needs at least 2 slots to overlap fill and read"));
        }
        self.slot_pool_size = size;
        Ok(self)
    }
}

/// Where an input column's value comes from at extraction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Event column at the window row itself
    Direct {
        /// Table column index
        col: usize,
    },
    /// Event column one step after the window row, zeroed across episode
    /// breaks
    Future {
        /// Table column index
        col: usize,
    },
    /// Episode-break flag synthesized from the seq gap test alone; used when
    /// `last_terminal` is declared but the game supplies no terminal column
    SyntheticTerminal,
    /// Event column `back` steps before the window, filled on row 0 only
    Hist {
        /// Steps before the window start (>= 1, larger is older)
        back: usize,
        /// Table column index
        col: usize,
    },
}

/// One resolved input key: declared name, bound source, element spec
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// Name as the consumer declared it (including any prefix)
    pub name: Arc<str>,
    /// Bound source
    pub source: Source,
    /// Element spec of the batch column
    pub spec: KeySpec,
}

impl ResolvedKey {
    /// Whether this key carries the episode-break sentinel on gap rows
    pub fn is_terminal_sentinel(&self) -> bool {
        matches!(self.source, Source::SyntheticTerminal) ||
            (matches!(self.source, Source::Future { .. }) &&
                (&*self.name == "last_terminal" || &*self.name == "terminal"))
    }
}

/// One resolved reply key
#[derive(Debug, Clone)]
pub struct ReplyKey {
    /// Key name
    pub name: Arc<str>,
    /// Element spec
    pub spec: KeySpec,
}

/// A [`BatchDesc`] bound against a [`KeyTable`]: all string lookups done,
/// window geometry computed.
#[derive(Debug, Clone)]
pub struct ResolvedDesc {
    /// Consumer name
    pub name: Arc<str>,
    /// Rows per batch
    pub batchsize: usize,
    /// History length
    pub t: usize,
    /// Pre-history events needed before the window (max `histK_` K)
    pub num_hist: usize,
    /// Future events needed after the window (1 if any `last_` binding)
    pub num_future: usize,
    /// Resolved input keys
    pub input: Arc<[ResolvedKey]>,
    /// Resolved reply keys; empty means no reply
    pub reply: Arc<[ReplyKey]>,
    /// Time steps covered by one reply batch
    pub reply_t: usize,
    /// Accept/reject predicate
    pub filter: Filter,
    /// Partial-batch timeout; `None` disables early dispatch
    pub timeout: Option<Duration>,
    /// Allow partial batches on timeout
    pub allow_incomplete: bool,
}

impl ResolvedDesc {
    /// Events beyond the T window one extraction peeks at
    pub fn num_extra(&self) -> usize {
        self.num_hist + self.num_future
    }

    /// Events one extraction peeks at in total
    pub fn window(&self) -> usize {
        self.t + self.num_extra()
    }

    /// History ring capacity per agent
    pub fn history_capacity(&self) -> usize {
        HISTORY_CAPACITY_FACTOR * self.t + self.num_extra()
    }

    /// Whether this consumer expects a reply per batch
    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    /// Resolve a description against a game key table.
    ///
    /// Fails with a spec error when a requested key cannot be bound, when a
    /// `histK_` prefix is malformed, or when the basic sizes are invalid.
    pub fn resolve(name: &str, desc: &BatchDesc, table: &KeyTable) -> Result<Self> {
        if desc.batchsize == 0 {
            return Err(ConvoyError::spec(format!("consumer '{name}': batchsize must be >= 1")));
        }
        if desc.t == 0 {
            return Err(ConvoyError::spec(format!("consumer '{name}': history length T must be >= 1")));
        }
        if desc.reply_t == 0 {
            return Err(ConvoyError::spec(format!("consumer '{name}': reply_t must be >= 1")));
        }
        if desc.input.is_empty() {
            return Err(ConvoyError::spec(format!("consumer '{name}': input key set is empty")));
        }

        let mut input = Vec::with_capacity(desc.input.len());
        let mut num_hist = 0usize;
        let mut num_future = 0usize;

        for key in &desc.input {
            let resolved = resolve_input_key(name, key, table)?;
            match resolved.source {
                Source::Future { .. } | Source::SyntheticTerminal => {
                    num_future = 1;
                }
                Source::Hist { back, .. } => {
                    num_hist = num_hist.max(back);
                }
                Source::Direct { .. } => {}
            }
            input.push(resolved);
        }

        // A reply-bearing consumer answers every event before the simulator
        // emits the next one, so a window can never include a future event:
        // the simulator would block on the reply the batch is waiting for.
        // Games feed such consumers by emitting `last_` keys directly.
        if !desc.reply.is_empty() && num_future > 0 {
            let offender = input
                .iter()
                .find(|k|
                    matches!(k.source, Source::Future { .. } | Source::SyntheticTerminal)
                )
                .map(|k| k.name.to_string())
                .unwrap_or_default();
            return Err(
                ConvoyError::spec(
                    format!(
                        "consumer '{name}': key '{offender}' needs the event after the window, \
                         but a reply-bearing consumer blocks its simulators; \
                         supply '{offender}' from the game instead"
                    )
                )
            );
        }

        let mut reply = Vec::with_capacity(desc.reply.len());
        for key in &desc.reply {
            let (_, spec) = table
                .get(key)
                .ok_or_else(|| {
                    ConvoyError::spec(
                        format!("consumer '{name}': reply key '{key}' is not in the game key table")
                    )
                })?;
            reply.push(ReplyKey { name: Arc::from(key.as_str()), spec: spec.clone() });
        }

        Ok(Self {
            name: Arc::from(name),
            batchsize: desc.batchsize,
            t: desc.t,
            num_hist,
            num_future,
            input: input.into(),
            reply: reply.into(),
            reply_t: desc.reply_t,
            filter: desc.filter.clone(),
            timeout: (desc.timeout_usec > 0).then(|| Duration::from_micros(desc.timeout_usec)),
            allow_incomplete: desc.allow_incomplete_batch,
        })
    }
}

fn resolve_input_key(consumer: &str, key: &str, table: &KeyTable) -> Result<ResolvedKey> {
    let name: Arc<str> = Arc::from(key);

    // A key the game supplies directly binds to its own column.
    if let Some((col, spec)) = table.get(key) {
        return Ok(ResolvedKey { name, source: Source::Direct { col }, spec: spec.clone() });
    }

    // `last_X` reads X one step after the window row.
    if let Some(base) = key.strip_prefix("last_") {
        if let Some((col, spec)) = table.get(base) {
            return Ok(ResolvedKey { name, source: Source::Future { col }, spec: spec.clone() });
        }
        if base == "terminal" {
            return Ok(ResolvedKey {
                name,
                source: Source::SyntheticTerminal,
                spec: KeySpec::scalar(ElemType::U8),
            });
        }
        return Err(
            ConvoyError::spec(
                format!("consumer '{consumer}': key '{key}' has no '{base}' in the game key table")
            )
        );
    }

    // `histK_X` reads X from K steps before the window, on row 0.
    if let Some(rest) = key.strip_prefix("hist") {
        if let Some(sep) = rest.find('_') {
            if let Ok(back) = rest[..sep].parse::<usize>() {
                if back == 0 {
                    return Err(
                        ConvoyError::spec(
                            format!("consumer '{consumer}': hist offset in '{key}' must be >= 1")
                        )
                    );
                }
                let base = &rest[sep + 1..];
                let (col, spec) = table
                    .get(base)
                    .ok_or_else(|| {
                        ConvoyError::spec(
                            format!(
                                "consumer '{consumer}': key '{key}' has no '{base}' in the game key table"
                            )
                        )
                    })?;
                return Ok(ResolvedKey {
                    name,
                    source: Source::Hist { back, col },
                    spec: spec.clone(),
                });
            }
        }
    }

    // A plain key the game only supplies in `last_` form denotes the same
    // quantity read one step ahead.
    let last_form = format!("last_{key}");
    if let Some((col, spec)) = table.get(&last_form) {
        return Ok(ResolvedKey { name, source: Source::Future { col }, spec: spec.clone() });
    }

    Err(
        ConvoyError::spec(
            format!(
                "consumer '{consumer}': key '{key}' is not in the game key table and has no last_ fallback"
            )
        )
    )
}
