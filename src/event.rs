//! Events: one timestep record produced by a simulator
//!
//! An event is a flat column array addressed by [`KeyTable`](crate::KeyTable)
//! indices plus the routing meta the collectors need. Columns are typed
//! [`Value`]s; the array is shared behind an `Arc` so submitting the same
//! event to several collectors never copies tensor data.

use std::fmt;
use std::sync::Arc;

use crate::reply::Mailbox;
use crate::spec::{ ElemType, KeySpec };

/// A typed, flat column of values for one event
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 32-bit signed integers
    I32(Vec<i32>),
    /// 64-bit signed integers
    I64(Vec<i64>),
    /// 32-bit floats
    F32(Vec<f32>),
    /// Unsigned bytes
    U8(Vec<u8>),
}

impl Value {
    /// Element type of this column
    pub fn dtype(&self) -> ElemType {
        match self {
            Value::I32(_) => ElemType::I32,
            Value::I64(_) => ElemType::I64,
            Value::F32(_) => ElemType::F32,
            Value::U8(_) => ElemType::U8,
        }
    }

    /// Number of elements in this column
    pub fn len(&self) -> usize {
        match self {
            Value::I32(v) => v.len(),
            Value::I64(v) => v.len(),
            Value::F32(v) => v.len(),
            Value::U8(v) => v.len(),
        }
    }

    /// Whether the column holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A zero-filled column matching the given spec
    pub fn zeros(spec: &KeySpec) -> Self {
        let n = spec.numel();
        match spec.dtype {
            ElemType::I32 => Value::I32(vec![0; n]),
            ElemType::I64 => Value::I64(vec![0; n]),
            ElemType::F32 => Value::F32(vec![0.0; n]),
            ElemType::U8 => Value::U8(vec![0; n]),
        }
    }

    /// Scalar i32 column
    pub fn scalar_i32(v: i32) -> Self {
        Value::I32(vec![v])
    }

    /// Scalar i64 column
    pub fn scalar_i64(v: i64) -> Self {
        Value::I64(vec![v])
    }

    /// Scalar f32 column
    pub fn scalar_f32(v: f32) -> Self {
        Value::F32(vec![v])
    }

    /// Scalar u8 column
    pub fn scalar_u8(v: u8) -> Self {
        Value::U8(vec![v])
    }

    /// First element as i64, widening integer types; `None` for floats
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => v.first().map(|&x| x as i64),
            Value::I64(v) => v.first().copied(),
            Value::U8(v) => v.first().map(|&x| x as i64),
            Value::F32(_) => None,
        }
    }

    /// First element as f32; `None` for integer columns
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => v.first().copied(),
            _ => None,
        }
    }

    /// Append another column of the same element type
    pub(crate) fn extend_from(&mut self, other: &Value) {
        match (self, other) {
            (Value::I32(dst), Value::I32(src)) => dst.extend_from_slice(src),
            (Value::I64(dst), Value::I64(src)) => dst.extend_from_slice(src),
            (Value::F32(dst), Value::F32(src)) => dst.extend_from_slice(src),
            (Value::U8(dst), Value::U8(src)) => dst.extend_from_slice(src),
            _ => debug_assert!(false, "extend_from across element types"),
        }
    }

    /// Copy `count` elements starting at `offset` into a new column of the
    /// same element type. Used by the reply router to slice one row out of a
    /// reply tensor.
    pub fn slice_block(&self, offset: usize, count: usize) -> Value {
        match self {
            Value::I32(v) => Value::I32(v[offset..offset + count].to_vec()),
            Value::I64(v) => Value::I64(v[offset..offset + count].to_vec()),
            Value::F32(v) => Value::F32(v[offset..offset + count].to_vec()),
            Value::U8(v) => Value::U8(v[offset..offset + count].to_vec()),
        }
    }
}

/// Identity of one dispatched sample: the simulator plus its episode and
/// step counters at emission time. Rendered as `{agent}-{game}-{seq}` this is
/// the reply-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Agent name
    pub agent: Arc<str>,
    /// Episode counter at emission
    pub game_counter: u32,
    /// Step counter at emission
    pub seq: u32,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.agent, self.game_counter, self.seq)
    }
}

/// Routing meta stamped on every event
#[derive(Clone)]
pub struct EventMeta {
    /// Agent name, unique per simulator
    pub agent: Arc<str>,
    /// Monotonic episode counter, bumped at each terminal
    pub game_counter: u32,
    /// Step counter within the episode, reset at each terminal
    pub seq: u32,
    /// Where the reply for this event goes
    pub sender: Arc<Mailbox>,
}

impl EventMeta {
    /// The sample identity this meta describes
    pub fn route_key(&self) -> RouteKey {
        RouteKey {
            agent: self.agent.clone(),
            game_counter: self.game_counter,
            seq: self.seq,
        }
    }
}

impl fmt::Debug for EventMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMeta")
            .field("agent", &self.agent)
            .field("game_counter", &self.game_counter)
            .field("seq", &self.seq)
            .finish()
    }
}

/// One timestep record: routing meta plus shared value columns.
///
/// `values` is indexed by [`KeyTable`](crate::KeyTable) column index; columns
/// no registered consumer reads are `None` and never gathered.
#[derive(Debug, Clone)]
pub struct Event {
    /// Routing meta
    pub meta: EventMeta,
    /// Value columns, indexed by key table position
    pub values: Arc<[Option<Value>]>,
}

impl Event {
    /// Value of the column at the given table index, if gathered
    pub fn column(&self, col: usize) -> Option<&Value> {
        self.values.get(col).and_then(|v| v.as_ref())
    }
}
