//! Pre-allocated batch slots and the per-collector slot pool
//!
//! A batch slot is the backing storage for one assembled batch: one
//! contiguous `[T, B, *shape]` column per resolved input key plus the per-row
//! routing metadata. Slots are allocated once at registration and cycle
//! through a fixed state machine:
//!
//! ```text
//! Free -> Filling -> Ready -> InFlight -> Releasing -> Free
//! ```
//!
//! The collector thread owns a slot while it is `Filling` or `Ready`; exactly
//! one consumer thread owns it while `InFlight`. The atomic state transitions
//! carry the Acquire/Release edges, so neither side ever observes the other's
//! partial writes.

use std::sync::Arc;
use std::sync::atomic::{ AtomicU8, AtomicUsize, Ordering };

use crossbeam::queue::ArrayQueue;
use parking_lot::{ Mutex, MutexGuard };

use crate::contract_error;
use crate::error::{ ConvoyError, Result };
use crate::event::{ RouteKey, Value };
use crate::reply::Mailbox;
use crate::spec::{ ElemType, ResolvedDesc, ResolvedKey };
use crate::tensor::HostBuffer;

/// Lifecycle state of a batch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// In the pool, available for reservation
    Free = 0,
    /// Reserved by the collector, being filled
    Filling = 1,
    /// Posted to the dispatcher, waiting for a consumer
    Ready = 2,
    /// Borrowed by exactly one consumer
    InFlight = 3,
    /// Reply routed, returning to the pool
    Releasing = 4,
}

impl SlotState {
    fn from_u8(v: u8) -> SlotState {
        match v {
            0 => SlotState::Free,
            1 => SlotState::Filling,
            2 => SlotState::Ready,
            3 => SlotState::InFlight,
            _ => SlotState::Releasing,
        }
    }
}

/// Routing metadata for one batch row
#[derive(Debug, Clone)]
pub struct RowRoute {
    /// Reply destination of the originating simulator
    pub sender: Arc<Mailbox>,
    /// Sample identity `(agent, game_counter, seq)`
    pub key: RouteKey,
    /// The identity rendered as `{agent}-{game_counter}-{seq}`
    pub key_str: String,
}

/// One tensor column of a batch slot, shaped `[T, B, *shape]` row-major with
/// no padding between rows.
pub struct Column {
    name: Arc<str>,
    dtype: ElemType,
    shape: Box<[usize]>,
    numel: usize,
    t: usize,
    b: usize,
    buf: HostBuffer,
}

impl Column {
    fn new(key: &ResolvedKey, t: usize, b: usize) -> Result<Self> {
        let numel = key.spec.numel();
        let bytes = t * b * numel * key.spec.dtype.size_of();
        Ok(Self {
            name: key.name.clone(),
            dtype: key.spec.dtype,
            shape: key.spec.shape.clone().into_boxed_slice(),
            numel,
            t,
            b,
            buf: HostBuffer::alloc(bytes, key.spec.pinned)?,
        })
    }

    /// Key name as the consumer declared it
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type
    pub fn dtype(&self) -> ElemType {
        self.dtype
    }

    /// Logical per-event shape (empty = scalar)
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Elements per (t, row) cell
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Total element count `t * b * numel`
    pub fn len(&self) -> usize {
        self.t * self.b * self.numel
    }

    /// Whether the column holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte stride between consecutive time steps
    pub fn t_stride_bytes(&self) -> usize {
        self.b * self.numel * self.dtype.size_of()
    }

    /// Raw pointer and byte length of the backing buffer, for device copies
    pub fn raw(&self) -> (*const u8, usize) {
        (self.buf.as_ptr(), self.buf.len_bytes())
    }

    /// Whether the backing buffer was requested page-locked
    pub fn is_pinned(&self) -> bool {
        self.buf.is_pinned()
    }

    /// The whole column as f32, valid while the slot is held
    pub fn as_f32s(&self) -> &[f32] {
        assert_eq!(self.dtype, ElemType::F32, "column '{}' is not f32", self.name);
        unsafe {
            // SAFETY: buffer is 64-byte aligned and len() elements long
            std::slice::from_raw_parts(self.buf.as_ptr() as *const f32, self.len())
        }
    }

    /// The whole column as i32
    pub fn as_i32s(&self) -> &[i32] {
        assert_eq!(self.dtype, ElemType::I32, "column '{}' is not i32", self.name);
        unsafe {
            // SAFETY: buffer is 64-byte aligned and len() elements long
            std::slice::from_raw_parts(self.buf.as_ptr() as *const i32, self.len())
        }
    }

    /// The whole column as i64
    pub fn as_i64s(&self) -> &[i64] {
        assert_eq!(self.dtype, ElemType::I64, "column '{}' is not i64", self.name);
        unsafe {
            // SAFETY: buffer is 64-byte aligned and len() elements long
            std::slice::from_raw_parts(self.buf.as_ptr() as *const i64, self.len())
        }
    }

    /// The whole column as u8
    pub fn as_u8s(&self) -> &[u8] {
        assert_eq!(self.dtype, ElemType::U8, "column '{}' is not u8", self.name);
        unsafe {
            // SAFETY: len() elements long
            std::slice::from_raw_parts(self.buf.as_ptr(), self.len())
        }
    }

    /// The `(t, row)` cell copied out as a [`Value`]
    pub fn cell(&self, t: usize, row: usize) -> Value {
        assert!(t < self.t && row < self.b, "cell ({t}, {row}) out of range");
        let base = (t * self.b + row) * self.numel;
        match self.dtype {
            ElemType::F32 => Value::F32(self.as_f32s()[base..base + self.numel].to_vec()),
            ElemType::I32 => Value::I32(self.as_i32s()[base..base + self.numel].to_vec()),
            ElemType::I64 => Value::I64(self.as_i64s()[base..base + self.numel].to_vec()),
            ElemType::U8 => Value::U8(self.as_u8s()[base..base + self.numel].to_vec()),
        }
    }

    unsafe fn write_raw<T: Copy>(&self, base: usize, src: &[T]) {
        // SAFETY: caller guarantees base + src.len() <= len() and holds the
        // exclusive fill side of the slot handoff
        let dst = (self.buf.as_mut_ptr() as *mut T).add(base);
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    }

    /// Store one event value into the `(t, row)` cell, widening integers to
    /// the declared width. Dtype compatibility was checked at registration.
    pub(crate) fn write(&self, t: usize, row: usize, value: &Value) {
        debug_assert!(t < self.t && row < self.b);
        debug_assert_eq!(value.len(), self.numel, "column '{}' numel mismatch", self.name);
        let base = (t * self.b + row) * self.numel;
        unsafe {
            match (value, self.dtype) {
                (Value::F32(src), ElemType::F32) => self.write_raw(base, src),
                (Value::I32(src), ElemType::I32) => self.write_raw(base, src),
                (Value::I64(src), ElemType::I64) => self.write_raw(base, src),
                (Value::U8(src), ElemType::U8) => self.write_raw(base, src),
                (Value::I32(src), ElemType::I64) => {
                    let widened: Vec<i64> = src.iter().map(|&x| x as i64).collect();
                    self.write_raw(base, &widened);
                }
                (Value::U8(src), ElemType::I32) => {
                    let widened: Vec<i32> = src.iter().map(|&x| x as i32).collect();
                    self.write_raw(base, &widened);
                }
                (Value::U8(src), ElemType::I64) => {
                    let widened: Vec<i64> = src.iter().map(|&x| x as i64).collect();
                    self.write_raw(base, &widened);
                }
                _ => {
                    debug_assert!(
                        false,
                        "column '{}': cannot store {:?} into {:?}",
                        self.name,
                        value.dtype(),
                        self.dtype
                    );
                    self.zero(t, row);
                }
            }
        }
    }

    /// Fill the `(t, row)` cell with ones; used for the terminal sentinel
    pub(crate) fn fill_ones(&self, t: usize, row: usize) {
        let base = (t * self.b + row) * self.numel;
        unsafe {
            match self.dtype {
                ElemType::F32 => self.write_raw(base, &vec![1.0f32; self.numel]),
                ElemType::I32 => self.write_raw(base, &vec![1i32; self.numel]),
                ElemType::I64 => self.write_raw(base, &vec![1i64; self.numel]),
                ElemType::U8 => self.write_raw(base, &vec![1u8; self.numel]),
            }
        }
    }

    /// Zero the `(t, row)` cell
    pub(crate) fn zero(&self, t: usize, row: usize) {
        let esize = self.dtype.size_of();
        let base = (t * self.b + row) * self.numel * esize;
        unsafe {
            // SAFETY: cell range is within the allocation; caller holds the
            // exclusive fill side of the slot handoff
            std::ptr::write_bytes(self.buf.as_mut_ptr().add(base), 0, self.numel * esize);
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("t", &self.t)
            .field("b", &self.b)
            .finish()
    }
}

/// Backing storage and routing metadata for one assembled batch
#[derive(Debug)]
pub struct BatchSlot {
    index: usize,
    t: usize,
    b: usize,
    state: AtomicU8,
    rows: AtomicUsize,
    columns: Box<[Column]>,
    route: Mutex<Vec<RowRoute>>,
}

impl BatchSlot {
    fn new(index: usize, desc: &ResolvedDesc) -> Result<Self> {
        let columns: Result<Vec<Column>> = desc.input
            .iter()
            .map(|key| Column::new(key, desc.t, desc.batchsize))
            .collect();
        Ok(Self {
            index,
            t: desc.t,
            b: desc.batchsize,
            state: AtomicU8::new(SlotState::Free as u8),
            rows: AtomicUsize::new(0),
            columns: columns?.into_boxed_slice(),
            route: Mutex::new(Vec::with_capacity(desc.batchsize)),
        })
    }

    /// Index of this slot within its pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// History length of the batch
    pub fn t(&self) -> usize {
        self.t
    }

    /// Allocated row capacity
    pub fn capacity(&self) -> usize {
        self.b
    }

    /// Rows actually filled (equals capacity except for timeout batches).
    /// Data past this row count is stale and must not be read.
    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::Acquire)
    }

    pub(crate) fn set_rows(&self, rows: usize) {
        self.rows.store(rows, Ordering::Release);
    }

    /// Current lifecycle state
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the slot from `from` to `to`, failing on any other current state
    pub(crate) fn transition(&self, from: SlotState, to: SlotState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                contract_error!(
                    "slot {}: expected {:?} -> {:?}, but slot is {:?}",
                    self.index,
                    from,
                    to,
                    SlotState::from_u8(actual)
                )
            })
    }

    pub(crate) fn force_free(&self) {
        self.state.store(SlotState::Free as u8, Ordering::Release);
    }

    /// Column by declared key name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| &*c.name == name)
    }

    /// All columns in declaration order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by declaration index
    pub(crate) fn column_at(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    /// Routing metadata, one entry per filled row
    pub fn routes(&self) -> MutexGuard<'_, Vec<RowRoute>> {
        self.route.lock()
    }

    pub(crate) fn begin_fill(&self) {
        self.route.lock().clear();
        self.rows.store(0, Ordering::Release);
    }

    pub(crate) fn push_route(&self, route: RowRoute) {
        self.route.lock().push(route);
    }
}

/// Fixed pool of pre-allocated batch slots with an O(1) free queue
#[derive(Debug)]
pub struct SlotPool {
    slots: Box<[Arc<BatchSlot>]>,
    free: ArrayQueue<usize>,
}

impl SlotPool {
    /// Allocate `size` slots for the given resolved description
    pub fn new(size: usize, desc: &ResolvedDesc) -> Result<Self> {
        if size < 2 {
            return Err(ConvoyError::config("slot pool needs at least 2 slots"));
        }
        let mut slots = Vec::with_capacity(size);
        let free = ArrayQueue::new(size);
        for i in 0..size {
            slots.push(Arc::new(BatchSlot::new(i, desc)?));
            let _ = free.push(i);
        }
        Ok(Self { slots: slots.into_boxed_slice(), free })
    }

    /// Total slots in the pool
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots currently available for reservation
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Reserve a free slot and move it to `Filling`. `None` when every slot
    /// is out with the dispatcher or a consumer.
    pub fn reserve(&self) -> Option<Arc<BatchSlot>> {
        let idx = self.free.pop()?;
        let slot = self.slots[idx].clone();
        slot
            .transition(SlotState::Free, SlotState::Filling)
            .expect("free-queue slot must be in Free state");
        slot.begin_fill();
        Some(slot)
    }

    /// Return a slot to the pool
    pub fn release(&self, slot: &BatchSlot) {
        slot.force_free();
        let _ = self.free.push(slot.index());
    }

    /// Slots currently borrowed by consumers
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == SlotState::InFlight)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ BatchDesc, KeySpec, KeyTable, ResolvedDesc };

    fn desc() -> ResolvedDesc {
        let table = KeyTable::new()
            .with_key("s", KeySpec::tensor(ElemType::F32, &[3]))
            .unwrap()
            .with_key("a", KeySpec::scalar(ElemType::I64))
            .unwrap();
        let desc = BatchDesc::new(4, 2).with_input(&["s", "a"]);
        ResolvedDesc::resolve("test", &desc, &table).unwrap()
    }

    #[test]
    fn test_column_layout() {
        let pool = SlotPool::new(2, &desc()).unwrap();
        let slot = pool.reserve().unwrap();

        let s = slot.column("s").unwrap();
        assert_eq!(s.dtype(), ElemType::F32);
        assert_eq!(s.numel(), 3);
        assert_eq!(s.len(), 2 * 4 * 3);
        assert_eq!(s.t_stride_bytes(), 4 * 3 * 4);

        let (ptr, bytes) = s.raw();
        assert!(!ptr.is_null());
        assert_eq!(bytes, 2 * 4 * 3 * 4);
    }

    #[test]
    fn test_write_and_cell_roundtrip() {
        let pool = SlotPool::new(2, &desc()).unwrap();
        let slot = pool.reserve().unwrap();

        let s = slot.column("s").unwrap();
        s.write(1, 2, &Value::F32(vec![1.0, 2.0, 3.0]));
        assert_eq!(s.cell(1, 2), Value::F32(vec![1.0, 2.0, 3.0]));
        assert_eq!(s.cell(0, 2), Value::F32(vec![0.0, 0.0, 0.0]));

        s.zero(1, 2);
        assert_eq!(s.cell(1, 2), Value::F32(vec![0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_integer_widening_write() {
        let pool = SlotPool::new(2, &desc()).unwrap();
        let slot = pool.reserve().unwrap();

        let a = slot.column("a").unwrap();
        a.write(0, 0, &Value::I32(vec![41]));
        assert_eq!(a.cell(0, 0), Value::I64(vec![41]));
        a.write(0, 1, &Value::U8(vec![7]));
        assert_eq!(a.cell(0, 1), Value::I64(vec![7]));
    }

    #[test]
    fn test_state_machine_transitions() {
        let pool = SlotPool::new(2, &desc()).unwrap();
        let slot = pool.reserve().unwrap();
        assert_eq!(slot.state(), SlotState::Filling);

        slot.transition(SlotState::Filling, SlotState::Ready).unwrap();
        slot.transition(SlotState::Ready, SlotState::InFlight).unwrap();

        // Stepping a slot that is not in flight is a contract violation.
        let err = slot.transition(SlotState::Ready, SlotState::InFlight).unwrap_err();
        assert!(err.is_fatal());

        slot.transition(SlotState::InFlight, SlotState::Releasing).unwrap();
        pool.release(&slot);
        assert_eq!(slot.state(), SlotState::Free);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = SlotPool::new(2, &desc()).unwrap();
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert!(pool.reserve().is_none());
        assert_eq!(pool.free_len(), 0);

        pool.release(&a);
        assert!(pool.reserve().is_some());
        drop(b);
    }
}
