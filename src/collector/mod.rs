//! Collectors: per-consumer batch assembly
//!
//! One collector exists per (consumer name, shard). It exclusively owns the
//! history rings of every simulator that feeds it, a small pool of batch
//! slots, and the routing metadata of the slot it is currently filling. The
//! shard thread drains a bounded event channel (the channel bound is the
//! backpressure point for simulators), appends each accepted event to the
//! sender's ring, and dispatches a batch as soon as enough complete windows
//! have accumulated.
//!
//! ## Accounting
//!
//! Per sender, `windows` counts complete extractable windows: after a push,
//! the sender gains a window once its ring holds
//! `(windows + 1) * T + num_extra` events. The collector-wide sample count is
//! the sum over senders; reaching `batchsize` triggers assembly. Assembly
//! walks senders in first-arrival order, consumes up to `windows` windows
//! from each (advancing the ring by `T` per window so history prefixes roll
//! forward), and recounts the sender from its remaining depth. A sender's
//! surplus persists to the next batch.

pub mod history;
pub mod offline;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::{ self, JoinHandle };
use std::time::Instant;

use crossbeam::channel::{ bounded, Receiver, RecvTimeoutError, Sender };
use tracing::{ debug, info, warn };

use crate::batch::{ extract_window, BatchSlot, SlotPool, SlotState };
use crate::constants::DONE_POLL_INTERVAL;
use crate::contract_error;
use crate::dispatcher::{ CollectorId, ReadyQueue };
use crate::error::Result;
use crate::event::Event;
use crate::monitoring::CollectorStats;
use crate::reply::{ ReplyBatch, ReplyRouter };
use crate::spec::ResolvedDesc;

pub use history::{ HistoryRing, Window };
pub use offline::{ OfflineSampler, ReplayBatch };

struct AgentBuffer {
    ring: HistoryRing<Event>,
    windows: usize,
}

/// Thread-owned collector state: history rings, window accounting, the
/// currently filling slot. Nothing here is shared; the shard thread is the
/// only mutator.
pub(crate) struct CollectorCore {
    id: CollectorId,
    desc: Arc<ResolvedDesc>,
    pool: Arc<SlotPool>,
    ready: Arc<ReadyQueue>,
    stats: Arc<CollectorStats>,
    done: Arc<AtomicBool>,
    agents: HashMap<Arc<str>, AgentBuffer>,
    order: Vec<Arc<str>>,
    total: usize,
    first_sample_at: Option<Instant>,
}

impl CollectorCore {
    pub(crate) fn new(
        id: CollectorId,
        desc: Arc<ResolvedDesc>,
        pool: Arc<SlotPool>,
        ready: Arc<ReadyQueue>,
        stats: Arc<CollectorStats>,
        done: Arc<AtomicBool>
    ) -> Self {
        Self {
            id,
            desc,
            pool,
            ready,
            stats,
            done,
            agents: HashMap::new(),
            order: Vec::new(),
            total: 0,
            first_sample_at: None,
        }
    }

    /// Accept one event: filter, append to the sender's ring, update window
    /// accounting, and assemble a batch when the sample target is reached.
    /// Never blocks on the consumer; a full ring drops the oldest event.
    pub(crate) fn submit(&mut self, event: Event) {
        if !self.desc.filter.accepts(&event.meta.agent) {
            self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let agent = event.meta.agent.clone();
        let (seq, game) = (event.meta.seq, event.meta.game_counter);

        if !self.agents.contains_key(&agent) {
            self.order.push(agent.clone());
            self.agents.insert(agent.clone(), AgentBuffer {
                ring: HistoryRing::new(self.desc.history_capacity()),
                windows: 0,
            });
        }
        let buffer = self.agents.get_mut(&agent).expect("agent buffer just ensured");

        if !buffer.ring.push(event.clone()) {
            // Upstream design should prevent this; shed the oldest event and
            // skip window accounting for this round, like a missed sample.
            let _ = buffer.ring.pop();
            let pushed = buffer.ring.push(event);
            debug_assert!(pushed);
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(collector = %self.id, agent = %agent, "history ring full, dropped oldest event");
            return;
        }

        let depth = buffer.ring.len();
        self.stats.record_event(&agent, seq, game, depth);

        if depth >= (buffer.windows + 1) * self.desc.t + self.desc.num_extra() {
            buffer.windows += 1;
            self.total += 1;
            if self.first_sample_at.is_none() {
                self.first_sample_at = Some(Instant::now());
            }
        }

        if self.total >= self.desc.batchsize {
            self.build_batch(self.desc.batchsize, false);
        }
    }

    /// Dispatch a partial batch once the configured timeout has elapsed since
    /// the first buffered sample. No-op unless the collector allows
    /// incomplete batches and at least one sample is pending.
    pub(crate) fn try_flush_timeout(&mut self) {
        let Some(timeout) = self.desc.timeout else {
            return;
        };
        if !self.desc.allow_incomplete || self.total == 0 {
            return;
        }
        let waited = self.first_sample_at.map(|t| t.elapsed()).unwrap_or_default();
        if waited >= timeout {
            let n = self.total.min(self.desc.batchsize);
            debug!(collector = %self.id, rows = n, "timeout flush of partial batch");
            self.build_batch(n, true);
        }
    }

    /// Assemble `n` rows into a free slot and post it to the dispatcher.
    fn build_batch(&mut self, n: usize, incomplete: bool) {
        let Some(slot) = self.reserve_blocking() else {
            return;
        };

        let window_len = self.desc.window();
        let mut row = 0usize;
        let snapshot = self.order.clone();

        'agents: for agent in snapshot {
            let Some(buffer) = self.agents.get_mut(&agent) else {
                continue;
            };
            let available = buffer.windows;
            if available == 0 {
                continue;
            }

            let mut taken = 0u64;
            for _ in 0..available {
                if row >= n {
                    break;
                }
                let window = buffer.ring
                    .peek(window_len)
                    .expect("window accounting guarantees a full window");
                extract_window(&slot, &self.desc, row, &window);
                buffer.ring.popn(self.desc.t);
                row += 1;
                taken += 1;
            }

            // Recount from the remaining depth; the surplus persists.
            let depth = buffer.ring.len();
            buffer.windows = depth.saturating_sub(self.desc.num_extra()) / self.desc.t;
            self.stats.record_agent_rows(&agent, taken, depth);

            if row >= n {
                break 'agents;
            }
        }

        self.total = self.agents
            .values()
            .map(|b| b.windows)
            .sum();

        let latency_us = self.first_sample_at
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.first_sample_at = (self.total > 0).then(Instant::now);

        slot.set_rows(row);
        slot
            .transition(SlotState::Filling, SlotState::Ready)
            .expect("collector owns the filling slot");
        self.stats.record_batch(row, incomplete, latency_us);
        self.ready.post(self.id, slot);
    }

    /// Reserve a free slot, blocking while every slot is out with a consumer.
    /// Blocking here stalls the shard thread, which stops draining the event
    /// channel, which in turn blocks simulators: the backpressure chain.
    fn reserve_blocking(&self) -> Option<Arc<BatchSlot>> {
        loop {
            if let Some(slot) = self.pool.reserve() {
                return Some(slot);
            }
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            thread::sleep(DONE_POLL_INTERVAL);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_samples(&self) -> usize {
        self.total
    }
}

fn run_core(mut core: CollectorCore, rx: Receiver<Event>, pin_cpu: Option<usize>) {
    if let Some(cpu) = pin_cpu {
        if let Err(e) = crate::utils::cpu::pin_to_cpu(cpu) {
            warn!(collector = %core.id, cpu, error = %e, "could not pin collector thread");
        }
    }

    let poll = core.desc.timeout.map(|t| t.min(DONE_POLL_INTERVAL)).unwrap_or(DONE_POLL_INTERVAL);

    loop {
        match rx.recv_timeout(poll) {
            Ok(event) => core.submit(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        core.try_flush_timeout();
        if core.done.load(Ordering::Acquire) {
            break;
        }
    }
    info!(collector = %core.id, "collector thread exiting");
}

/// Shared handle to one collector shard: the event channel simulators submit
/// into, the slot pool, the reply router, and the counters.
pub struct Collector {
    id: CollectorId,
    name: Arc<str>,
    shard: usize,
    desc: Arc<ResolvedDesc>,
    tx: Sender<Event>,
    pool: Arc<SlotPool>,
    router: ReplyRouter,
    stats: Arc<CollectorStats>,
}

impl Collector {
    /// Build a collector shard and spawn its thread.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: CollectorId,
        name: Arc<str>,
        shard: usize,
        desc: Arc<ResolvedDesc>,
        ready: Arc<ReadyQueue>,
        done: Arc<AtomicBool>,
        pool_size: usize,
        queue_bound: usize,
        cache_capacity: usize,
        pin_cpu: Option<usize>
    ) -> Result<(Self, JoinHandle<()>)> {
        let pool = Arc::new(SlotPool::new(pool_size, &desc)?);
        let stats = Arc::new(CollectorStats::new());
        let (tx, rx) = bounded(queue_bound);

        let core = CollectorCore::new(
            id,
            desc.clone(),
            pool.clone(),
            ready,
            stats.clone(),
            done
        );
        let handle = thread::Builder
            ::new()
            .name(format!("convoy-{name}-{shard}"))
            .spawn(move || run_core(core, rx, pin_cpu))
            .map_err(|e| crate::error::ConvoyError::config(format!("spawn failed: {e}")))?;

        let router = ReplyRouter::new(desc.reply.clone(), desc.reply_t, cache_capacity);
        Ok((Self { id, name, shard, desc, tx, pool, router, stats }, handle))
    }

    /// Collector id within the context
    pub fn id(&self) -> CollectorId {
        self.id
    }

    /// Consumer name this collector serves
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Shard index within the consumer's collector group
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Resolved consumer description
    pub fn desc(&self) -> &Arc<ResolvedDesc> {
        &self.desc
    }

    /// Counters for this collector
    pub fn stats(&self) -> &Arc<CollectorStats> {
        &self.stats
    }

    /// Reply router (exposes the shared reply cache)
    pub fn router(&self) -> &ReplyRouter {
        &self.router
    }

    /// Events currently queued toward the shard thread
    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    /// Free batch slots in the pool
    pub fn free_slots(&self) -> usize {
        self.pool.free_len()
    }

    /// Slots currently borrowed by consumers
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub(crate) fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }

    /// Route a consumer reply and return the slot to the pool.
    pub(crate) fn step(&self, slot: &Arc<BatchSlot>, reply: Option<&ReplyBatch>) -> Result<()> {
        slot.transition(SlotState::InFlight, SlotState::Releasing)?;

        if self.desc.has_reply() {
            let reply = reply.ok_or_else(||
                contract_error!("consumer '{}' declared reply keys but stepped without a reply", self.name)
            )?;
            self.router.route(slot, reply)?;
        } else if reply.is_some() {
            return Err(
                contract_error!("consumer '{}' declared no reply keys but stepped with a reply", self.name)
            );
        }

        self.pool.release(slot);
        Ok(())
    }

    /// Release a slot without routing; used when a consumer drops a batch.
    pub(crate) fn abandon(&self, slot: &Arc<BatchSlot>) {
        self.pool.release(slot);
    }
}
