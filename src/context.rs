//! The context: registration, lifecycle and the consumer API
//!
//! A [`Context`] owns the whole topology: the game key table, one collector
//! group per registered consumer, the shared dispatcher, and the simulator
//! threads. Everything is wired explicitly through this object; there is no
//! global registry. The order of operations is fixed:
//!
//! 1. [`Context::new`] with the game [`KeyTable`]
//! 2. [`Context::register`] each consumer description
//! 3. [`Context::add_simulator`] each game
//! 4. optionally [`Context::on_batch`] callbacks, then [`Context::start`]
//! 5. consume through [`Context::wait`] / [`Context::step`] or
//!    [`Context::run_until_stopped`]
//! 6. [`Context::stop`], optionally [`Context::print_summary`]
//!
//! `start` after `stop` is not supported; build a fresh context instead.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{ Hash, Hasher };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{ Mutex, MutexGuard };
use tracing::{ error, info, warn };

use crate::batch::{ BatchSlot, Column, RowRoute };
use crate::collector::Collector;
use crate::dispatcher::{ CollectorId, ReadyQueue };
use crate::error::{ ConvoyError, Result };
use crate::reply::{ Mailbox, ReplyBatch };
use crate::simulator::{ ConsumerPort, GameSim, SimulatorRuntime };
use crate::spec::{ BatchDesc, ContextConfig, KeyTable, ResolvedDesc, Source };

static SIGINT_HOOK: OnceCell<()> = OnceCell::new();

/// Callback invoked per dispatched batch by [`Context::run_until_stopped`]
pub type BatchCallback = Box<dyn FnMut(&Batch) -> Option<ReplyBatch> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifeState {
    Idle,
    Running,
    Stopped,
}

struct Group {
    name: Arc<str>,
    desc: Arc<ResolvedDesc>,
    /// Indices into `collectors`, one per shard; empty until start
    shards: Vec<usize>,
}

struct PendingSim {
    agent: Arc<str>,
    game: Box<dyn GameSim>,
}

/// A dispatched batch borrowed by one consumer.
///
/// Reading tensor columns and routing metadata is valid until the batch is
/// stepped. Dropping an unstepped batch releases the slot without routing a
/// reply, which strands any simulator blocked on one; always step
/// reply-bearing batches.
pub struct Batch {
    collector: Arc<Collector>,
    slot: Arc<BatchSlot>,
    stepped: bool,
}

impl Batch {
    /// Consumer name this batch belongs to
    pub fn name(&self) -> &Arc<str> {
        self.collector.name()
    }

    /// Collector that assembled the batch
    pub fn collector_id(&self) -> CollectorId {
        self.collector.id()
    }

    /// Rows filled; below the declared batch size only for timeout batches
    pub fn rows(&self) -> usize {
        self.slot.rows()
    }

    /// History length of the batch
    pub fn t(&self) -> usize {
        self.slot.t()
    }

    /// Tensor column by declared key name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.slot.column(name)
    }

    /// All tensor columns in declaration order
    pub fn columns(&self) -> &[Column] {
        self.slot.columns()
    }

    /// Per-row routing metadata
    pub fn routes(&self) -> MutexGuard<'_, Vec<RowRoute>> {
        self.slot.routes()
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.stepped {
            warn!(
                consumer = %self.collector.name(),
                "batch dropped without step, releasing slot without a reply"
            );
            self.collector.abandon(&self.slot);
        }
    }
}

/// The explicit top-level object wiring simulators, collectors and consumers
pub struct Context {
    table: Arc<KeyTable>,
    config: ContextConfig,
    done: Arc<AtomicBool>,
    ready: Arc<ReadyQueue>,
    groups: Vec<Group>,
    collectors: Vec<Arc<Collector>>,
    pending_sims: Vec<PendingSim>,
    callbacks: Mutex<HashMap<Arc<str>, BatchCallback>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<LifeState>,
}

impl Context {
    /// Create a context over the given game key table
    pub fn new(table: KeyTable, config: ContextConfig) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        Self {
            table: Arc::new(table),
            ready: Arc::new(ReadyQueue::new(done.clone())),
            done,
            config,
            groups: Vec::new(),
            collectors: Vec::new(),
            pending_sims: Vec::new(),
            callbacks: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            state: Mutex::new(LifeState::Idle),
        }
    }

    /// Register one consumer. Resolution against the key table happens here,
    /// so a bad description fails before anything runs.
    pub fn register(&mut self, name: &str, desc: &BatchDesc) -> Result<()> {
        self.ensure_idle("register")?;
        if self.groups.iter().any(|g| &*g.name == name) {
            return Err(ConvoyError::config(format!("consumer '{name}' registered twice")));
        }
        let resolved = Arc::new(ResolvedDesc::resolve(name, desc, &self.table)?);
        self.groups.push(Group {
            name: resolved.name.clone(),
            desc: resolved,
            shards: Vec::new(),
        });
        Ok(())
    }

    /// Add one simulator under a unique agent name
    pub fn add_simulator(&mut self, agent: &str, game: Box<dyn GameSim>) -> Result<()> {
        self.ensure_idle("add_simulator")?;
        if self.pending_sims.iter().any(|s| &*s.agent == agent) {
            return Err(ConvoyError::config(format!("agent '{agent}' added twice")));
        }
        self.pending_sims.push(PendingSim { agent: Arc::from(agent), game });
        Ok(())
    }

    /// Register the batch callback for a consumer name, enabling
    /// [`Context::run_until_stopped`]
    pub fn on_batch(&mut self, name: &str, callback: BatchCallback) -> Result<()> {
        self.ensure_idle("on_batch")?;
        self.callbacks.lock().insert(Arc::from(name), callback);
        Ok(())
    }

    fn ensure_idle(&self, op: &str) -> Result<()> {
        match *self.state.lock() {
            LifeState::Idle => Ok(()),
            state => Err(ConvoyError::config(format!("{op} requires an idle context, state is {state:?}"))),
        }
    }

    /// Spawn collector shards and simulator threads and open the dispatcher.
    ///
    /// With callbacks registered, every consumer name must have one; the
    /// mixed case is a wiring bug caught here. Without any callback the
    /// context runs in raw `wait`/`step` mode.
    pub fn start(&mut self) -> Result<()> {
        match *self.state.lock() {
            LifeState::Idle => {}
            LifeState::Running => {
                return Err(ConvoyError::config("context already started"));
            }
            LifeState::Stopped => {
                return Err(ConvoyError::config("start after stop is not supported"));
            }
        }

        if self.groups.is_empty() {
            return Err(ConvoyError::spec("no consumer registered"));
        }
        {
            let callbacks = self.callbacks.lock();
            if !callbacks.is_empty() {
                for group in &self.groups {
                    if !callbacks.contains_key(&group.name) {
                        return Err(
                            ConvoyError::spec(
                                format!("consumer '{}' has no registered callback", group.name)
                            )
                        );
                    }
                }
                for name in callbacks.keys() {
                    if !self.groups.iter().any(|g| g.name == *name) {
                        return Err(
                            ConvoyError::spec(format!("callback for unregistered consumer '{name}'"))
                        );
                    }
                }
            }
        }

        let mut threads = self.threads.lock();

        // Collector shards, in registration order.
        for gi in 0..self.groups.len() {
            for shard in 0..self.config.num_shards {
                let id = CollectorId(self.collectors.len());
                let pin = (!self.config.pin_cpus.is_empty()).then(|| {
                    self.config.pin_cpus[id.0 % self.config.pin_cpus.len()]
                });
                let (collector, handle) = Collector::spawn(
                    id,
                    self.groups[gi].name.clone(),
                    shard,
                    self.groups[gi].desc.clone(),
                    self.ready.clone(),
                    self.done.clone(),
                    self.config.slot_pool_size,
                    self.config.sender_queue_bound,
                    self.config.reply_cache_capacity,
                    pin
                )?;
                self.groups[gi].shards.push(id.0);
                self.collectors.push(Arc::new(collector));
                threads.push(handle);
            }
        }

        // Union of table columns any consumer reads.
        let mut needed: Vec<usize> = self.groups
            .iter()
            .flat_map(|g| g.desc.input.iter())
            .filter_map(|key| {
                match key.source {
                    Source::Direct { col } | Source::Future { col } | Source::Hist { col, .. } => {
                        Some(col)
                    }
                    Source::SyntheticTerminal => None,
                }
            })
            .collect();
        needed.sort_unstable();
        needed.dedup();

        // Simulator threads.
        for PendingSim { agent, game } in self.pending_sims.drain(..) {
            let mut ports = Vec::with_capacity(self.groups.len());
            for group in &self.groups {
                let shard = group.shards[shard_of(&agent, group.shards.len())];
                let collector = &self.collectors[shard];
                ports.push(ConsumerPort {
                    desc: group.desc.clone(),
                    tx: collector.sender(),
                    mailbox: Arc::new(Mailbox::new()),
                    cache: collector.router().cache().clone(),
                });
            }
            let runtime = SimulatorRuntime::new(
                agent.clone(),
                game,
                ports,
                needed.clone(),
                self.table.clone(),
                self.done.clone()
            );
            let handle = std::thread::Builder
                ::new()
                .name(format!("convoy-sim-{agent}"))
                .spawn(move || runtime.run())
                .map_err(|e| ConvoyError::config(format!("spawn failed: {e}")))?;
            threads.push(handle);
        }

        drop(threads);
        *self.state.lock() = LifeState::Running;
        info!(
            consumers = self.groups.len(),
            collectors = self.collectors.len(),
            "context started"
        );
        Ok(())
    }

    /// Block until any collector has a ready batch.
    ///
    /// `timeout_us == 0` waits indefinitely (until stop); otherwise the call
    /// returns `None` on expiry. The returned batch belongs to the caller
    /// until stepped.
    pub fn wait(&self, timeout_us: u64) -> Option<Batch> {
        let timeout = (timeout_us > 0).then(|| Duration::from_micros(timeout_us));
        let ready = self.ready.wait(timeout)?;
        let collector = self.collectors[ready.collector.0].clone();
        Some(Batch { collector, slot: ready.slot, stepped: false })
    }

    /// Route the consumer's reply for a batch and release its slot.
    ///
    /// A broken reply (missing declared key, wrong width, stepping twice) is
    /// a contract violation: the context dumps a summary and panics, since
    /// the producing side can no longer make progress.
    pub fn step(&self, mut batch: Batch, reply: Option<&ReplyBatch>) -> Result<()> {
        batch.stepped = true;
        let result = batch.collector.step(&batch.slot, reply);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "contract violation in step");
                self.print_summary();
                panic!("convoy contract violation: {e}");
            }
        }
        result
    }

    /// Serve batches through the registered callbacks until stop
    pub fn run_until_stopped(&self) {
        const WAIT_SLICE_US: u64 = 100_000;
        while !self.done.load(Ordering::Acquire) {
            let Some(batch) = self.wait(WAIT_SLICE_US) else {
                continue;
            };
            let reply = {
                let mut callbacks = self.callbacks.lock();
                match callbacks.get_mut(batch.name()) {
                    Some(callback) => callback(&batch),
                    None => None,
                }
            };
            if let Err(e) = self.step(batch, reply.as_ref()) {
                error!(error = %e, "step failed");
                break;
            }
        }
    }

    /// Whether stop has been requested
    pub fn is_stopping(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Set the done flag, wake every blocked wait, and join all threads.
    /// Partially filled batches are dropped, not dispatched; consumers
    /// blocked in [`Context::wait`] observe `None`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifeState::Stopped {
                return;
            }
            *state = LifeState::Stopped;
        }
        info!("stopping context");
        self.done.store(true, Ordering::Release);
        self.ready.close();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            if let Err(e) = handle.join() {
                error!("worker thread panicked: {e:?}");
            }
        }
    }

    /// Install a SIGINT hook that requests stop on ctrl-c. Opt-in, process
    /// wide, installable once.
    pub fn install_sigint(&self) -> Result<()> {
        SIGINT_HOOK.set(()).map_err(|_|
            ConvoyError::config("SIGINT hook already installed")
        )?;
        let done = self.done.clone();
        let ready = self.ready.clone();
        ctrlc
            ::set_handler(move || {
                info!("SIGINT received, requesting stop");
                done.store(true, Ordering::Release);
                ready.close();
            })
            .map_err(|e| ConvoyError::config(format!("failed to install SIGINT handler: {e}")))
    }

    /// Collector handles, one per (consumer, shard), in registration order
    pub fn collectors(&self) -> &[Arc<Collector>] {
        &self.collectors
    }

    /// Collector handle for a consumer name and shard index
    pub fn collector(&self, name: &str, shard: usize) -> Option<&Arc<Collector>> {
        let group = self.groups.iter().find(|g| &*g.name == name)?;
        let idx = *group.shards.get(shard)?;
        self.collectors.get(idx)
    }

    /// Batches currently queued for consumption
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Dump queue depths, per-agent sample counts and latency stats
    pub fn print_summary(&self) {
        println!("=== convoy summary ===");
        println!("ready batches queued: {}", self.ready.len());
        for collector in &self.collectors {
            let header = format!("{}/{}", collector.name(), collector.shard());
            print!(
                "{}",
                collector.stats().render(&header, collector.queue_len(), collector.free_slots())
            );
            let cache = collector.router().cache().lock();
            let (parked, hits, evictions) = cache.counters();
            if parked > 0 {
                println!("  reply cache: parked={parked} hits={hits} evictions={evictions} held={}", cache.len());
            }
            drop(cache);
            collector.router().report_pressure(collector.name());
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let running = { *self.state.lock() == LifeState::Running };
        if running {
            self.stop();
        }
    }
}

fn shard_of(agent: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    agent.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}
