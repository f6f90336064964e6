//! Offline replay sampling
//!
//! The online collector consumes windows as it dispatches them. For
//! off-policy consumers that want to revisit old experience, the
//! [`OfflineSampler`] retains a longer per-agent history and assembles
//! batches of uniformly sampled windows without consuming anything. It is a
//! single-threaded assembler: feed it events from wherever experience is
//! collected, then draw batches.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{ Rng, SeedableRng };

use crate::batch::{ extract_window, BatchSlot, SlotPool, SlotState };
use crate::error::{ ConvoyError, Result };
use crate::event::Event;
use crate::spec::{ BatchDesc, KeyTable, ResolvedDesc };

/// A batch assembled from sampled replay windows. Dropping it returns the
/// slot to the sampler's pool.
pub struct ReplayBatch {
    slot: Arc<BatchSlot>,
    pool: Arc<SlotPool>,
}

impl ReplayBatch {
    /// Rows in the batch
    pub fn rows(&self) -> usize {
        self.slot.rows()
    }

    /// Column by declared key name
    pub fn column(&self, name: &str) -> Option<&crate::batch::Column> {
        self.slot.column(name)
    }

    /// The underlying slot
    pub fn slot(&self) -> &BatchSlot {
        &self.slot
    }
}

impl Drop for ReplayBatch {
    fn drop(&mut self) {
        self.pool.release(&self.slot);
    }
}

/// Uniform replay-window batch assembler
pub struct OfflineSampler {
    desc: Arc<ResolvedDesc>,
    pool: Arc<SlotPool>,
    retain: usize,
    agents: HashMap<Arc<str>, crate::collector::HistoryRing<Event>>,
    names: Vec<Arc<str>>,
    rng: SmallRng,
    total_fed: u64,
}

impl OfflineSampler {
    /// Create a sampler for the given consumer description.
    ///
    /// `retain` bounds how many events are kept per agent; it must cover at
    /// least one extraction window. Older events slide out silently.
    pub fn new(
        name: &str,
        desc: &BatchDesc,
        table: &KeyTable,
        retain: usize,
        seed: u64
    ) -> Result<Self> {
        let desc = Arc::new(ResolvedDesc::resolve(name, desc, table)?);
        if retain < desc.window() {
            return Err(
                ConvoyError::config(
                    format!("replay retention {retain} is below the window length {}", desc.window())
                )
            );
        }
        let pool = Arc::new(SlotPool::new(2, &desc)?);
        Ok(Self {
            desc,
            pool,
            retain,
            agents: HashMap::new(),
            names: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
            total_fed: 0,
        })
    }

    /// Retain one event; the oldest slides out once the agent is at capacity
    pub fn feed(&mut self, event: Event) {
        let agent = event.meta.agent.clone();
        if !self.agents.contains_key(&agent) {
            self.names.push(agent.clone());
            self.agents.insert(agent.clone(), crate::collector::HistoryRing::new(self.retain));
        }
        let ring = self.agents.get_mut(&agent).expect("replay ring just ensured");
        if ring.is_full() {
            let _ = ring.pop();
        }
        let pushed = ring.push(event);
        debug_assert!(pushed);
        self.total_fed += 1;
    }

    /// Events retained across all agents
    pub fn len(&self) -> usize {
        self.agents
            .values()
            .map(|r| r.len())
            .sum()
    }

    /// Whether nothing has been retained yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events fed over the sampler's lifetime
    pub fn total_fed(&self) -> u64 {
        self.total_fed
    }

    /// Assemble a full batch of uniformly sampled windows.
    ///
    /// Each row picks an eligible agent uniformly at random, then a uniform
    /// window within that agent's retained history. Nothing is consumed;
    /// the same experience can be drawn again.
    pub fn sample_batch(&mut self) -> Result<ReplayBatch> {
        let window_len = self.desc.window();
        let eligible: Vec<Arc<str>> = self.names
            .iter()
            .filter(|name| self.agents[*name].len() >= window_len)
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(ConvoyError::OutOfRange {
                start: 0,
                len: window_len,
                available: self.agents
                    .values()
                    .map(|r| r.len())
                    .max()
                    .unwrap_or(0),
            });
        }

        let slot = self.pool
            .reserve()
            .ok_or_else(||
                ConvoyError::contract("all replay slots are still held by earlier batches")
            )?;

        for row in 0..self.desc.batchsize {
            let agent = &eligible[self.rng.random_range(0..eligible.len())];
            let ring = &self.agents[agent];
            let window = ring.sample(window_len, &mut self.rng)?;
            extract_window(&slot, &self.desc, row, &window);
        }

        slot.set_rows(self.desc.batchsize);
        slot.transition(SlotState::Filling, SlotState::Ready)?;
        slot.transition(SlotState::Ready, SlotState::InFlight)?;
        Ok(ReplayBatch { slot, pool: self.pool.clone() })
    }
}
