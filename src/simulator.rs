//! Simulator runtime: the per-game producer loop
//!
//! A game implements [`GameSim`]; the context runs it on its own thread. Each
//! iteration assembles the current event from the game's declared keys,
//! stamps the routing meta, submits to every registered collector (bounded
//! channel, so a slow consumer blocks the simulator here), then blocks for a
//! reply from each reply-bearing consumer whose filter accepts this agent,
//! applies the replies back into the game, and advances the episode
//! counters. A terminal step resets `seq`, bumps `game_counter` and restarts
//! the game; episodes chain without leaving the loop.
//!
//! Every blocking point re-checks the shared done flag, so `stop` cancels
//! the loop between steps.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use crossbeam::channel::{ SendTimeoutError, Sender };
use parking_lot::Mutex;
use tracing::{ debug, error };

use crate::constants::DONE_POLL_INTERVAL;
use crate::error::{ ConvoyError, Result };
use crate::event::{ Event, EventMeta, RouteKey, Value };
use crate::reply::{ Mailbox, ReplyCache };
use crate::spec::{ KeyTable, ResolvedDesc };

/// The contract a game implements to run under the context.
///
/// `set_key` is where replies take effect; for action keys this is also
/// where the game advances. Games that advance independently of any reply
/// can override [`GameSim::on_step`].
pub trait GameSim: Send {
    /// Called once on the simulator thread before the first event
    fn on_init(&mut self) {}

    /// Reset the game to a fresh episode
    fn restart(&mut self);

    /// Whether the current state ends the episode
    fn terminal(&self) -> bool;

    /// Produce the value for a declared key
    fn get_key(&mut self, key: &str) -> Result<Value>;

    /// Apply one reply key back into the game
    fn set_key(&mut self, key: &str, value: &Value) -> Result<()>;

    /// Called once per loop iteration after replies are applied
    fn on_step(&mut self) {}
}

/// One simulator's connection to one consumer's collector shard
pub(crate) struct ConsumerPort {
    pub desc: Arc<ResolvedDesc>,
    pub tx: Sender<Event>,
    pub mailbox: Arc<Mailbox>,
    pub cache: Arc<Mutex<ReplyCache>>,
}

/// The per-simulator state machine the context runs on a dedicated thread
pub(crate) struct SimulatorRuntime {
    agent: Arc<str>,
    game: Box<dyn GameSim>,
    ports: Vec<ConsumerPort>,
    needed: Vec<usize>,
    table: Arc<KeyTable>,
    done: Arc<AtomicBool>,
    game_counter: u32,
    seq: u32,
}

impl SimulatorRuntime {
    pub(crate) fn new(
        agent: Arc<str>,
        game: Box<dyn GameSim>,
        ports: Vec<ConsumerPort>,
        needed: Vec<usize>,
        table: Arc<KeyTable>,
        done: Arc<AtomicBool>
    ) -> Self {
        Self {
            agent,
            game,
            ports,
            needed,
            table,
            done,
            game_counter: 0,
            seq: 0,
        }
    }

    /// Run the loop until stop or a game error
    pub(crate) fn run(mut self) {
        self.game.on_init();
        self.game.restart();
        debug!(agent = %self.agent, "simulator started");

        loop {
            if self.done.load(Ordering::Acquire) {
                break;
            }
            match self.step_once() {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => {
                    break;
                }
                Err(e) => {
                    error!(agent = %self.agent, error = %e, "simulator loop failed");
                    break;
                }
            }
        }
        debug!(agent = %self.agent, "simulator exiting");
    }

    /// One loop iteration: emit, await, apply, advance
    pub(crate) fn step_once(&mut self) -> Result<()> {
        let values = self.gather()?;

        for port in &self.ports {
            let event = Event {
                meta: EventMeta {
                    agent: self.agent.clone(),
                    game_counter: self.game_counter,
                    seq: self.seq,
                    sender: port.mailbox.clone(),
                },
                values: values.clone(),
            };
            send_backpressure(&port.tx, event, &self.done)?;
        }

        // Await replies one consumer at a time, in registration order. Only
        // consumers that declared reply keys and whose filter accepts this
        // agent will ever answer.
        for port in &self.ports {
            if !port.desc.has_reply() || !port.desc.filter.accepts(&self.agent) {
                continue;
            }
            let key = RouteKey {
                agent: self.agent.clone(),
                game_counter: self.game_counter,
                seq: self.seq,
            };
            let rec = port.mailbox.wait_reply(&port.cache, key, &self.done)?;
            for (name, value) in &rec.values {
                self.game.set_key(name, value)?;
            }
        }

        self.game.on_step();

        if self.game.terminal() {
            self.seq = 0;
            self.game_counter += 1;
            self.game.restart();
        } else {
            self.seq += 1;
        }
        Ok(())
    }

    /// Read every needed column from the game and validate it against the
    /// table spec.
    fn gather(&mut self) -> Result<Arc<[Option<Value>]>> {
        let mut values: Vec<Option<Value>> = vec![None; self.table.len()];
        for &col in &self.needed {
            let name = self.table.name(col).clone();
            let spec = self.table.spec(col);
            let value = self.game.get_key(&name)?;
            if value.dtype() != spec.dtype {
                return Err(
                    ConvoyError::simulator(
                        format!(
                            "agent '{}': key '{}' produced {:?}, table declares {:?}",
                            self.agent,
                            name,
                            value.dtype(),
                            spec.dtype
                        )
                    )
                );
            }
            if value.len() != spec.numel() {
                return Err(
                    ConvoyError::simulator(
                        format!(
                            "agent '{}': key '{}' produced {} elements, table declares {}",
                            self.agent,
                            name,
                            value.len(),
                            spec.numel()
                        )
                    )
                );
            }
            values[col] = Some(value);
        }
        Ok(values.into())
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (u32, u32) {
        (self.game_counter, self.seq)
    }
}

/// Send with backpressure: block while the channel is full, polling the done
/// flag; abandon the send once stop is requested.
fn send_backpressure(tx: &Sender<Event>, event: Event, done: &AtomicBool) -> Result<()> {
    let mut event = event;
    loop {
        match tx.send_timeout(event, DONE_POLL_INTERVAL) {
            Ok(()) => {
                return Ok(());
            }
            Err(SendTimeoutError::Timeout(returned)) => {
                if done.load(Ordering::Acquire) {
                    return Err(ConvoyError::Stopped);
                }
                event = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(ConvoyError::Stopped);
            }
        }
    }
}
