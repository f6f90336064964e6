//! Convoy - batched experience collection and dispatch
//!
//! Convoy sits between a large population of concurrent game simulators and a
//! few consumer loops (inference actors, trainers). Simulators emit one event
//! per timestep; convoy groups those heterogeneous per-simulator events into
//! fixed-shape batched tensors, routes each batch to the consumer that
//! declared interest in it, and routes per-sample replies (actions, auxiliary
//! outputs) back to the exact simulator that produced each sample, while
//! maintaining per-simulator temporal history windows and per-consumer
//! backpressure.
//!
//! ## Key Features
//!
//! - **Pre-allocated batch slots**: contiguous `[T, B, *shape]` tensor
//!   columns, optionally page-locked for async device copies
//! - **Temporal windows**: per-simulator history rings with `last_` future
//!   slots and `histK_` prefixes extracted atomically
//! - **Backpressure**: bounded sender channels; a slow consumer stalls its
//!   producers instead of growing queues
//! - **Reply routing**: per-row de-multiplexing with a bounded reply cache
//!   for replies that race a simulator's next send
//! - **Explicit lifecycle**: no global registries; one [`Context`] object
//!   owns the whole topology
//!
//! ## Example
//!
//! ```no_run
//! use convoy::{
//!     BatchDesc, Context, ContextConfig, ElemType, GameSim, KeySpec, KeyTable,
//!     ReplyBatch, Result, Value,
//! };
//!
//! struct Guess {
//!     state: f32,
//! }
//!
//! impl GameSim for Guess {
//!     fn restart(&mut self) {
//!         self.state = 0.0;
//!     }
//!     fn terminal(&self) -> bool {
//!         self.state >= 10.0
//!     }
//!     fn get_key(&mut self, _key: &str) -> Result<Value> {
//!         Ok(Value::scalar_f32(self.state))
//!     }
//!     fn set_key(&mut self, _key: &str, value: &Value) -> Result<()> {
//!         self.state += value.as_i64().unwrap_or(0) as f32;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let table = KeyTable::new()
//!         .with_key("s", KeySpec::scalar(ElemType::F32))?
//!         .with_key("a", KeySpec::scalar(ElemType::I64))?;
//!
//!     let mut ctx = Context::new(table, ContextConfig::default());
//!     ctx.register("actor", &BatchDesc::new(16, 1).with_input(&["s"]).with_reply(&["a"]))?;
//!     for i in 0..64 {
//!         ctx.add_simulator(&format!("game-{i}"), Box::new(Guess { state: 0.0 }))?;
//!     }
//!     ctx.start()?;
//!
//!     // Consumer loop: read states, reply actions.
//!     while let Some(batch) = ctx.wait(0) {
//!         let rows = batch.rows();
//!         let reply = ReplyBatch::new(1).with("a", Value::I64(vec![1; rows]));
//!         ctx.step(batch, Some(&reply))?;
//!     }
//!     ctx.stop();
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod collector;
pub mod constants;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod monitoring;
pub mod reply;
pub mod simulator;
pub mod spec;
pub mod tensor;
pub mod utils;

// Re-export main components
pub use batch::{ BatchSlot, Column, RowRoute, SlotPool, SlotState };
pub use collector::{ Collector, HistoryRing, OfflineSampler, ReplayBatch };
pub use context::{ Batch, BatchCallback, Context };
pub use dispatcher::CollectorId;
pub use error::{ ConvoyError, Result };
pub use event::{ Event, EventMeta, RouteKey, Value };
pub use reply::{ Mailbox, ReplyBatch, ReplyCache, ReplyRecord };
pub use simulator::GameSim;
pub use spec::{ BatchDesc, ContextConfig, ElemType, Filter, KeySpec, KeyTable, ResolvedDesc };
pub use tensor::HostBuffer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
