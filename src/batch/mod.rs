//! Batch slots: pre-allocated tensor storage for assembled batches
//!
//! A collector owns a small pool of slots and fills one at a time; the
//! dispatcher hands filled slots to consumers; the reply router reads the
//! routing metadata back out. See [`slot`] for the storage and state machine
//! and [`extract`] for the window-to-row copy.

pub mod extract;
pub mod slot;

pub use slot::{ BatchSlot, Column, RowRoute, SlotPool, SlotState };

pub(crate) use extract::extract_window;
