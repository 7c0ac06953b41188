//! `admem`: an ad-hoc persistent memory allocator over a flat byte-addressable
//! blob, with transactional redo/undo semantics (spec §1-§2).
//!
//! A [`Blob`] formats or opens a region ([`region::Region`]) into a
//! hierarchy of arenas, each holding groups of fixed-size units; allocation
//! and mutation both happen inside a [`Transaction`], which accumulates a
//! redo log durably committed through a pluggable [`store::Store`] and an
//! undo log replayed in-process on abort. [`Umem`] is the application-facing
//! handle that ties a `Blob` and its transactions together.

pub mod action;
pub mod bitmap;
pub mod config;
pub mod constants;
pub mod dram;
pub mod error;
pub mod heap;
pub mod layout;
pub mod lru;
pub mod region;
pub mod store;
pub mod transaction;
pub mod umem;

pub use config::{BackingKind, BlobConfig};
pub use dram::blob::Blob;
pub use error::{AdError, Result};
pub use region::{Region, SharedRegion};
pub use store::{MemStore, Store};
pub use transaction::{EndOutcome, Stage, StageCallback, Transaction, TxFlags};
pub use umem::{AllocFlags, Reservation, Umem, XaddFlags};
