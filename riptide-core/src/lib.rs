//! Riptide core library
//!
//! Batched lockstep beam-search decoding over weighted finite-state
//! transducers. Many independent utterances advance one frame at a time
//! across a pool of parallel execution slots (*lanes*), while per-utterance
//! search state lives in persistent *channels* that can be suspended and
//! resumed between calls. The search kernels are data-parallel and
//! lock-free: costs move through an order-preserving integer encoding so
//! that pruning and best-per-state relaxation run on integer atomics.
//!
//! The typical flow: build an [`fst::FstView`], construct a
//! [`decoder::BatchedDecoder`], `init_decoding` a set of channels, feed
//! frames through `advance_decoding` with one [`decodable::Decodable`] per
//! channel, and read results back with `get_best_path` or
//! `get_raw_lattice`.

pub mod config;
pub mod cost;
pub mod decodable;
pub mod decoder;
pub mod errors;
pub mod fst;
pub mod lattice;
pub mod logging;

mod counters;
mod hashmap;
mod kernels;
mod matrix;
mod token;

// Re-export the canonical decoding interface.
pub use config::DecoderConfig;
pub use decodable::{Decodable, LoglikMatrix};
pub use decoder::{BatchedDecoder, ChannelBestCost, ChannelId, ChannelPhase};
pub use errors::{ConfigError, DecoderError, Result, UsageError};
pub use fst::{FstArc, FstBuilder, FstView};
pub use lattice::{BestPath, RawLattice, TracebackArc};
