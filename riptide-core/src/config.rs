//! Decoder configuration.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Hard upper bound on the number of execution lanes.
pub const MAX_LANES: usize = 200;

/// Numeric knobs of the batched decoder.
///
/// Capacities size the storage allocated at construction: every lane carries
/// queues of `max_tokens_per_frame` cells, so large capacities with many
/// lanes reserve a lot of memory up front, exactly as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Decoding beam. Larger is slower and more accurate. The live beam may
    /// drop below this when a frame generates more tokens than the queues
    /// hold, then recovers over the following frames.
    pub beam: f32,

    /// Pruning radius used by best-cost lists and raw-lattice extraction.
    pub lattice_beam: f32,

    /// Aggregate token capacity hint; pre-reserves the per-channel host
    /// token streams.
    pub max_tokens_pre_allocated: usize,

    /// Main/aux queue capacity per lane per frame.
    pub max_tokens_per_frame: usize,

    /// Histogram culling trims the main queue back to this size.
    pub max_active: usize,

    /// Parallel execution slots.
    pub nlanes: usize,

    /// Persistent utterance slots; at least `nlanes`.
    pub nchannels: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam: 15.0,
            lattice_beam: 10.0,
            max_tokens_pre_allocated: 2_000_000,
            max_tokens_per_frame: 1_000_000,
            max_active: 10_000,
            nlanes: 1,
            nchannels: 1,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.beam.is_finite() && self.beam > 0.0) {
            return Err(ConfigError::InvalidBeam { beam: self.beam });
        }
        if !(self.lattice_beam >= 0.0) {
            return Err(ConfigError::InvalidLatticeBeam {
                lattice_beam: self.lattice_beam,
            });
        }
        if self.max_tokens_pre_allocated == 0 {
            return Err(ConfigError::InvalidTokenCapacity {
                field: "max_tokens_pre_allocated",
                value: self.max_tokens_pre_allocated,
            });
        }
        if self.max_tokens_per_frame == 0 {
            return Err(ConfigError::InvalidTokenCapacity {
                field: "max_tokens_per_frame",
                value: self.max_tokens_per_frame,
            });
        }
        if self.max_active <= 1 {
            return Err(ConfigError::InvalidMaxActive {
                max_active: self.max_active,
            });
        }
        if self.nlanes == 0 || self.nlanes > MAX_LANES {
            return Err(ConfigError::InvalidLaneCount {
                nlanes: self.nlanes,
                max: MAX_LANES,
            });
        }
        if self.nchannels < self.nlanes {
            return Err(ConfigError::ChannelsBelowLanes {
                nchannels: self.nchannels,
                nlanes: self.nlanes,
            });
        }
        Ok(())
    }
}
