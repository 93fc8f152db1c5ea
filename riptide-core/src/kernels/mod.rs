//! Data-parallel search kernels.
//!
//! Each kernel runs inside one lane and coordinates its logical threads with
//! atomics only; the scheduler runs lanes in parallel and kernels within a
//! lane in order. A [`LaneKernelCtx`] bundles everything one lane's kernels
//! may touch: the shared FST view, the lane's counters and scratch rows, and
//! the channel rows the lane has borrowed for the current batch.

pub mod expand;
pub mod histogram;
pub mod nonemitting;
pub mod postprocess;
pub mod preprocess;

use std::sync::atomic::{AtomicI32, AtomicU64};

use atomic_float::AtomicF32;

use crate::cost::{IntCost, INT_INF};
use crate::counters::LaneCounters;
use crate::fst::FstView;
use crate::hashmap::StateHashmap;

/// Beam recovery per frame after an adaptive or max-active reduction.
pub const RECOVER_RATE: f32 = 1.2;

/// Below this many residual arcs the closure switches to the single-lane
/// finalizer instead of another pair of batched passes.
pub const NONEMITTING_FINALIZE_MAX_NARCS: i32 = 4096;

/// Bin count of the max-active cost histogram.
pub const HISTOGRAM_NBINS: usize = 255;

/// The first `aux capacity / ADAPTIVE_BEAM_STATIC_SEGMENT` aux slots keep
/// the full beam; past them the beam ramps down over
/// `ADAPTIVE_BEAM_NBINS` equal bins.
pub const ADAPTIVE_BEAM_STATIC_SEGMENT: i32 = 4;
pub const ADAPTIVE_BEAM_NBINS: i32 = 8;

/// Block width of the two-stage degree prefix sum.
pub const PREFIX_SUM_BLOCK: usize = 256;

/// Length of the static full-beam prefix of the aux queue.
#[inline]
pub fn adaptive_static_segment_len(aux_q_capacity: i32) -> i32 {
    (aux_q_capacity / ADAPTIVE_BEAM_STATIC_SEGMENT).max(1)
}

/// Everything one lane's kernels read or write during a frame.
///
/// All rows are shared slices of atomic cells, so a context is freely
/// shareable across the logical threads of a kernel.
pub struct LaneKernelCtx<'a> {
    pub fst: &'a FstView,
    pub counters: &'a LaneCounters,
    pub hashmap: &'a StateHashmap,

    // Channel-keyed rows, persistent across suspension of the utterance.
    pub main_q_state_and_cost: &'a [AtomicU64],
    pub main_q_degrees_prefix_sum: &'a [AtomicI32],
    pub main_q_arc_offsets: &'a [AtomicI32],

    // Lane-keyed rows, reused by whichever utterance holds the slot.
    pub main_q_acoustic: &'a [AtomicF32],
    pub main_q_info: &'a [AtomicU64],
    pub aux_q_state_and_cost: &'a [AtomicU64],
    pub aux_q_acoustic: &'a [AtomicF32],
    pub aux_q_info: &'a [AtomicU64],
    pub state_best_cost: &'a [AtomicI32],
    pub touched_states: &'a [AtomicI32],
    pub block_sums: &'a [AtomicI32],
    pub histogram: &'a [AtomicI32],
    pub extras_info: &'a [AtomicU64],
    pub extras_costs: &'a [AtomicU64],

    /// Acoustic log-likelihood row for the frame being decoded; absent
    /// during the initial epsilon closure.
    pub loglikes: Option<&'a [f32]>,

    pub main_q_capacity: i32,
    pub aux_q_capacity: i32,
    pub max_active: i32,
    /// The lane's beam at frame start; the adaptive ramp scales this.
    pub base_int_beam: IntCost,
}

/// Resets the per-frame counters. Runs after the emitting preprocess (which
/// still needs the previous frame's cutoff) and before any expansion.
pub fn start_frame(ctx: &LaneKernelCtx) {
    ctx.counters.set_min_int_cost(INT_INF);
    ctx.counters.set_int_cutoff(INT_INF);
    ctx.counters.set_aux_q_end(0);
    ctx.counters.set_n_extras(0);
    ctx.counters.clear_overflow();
    ctx.counters.set_adaptive_beam_and_validity(
        ctx.counters.int_beam(),
        adaptive_static_segment_len(ctx.aux_q_capacity),
    );
}

/// Epsilon closure: contract the aux queue into main, expand the new slice
/// over epsilon arcs, repeat until no arcs remain. Terminates because the
/// best-per-state filter only accepts strictly improving costs.
pub fn nonemitting_closure(ctx: &LaneKernelCtx) {
    loop {
        preprocess::preprocess_and_contract(ctx);
        let (narcs, end) = ctx.counters.narcs_and_end();
        if narcs == 0 {
            break;
        }
        if narcs < NONEMITTING_FINALIZE_MAX_NARCS {
            nonemitting::finalize_nonemitting(ctx);
            break;
        }
        expand::expand_arcs(ctx, false);
        ctx.counters.set_local_offset(end);
        ctx.counters.set_narcs_and_end(0, end);
    }
}

/// One full frame for one lane: emitting expansion of the previous frame's
/// queue, epsilon closure, pruning and same-state merge.
pub fn process_frame(ctx: &LaneKernelCtx) {
    // Emitting phase over the persisted queue [0, end).
    preprocess::preprocess_in_place(ctx);
    preprocess::finalize_preprocess_in_place(ctx);
    start_frame(ctx);
    expand::expand_arcs(ctx, true);

    // The previous frame's tokens are consumed; the queue restarts empty and
    // the global offset moves past them.
    let (_, prev_end) = ctx.counters.narcs_and_end();
    ctx.counters
        .set_global_offset(ctx.counters.global_offset() + prev_end);
    ctx.counters.set_narcs_and_end(0, 0);
    ctx.counters.set_local_offset(0);

    histogram::apply_max_active_and_reduce_beam(ctx, true);
    nonemitting_closure(ctx);
    histogram::apply_max_active_and_reduce_beam(ctx, false);
    postprocess::postprocess_main_queue(ctx);
}
