//! Arc-parallel token expansion.
//!
//! One logical thread per arc of the active main-queue slice. A thread finds
//! its source token by binary search over the degree prefix sum, computes
//! the successor cost, and runs the token through the cutoff, best-per-state
//! and adaptive-beam filters before reserving an aux slot.

use std::sync::atomic::Ordering::Relaxed;

use rayon::prelude::*;

use crate::cost::{float_to_ordered_int, ordered_int_to_float, pack_pair, unpack_pair, INT_INF};
use crate::counters::OVERFLOW_AUX_Q;
use crate::token::InfoToken;

use super::{adaptive_static_segment_len, LaneKernelCtx, ADAPTIVE_BEAM_NBINS};

/// Expands every arc leaving the slice `[local_offset, end)` of the main
/// queue into the aux queue. `emitting` selects the arc grouping and whether
/// the acoustic term is added.
pub fn expand_arcs(ctx: &LaneKernelCtx, emitting: bool) {
    let (narcs, end) = ctx.counters.narcs_and_end();
    if narcs <= 0 {
        return;
    }
    let local_offset = ctx.counters.local_offset();
    (0..narcs)
        .into_par_iter()
        .for_each(|arc_tid| expand_one_arc(ctx, emitting, arc_tid, local_offset, end));
}

/// Single-arc body, shared with the sequential closure finalizer.
pub fn expand_one_arc(ctx: &LaneKernelCtx, emitting: bool, arc_tid: i32, local_offset: i32, end: i32) {
    // Owner token of this arc id: the last slice slot whose exclusive degree
    // prefix is <= arc_tid. Zero-degree tokens collapse out of the search.
    let mut lo = local_offset;
    let mut hi = end;
    while hi - lo > 1 {
        let mid = (lo + hi) >> 1;
        if ctx.main_q_degrees_prefix_sum[mid as usize].load(Relaxed) <= arc_tid {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let itok = lo as usize;

    let (_, tok_int_cost) = unpack_pair(ctx.main_q_state_and_cost[itok].load(Relaxed));
    let degree_start = ctx.main_q_degrees_prefix_sum[itok].load(Relaxed);
    let arc_idx = ctx.main_q_arc_offsets[itok].load(Relaxed) + (arc_tid - degree_start);
    let arc = ctx.fst.arc(arc_idx as usize);

    let mut acoustic_cost = 0.0f32;
    let mut total_cost = ordered_int_to_float(tok_int_cost) + arc.weight;
    if emitting {
        let loglikes = ctx.loglikes.expect("emitting expansion requires a log-likelihood row");
        acoustic_cost = -loglikes[arc.ilabel as usize];
        total_cost += acoustic_cost;
    }
    let int_cost = float_to_ordered_int(total_cost);

    if int_cost >= ctx.counters.int_cutoff() {
        return;
    }

    // Best-per-state filter. Exactly one thread observes the idle value and
    // records the state for the end-of-frame lookup reset.
    let old = ctx.state_best_cost[arc.next_state as usize].fetch_min(int_cost, Relaxed);
    if old == INT_INF {
        let t = ctx.counters.reserve_touched();
        ctx.touched_states[t as usize].store(arc.next_state, Relaxed);
    }
    if int_cost >= old {
        return;
    }

    let pos = ctx.counters.reserve_aux();
    if pos >= ctx.aux_q_capacity {
        ctx.counters.rollback_aux();
        ctx.counters.raise_overflow(OVERFLOW_AUX_Q);
        return;
    }
    maybe_lower_adaptive_beam(ctx, pos);

    let old_min = ctx.counters.relax_min_int_cost(int_cost);
    if int_cost < old_min {
        // Cutoff arithmetic runs in the float domain; the encoding is
        // monotone, not additive.
        let beam = ordered_int_to_float(ctx.counters.int_beam());
        ctx.counters
            .lower_int_cutoff(float_to_ordered_int(total_cost + beam));
    }

    let pos = pos as usize;
    ctx.aux_q_state_and_cost[pos].store(pack_pair(arc.next_state, int_cost), Relaxed);
    ctx.aux_q_acoustic[pos].store(acoustic_cost, Relaxed);
    let prev_token = ctx.counters.global_offset() + itok as i32;
    ctx.aux_q_info[pos].store(InfoToken::new(prev_token, arc_idx).pack(), Relaxed);
}

/// Queue-pressure beam reduction. When a reserved aux position passes the
/// current validity index, the beam drops to the ramp value of that
/// position's bin and the validity moves to the bin's end. The pair only
/// ever moves down, so the beam is monotone within a frame.
fn maybe_lower_adaptive_beam(ctx: &LaneKernelCtx, pos: i32) {
    loop {
        let (current_beam, validity) = ctx.counters.adaptive_beam_and_validity();
        if pos < validity {
            return;
        }
        let static_len = adaptive_static_segment_len(ctx.aux_q_capacity);
        let bin_len = ((ctx.aux_q_capacity - static_len) / ADAPTIVE_BEAM_NBINS).max(1);
        let k = (((pos - static_len) / bin_len) + 1).min(ADAPTIVE_BEAM_NBINS);
        let base_beam = ordered_int_to_float(ctx.base_int_beam);
        let ramped = float_to_ordered_int(
            base_beam * (ADAPTIVE_BEAM_NBINS - k) as f32 / ADAPTIVE_BEAM_NBINS as f32,
        );
        let new_beam = ramped.min(current_beam);
        let new_validity = static_len + k * bin_len;
        if ctx
            .counters
            .try_lower_adaptive_beam((current_beam, validity), (new_beam, new_validity))
        {
            ctx.counters.lower_int_beam(new_beam);
            let min_int_cost = ctx.counters.min_int_cost();
            if min_int_cost < INT_INF {
                ctx.counters.lower_int_cutoff(float_to_ordered_int(
                    ordered_int_to_float(min_int_cost) + ordered_int_to_float(new_beam),
                ));
            }
            return;
        }
        // Lost the race; re-read the fresher pair.
    }
}
