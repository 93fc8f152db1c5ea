//! Max-active culling through a bounded cost histogram.

use std::sync::atomic::Ordering::Relaxed;

use rayon::prelude::*;

use crate::cost::{float_to_ordered_int, ordered_int_to_float, unpack_pair, INT_INF};

use super::{LaneKernelCtx, HISTOGRAM_NBINS};

/// If the selected queue holds more than `max_active` tokens, histogram the
/// ordered-int costs over `[min_cost, min_cost + beam)` and lower the beam
/// to the largest bin boundary whose cumulative count still fits. The bin
/// holding the minimum always survives, so the queue never empties. The
/// tightened cutoff takes effect at the next preprocess.
pub fn apply_max_active_and_reduce_beam(ctx: &LaneKernelCtx, use_aux_q: bool) {
    let count = if use_aux_q {
        ctx.counters.aux_q_end().min(ctx.aux_q_capacity)
    } else {
        ctx.counters.narcs_and_end().1
    };
    if count <= ctx.max_active {
        return;
    }
    let min_int_cost = ctx.counters.min_int_cost();
    if min_int_cost >= INT_INF {
        return;
    }
    let min_cost = ordered_int_to_float(min_int_cost);
    let beam = ordered_int_to_float(ctx.counters.int_beam());
    if !(beam > 0.0) {
        return;
    }

    for bin in ctx.histogram.iter().take(HISTOGRAM_NBINS) {
        bin.store(0, Relaxed);
    }

    let nbins = HISTOGRAM_NBINS as f32;
    (0..count).into_par_iter().for_each(|i| {
        let cell = if use_aux_q {
            &ctx.aux_q_state_and_cost[i as usize]
        } else {
            &ctx.main_q_state_and_cost[i as usize]
        };
        let (_, int_cost) = unpack_pair(cell.load(Relaxed));
        let offset = ordered_int_to_float(int_cost) - min_cost;
        if offset < 0.0 || offset >= beam {
            // Outside the span; the next cutoff disposes of it anyway.
            return;
        }
        let bin = ((offset / beam * nbins) as usize).min(HISTOGRAM_NBINS - 1);
        ctx.histogram[bin].fetch_add(1, Relaxed);
    });

    let mut cumulative = 0i64;
    let mut boundary_bin = 0usize;
    for k in 0..HISTOGRAM_NBINS {
        let bin_count = ctx.histogram[k].load(Relaxed) as i64;
        if cumulative + bin_count > ctx.max_active as i64 {
            break;
        }
        cumulative += bin_count;
        boundary_bin = k + 1;
    }
    let boundary_bin = boundary_bin.max(1);

    let new_beam = beam * boundary_bin as f32 / nbins;
    ctx.counters.lower_int_beam(float_to_ordered_int(new_beam));
    ctx.counters
        .lower_int_cutoff(float_to_ordered_int(min_cost + new_beam));
}
