//! End-of-frame queue post-processing: same-state merge and lane teardown.
//!
//! Several tokens of one frame can land on the same FST state. The traceback
//! wants them merged (one representative in the queue, the siblings carried
//! aside), so each frame ends by grouping the main queue through the state
//! hashmap and packing every multi-token group into the extra-prev-tokens
//! list. Every member's queue slot is then redirected to the group:
//! `{prev_token: list offset, arc_idx: -count}`. A token referencing any
//! member of the group resolves through the list, and each list entry
//! carries `extra_cost = total - best_total` for lattice weights.

use std::sync::atomic::Ordering::Relaxed;

use rayon::prelude::*;

use crate::cost::{ordered_int_to_float, pack_float_pair, unpack_pair, INT_INF};
use crate::token::InfoToken;

use super::LaneKernelCtx;

pub fn postprocess_main_queue(ctx: &LaneKernelCtx) {
    let (_, end) = ctx.counters.narcs_and_end();
    let end = end as usize;

    (0..end).into_par_iter().for_each(|i| {
        let (state, int_cost) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
        ctx.hashmap.insert(state, int_cost, i as i32);
    });

    // Reserve one contiguous extras region per multi-token group. The
    // group's argmin member acts as its leader so each group reserves once.
    let mut n_extras = 0i32;
    for i in 0..end {
        let (state, _) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
        let slot = ctx.hashmap.find(state);
        let count = ctx.hashmap.count(slot);
        if count > 1 && ctx.hashmap.min_and_argmin(slot).1 == i as i32 {
            ctx.hashmap.set_extras_offset(slot, n_extras);
            n_extras += count;
        }
    }

    let extras_global_offset = ctx.counters.extras_global_offset();
    (0..end).into_par_iter().for_each(|i| {
        let (state, int_cost) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
        let slot = ctx.hashmap.find(state);
        let count = ctx.hashmap.count(slot);
        if count <= 1 {
            return;
        }
        let (min_int_cost, _) = ctx.hashmap.min_and_argmin(slot);
        let offset = ctx.hashmap.extras_offset(slot);
        let member = (offset + ctx.hashmap.next_fill_index(slot)) as usize;

        ctx.extras_info[member].store(ctx.main_q_info[i].load(Relaxed), Relaxed);
        let extra_cost = ordered_int_to_float(int_cost) - ordered_int_to_float(min_int_cost);
        let acoustic_cost = ctx.main_q_acoustic[i].load(Relaxed);
        ctx.extras_costs[member].store(pack_float_pair(extra_cost, acoustic_cost), Relaxed);

        ctx.main_q_info[i]
            .store(InfoToken::new(extras_global_offset + offset, -count).pack(), Relaxed);
    });
    ctx.counters.set_n_extras(n_extras);
    ctx.hashmap.reset();

    // Return every lookup entry touched this frame to +∞. The touched list
    // is exact: it also covers states whose tokens were all pruned after the
    // cutoff tightened and which therefore never reached the main queue.
    let touched = ctx.counters.touched_count();
    (0..touched).into_par_iter().for_each(|t| {
        let state = ctx.touched_states[t as usize].load(Relaxed);
        ctx.state_best_cost[state as usize].store(INT_INF, Relaxed);
    });
    ctx.counters.reset_touched_count();
}
