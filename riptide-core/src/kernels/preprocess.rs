//! Queue preprocessing: pruning plus degree prefix sums.
//!
//! Two variants feed the expansion kernel. `preprocess_and_contract` prunes
//! the aux queue while moving survivors into the main queue, computing the
//! degree prefix sum on the fly through the packed `(narcs, end)` atomic.
//! `preprocess_in_place` keeps the main queue's slots where they are (the
//! next frame's tokens already hold indices into it) and zeroes the degree
//! of pruned tokens instead; its prefix sum needs a second entry point
//! because the intermediate block sums must themselves be scanned.

use std::sync::atomic::Ordering::Relaxed;

use rayon::prelude::*;

use crate::cost::{unpack_pair, pack_pair, INT_INF};
use crate::counters::OVERFLOW_MAIN_Q;

use super::{LaneKernelCtx, PREFIX_SUM_BLOCK};

/// Prunes the aux queue into the main queue.
///
/// Keep predicate: inside the cutoff and still the best token for its state.
/// A kept token reserves its main slot and its arc range with one atomic on
/// the packed pair, which doubles as a single-pass exclusive prefix sum. On
/// capacity the overflow flag raises and the queue stops growing.
pub fn preprocess_and_contract(ctx: &LaneKernelCtx) {
    let aux_q_end = ctx.counters.aux_q_end().min(ctx.aux_q_capacity);
    (0..aux_q_end)
        .into_par_iter()
        .for_each(|j| contract_one_token(ctx, j as usize));
    ctx.counters.set_aux_q_end(0);
}

/// Single-token body, shared with the sequential closure finalizer.
pub fn contract_one_token(ctx: &LaneKernelCtx, j: usize) {
    let (state, int_cost) = unpack_pair(ctx.aux_q_state_and_cost[j].load(Relaxed));
    if int_cost >= ctx.counters.int_cutoff() {
        return;
    }
    if ctx.state_best_cost[state as usize].load(Relaxed) != int_cost {
        return;
    }

    // Degrees recorded here drive the next closure round, hence epsilon.
    let degree = ctx.fst.out_degree(state, false);
    let (degree_prefix, slot) = ctx.counters.reserve_main(degree);
    if slot >= ctx.main_q_capacity {
        ctx.counters.rollback_main(degree);
        ctx.counters.raise_overflow(OVERFLOW_MAIN_Q);
        return;
    }

    let i = slot as usize;
    ctx.main_q_state_and_cost[i].store(pack_pair(state, int_cost), Relaxed);
    ctx.main_q_acoustic[i].store(ctx.aux_q_acoustic[j].load(Relaxed), Relaxed);
    ctx.main_q_info[i].store(ctx.aux_q_info[j].load(Relaxed), Relaxed);
    ctx.main_q_degrees_prefix_sum[i].store(degree_prefix, Relaxed);
    ctx.main_q_arc_offsets[i].store(ctx.fst.arc_range(state, false).0 as i32, Relaxed);
}

/// First entry point of the emitting preprocess: rebuild the lane's
/// best-cost lookup from the persisted queue, then apply the keep predicate
/// and the block-local half of the degree scan.
///
/// The lookup is lane scratch and does not survive suspension, so it is
/// reconstructed from the channel's queue on every frame; one relax pass
/// restores exactly the per-state minima the predicate compares against.
/// Slots are never reordered. Pruned tokens keep their index with degree 0,
/// which makes the expansion kernel skip them.
pub fn preprocess_in_place(ctx: &LaneKernelCtx) {
    let (_, end) = ctx.counters.narcs_and_end();
    let end = end as usize;

    (0..end).into_par_iter().for_each(|i| {
        let (state, int_cost) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
        ctx.state_best_cost[state as usize].fetch_min(int_cost, Relaxed);
    });

    let cutoff = ctx.counters.int_cutoff();
    let nblocks = end.div_ceil(PREFIX_SUM_BLOCK);
    (0..nblocks).into_par_iter().for_each(|b| {
        let begin = b * PREFIX_SUM_BLOCK;
        let block_end = (begin + PREFIX_SUM_BLOCK).min(end);
        let mut running = 0i32;
        for i in begin..block_end {
            let (state, int_cost) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
            ctx.main_q_degrees_prefix_sum[i].store(running, Relaxed);
            let keep = int_cost < cutoff
                && ctx.state_best_cost[state as usize].load(Relaxed) == int_cost;
            if keep {
                running += ctx.fst.out_degree(state, true);
                ctx.main_q_arc_offsets[i].store(ctx.fst.arc_range(state, true).0 as i32, Relaxed);
            }
        }
        ctx.block_sums[b].store(running, Relaxed);
    });
}

/// Second entry point: scan the block sums, add the carries, publish the
/// arc total, and return the lookup entries just walked to `+∞` so the new
/// frame's costs start from a clean slate.
pub fn finalize_preprocess_in_place(ctx: &LaneKernelCtx) {
    let (_, end) = ctx.counters.narcs_and_end();
    let end_u = end as usize;
    let nblocks = end_u.div_ceil(PREFIX_SUM_BLOCK);

    let mut carry = 0i32;
    for b in 0..nblocks {
        let block_sum = ctx.block_sums[b].load(Relaxed);
        ctx.block_sums[b].store(carry, Relaxed);
        carry += block_sum;
    }
    let narcs = carry;

    (0..nblocks).into_par_iter().for_each(|b| {
        let block_carry = ctx.block_sums[b].load(Relaxed);
        if block_carry == 0 {
            return;
        }
        let begin = b * PREFIX_SUM_BLOCK;
        let block_end = (begin + PREFIX_SUM_BLOCK).min(end_u);
        for i in begin..block_end {
            ctx.main_q_degrees_prefix_sum[i].fetch_add(block_carry, Relaxed);
        }
    });

    (0..end_u).into_par_iter().for_each(|i| {
        let (state, _) = unpack_pair(ctx.main_q_state_and_cost[i].load(Relaxed));
        ctx.state_best_cost[state as usize].store(INT_INF, Relaxed);
    });

    ctx.counters.set_narcs_and_end(narcs, end);
    ctx.counters.set_local_offset(0);
}
