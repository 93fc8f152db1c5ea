//! Single-lane finalizer for the tail of the epsilon closure.
//!
//! Near the end of a closure the residual arc counts are tiny and the fixed
//! cost of batched passes dominates. This finalizer runs both phases in one
//! sequential loop until the queue stabilizes, reusing the per-arc and
//! per-token bodies of the batched kernels.

use super::{expand, preprocess, LaneKernelCtx};

pub fn finalize_nonemitting(ctx: &LaneKernelCtx) {
    loop {
        let (narcs, end) = ctx.counters.narcs_and_end();
        if narcs == 0 {
            return;
        }
        let local_offset = ctx.counters.local_offset();
        for arc_tid in 0..narcs {
            expand::expand_one_arc(ctx, false, arc_tid, local_offset, end);
        }
        ctx.counters.set_local_offset(end);
        ctx.counters.set_narcs_and_end(0, end);

        let aux_q_end = ctx.counters.aux_q_end().min(ctx.aux_q_capacity);
        for j in 0..aux_q_end {
            preprocess::contract_one_token(ctx, j as usize);
        }
        ctx.counters.set_aux_q_end(0);
    }
}
