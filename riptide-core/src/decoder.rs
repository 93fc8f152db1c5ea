//! The batched decoder: channels, lanes and the lockstep frame scheduler.
//!
//! A *channel* is a persistent per-utterance slot whose search state can be
//! suspended and resumed; a *lane* is an execution slot that borrows one
//! channel for the duration of an `advance_decoding` call. A batch of N
//! channels (N ≤ nlanes) advances one frame at a time in lockstep; at every
//! frame boundary the surviving tokens are appended to the channel's host
//! streams for later traceback.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use atomic_float::AtomicF32;
use rayon::prelude::*;

use crate::config::DecoderConfig;
use crate::cost::{
    float_to_ordered_int, ordered_int_to_float, pack_pair, unpack_float_pair, unpack_pair, INT_INF,
};
use crate::counters::{ChannelCounters, LaneCounters, OVERFLOW_AUX_Q, OVERFLOW_MAIN_Q};
use crate::decodable::Decodable;
use crate::errors::{Result, UsageError};
use crate::fst::FstView;
use crate::hashmap::StateHashmap;
use crate::kernels::{self, LaneKernelCtx, HISTOGRAM_NBINS, PREFIX_SUM_BLOCK, RECOVER_RATE};
use crate::lattice::{self, BestPath, RawLattice};
use crate::logging::{DecoderLogger, LogConfig};
use crate::matrix::{ChannelMatrix, LaneMatrix};
use crate::token::{HostTokenStreams, InfoToken};

/// Index of a persistent utterance slot.
pub type ChannelId = usize;

/// Lifecycle of a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Free,
    Initialized,
    Advancing,
    Suspended,
    Queried,
}

impl ChannelPhase {
    fn name(self) -> &'static str {
        match self {
            ChannelPhase::Free => "free",
            ChannelPhase::Initialized => "initialized",
            ChannelPhase::Advancing => "advancing",
            ChannelPhase::Suspended => "suspended",
            ChannelPhase::Queried => "queried",
        }
    }
}

/// Result of a best-cost scan over one channel's last frame.
#[derive(Debug, Clone)]
pub struct ChannelBestCost {
    /// Host-stream index of the argmin token.
    pub best_token: usize,
    /// Its cost, including the final weight when final costs applied.
    pub best_cost: f32,
    /// All last-frame tokens within `lattice_beam` of the best, as
    /// `(host-stream index, cost)`.
    pub within_lattice_beam: Vec<(usize, f32)>,
    /// Whether any last-frame token sits on a final state.
    pub has_reached_final: bool,
}

#[derive(Debug)]
struct ChannelSlot {
    counters: ChannelCounters,
    phase: ChannelPhase,
    num_frames_decoded: usize,
    host: HostTokenStreams,
    /// Sticky: some frame of this utterance overflowed a queue.
    overflowed: bool,
}

impl ChannelSlot {
    fn new(token_capacity_hint: usize) -> Self {
        Self {
            counters: ChannelCounters::default(),
            phase: ChannelPhase::Free,
            num_frames_decoded: 0,
            host: HostTokenStreams::with_capacity(token_capacity_hint),
            overflowed: false,
        }
    }
}

/// Batched lockstep beam-search decoder over a shared [`FstView`].
pub struct BatchedDecoder {
    fst: Arc<FstView>,
    config: DecoderConfig,
    logger: DecoderLogger,

    lane_counters: Vec<LaneCounters>,
    /// `nchannels + 1` slots; the extra one holds the initial-channel
    /// template cloned by `init_decoding`.
    channels: Vec<ChannelSlot>,
    init_channel_ready: bool,

    // Channel-keyed storage (survives suspension).
    main_q_state_and_cost: ChannelMatrix<AtomicU64>,
    main_q_degrees_prefix_sum: ChannelMatrix<AtomicI32>,
    main_q_arc_offsets: ChannelMatrix<AtomicI32>,

    // Lane-keyed storage (scratch for the active batch).
    main_q_acoustic: LaneMatrix<AtomicF32>,
    main_q_info: LaneMatrix<AtomicU64>,
    aux_q_state_and_cost: LaneMatrix<AtomicU64>,
    aux_q_acoustic: LaneMatrix<AtomicF32>,
    aux_q_info: LaneMatrix<AtomicU64>,
    state_best_cost: LaneMatrix<AtomicI32>,
    touched_states: LaneMatrix<AtomicI32>,
    block_sums: LaneMatrix<AtomicI32>,
    histograms: LaneMatrix<AtomicI32>,
    extras_info: LaneMatrix<AtomicU64>,
    extras_costs: LaneMatrix<AtomicU64>,
    hashmaps: Vec<StateHashmap>,
}

impl BatchedDecoder {
    pub fn new(fst: Arc<FstView>, config: DecoderConfig) -> Result<Self> {
        config.validate()?;

        let nlanes = config.nlanes;
        let nchannels = config.nchannels;
        let main_q_capacity = config.max_tokens_per_frame;
        let num_states = fst.num_states();
        let nblocks = main_q_capacity.div_ceil(PREFIX_SUM_BLOCK).max(1);
        let per_channel_hint = config.max_tokens_pre_allocated / nchannels.max(1);

        Ok(Self {
            logger: DecoderLogger::new(LogConfig::default()),
            lane_counters: (0..nlanes).map(|_| LaneCounters::default()).collect(),
            channels: (0..=nchannels).map(|_| ChannelSlot::new(per_channel_hint)).collect(),
            init_channel_ready: false,
            main_q_state_and_cost: ChannelMatrix::new(nchannels + 1, main_q_capacity),
            main_q_degrees_prefix_sum: ChannelMatrix::new(nchannels + 1, main_q_capacity),
            main_q_arc_offsets: ChannelMatrix::new(nchannels + 1, main_q_capacity),
            main_q_acoustic: LaneMatrix::new(nlanes, main_q_capacity),
            main_q_info: LaneMatrix::new(nlanes, main_q_capacity),
            aux_q_state_and_cost: LaneMatrix::new(nlanes, main_q_capacity),
            aux_q_acoustic: LaneMatrix::new(nlanes, main_q_capacity),
            aux_q_info: LaneMatrix::new(nlanes, main_q_capacity),
            state_best_cost: LaneMatrix::from_fn(nlanes, num_states, || AtomicI32::new(INT_INF)),
            touched_states: LaneMatrix::new(nlanes, num_states),
            block_sums: LaneMatrix::new(nlanes, nblocks),
            histograms: LaneMatrix::new(nlanes, HISTOGRAM_NBINS),
            extras_info: LaneMatrix::new(nlanes, main_q_capacity),
            extras_costs: LaneMatrix::new(nlanes, main_q_capacity),
            hashmaps: (0..nlanes).map(|_| StateHashmap::new(main_q_capacity)).collect(),
            fst,
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn fst(&self) -> &FstView {
        &self.fst
    }

    pub fn logger(&self) -> &DecoderLogger {
        &self.logger
    }

    pub fn set_log_config(&mut self, config: LogConfig) {
        self.logger = DecoderLogger::new(config);
    }

    /// Monotone count of emitting frames decoded on a channel.
    pub fn num_frames_decoded(&self, channel: ChannelId) -> usize {
        self.channels[channel].num_frames_decoded
    }

    /// True if any frame of the channel's current utterance overflowed a
    /// token queue (results are degraded but usable).
    pub fn overflow_occurred(&self, channel: ChannelId) -> bool {
        self.channels[channel].overflowed
    }

    fn check_channel(&self, channel: ChannelId) -> Result<()> {
        if channel >= self.config.nchannels {
            return Err(UsageError::InvalidChannel {
                channel,
                nchannels: self.config.nchannels,
            }
            .into());
        }
        Ok(())
    }

    fn lane_ctx<'a>(
        &'a self,
        ilane: usize,
        ichannel: usize,
        loglikes: Option<&'a [f32]>,
    ) -> LaneKernelCtx<'a> {
        let capacity = self.config.max_tokens_per_frame as i32;
        LaneKernelCtx {
            fst: &self.fst,
            counters: &self.lane_counters[ilane],
            hashmap: &self.hashmaps[ilane],
            main_q_state_and_cost: self.main_q_state_and_cost.channel(ichannel),
            main_q_degrees_prefix_sum: self.main_q_degrees_prefix_sum.channel(ichannel),
            main_q_arc_offsets: self.main_q_arc_offsets.channel(ichannel),
            main_q_acoustic: self.main_q_acoustic.lane(ilane),
            main_q_info: self.main_q_info.lane(ilane),
            aux_q_state_and_cost: self.aux_q_state_and_cost.lane(ilane),
            aux_q_acoustic: self.aux_q_acoustic.lane(ilane),
            aux_q_info: self.aux_q_info.lane(ilane),
            state_best_cost: self.state_best_cost.lane(ilane),
            touched_states: self.touched_states.lane(ilane),
            block_sums: self.block_sums.lane(ilane),
            histogram: self.histograms.lane(ilane),
            extras_info: self.extras_info.lane(ilane),
            extras_costs: self.extras_costs.lane(ilane),
            loglikes,
            main_q_capacity: capacity,
            aux_q_capacity: capacity,
            max_active: self.config.max_active as i32,
            base_int_beam: self.lane_counters[ilane].int_beam(),
        }
    }

    /// Resets the listed channels to a fresh utterance start: a single token
    /// at the FST start state with its epsilon closure already settled.
    pub fn init_decoding(&mut self, channels: &[ChannelId]) -> Result<()> {
        for &channel in channels {
            self.check_channel(channel)?;
            let phase = self.channels[channel].phase;
            if !matches!(phase, ChannelPhase::Free | ChannelPhase::Queried) {
                return Err(UsageError::InvalidTransition {
                    channel,
                    operation: "initialize",
                    phase: phase.name(),
                }
                .into());
            }
        }

        if !self.init_channel_ready {
            self.compute_initial_channel();
            self.init_channel_ready = true;
        }
        let template = self.config.nchannels;
        for &channel in channels {
            self.clone_channel(template, channel);
            self.channels[channel].phase = ChannelPhase::Initialized;
        }
        self.logger
            .debug("SCHED", format!("initialized {} channel(s)", channels.len()));
        Ok(())
    }

    /// Runs the start-state closure once into the template slot; every
    /// `init_decoding` afterwards is a cheap clone.
    fn compute_initial_channel(&mut self) {
        let template = self.config.nchannels;
        let int_beam = float_to_ordered_int(self.config.beam);
        let zero = float_to_ordered_int(0.0);

        let lane = &self.lane_counters[0];
        lane.set_narcs_and_end(0, 0);
        lane.set_local_offset(0);
        lane.set_global_offset(0);
        lane.set_extras_global_offset(0);
        lane.set_int_beam(int_beam);
        lane.set_min_int_cost(zero);
        lane.set_int_cutoff(float_to_ordered_int(self.config.beam));
        lane.set_aux_q_end(1);
        lane.set_n_extras(0);
        lane.clear_overflow();
        lane.reset_touched_count();

        {
            let ctx = self.lane_ctx(0, template, None);
            ctx.counters.set_adaptive_beam_and_validity(
                int_beam,
                kernels::adaptive_static_segment_len(ctx.aux_q_capacity),
            );
            let start = self.fst.start();
            ctx.aux_q_state_and_cost[0].store(pack_pair(start, zero), Relaxed);
            ctx.aux_q_acoustic[0].store(0.0, Relaxed);
            ctx.aux_q_info[0].store(InfoToken::seed().pack(), Relaxed);
            // The seed is the provisional best for the start state; record it
            // like any other relaxation so the teardown resets it.
            ctx.state_best_cost[start as usize].store(zero, Relaxed);
            let t = ctx.counters.reserve_touched();
            ctx.touched_states[t as usize].store(start, Relaxed);

            kernels::nonemitting_closure(&ctx);
            kernels::histogram::apply_max_active_and_reduce_beam(&ctx, false);
            kernels::postprocess::postprocess_main_queue(&ctx);
        }

        self.channels[template].host.clear();
        self.channels[template].num_frames_decoded = 0;
        self.finish_frame_on_host(0, template, false);
        self.save_channel(0, template);
    }

    fn clone_channel(&mut self, from: usize, to: usize) {
        let end = self.channels[from].counters.prev_main_q_narcs_and_end.1 as usize;
        let src = self.main_q_state_and_cost.channel(from);
        let dst = self.main_q_state_and_cost.channel(to);
        for i in 0..end {
            dst[i].store(src[i].load(Relaxed), Relaxed);
        }
        // Degree prefix sums and arc offsets are rebuilt by the next frame's
        // preprocess; the queue cells and counters are the whole snapshot.
        let counters = self.channels[from].counters.clone();
        let host = self.channels[from].host.clone();
        let slot = &mut self.channels[to];
        slot.counters = counters;
        slot.host = host;
        slot.num_frames_decoded = 0;
        slot.overflowed = false;
    }

    fn load_channel(&self, ilane: usize, ichannel: usize) {
        let lane = &self.lane_counters[ilane];
        let counters = &self.channels[ichannel].counters;
        let (narcs, end) = counters.prev_main_q_narcs_and_end;
        lane.set_narcs_and_end(narcs, end);
        lane.set_local_offset(0);
        lane.set_global_offset(counters.prev_main_q_global_offset);
        lane.set_extras_global_offset(counters.prev_extra_prev_tokens_global_offset);
        lane.set_int_beam(float_to_ordered_int(counters.prev_beam));
        lane.set_int_cutoff(counters.prev_int_cutoff);
        lane.set_min_int_cost(INT_INF);
        lane.set_aux_q_end(0);
        lane.set_n_extras(0);
        lane.clear_overflow();
        lane.reset_touched_count();
    }

    fn save_channel(&mut self, ilane: usize, ichannel: usize) {
        let lane = &self.lane_counters[ilane];
        let counters = &mut self.channels[ichannel].counters;
        counters.prev_main_q_narcs_and_end = lane.narcs_and_end();
        counters.prev_main_q_global_offset = lane.global_offset();
        counters.prev_extra_prev_tokens_global_offset = lane.extras_global_offset();
        counters.prev_beam = ordered_int_to_float(lane.int_beam());
        counters.prev_int_cutoff = lane.int_cutoff();
    }

    /// Appends the frame's surviving tokens to the channel's host streams,
    /// reports overflow, and recovers the beam for the next frame.
    fn finish_frame_on_host(&mut self, ilane: usize, ichannel: usize, count_frame: bool) {
        let lane = &self.lane_counters[ilane];

        let overflow = lane.overflow();
        if overflow != 0 {
            self.channels[ichannel].overflowed = true;
            let which = match (overflow & OVERFLOW_MAIN_Q != 0, overflow & OVERFLOW_AUX_Q != 0) {
                (true, true) => "main and aux queues",
                (true, false) => "main queue",
                _ => "aux queue",
            };
            let frame = self.channels[ichannel].num_frames_decoded;
            self.logger.warn(
                "OVERFLOW",
                format!(
                    "channel {}: {} hit capacity {} at frame {}; continuing with degraded accuracy",
                    ichannel, which, self.config.max_tokens_per_frame, frame
                ),
            );
        }

        let (_, end) = lane.narcs_and_end();
        let end = end as usize;
        let n_extras = lane.n_extras() as usize;
        let info_row = self.main_q_info.lane(ilane);
        let acoustic_row = self.main_q_acoustic.lane(ilane);
        let extras_row = self.extras_info.lane(ilane);
        let extra_costs_row = self.extras_costs.lane(ilane);

        let host = &mut self.channels[ichannel].host;
        assert!(
            host.info.len() + end <= i32::MAX as usize,
            "channel token stream exceeds the 32-bit index space"
        );
        host.info
            .extend((0..end).map(|i| InfoToken::unpack(info_row[i].load(Relaxed))));
        host.acoustic
            .extend((0..end).map(|i| acoustic_row[i].load(Relaxed)));
        host.extras
            .extend((0..n_extras).map(|i| InfoToken::unpack(extras_row[i].load(Relaxed))));
        host.extra_costs
            .extend((0..n_extras).map(|i| unpack_float_pair(extra_costs_row[i].load(Relaxed))));
        host.frame_offsets.push(host.info.len());
        if count_frame {
            self.channels[ichannel].num_frames_decoded += 1;
        }

        lane.set_extras_global_offset(lane.extras_global_offset() + n_extras as i32);
        let recovered = (ordered_int_to_float(lane.int_beam()) * RECOVER_RATE).min(self.config.beam);
        lane.set_int_beam(float_to_ordered_int(recovered));
    }

    /// Advances every supplied channel in lockstep, one frame at a time,
    /// until some channel runs out of ready frames or `max_num_frames` is
    /// reached. Channel `i` of the batch runs on lane `i` against
    /// `decodables[i]`.
    pub fn advance_decoding(
        &mut self,
        channels: &[ChannelId],
        decodables: &[&dyn Decodable],
        max_num_frames: Option<usize>,
    ) -> Result<()> {
        if channels.len() != decodables.len() {
            return Err(UsageError::MismatchedBatch {
                channels: channels.len(),
                decodables: decodables.len(),
            }
            .into());
        }
        if channels.len() > self.config.nlanes {
            return Err(UsageError::BatchTooLarge {
                requested: channels.len(),
                nlanes: self.config.nlanes,
            }
            .into());
        }
        for (i, &channel) in channels.iter().enumerate() {
            self.check_channel(channel)?;
            if channels[..i].contains(&channel) {
                return Err(UsageError::DuplicateChannel { channel }.into());
            }
            let phase = self.channels[channel].phase;
            if !matches!(phase, ChannelPhase::Initialized | ChannelPhase::Suspended) {
                return Err(UsageError::InvalidTransition {
                    channel,
                    operation: "advance",
                    phase: phase.name(),
                }
                .into());
            }
        }
        if channels.is_empty() {
            return Ok(());
        }

        let mut nframes = usize::MAX;
        for (i, &channel) in channels.iter().enumerate() {
            let ready = decodables[i]
                .num_frames_ready()
                .saturating_sub(self.channels[channel].num_frames_decoded);
            nframes = nframes.min(ready);
        }
        if let Some(limit) = max_num_frames {
            nframes = nframes.min(limit);
        }
        if nframes == 0 {
            return Ok(());
        }

        for &channel in channels {
            self.channels[channel].phase = ChannelPhase::Advancing;
        }
        for (ilane, &channel) in channels.iter().enumerate() {
            self.load_channel(ilane, channel);
        }

        let num_ilabels = self.fst.num_ilabels();
        for _ in 0..nframes {
            let loglikes: Vec<&[f32]> = channels
                .iter()
                .enumerate()
                .map(|(i, &channel)| {
                    let row = decodables[i].log_likelihoods(self.channels[channel].num_frames_decoded);
                    assert!(
                        row.len() >= num_ilabels,
                        "log-likelihood row shorter than the ilabel space"
                    );
                    row
                })
                .collect();

            {
                let contexts: Vec<LaneKernelCtx> = channels
                    .iter()
                    .enumerate()
                    .map(|(ilane, &channel)| self.lane_ctx(ilane, channel, Some(loglikes[ilane])))
                    .collect();
                contexts.par_iter().for_each(kernels::process_frame);
            }

            for (ilane, &channel) in channels.iter().enumerate() {
                self.finish_frame_on_host(ilane, channel, true);
            }
        }

        for (ilane, &channel) in channels.iter().enumerate() {
            self.save_channel(ilane, channel);
            self.channels[channel].phase = ChannelPhase::Suspended;
        }
        self.logger.debug(
            "SCHED",
            format!("advanced {} channel(s) by {} frame(s)", channels.len(), nframes),
        );
        Ok(())
    }

    fn channel_best_cost(&self, channel: ChannelId, use_final_costs: bool) -> ChannelBestCost {
        let slot = &self.channels[channel];
        let (_, end) = slot.counters.prev_main_q_narcs_and_end;
        let end = end as usize;
        let global_offset = slot.counters.prev_main_q_global_offset as usize;
        let row = self.main_q_state_and_cost.channel(channel);

        let mut has_reached_final = false;
        for i in 0..end {
            let (state, _) = unpack_pair(row[i].load(Relaxed));
            if self.fst.is_final(state) {
                has_reached_final = true;
                break;
            }
        }
        let apply_final = use_final_costs && has_reached_final;

        let mut best_cost = f32::INFINITY;
        let mut best_index = 0usize;
        let mut costs = Vec::with_capacity(end);
        for i in 0..end {
            let (state, int_cost) = unpack_pair(row[i].load(Relaxed));
            let mut cost = ordered_int_to_float(int_cost);
            if apply_final {
                cost += self.fst.final_weight(state);
            }
            if cost < best_cost {
                best_cost = cost;
                best_index = i;
            }
            costs.push(cost);
        }

        let within_lattice_beam = costs
            .iter()
            .enumerate()
            .filter(|&(_, &cost)| cost.is_finite() && cost <= best_cost + self.config.lattice_beam)
            .map(|(i, &cost)| (global_offset + i, cost))
            .collect();

        ChannelBestCost {
            best_token: global_offset + best_index,
            best_cost,
            within_lattice_beam,
            has_reached_final,
        }
    }

    /// Best cost of each channel's last frame; with `use_final_costs`, final
    /// weights are added whenever the channel reached a final state (and
    /// ignored otherwise, with `has_reached_final` reporting which case
    /// applied).
    pub fn get_best_cost(
        &self,
        channels: &[ChannelId],
        use_final_costs: bool,
    ) -> Vec<ChannelBestCost> {
        channels
            .iter()
            .map(|&channel| self.channel_best_cost(channel, use_final_costs))
            .collect()
    }

    /// Best-path traceback per channel; `None` for channels with nothing
    /// decoded.
    pub fn get_best_path(
        &mut self,
        channels: &[ChannelId],
        use_final_costs: bool,
    ) -> Vec<Option<BestPath>> {
        let paths: Vec<Option<BestPath>> = channels
            .iter()
            .map(|&channel| {
                let slot = &self.channels[channel];
                if !Self::queryable(slot.phase) {
                    return None;
                }
                let best = self.channel_best_cost(channel, use_final_costs);
                if !best.best_cost.is_finite() {
                    return None;
                }
                lattice::trace_best_path(&self.fst, &slot.host, best.best_token, best.best_cost)
            })
            .collect();
        self.mark_queried(channels);
        paths
    }

    /// Single-channel convenience wrapper over [`Self::get_best_path`].
    pub fn best_path(&mut self, channel: ChannelId, use_final_costs: bool) -> Option<BestPath> {
        self.get_best_path(&[channel], use_final_costs).pop().flatten()
    }

    /// Raw-lattice extraction per channel: the DAG of all tokens within
    /// `lattice_beam` of the best (final-aware) cost.
    pub fn get_raw_lattice(
        &mut self,
        channels: &[ChannelId],
        use_final_costs: bool,
    ) -> Vec<Option<RawLattice>> {
        let lattices: Vec<Option<RawLattice>> = channels
            .iter()
            .map(|&channel| {
                let slot = &self.channels[channel];
                if !Self::queryable(slot.phase) {
                    return None;
                }
                let best = self.channel_best_cost(channel, use_final_costs);
                if !best.best_cost.is_finite() {
                    return None;
                }
                lattice::build_raw_lattice(
                    &self.fst,
                    &slot.host,
                    &best.within_lattice_beam,
                    self.config.lattice_beam,
                    use_final_costs && best.has_reached_final,
                )
            })
            .collect();
        self.mark_queried(channels);
        lattices
    }

    fn queryable(phase: ChannelPhase) -> bool {
        matches!(
            phase,
            ChannelPhase::Initialized | ChannelPhase::Suspended | ChannelPhase::Queried
        )
    }

    fn mark_queried(&mut self, channels: &[ChannelId]) {
        for &channel in channels {
            if Self::queryable(self.channels[channel].phase) {
                self.channels[channel].phase = ChannelPhase::Queried;
            }
        }
    }
}
