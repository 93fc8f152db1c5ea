//! Traceback token data and the per-channel host token streams.

use crate::cost::{pack_pair, unpack_pair};

/// The back-pointer half of a token: everything the traceback needs once the
/// frame is over. `{prev_token, arc_idx}` packs into one 64-bit cell.
///
/// When several tokens of a frame share the same next state, every member's
/// slot is rewritten to `{prev_token: offset, arc_idx: -count}` where
/// `offset` points into the channel's extra-prev-tokens list and `count` is
/// the group size; the real `(prev_token, arc_idx)` pairs live in that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoToken {
    pub prev_token: i32,
    pub arc_idx: i32,
}

impl InfoToken {
    pub fn new(prev_token: i32, arc_idx: i32) -> Self {
        Self { prev_token, arc_idx }
    }

    /// The token seeded at the start state by `init_decoding`. It is always
    /// host-stream index 0 of its channel, where every traceback stops.
    pub fn seed() -> Self {
        Self { prev_token: 0, arc_idx: -1 }
    }

    pub fn pack(self) -> u64 {
        pack_pair(self.prev_token, self.arc_idx)
    }

    pub fn unpack(packed: u64) -> Self {
        let (prev_token, arc_idx) = unpack_pair(packed);
        Self { prev_token, arc_idx }
    }

    /// True when `prev_token`/`arc_idx` are directly usable, i.e. this token
    /// was the only one for its `(frame, state)`.
    pub fn is_unique_for_state(self) -> bool {
        self.arc_idx >= 0
    }

    /// `(offset, count)` of this token's group in the extra-prev-tokens
    /// list. Only meaningful when `!is_unique_for_state()`.
    pub fn extras_range(self) -> (i32, i32) {
        debug_assert!(self.arc_idx < 0);
        (self.prev_token, -self.arc_idx)
    }
}

/// Host-side token history of one channel, appended to at every frame
/// boundary and consumed by the traceback.
#[derive(Debug, Clone, Default)]
pub struct HostTokenStreams {
    /// Concatenated per-frame main queues.
    pub info: Vec<InfoToken>,
    /// Acoustic cost of each token in `info` (0 for epsilon arcs).
    pub acoustic: Vec<f32>,
    /// Concatenated same-state group members.
    pub extras: Vec<InfoToken>,
    /// `(extra_cost, acoustic_cost)` for each entry of `extras`.
    pub extra_costs: Vec<(f32, f32)>,
    /// `frame_offsets[f]` is the index in `info` where frame `f` begins;
    /// the last entry is `info.len()`.
    pub frame_offsets: Vec<usize>,
}

impl HostTokenStreams {
    pub fn with_capacity(tokens: usize) -> Self {
        Self {
            info: Vec::with_capacity(tokens),
            acoustic: Vec::with_capacity(tokens),
            extras: Vec::new(),
            extra_costs: Vec::new(),
            frame_offsets: vec![0],
        }
    }

    pub fn clear(&mut self) {
        self.info.clear();
        self.acoustic.clear();
        self.extras.clear();
        self.extra_costs.clear();
        self.frame_offsets.clear();
        self.frame_offsets.push(0);
    }

    /// Frame a host token index belongs to.
    pub fn frame_of(&self, token_idx: usize) -> usize {
        debug_assert!(token_idx < self.info.len());
        self.frame_offsets.partition_point(|&off| off <= token_idx) - 1
    }
}
