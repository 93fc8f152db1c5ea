//! Compressed-sparse-row view of a weighted finite-state transducer.
//!
//! The decoder never walks an FST through a general graph API; it reads this
//! immutable view. Arcs are grouped by source state with the emitting arcs
//! (ilabel ≠ 0) of every state laid out first and the epsilon arcs after
//! them, so a state's emitting and epsilon out-degrees can be queried
//! independently while arc indices stay globally unique.

use serde::{Deserialize, Serialize};

/// The epsilon input label: arcs with this ilabel consume no frame.
pub const EPSILON: i32 = 0;

/// A single transducer arc.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FstArc {
    pub next_state: i32,
    pub ilabel: i32,
    pub olabel: i32,
    pub weight: f32,
}

/// Immutable CSR transducer view shared read-only by every lane and channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FstView {
    start: i32,
    num_ilabels: usize,
    /// Emitting arc offsets, length `num_states + 1`.
    e_offsets: Vec<u32>,
    /// Epsilon arc offsets, length `num_states + 1`; these index past the
    /// emitting block, so both tables address the same `arcs` array.
    ne_offsets: Vec<u32>,
    arcs: Vec<FstArc>,
    /// Final weight per state, `+∞` for non-final states.
    final_weights: Vec<f32>,
}

impl FstView {
    pub fn num_states(&self) -> usize {
        self.final_weights.len()
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    /// Length of the per-frame log-likelihood vector this view requires
    /// (highest ilabel + 1).
    pub fn num_ilabels(&self) -> usize {
        self.num_ilabels
    }

    pub fn final_weight(&self, state: i32) -> f32 {
        self.final_weights[state as usize]
    }

    pub fn is_final(&self, state: i32) -> bool {
        self.final_weights[state as usize].is_finite()
    }

    /// Arc index range for a state, within the emitting or epsilon grouping.
    pub fn arc_range(&self, state: i32, emitting: bool) -> (u32, u32) {
        let s = state as usize;
        if emitting {
            (self.e_offsets[s], self.e_offsets[s + 1])
        } else {
            (self.ne_offsets[s], self.ne_offsets[s + 1])
        }
    }

    pub fn out_degree(&self, state: i32, emitting: bool) -> i32 {
        let (begin, end) = self.arc_range(state, emitting);
        (end - begin) as i32
    }

    pub fn arc(&self, index: usize) -> FstArc {
        self.arcs[index]
    }

    pub fn num_arcs(&self) -> usize {
        self.arcs.len()
    }
}

/// Assembles an [`FstView`] from explicit arcs and final weights.
///
/// The production loader deserializes a prebuilt view; this builder is the
/// in-memory seam used by tests and by callers that compile small graphs on
/// the fly.
#[derive(Debug, Clone)]
pub struct FstBuilder {
    start: i32,
    arcs_per_state: Vec<Vec<FstArc>>,
    final_weights: Vec<f32>,
}

impl FstBuilder {
    pub fn new(num_states: usize, start: i32) -> Self {
        assert!(
            (start as usize) < num_states,
            "start state {} out of range for {} states",
            start,
            num_states
        );
        Self {
            start,
            arcs_per_state: vec![Vec::new(); num_states],
            final_weights: vec![f32::INFINITY; num_states],
        }
    }

    pub fn add_arc(&mut self, from: i32, arc: FstArc) -> &mut Self {
        assert!((arc.next_state as usize) < self.arcs_per_state.len());
        self.arcs_per_state[from as usize].push(arc);
        self
    }

    pub fn set_final(&mut self, state: i32, weight: f32) -> &mut Self {
        self.final_weights[state as usize] = weight;
        self
    }

    pub fn build(&self) -> FstView {
        let num_states = self.arcs_per_state.len();
        let mut arcs = Vec::new();
        let mut e_offsets = Vec::with_capacity(num_states + 1);
        let mut num_ilabels = 1;

        e_offsets.push(0);
        for state_arcs in &self.arcs_per_state {
            for arc in state_arcs.iter().filter(|a| a.ilabel != EPSILON) {
                num_ilabels = num_ilabels.max(arc.ilabel as usize + 1);
                arcs.push(*arc);
            }
            e_offsets.push(arcs.len() as u32);
        }

        let mut ne_offsets = Vec::with_capacity(num_states + 1);
        ne_offsets.push(arcs.len() as u32);
        for state_arcs in &self.arcs_per_state {
            arcs.extend(state_arcs.iter().filter(|a| a.ilabel == EPSILON).copied());
            ne_offsets.push(arcs.len() as u32);
        }

        FstView {
            start: self.start,
            num_ilabels,
            e_offsets,
            ne_offsets,
            arcs,
            final_weights: self.final_weights.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(next_state: i32, ilabel: i32, olabel: i32, weight: f32) -> FstArc {
        FstArc { next_state, ilabel, olabel, weight }
    }

    #[test]
    fn groups_emitting_before_epsilon() {
        let mut b = FstBuilder::new(3, 0);
        b.add_arc(0, arc(1, 0, 5, 1.0))
            .add_arc(0, arc(2, 2, 6, 0.5))
            .add_arc(1, arc(2, 1, 7, 0.25))
            .set_final(2, 0.0);
        let fst = b.build();

        assert_eq!(fst.num_states(), 3);
        assert_eq!(fst.num_ilabels(), 3);
        assert_eq!(fst.out_degree(0, true), 1);
        assert_eq!(fst.out_degree(0, false), 1);
        assert_eq!(fst.out_degree(1, true), 1);
        assert_eq!(fst.out_degree(1, false), 0);

        let (begin, end) = fst.arc_range(0, true);
        assert_eq!((begin, end), (0, 1));
        assert_eq!(fst.arc(begin as usize).olabel, 6);

        // Epsilon arcs index past the emitting block.
        let (ne_begin, ne_end) = fst.arc_range(0, false);
        assert_eq!(ne_end - ne_begin, 1);
        assert_eq!(fst.arc(ne_begin as usize).olabel, 5);
        assert!(ne_begin >= fst.arc_range(1, true).1);
    }

    #[test]
    fn final_weights_default_to_infinity() {
        let fst = FstBuilder::new(2, 0).set_final(1, 0.5).build();
        assert!(!fst.is_final(0));
        assert!(fst.is_final(1));
        assert_eq!(fst.final_weight(1), 0.5);
        assert_eq!(fst.final_weight(0), f32::INFINITY);
    }
}
