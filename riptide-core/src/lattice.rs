//! Traceback assembly from the host token streams.
//!
//! After decoding, a channel's history is a flat stream of back-pointer
//! tokens plus the extra-prev-tokens list for same-state merges. The best
//! path walks that stream backward from one token; the raw lattice walks it
//! backward from every token near the best cost and rebuilds the DAG.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::fst::FstView;
use crate::token::{HostTokenStreams, InfoToken};

/// One step of a best-path traceback. `weight` folds the arc's graph weight
/// and the acoustic cost paid on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TracebackArc {
    pub ilabel: i32,
    pub olabel: i32,
    pub weight: f32,
}

/// Linear best-path traceback of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BestPath {
    pub arcs: Vec<TracebackArc>,
    pub total_cost: f32,
}

impl BestPath {
    /// Output labels along the path, epsilons dropped.
    pub fn olabels(&self) -> Vec<i32> {
        self.arcs.iter().map(|a| a.olabel).filter(|&l| l != 0).collect()
    }

    /// Input labels along the path, epsilons dropped.
    pub fn ilabels(&self) -> Vec<i32> {
        self.arcs.iter().map(|a| a.ilabel).filter(|&l| l != 0).collect()
    }
}

/// A node of the raw lattice: one `(frame, state)` equivalence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeNode {
    pub frame: usize,
    pub state: i32,
}

/// A raw-lattice arc; one surviving token. Graph and acoustic cost stay
/// decomposed for downstream rescoring.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeArc {
    pub from: usize,
    pub to: usize,
    pub ilabel: i32,
    pub olabel: i32,
    pub graph_cost: f32,
    pub acoustic_cost: f32,
}

/// DAG of the tokens that survived within the lattice beam.
#[derive(Debug, Clone)]
pub struct RawLattice {
    pub nodes: Vec<LatticeNode>,
    pub arcs: Vec<LatticeArc>,
    /// Node of the origin token.
    pub start: usize,
    /// Last-frame nodes with their final weights (0 when final costs are
    /// not applied).
    pub finals: Vec<(usize, f32)>,
}

/// State a host token landed on. The stream stores no states; they are
/// recovered from the token's arc, and the origin token sits on the start
/// state by construction.
fn resolve_state(fst: &FstView, host: &HostTokenStreams, token_idx: usize) -> i32 {
    if token_idx == 0 {
        return fst.start();
    }
    let info = host.info[token_idx];
    let arc_idx = if info.is_unique_for_state() {
        info.arc_idx
    } else {
        let (offset, _) = info.extras_range();
        host.extras[offset as usize].arc_idx
    };
    if arc_idx < 0 {
        // A group whose first member is the origin token: the group's state
        // is the start state.
        return fst.start();
    }
    fst.arc(arc_idx as usize).next_state
}

/// Walks `prev_token` links backward from `best_token` and returns the
/// reversed arc sequence. Returns `None` on an empty or malformed stream.
pub(crate) fn trace_best_path(
    fst: &FstView,
    host: &HostTokenStreams,
    best_token: usize,
    total_cost: f32,
) -> Option<BestPath> {
    if host.info.is_empty() || best_token >= host.info.len() {
        return None;
    }

    let mut arcs = Vec::new();
    let mut idx = best_token;
    // Every step strictly descends the token stream, so this many steps
    // means a corrupt back-pointer chain.
    let mut remaining = host.info.len() + host.extras.len();
    while idx != 0 {
        if remaining == 0 {
            return None;
        }
        remaining -= 1;

        let mut info = host.info[idx];
        let mut acoustic_cost = host.acoustic[idx];
        if !info.is_unique_for_state() {
            // Same-state group: the representative path is the member that
            // pays no extra cost.
            let (offset, count) = info.extras_range();
            let mut pick = offset as usize;
            let mut pick_extra = f32::INFINITY;
            for j in offset as usize..(offset + count) as usize {
                let (extra, _) = host.extra_costs[j];
                if extra < pick_extra {
                    pick_extra = extra;
                    pick = j;
                }
            }
            info = host.extras[pick];
            acoustic_cost = host.extra_costs[pick].1;
        }
        if info.arc_idx < 0 {
            // Resolved to the origin token.
            break;
        }

        let arc = fst.arc(info.arc_idx as usize);
        arcs.push(TracebackArc {
            ilabel: arc.ilabel,
            olabel: arc.olabel,
            weight: arc.weight + acoustic_cost,
        });
        idx = info.prev_token as usize;
    }

    arcs.reverse();
    Some(BestPath { arcs, total_cost })
}

/// Rebuilds the DAG of all tokens backward-reachable from `seeds` (the
/// last-frame tokens within the lattice beam of the best cost). Group
/// members become parallel arcs into their node, pruned by `extra_cost`.
pub(crate) fn build_raw_lattice(
    fst: &FstView,
    host: &HostTokenStreams,
    seeds: &[(usize, f32)],
    lattice_beam: f32,
    use_final_costs: bool,
) -> Option<RawLattice> {
    if host.info.is_empty() || seeds.is_empty() {
        return None;
    }

    let mut node_ids: HashMap<(usize, i32), usize> = HashMap::new();
    let mut nodes: Vec<LatticeNode> = Vec::new();
    let mut arcs: Vec<LatticeArc> = Vec::new();
    let mut intern = |frame: usize, state: i32, nodes: &mut Vec<LatticeNode>| -> usize {
        *node_ids.entry((frame, state)).or_insert_with(|| {
            nodes.push(LatticeNode { frame, state });
            nodes.len() - 1
        })
    };

    let start = intern(0, fst.start(), &mut nodes);

    // Tokens of one frame sharing a state all collapse into one node (the
    // same-state merge guarantees it), so reachability is tracked per node:
    // a second queue slot of an expanded group adds nothing.
    let mut expanded: HashSet<usize> = HashSet::new();
    let mut pending: VecDeque<usize> = seeds.iter().map(|&(idx, _)| idx).collect();
    while let Some(idx) = pending.pop_front() {
        if idx == 0 {
            continue;
        }
        let frame = host.frame_of(idx);
        let state = resolve_state(fst, host, idx);
        let to = intern(frame, state, &mut nodes);
        if !expanded.insert(to) {
            continue;
        }

        let info = host.info[idx];
        let members: Vec<(InfoToken, f32, f32)> = if info.is_unique_for_state() {
            vec![(info, 0.0, host.acoustic[idx])]
        } else {
            let (offset, count) = info.extras_range();
            (offset as usize..(offset + count) as usize)
                .map(|j| (host.extras[j], host.extra_costs[j].0, host.extra_costs[j].1))
                .collect()
        };

        for (member, extra_cost, acoustic_cost) in members {
            if member.arc_idx < 0 || extra_cost > lattice_beam {
                continue;
            }
            let arc = fst.arc(member.arc_idx as usize);
            let prev = member.prev_token as usize;
            let from = intern(host.frame_of(prev), resolve_state(fst, host, prev), &mut nodes);
            arcs.push(LatticeArc {
                from,
                to,
                ilabel: arc.ilabel,
                olabel: arc.olabel,
                graph_cost: arc.weight,
                acoustic_cost,
            });
            pending.push_back(prev);
        }
    }

    let mut finals: Vec<(usize, f32)> = Vec::new();
    let mut seen_final_nodes: HashSet<usize> = HashSet::new();
    for &(idx, _) in seeds {
        let frame = host.frame_of(idx);
        let state = resolve_state(fst, host, idx);
        let node = intern(frame, state, &mut nodes);
        if seen_final_nodes.insert(node) {
            let weight = if use_final_costs && fst.is_final(state) {
                fst.final_weight(state)
            } else {
                0.0
            };
            finals.push((node, weight));
        }
    }

    Some(RawLattice { nodes, arcs, start, finals })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{FstArc, FstBuilder};

    fn chain_fst() -> FstView {
        let mut b = FstBuilder::new(3, 0);
        b.add_arc(0, FstArc { next_state: 1, ilabel: 1, olabel: 4, weight: 0.5 })
            .add_arc(1, FstArc { next_state: 2, ilabel: 2, olabel: 5, weight: 0.25 })
            .set_final(2, 0.0);
        b.build()
    }

    fn two_frame_streams(fst: &FstView) -> HostTokenStreams {
        // Frame 0: the origin token. Frame 1: token via arc 0. Frame 2:
        // token via arc 1.
        let (e0, _) = fst.arc_range(0, true);
        let (e1, _) = fst.arc_range(1, true);
        let mut host = HostTokenStreams::default();
        host.info = vec![
            InfoToken::seed(),
            InfoToken::new(0, e0 as i32),
            InfoToken::new(1, e1 as i32),
        ];
        host.acoustic = vec![0.0, 0.1, 0.2];
        host.frame_offsets = vec![0, 1, 2, 3];
        host
    }

    #[test]
    fn best_path_walks_and_reverses() {
        let fst = chain_fst();
        let host = two_frame_streams(&fst);
        let path = trace_best_path(&fst, &host, 2, 1.05).expect("nonempty path");
        assert_eq!(path.olabels(), vec![4, 5]);
        assert_eq!(path.ilabels(), vec![1, 2]);
        let sum: f32 = path.arcs.iter().map(|a| a.weight).sum();
        assert!((sum - 1.05).abs() < 1e-6);
    }

    #[test]
    fn empty_stream_yields_none() {
        let fst = chain_fst();
        let host = HostTokenStreams::default();
        assert!(trace_best_path(&fst, &host, 0, 0.0).is_none());
    }

    #[test]
    fn raw_lattice_links_frames() {
        let fst = chain_fst();
        let host = two_frame_streams(&fst);
        let lattice = build_raw_lattice(&fst, &host, &[(2, 1.05)], 10.0, true).expect("lattice");
        assert_eq!(lattice.arcs.len(), 2);
        assert_eq!(lattice.finals.len(), 1);
        let (final_node, final_weight) = lattice.finals[0];
        assert_eq!(lattice.nodes[final_node].state, 2);
        assert_eq!(final_weight, 0.0);
        // Both arcs chain start -> mid -> final.
        assert_eq!(lattice.nodes[lattice.start].state, 0);
        let incoming: Vec<_> = lattice.arcs.iter().filter(|a| a.to == final_node).collect();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].olabel, 5);
    }
}
