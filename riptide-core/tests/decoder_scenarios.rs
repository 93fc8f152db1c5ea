//! End-to-end decoding scenarios over small hand-built transducers.

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use riptide_core::{
    BatchedDecoder, Decodable, DecoderConfig, FstArc, FstBuilder, FstView, LoglikMatrix,
};

fn arc(next_state: i32, ilabel: i32, olabel: i32, weight: f32) -> FstArc {
    FstArc { next_state, ilabel, olabel, weight }
}

fn small_config() -> DecoderConfig {
    DecoderConfig {
        max_tokens_pre_allocated: 4096,
        max_tokens_per_frame: 512,
        ..DecoderConfig::default()
    }
}

fn decoder(fst: FstView, config: DecoderConfig) -> BatchedDecoder {
    BatchedDecoder::new(Arc::new(fst), config).expect("valid config")
}

#[test]
fn single_emitting_arc_traces_back() {
    // States {0, 1}, one arc consuming label 1, final at 1.
    let mut b = FstBuilder::new(2, 0);
    b.add_arc(0, arc(1, 1, 7, 0.5)).set_final(1, 0.0);
    let mut d = decoder(b.build(), small_config());

    d.init_decoding(&[0]).unwrap();
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, -0.1]]);
    d.advance_decoding(&[0], &[&loglikes], None).unwrap();
    assert_eq!(d.num_frames_decoded(0), 1);

    let path = d.best_path(0, true).expect("nonempty traceback");
    assert_eq!(path.olabels(), vec![7]);
    assert_abs_diff_eq!(path.total_cost, 0.6, epsilon = 1e-5);
    let weight_sum: f32 = path.arcs.iter().map(|a| a.weight).sum();
    assert_abs_diff_eq!(weight_sum, 0.6, epsilon = 1e-5);
}

#[test]
fn epsilon_chain_decodes_with_zero_frames() {
    // 0 -ε/A-> 1 -ε/B-> 2, final at 2; no acoustic input at all.
    let mut b = FstBuilder::new(3, 0);
    b.add_arc(0, arc(1, 0, 5, 1.0))
        .add_arc(1, arc(2, 0, 6, 2.0))
        .set_final(2, 0.0);
    let mut d = decoder(b.build(), small_config());

    d.init_decoding(&[0]).unwrap();
    assert_eq!(d.num_frames_decoded(0), 0);

    let path = d.best_path(0, true).expect("nonempty traceback");
    assert_eq!(path.olabels(), vec![5, 6]);
    assert_abs_diff_eq!(path.total_cost, 3.0, epsilon = 1e-5);
}

fn competing_paths_fst() -> FstView {
    // Two emitting arcs from the start; the acoustics decide.
    let mut b = FstBuilder::new(3, 0);
    b.add_arc(0, arc(1, 1, 1, 0.0))
        .add_arc(0, arc(2, 2, 2, 0.2))
        .set_final(1, 0.0)
        .set_final(2, 0.0);
    b.build()
}

#[test]
fn acoustics_pick_the_cheaper_competing_path() {
    let mut d = decoder(competing_paths_fst(), small_config());
    d.init_decoding(&[0]).unwrap();

    // -log p costs: label 1 pays 3.0, label 2 pays 2.0. Label 2 wins with
    // 0.2 + 2.0 = 2.2 against 3.0.
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, -3.0, -2.0]]);
    d.advance_decoding(&[0], &[&loglikes], None).unwrap();

    let path = d.best_path(0, true).expect("nonempty traceback");
    assert_eq!(path.olabels(), vec![2]);
    assert_abs_diff_eq!(path.total_cost, 2.2, epsilon = 1e-5);
}

#[test]
fn batched_decoding_leaves_channels_independent() {
    let config = DecoderConfig {
        nlanes: 2,
        nchannels: 2,
        ..small_config()
    };

    let a_loglikes = LoglikMatrix::from_rows(&[vec![0.0, -0.5, -4.0]]);
    let b_loglikes = LoglikMatrix::from_rows(&[vec![0.0, -3.0, -2.0]]);

    // Channel A decoded alone.
    let mut solo = decoder(competing_paths_fst(), config.clone());
    solo.init_decoding(&[0]).unwrap();
    solo.advance_decoding(&[0], &[&a_loglikes], None).unwrap();
    let solo_path = solo.best_path(0, true).expect("solo traceback");

    // Channel A decoded next to an unrelated channel B.
    let mut batched = decoder(competing_paths_fst(), config);
    batched.init_decoding(&[0, 1]).unwrap();
    batched
        .advance_decoding(&[0, 1], &[&a_loglikes, &b_loglikes], None)
        .unwrap();
    let paths = batched.get_best_path(&[0, 1], true);

    assert_eq!(paths[0].as_ref(), Some(&solo_path));
    // And B still decodes to its own answer.
    assert_eq!(paths[1].as_ref().expect("batched traceback").olabels(), vec![2]);
}

#[test]
fn overflow_degrades_gracefully() {
    // Fan-out 16 from the start against queues of capacity 4.
    let mut b = FstBuilder::new(17, 0);
    for i in 0..16 {
        b.add_arc(0, arc(i + 1, 1, i + 1, 0.0));
    }
    let config = DecoderConfig {
        max_tokens_pre_allocated: 64,
        max_tokens_per_frame: 4,
        ..DecoderConfig::default()
    };
    let mut d = decoder(b.build(), config);

    d.init_decoding(&[0]).unwrap();
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, 0.0]]);
    d.advance_decoding(&[0], &[&loglikes], None).unwrap();

    assert!(d.overflow_occurred(0));
    assert!(!d.logger().entries_for_subsystem("OVERFLOW").is_empty());

    // The frame still produced a full queue of survivors and a traceback.
    let best = &d.get_best_cost(&[0], false)[0];
    assert_eq!(best.within_lattice_beam.len(), 4);
    let path = d.best_path(0, false).expect("degraded but nonempty traceback");
    assert_eq!(path.arcs.len(), 1);
}

#[test]
fn max_active_tightens_the_beam() {
    // Ten competing arcs: three cheap, seven expensive.
    let mut b = FstBuilder::new(11, 0);
    for (i, &w) in [0.0, 0.1, 0.2, 14.2, 14.2, 14.2, 14.2, 14.2, 14.2, 14.2]
        .iter()
        .enumerate()
    {
        b.add_arc(0, arc(i as i32 + 1, 1, i as i32 + 1, w));
    }
    let config = DecoderConfig {
        max_active: 3,
        ..small_config()
    };
    let mut d = decoder(b.build(), config);

    d.init_decoding(&[0]).unwrap();
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, 0.0]]);
    d.advance_decoding(&[0], &[&loglikes], None).unwrap();

    let best = &d.get_best_cost(&[0], false)[0];
    assert_eq!(best.within_lattice_beam.len(), 3, "culling keeps exactly max_active");
    for &(_, cost) in &best.within_lattice_beam {
        assert!(cost < 1.0, "kept token has the strictly lower costs, got {cost}");
    }
}

#[test]
fn raw_lattice_stays_within_the_lattice_beam() {
    // Three parallel paths: 2.2 (best), 3.0 (inside the beam), 12.0 (out).
    let mut b = FstBuilder::new(4, 0);
    b.add_arc(0, arc(1, 1, 1, 0.0))
        .add_arc(0, arc(2, 2, 2, 0.2))
        .add_arc(0, arc(3, 3, 3, 10.0))
        .set_final(1, 0.0)
        .set_final(2, 0.0)
        .set_final(3, 0.0);
    let config = DecoderConfig {
        lattice_beam: 1.0,
        ..small_config()
    };
    let mut d = decoder(b.build(), config);

    d.init_decoding(&[0]).unwrap();
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, -3.0, -2.0, -2.0]]);
    d.advance_decoding(&[0], &[&loglikes], None).unwrap();

    let best_cost = d.get_best_cost(&[0], true)[0].best_cost;
    let lattice = d.get_raw_lattice(&[0], true)[0].clone().expect("lattice");

    assert_eq!(lattice.finals.len(), 2, "the 12.0 path is outside the beam");
    for lattice_arc in &lattice.arcs {
        let path_cost = lattice_arc.graph_cost + lattice_arc.acoustic_cost;
        assert!(
            path_cost <= best_cost + 1.0 + 1e-5,
            "lattice arc cost {path_cost} escapes the beam around {best_cost}"
        );
    }
}

#[test]
fn suspension_between_frames_is_transparent() {
    // Two-frame chain: 0 -1-> 1 -2-> 2, final at 2.
    let mut b = FstBuilder::new(3, 0);
    b.add_arc(0, arc(1, 1, 7, 0.5))
        .add_arc(1, arc(2, 2, 8, 0.25))
        .set_final(2, 0.0);
    let loglikes = LoglikMatrix::from_rows(&[vec![0.0, -0.1, -9.0], vec![0.0, -9.0, -0.2]]);

    let mut one_call = decoder(b.build(), small_config());
    one_call.init_decoding(&[0]).unwrap();
    one_call.advance_decoding(&[0], &[&loglikes], None).unwrap();
    let reference = one_call.best_path(0, true).expect("traceback");

    let mut b = FstBuilder::new(3, 0);
    b.add_arc(0, arc(1, 1, 7, 0.5))
        .add_arc(1, arc(2, 2, 8, 0.25))
        .set_final(2, 0.0);
    let mut frame_by_frame = decoder(b.build(), small_config());
    frame_by_frame.init_decoding(&[0]).unwrap();
    frame_by_frame
        .advance_decoding(&[0], &[&loglikes], Some(1))
        .unwrap();
    assert_eq!(frame_by_frame.num_frames_decoded(0), 1);
    frame_by_frame
        .advance_decoding(&[0], &[&loglikes], Some(1))
        .unwrap();
    assert_eq!(frame_by_frame.num_frames_decoded(0), 2);

    let resumed = frame_by_frame.best_path(0, true).expect("traceback");
    assert_eq!(resumed, reference);
    assert_eq!(resumed.olabels(), vec![7, 8]);
    assert_abs_diff_eq!(resumed.total_cost, 1.05, epsilon = 1e-5);
}

#[test]
fn same_state_merges_produce_parallel_lattice_arcs() {
    // State 2 is reached twice during the closure: directly (cost 2.0) and
    // through state 1 (cost 1.5). The queue keeps both tokens merged under
    // one state group; the lattice turns the group into parallel arcs.
    let mut b = FstBuilder::new(3, 0);
    b.add_arc(0, arc(1, 0, 5, 1.0))
        .add_arc(0, arc(2, 0, 6, 2.0))
        .add_arc(1, arc(2, 0, 7, 0.5))
        .set_final(2, 0.0);
    let mut d = decoder(b.build(), small_config());

    d.init_decoding(&[0]).unwrap();

    let path = d.best_path(0, true).expect("traceback");
    assert_eq!(path.olabels(), vec![5, 7]);
    assert_abs_diff_eq!(path.total_cost, 1.5, epsilon = 1e-5);

    let lattice = d.get_raw_lattice(&[0], true)[0].clone().expect("lattice");
    assert_eq!(lattice.nodes.len(), 3);
    assert_eq!(lattice.finals.len(), 1);
    let (final_node, _) = lattice.finals[0];
    let into_final: Vec<i32> = lattice
        .arcs
        .iter()
        .filter(|a| a.to == final_node)
        .map(|a| a.olabel)
        .collect();
    assert_eq!(into_final.len(), 2, "both merged alternatives survive");
    assert!(into_final.contains(&6) && into_final.contains(&7));
}

#[test]
fn decodable_trait_objects_can_be_heterogeneous() {
    struct ConstantDecodable {
        frames: usize,
        row: Vec<f32>,
    }
    impl Decodable for ConstantDecodable {
        fn num_frames_ready(&self) -> usize {
            self.frames
        }
        fn log_likelihoods(&self, _frame: usize) -> &[f32] {
            &self.row
        }
    }

    let mut d = decoder(competing_paths_fst(), small_config());
    d.init_decoding(&[0]).unwrap();
    let constant = ConstantDecodable { frames: 1, row: vec![0.0, -3.0, -2.0] };
    d.advance_decoding(&[0], &[&constant], None).unwrap();
    assert_eq!(d.best_path(0, true).expect("traceback").olabels(), vec![2]);
}
