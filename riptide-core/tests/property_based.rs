//! Property-based tests for the cost encoding, configuration validation and
//! batch isolation.

use std::sync::Arc;

use proptest::prelude::*;

use riptide_core::cost::{float_to_ordered_int, ordered_int_to_float};
use riptide_core::{BatchedDecoder, DecoderConfig, FstArc, FstBuilder, FstView, LoglikMatrix};

fn competing_paths_fst() -> FstView {
    let mut b = FstBuilder::new(3, 0);
    b.add_arc(
        0,
        FstArc { next_state: 1, ilabel: 1, olabel: 1, weight: 0.0 },
    )
    .add_arc(
        0,
        FstArc { next_state: 2, ilabel: 2, olabel: 2, weight: 0.2 },
    )
    .set_final(1, 0.0)
    .set_final(2, 0.0);
    b.build()
}

fn tiny_config(nlanes: usize) -> DecoderConfig {
    DecoderConfig {
        nlanes,
        nchannels: nlanes,
        max_tokens_pre_allocated: 1024,
        max_tokens_per_frame: 128,
        ..DecoderConfig::default()
    }
}

proptest! {
    /// The ordered-int mapping round-trips every finite float bit-exactly.
    #[test]
    fn ordered_int_round_trips(x in prop::num::f32::ANY) {
        prop_assume!(x.is_finite());
        let back = ordered_int_to_float(float_to_ordered_int(x));
        prop_assert_eq!(back.to_bits(), x.to_bits());
    }

    /// Float order and ordered-int order agree.
    #[test]
    fn ordered_int_is_monotone(x in prop::num::f32::ANY, y in prop::num::f32::ANY) {
        prop_assume!(x.is_finite() && y.is_finite());
        prop_assert_eq!(
            x <= y,
            float_to_ordered_int(x) <= float_to_ordered_int(y)
        );
    }

    /// Configuration validation accepts exactly the documented domain of the
    /// beam.
    #[test]
    fn config_validation_gates_the_beam(beam in prop::num::f32::ANY) {
        let config = DecoderConfig { beam, ..DecoderConfig::default() };
        if beam.is_finite() && beam > 0.0 {
            prop_assert!(config.validate().is_ok());
        } else {
            prop_assert!(config.validate().is_err());
        }
    }

    /// A channel decodes to the same traceback whether it runs alone or in a
    /// batch next to a channel with arbitrary acoustics.
    #[test]
    fn batch_neighbors_cannot_change_a_traceback(
        other_ll1 in -5.0f32..0.0,
        other_ll2 in -5.0f32..0.0,
        frames in 1usize..4,
    ) {
        let fixed = LoglikMatrix::from_rows(&vec![vec![0.0, -0.5, -2.0]; frames]);
        let noisy = LoglikMatrix::from_rows(&vec![vec![0.0, other_ll1, other_ll2]; frames]);

        let mut solo = BatchedDecoder::new(Arc::new(competing_paths_fst()), tiny_config(2))
            .expect("valid config");
        solo.init_decoding(&[0]).unwrap();
        solo.advance_decoding(&[0], &[&fixed], None).unwrap();
        let solo_path = solo.best_path(0, true);

        let mut batched = BatchedDecoder::new(Arc::new(competing_paths_fst()), tiny_config(2))
            .expect("valid config");
        batched.init_decoding(&[0, 1]).unwrap();
        batched.advance_decoding(&[0, 1], &[&fixed, &noisy], None).unwrap();
        let batched_path = batched.best_path(0, true);

        prop_assert_eq!(solo_path, batched_path);
    }
}
