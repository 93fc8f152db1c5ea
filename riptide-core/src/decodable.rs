//! Acoustic-model interface.
//!
//! The decoder pulls one log-likelihood row per frame and never retains it
//! past that frame. How the rows are produced (neural network, lookup, test
//! fixture) is the caller's business.

use ndarray::Array2;

/// Per-utterance source of acoustic log-likelihoods.
///
/// `log_likelihoods(frame)` must return a slice of length at least the
/// transducer's `num_ilabels()`, indexed by ilabel (index 0 is the epsilon
/// slot and is never read). Implementations must be `Sync`: a batch of
/// decodables is consulted from parallel lanes.
pub trait Decodable: Sync {
    /// Number of frames that can be served right now.
    fn num_frames_ready(&self) -> usize;

    /// Log-likelihood row for `frame`, valid only until the next call into
    /// the decoder.
    fn log_likelihoods(&self, frame: usize) -> &[f32];
}

/// Buffered [`Decodable`] over a dense `(frames × ilabels)` matrix.
#[derive(Debug, Clone)]
pub struct LoglikMatrix {
    loglikes: Array2<f32>,
}

impl LoglikMatrix {
    pub fn new(loglikes: Array2<f32>) -> Self {
        Self { loglikes }
    }

    /// Convenience constructor from per-frame rows; rows must share a length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let ncols = rows.first().map_or(0, Vec::len);
        let mut loglikes = Array2::zeros((rows.len(), ncols));
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), ncols, "ragged log-likelihood rows");
            for (j, &v) in row.iter().enumerate() {
                loglikes[(i, j)] = v;
            }
        }
        Self { loglikes }
    }

    pub fn num_ilabels(&self) -> usize {
        self.loglikes.ncols()
    }
}

impl Decodable for LoglikMatrix {
    fn num_frames_ready(&self) -> usize {
        self.loglikes.nrows()
    }

    fn log_likelihoods(&self, frame: usize) -> &[f32] {
        self.loglikes
            .row(frame)
            .to_slice()
            .expect("loglik rows are contiguous")
    }
}
