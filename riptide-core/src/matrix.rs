//! 2-D row-major buffers keyed by lane or by channel.
//!
//! All batched storage is a matrix of `(slots × ld)` cells. Lane-keyed rows
//! are transient scratch reused by whichever utterance currently occupies
//! the slot; channel-keyed rows persist across suspensions of an utterance.
//! Cells are atomic types, so rows are handed out as shared slices and
//! parallel lanes never alias mutably.

use ndarray::Array2;

/// Row-major matrix with one row per execution lane.
#[derive(Debug)]
pub struct LaneMatrix<T> {
    data: Array2<T>,
}

impl<T> LaneMatrix<T> {
    pub fn new(nlanes: usize, ld: usize) -> Self
    where
        T: Default,
    {
        Self {
            data: Array2::from_shape_fn((nlanes, ld), |_| T::default()),
        }
    }

    /// Builds each cell with `fill` (for cells whose idle value is not the
    /// type's default, e.g. cost lookups starting at `+∞`).
    pub fn from_fn(nlanes: usize, ld: usize, fill: impl Fn() -> T) -> Self {
        Self {
            data: Array2::from_shape_fn((nlanes, ld), |_| fill()),
        }
    }

    pub fn ld(&self) -> usize {
        self.data.ncols()
    }

    pub fn lane(&self, ilane: usize) -> &[T] {
        self.data
            .row(ilane)
            .to_slice()
            .expect("lane rows are contiguous")
    }
}

/// Row-major matrix with one row per channel.
#[derive(Debug)]
pub struct ChannelMatrix<T> {
    data: Array2<T>,
}

impl<T> ChannelMatrix<T> {
    pub fn new(nchannels: usize, ld: usize) -> Self
    where
        T: Default,
    {
        Self {
            data: Array2::from_shape_fn((nchannels, ld), |_| T::default()),
        }
    }

    pub fn ld(&self) -> usize {
        self.data.ncols()
    }

    pub fn channel(&self, ichannel: usize) -> &[T] {
        self.data
            .row(ichannel)
            .to_slice()
            .expect("channel rows are contiguous")
    }
}
