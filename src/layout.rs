//! Flat tensor layout shared by host code and every kernel backend.
//!
//! - feature maps: `[n][plane][row][col]`, `n` slowest
//! - filters: `[outPlane][upstreamPlane][filterRow][filterCol]`
//!
//! All addressing is computed from this geometry; buffer lengths are trusted
//! to agree with it.

/// Index of element `(n, plane, row, col)` in a feature-map batch.
#[inline]
pub fn result_index(
    planes: usize,
    board_size: usize,
    n: usize,
    plane: usize,
    row: usize,
    col: usize,
) -> usize {
    ((n * planes + plane) * board_size + row) * board_size + col
}

/// Output board size of a convolution over `upstream_board_size`.
///
/// Padding keeps the board size; otherwise the board shrinks by `filter_size - 1`.
#[inline]
pub fn output_board_size(upstream_board_size: usize, filter_size: usize, pad_zeros: bool) -> usize {
    if pad_zeros {
        upstream_board_size
    } else {
        upstream_board_size + 1 - filter_size
    }
}

/// Geometry of one convolutional layer for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch_size: usize,
    pub upstream_planes: usize,
    pub upstream_board_size: usize,
    pub planes: usize,
    pub filter_size: usize,
    pub pad_zeros: bool,
}

impl ConvGeometry {
    pub fn board_size(&self) -> usize {
        output_board_size(self.upstream_board_size, self.filter_size, self.pad_zeros)
    }

    /// Offset between output and upstream coordinates: half the filter when padding.
    pub fn margin(&self) -> usize {
        if self.pad_zeros {
            self.filter_size / 2
        } else {
            0
        }
    }

    #[inline]
    pub fn weight_index(
        &self,
        out_plane: usize,
        upstream_plane: usize,
        filter_row: usize,
        filter_col: usize,
    ) -> usize {
        ((out_plane * self.upstream_planes + upstream_plane) * self.filter_size + filter_row)
            * self.filter_size
            + filter_col
    }

    #[inline]
    pub fn result_index(&self, n: usize, plane: usize, row: usize, col: usize) -> usize {
        result_index(self.planes, self.board_size(), n, plane, row, col)
    }

    #[inline]
    pub fn upstream_index(&self, n: usize, plane: usize, row: usize, col: usize) -> usize {
        result_index(self.upstream_planes, self.upstream_board_size, n, plane, row, col)
    }

    pub fn weights_size(&self) -> usize {
        self.planes * self.upstream_planes * self.filter_size * self.filter_size
    }

    pub fn results_size(&self) -> usize {
        let board_size = self.board_size();
        self.batch_size * self.planes * board_size * board_size
    }

    pub fn upstream_results_size(&self) -> usize {
        self.batch_size * self.upstream_planes * self.upstream_board_size * self.upstream_board_size
    }

    /// Inverse of [`weight_index`](Self::weight_index).
    pub fn split_weight_index(&self, index: usize) -> (usize, usize, usize, usize) {
        let filter_col = index % self.filter_size;
        let filter_row = (index / self.filter_size) % self.filter_size;
        let rest = index / (self.filter_size * self.filter_size);
        (rest / self.upstream_planes, rest % self.upstream_planes, filter_row, filter_col)
    }

    /// Splits a flat index into `(n, plane, row, col)` for a batch with the given shape.
    pub fn split_result_index(
        planes: usize,
        board_size: usize,
        index: usize,
    ) -> (usize, usize, usize, usize) {
        let col = index % board_size;
        let row = (index / board_size) % board_size;
        let rest = index / (board_size * board_size);
        (rest / planes, rest % planes, row, col)
    }
}
