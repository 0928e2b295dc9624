use crate::error::{Result, SliderError};
use crate::tiling::TileRect;
use log::debug;
use ndarray::{Array2, ArrayView2};
use std::collections::HashMap;
use std::str::FromStr;

/// Policy for resolving multiple tile predictions covering the same pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// The first tile (row-major traversal order) to touch a pixel wins.
    KeepFirst,
    /// The last tile to touch a pixel overwrites earlier labels.
    #[default]
    KeepLast,
    /// Each covering tile casts one vote; most votes win, ties break to the
    /// smallest class index.
    Vote,
}

impl FromStr for MergeStrategy {
    type Err = SliderError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "keep_first" => Ok(Self::KeepFirst),
            "keep_last" => Ok(Self::KeepLast),
            "vote" => Ok(Self::Vote),
            _ => Err(SliderError::UnknownMergeStrategy(name.to_string())),
        }
    }
}

/// Per-pixel vote state. Pixels covered by a single tile so far stay in the
/// scalar form; a second distinct label promotes the cell to a count map.
#[derive(Debug, Clone)]
enum VoteCell {
    Empty,
    Single { label: u32, count: u32 },
    Mixed(HashMap<u32, u32>),
}

impl VoteCell {
    fn cast(&mut self, label: u32) {
        match self {
            VoteCell::Empty => {
                *self = VoteCell::Single { label, count: 1 };
            }
            VoteCell::Single {
                label: existing,
                count,
            } => {
                if *existing == label {
                    *count += 1;
                } else {
                    let mut counts = HashMap::with_capacity(2);
                    counts.insert(*existing, *count);
                    counts.insert(label, 1);
                    *self = VoteCell::Mixed(counts);
                }
            }
            VoteCell::Mixed(counts) => {
                *counts.entry(label).or_insert(0) += 1;
            }
        }
    }

    /// Winning label; ties break to the smallest class index.
    fn winner(&self) -> u32 {
        match self {
            VoteCell::Empty => 0,
            VoteCell::Single { label, .. } => *label,
            VoteCell::Mixed(counts) => {
                let mut best_label = 0u32;
                let mut best_count = 0u32;
                for (&label, &count) in counts {
                    if count > best_count || (count == best_count && label < best_label) {
                        best_label = label;
                        best_count = count;
                    }
                }
                best_label
            }
        }
    }
}

enum AccumState {
    KeepFirst {
        labels: Array2<u32>,
        written: Array2<bool>,
    },
    KeepLast {
        labels: Array2<u32>,
    },
    Vote {
        cells: Vec<VoteCell>,
    },
}

/// Reconciles overlapping tile predictions into one label per pixel.
///
/// `ingest` must be called in tile traversal order; `KeepFirst` and
/// `KeepLast` are defined relative to that order.
pub struct MergeAccumulator {
    width: usize,
    height: usize,
    state: AccumState,
}

impl MergeAccumulator {
    pub fn new(width: usize, height: usize, strategy: MergeStrategy) -> Self {
        let state = match strategy {
            MergeStrategy::KeepFirst => AccumState::KeepFirst {
                labels: Array2::zeros((height, width)),
                written: Array2::from_elem((height, width), false),
            },
            MergeStrategy::KeepLast => AccumState::KeepLast {
                labels: Array2::zeros((height, width)),
            },
            MergeStrategy::Vote => AccumState::Vote {
                cells: vec![VoteCell::Empty; width * height],
            },
        };
        Self {
            width,
            height,
            state,
        }
    }

    fn extent(&self) -> TileRect {
        TileRect::new(0, 0, self.width, self.height)
    }

    /// Apply one tile's labels over the intersection of `rect` with the
    /// backing extent. `labels` must have the rect's shape.
    pub fn ingest(&mut self, rect: &TileRect, labels: ArrayView2<u32>) -> Result<()> {
        let (got_height, got_width) = labels.dim();
        if got_height != rect.height() || got_width != rect.width() {
            return Err(SliderError::LabelShapeMismatch {
                expected_width: rect.width(),
                expected_height: rect.height(),
                got_width,
                got_height,
            });
        }

        let clipped = match rect.intersect(&self.extent()) {
            Some(clipped) => clipped,
            None => {
                debug!("Tile at ({}, {}) is entirely outside the extent", rect.x0, rect.y0);
                return Ok(());
            }
        };

        for y in clipped.y0..clipped.y1 {
            for x in clipped.x0..clipped.x1 {
                let label = labels[[y - rect.y0, x - rect.x0]];
                match &mut self.state {
                    AccumState::KeepFirst { labels, written } => {
                        if !written[[y, x]] {
                            labels[[y, x]] = label;
                            written[[y, x]] = true;
                        }
                    }
                    AccumState::KeepLast { labels } => {
                        labels[[y, x]] = label;
                    }
                    AccumState::Vote { cells } => {
                        cells[y * self.width + x].cast(label);
                    }
                }
            }
        }
        Ok(())
    }

    /// Materialize final labels for `rect` (clipped to the extent). Callable
    /// per row-block or once for the whole extent.
    pub fn finalize(&self, rect: &TileRect) -> Array2<u32> {
        let clipped = match rect.intersect(&self.extent()) {
            Some(clipped) => clipped,
            None => return Array2::zeros((0, 0)),
        };

        let mut out = Array2::zeros((clipped.height(), clipped.width()));
        for y in clipped.y0..clipped.y1 {
            for x in clipped.x0..clipped.x1 {
                out[[y - clipped.y0, x - clipped.x0]] = match &self.state {
                    AccumState::KeepFirst { labels, .. } => labels[[y, x]],
                    AccumState::KeepLast { labels } => labels[[y, x]],
                    AccumState::Vote { cells } => cells[y * self.width + x].winner(),
                };
            }
        }
        out
    }

    /// Materialize the whole extent.
    pub fn finalize_all(&self) -> Array2<u32> {
        self.finalize(&self.extent())
    }
}
