use crate::error::{Result, SliderError};
use crate::io::{InputRaster, OutputSink};
use crate::merge::{MergeAccumulator, MergeStrategy};
use crate::tiling::{validate_block_overlap, Size2, TileGrid, TileRect};
use log::{debug, info};
use ndarray::{s, Array2, Array3};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What the external model returns for one tile. `scores` (per-class score
/// maps) are accepted but not consumed by the merge stage.
pub struct TilePrediction {
    pub label_map: Array2<u32>,
    pub scores: Option<Array3<f32>>,
}

impl TilePrediction {
    pub fn from_labels(label_map: Array2<u32>) -> Self {
        Self {
            label_map,
            scores: None,
        }
    }
}

/// Pixel-array transform applied to each raw tile before inference.
pub trait Preprocess: Sync {
    fn apply(&self, raw: Array3<f32>) -> std::result::Result<Array3<f32>, BoxError>;
}

impl<F> Preprocess for F
where
    F: Fn(Array3<f32>) -> std::result::Result<Array3<f32>, BoxError> + Sync,
{
    fn apply(&self, raw: Array3<f32>) -> std::result::Result<Array3<f32>, BoxError> {
        self(raw)
    }
}

/// Identity pipeline for models that consume raw pixel values.
pub struct NoPreprocess;

impl Preprocess for NoPreprocess {
    fn apply(&self, raw: Array3<f32>) -> std::result::Result<Array3<f32>, BoxError> {
        Ok(raw)
    }
}

/// The external inference function.
pub trait TileModel: Sync {
    /// One input per opened raster (two for bi-temporal change detection),
    /// each shaped `(bands, block_height, block_width)`. Edge tiles arrive
    /// padded to the full block size.
    fn infer(&self, inputs: &[Array3<f32>]) -> std::result::Result<TilePrediction, BoxError>;
}

impl<F> TileModel for F
where
    F: Fn(&[Array3<f32>]) -> std::result::Result<TilePrediction, BoxError> + Sync,
{
    fn infer(&self, inputs: &[Array3<f32>]) -> std::result::Result<TilePrediction, BoxError> {
        self(inputs)
    }
}

#[derive(Clone)]
pub struct SliderConfig {
    pub block_size: Size2,
    pub overlap: Size2,
    pub merge_strategy: MergeStrategy,
    /// Fill value for window pixels read outside the raster extent.
    pub pad_value: f32,
    /// Pre-fill / nodata value of the output label raster.
    pub output_nodata: u32,
    /// Number of tiles whose preprocessing and inference run concurrently.
    /// 1 means fully sequential. Merge order stays row-major either way.
    pub batch_size: usize,
    /// GTiff creation options for the output (e.g. "TILED=YES").
    pub creation_options: Vec<String>,
    /// Checked between batches; setting it aborts the run with `Cancelled`.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SliderConfig {
    pub fn new(block_size: impl Into<Size2>, overlap: impl Into<Size2>) -> Self {
        Self {
            block_size: block_size.into(),
            overlap: overlap.into(),
            merge_strategy: MergeStrategy::default(),
            pad_value: 0.0,
            output_nodata: 255,
            batch_size: 1,
            creation_options: Vec::new(),
            cancel: None,
        }
    }
}

/// Run sliding-window inference over one or more co-registered rasters and
/// write the merged label map as a georeferenced GTiff.
///
/// `output` may be an existing directory (the file is then named after the
/// first input, matching the usual save-dir convention) or an output file
/// path. Returns the path of the written raster.
pub fn slider_predict<P: Preprocess, M: TileModel>(
    input_paths: &[&Path],
    output: &Path,
    config: &SliderConfig,
    preprocess: &P,
    model: &M,
) -> Result<PathBuf> {
    // Configuration is rejected before any filesystem access
    if input_paths.is_empty() {
        return Err(SliderError::NoInputs);
    }
    validate_block_overlap(config.block_size, config.overlap)?;

    let inputs = input_paths
        .iter()
        .map(|path| InputRaster::open(path))
        .collect::<Result<Vec<_>>>()?;

    let first_meta = inputs[0].metadata().clone();
    for input in &inputs[1..] {
        let meta = input.metadata();
        if meta.width != first_meta.width || meta.height != first_meta.height {
            return Err(SliderError::ExtentMismatch(
                first_meta.width,
                first_meta.height,
                meta.width,
                meta.height,
            ));
        }
    }

    let grid = TileGrid::new(
        first_meta.width,
        first_meta.height,
        config.block_size,
        config.overlap,
    )?;

    info!(
        "Slider predict: {} input(s), {}x{} pixels, block {}x{}, overlap {}x{}, {} tiles, strategy {:?}",
        inputs.len(),
        first_meta.width,
        first_meta.height,
        config.block_size.width,
        config.block_size.height,
        config.overlap.width,
        config.overlap.height,
        grid.total_tiles,
        config.merge_strategy
    );

    let output_path = resolve_output_path(output, input_paths[0])?;
    let mut sink = OutputSink::new(
        output_path,
        first_meta.width,
        first_meta.height,
        config.output_nodata,
        config.creation_options.clone(),
    );
    let mut accumulator =
        MergeAccumulator::new(first_meta.width, first_meta.height, config.merge_strategy);

    let batch_size = config.batch_size.max(1);
    let tiles: Vec<(usize, TileRect)> = grid.iter().collect();

    for batch in tiles.chunks(batch_size) {
        check_cancel(config)?;

        // Windows are read on this thread (GDAL dataset handles stay
        // single-threaded); preprocessing and inference fan out per batch.
        let mut raw_batch = Vec::with_capacity(batch.len());
        for &(idx, rect) in batch {
            let read_rect = TileRect::new(
                rect.x0,
                rect.y0,
                rect.x0 + config.block_size.width,
                rect.y0 + config.block_size.height,
            );
            let mut raw = Vec::with_capacity(inputs.len());
            for input in &inputs {
                raw.push(input.read_window(&read_rect, config.pad_value)?);
            }
            raw_batch.push((idx, rect, raw));
        }

        let predictions: Vec<Result<(usize, TileRect, Array2<u32>)>> = if batch.len() == 1 {
            raw_batch
                .into_iter()
                .map(|(idx, rect, raw)| run_tile(preprocess, model, idx, rect, config.block_size, raw))
                .collect()
        } else {
            raw_batch
                .into_par_iter()
                .map(|(idx, rect, raw)| run_tile(preprocess, model, idx, rect, config.block_size, raw))
                .collect()
        };

        // Ingest strictly in row-major tile order, never completion order
        for prediction in predictions {
            let (idx, rect, labels) = prediction?;
            debug!(
                "Tile {}: ({}, {}) {}x{}",
                idx,
                rect.x0,
                rect.y0,
                rect.width(),
                rect.height()
            );
            accumulator.ingest(&rect, labels.view())?;
        }
    }

    check_cancel(config)?;

    let full = TileRect::new(0, 0, first_meta.width, first_meta.height);
    let labels = accumulator.finalize(&full);
    sink.write_window(&full, &labels)?;
    let written = sink.finalize(&first_meta)?;

    info!("Processed {} tiles", grid.total_tiles);
    Ok(written)
}

/// Preprocess and infer one tile, cropping the prediction back to the
/// clamped tile rectangle.
fn run_tile<P: Preprocess, M: TileModel>(
    preprocess: &P,
    model: &M,
    idx: usize,
    rect: TileRect,
    block: Size2,
    raw: Vec<Array3<f32>>,
) -> Result<(usize, TileRect, Array2<u32>)> {
    let mut model_inputs = Vec::with_capacity(raw.len());
    for tile in raw {
        let transformed = preprocess.apply(tile).map_err(|source| SliderError::Preprocess {
            x: rect.x0,
            y: rect.y0,
            source,
        })?;
        model_inputs.push(transformed);
    }

    let prediction = model
        .infer(&model_inputs)
        .map_err(|source| SliderError::Inference {
            x: rect.x0,
            y: rect.y0,
            source,
        })?;

    let label_map = prediction.label_map;
    let (got_height, got_width) = label_map.dim();
    let labels = if got_height == rect.height() && got_width == rect.width() {
        label_map
    } else if got_height == block.height && got_width == block.width {
        // Edge tiles are padded to full block size on read; crop the
        // prediction back to the in-extent part
        label_map.slice(s![..rect.height(), ..rect.width()]).to_owned()
    } else {
        return Err(SliderError::LabelShapeMismatch {
            expected_width: block.width,
            expected_height: block.height,
            got_width,
            got_height,
        });
    };

    Ok((idx, rect, labels))
}

fn check_cancel(config: &SliderConfig) -> Result<()> {
    if let Some(cancel) = &config.cancel {
        if cancel.load(Ordering::Relaxed) {
            return Err(SliderError::Cancelled);
        }
    }
    Ok(())
}

/// An existing directory receives the first input's file name; any other
/// path is taken as the output file itself, with parents created.
fn resolve_output_path(output: &Path, first_input: &Path) -> Result<PathBuf> {
    if output.is_dir() {
        let name = first_input.file_name().ok_or_else(|| {
            SliderError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("input path has no file name: {}", first_input.display()),
            ))
        })?;
        Ok(output.join(name))
    } else {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(output.to_path_buf())
    }
}
