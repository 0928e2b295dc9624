use thiserror::Error;

#[derive(Error, Debug)]
pub enum SliderError {
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Invalid block size: {0}x{1} (both sides must be positive)")]
    InvalidBlockSize(usize, usize),

    #[error(
        "Overlap {overlap_width}x{overlap_height} must be strictly smaller than \
         block size {block_width}x{block_height} on both axes"
    )]
    OverlapTooLarge {
        block_width: usize,
        block_height: usize,
        overlap_width: usize,
        overlap_height: usize,
    },

    #[error("Input raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("No input rasters given")]
    NoInputs,

    #[error("Input rasters have mismatched extents: {0}x{1} vs {2}x{3}")]
    ExtentMismatch(usize, usize, usize, usize),

    #[error("Unknown merge strategy: {0:?} (expected keep_first, keep_last or vote)")]
    UnknownMergeStrategy(String),

    #[error("Label buffer is {got_height}x{got_width}, expected {expected_height}x{expected_width}")]
    LabelShapeMismatch {
        expected_width: usize,
        expected_height: usize,
        got_width: usize,
        got_height: usize,
    },

    #[error("Preprocessing failed on tile at ({x}, {y}): {source}")]
    Preprocess {
        x: usize,
        y: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Inference failed on tile at ({x}, {y}): {source}")]
    Inference {
        x: usize,
        y: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SliderError>;
