// Library exports for testing and reuse

pub mod error;
pub mod io;
pub mod merge;
pub mod predict;
pub mod tiling;

// Re-export commonly used types
pub use error::{Result, SliderError};
pub use io::{InputRaster, OutputSink, RasterMetadata};
pub use merge::{MergeAccumulator, MergeStrategy};
pub use predict::{
    slider_predict, BoxError, NoPreprocess, Preprocess, SliderConfig, TileModel, TilePrediction,
};
pub use tiling::{validate_block_overlap, Size2, TileGrid, TileRect};
