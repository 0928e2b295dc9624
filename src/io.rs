use crate::error::{Result, SliderError};
use crate::tiling::TileRect;
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, RasterBand};
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use ndarray::{s, Array2, Array3};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub geotransform: [f64; 6],
    pub projection: String,
    pub nodata: Option<f64>,
}

/// Extract metadata from a dataset without reading any pixels
fn extract_metadata(dataset: &Dataset) -> Result<RasterMetadata> {
    let rasterband: RasterBand = dataset.rasterband(1)?;

    let width = rasterband.x_size() as usize;
    let height = rasterband.y_size() as usize;

    if width == 0 || height == 0 {
        return Err(SliderError::InvalidDimensions(width, height));
    }

    let nodata = rasterband.no_data_value();
    let geotransform = dataset.geo_transform()?;
    let band_count = dataset.raster_count() as usize;

    Ok(RasterMetadata {
        width,
        height,
        band_count,
        geotransform,
        projection: dataset.projection(),
        nodata,
    })
}

/// Read-only handle on one input raster. Reads are side-effect-free and may
/// be issued repeatedly for the same window.
pub struct InputRaster {
    dataset: Dataset,
    metadata: RasterMetadata,
}

impl InputRaster {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening input raster: {}", path.display());
        let dataset = Dataset::open(path)?;
        let metadata = extract_metadata(&dataset)?;

        debug!(
            "Raster dimensions: {}x{}, {} bands",
            metadata.width, metadata.height, metadata.band_count
        );

        Ok(Self { dataset, metadata })
    }

    pub fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    /// Read all bands of a window as `(bands, height, width)` f32.
    ///
    /// The window may fall partially or fully outside the raster extent;
    /// out-of-range pixels are filled with `fill`, so oversized edge requests
    /// always come back at the requested shape.
    pub fn read_window(&self, rect: &TileRect, fill: f32) -> Result<Array3<f32>> {
        let bands = self.metadata.band_count;
        let mut out = Array3::from_elem((bands, rect.height(), rect.width()), fill);

        let in_bounds = TileRect::new(0, 0, self.metadata.width, self.metadata.height);
        let read = match rect.intersect(&in_bounds) {
            Some(read) => read,
            None => {
                debug!(
                    "Window at ({}, {}) lies entirely outside the raster",
                    rect.x0, rect.y0
                );
                return Ok(out);
            }
        };

        let read_width = read.width();
        let read_height = read.height();

        debug!(
            "Reading window: offset=({},{}), size=({},{})",
            read.x0, read.y0, read_width, read_height
        );

        for band_idx in 0..bands {
            let rasterband = self.dataset.rasterband(band_idx + 1)?;
            let buffer = rasterband.read_as::<f32>(
                (read.x0 as isize, read.y0 as isize),
                (read_width, read_height),
                (read_width, read_height),
                None,
            )?;
            let data_vec: Vec<f32> = buffer.into_iter().collect();
            let plane = Array2::from_shape_vec((read_height, read_width), data_vec)?;

            let y_off = read.y0 - rect.y0;
            let x_off = read.x0 - rect.x0;
            out.slice_mut(s![
                band_idx,
                y_off..y_off + read_height,
                x_off..x_off + read_width
            ])
            .assign(&plane);
        }

        Ok(out)
    }
}

/// Single-band u32 label raster, sized to the full output extent.
///
/// The dataset is created lazily on first write, pre-filled with `nodata`.
/// All writes land on a temporary sibling path; `finalize` stamps the
/// georeference and renames into place, so a failed run never leaves a
/// partial file that looks complete. Dropping an unfinalized sink removes
/// the temporary file.
pub struct OutputSink {
    final_path: PathBuf,
    tmp_path: PathBuf,
    width: usize,
    height: usize,
    nodata: u32,
    creation_options: Vec<String>,
    dataset: Option<Dataset>,
}

impl OutputSink {
    pub fn new(
        path: PathBuf,
        width: usize,
        height: usize,
        nodata: u32,
        creation_options: Vec<String>,
    ) -> Self {
        let mut tmp_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".part");
        let tmp_path = path.with_file_name(tmp_name);

        Self {
            final_path: path,
            tmp_path,
            width,
            height,
            nodata,
            creation_options,
            dataset: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    fn ensure_dataset(&mut self) -> Result<&mut Dataset> {
        if self.dataset.is_none() {
            info!("Creating output raster: {}", self.final_path.display());

            let driver = DriverManager::get_driver_by_name("GTiff")?;
            let mut dataset = if self.creation_options.is_empty() {
                driver.create_with_band_type::<u32, _>(
                    &self.tmp_path,
                    self.width,
                    self.height,
                    1,
                )?
            } else {
                let mut gdal_options = CslStringList::new();
                for opt in &self.creation_options {
                    gdal_options.add_string(opt)?;
                }
                driver.create_with_band_type_with_options::<u32, _>(
                    &self.tmp_path,
                    self.width,
                    self.height,
                    1,
                    &gdal_options,
                )?
            };

            let mut rasterband = dataset.rasterband(1)?;
            rasterband.fill(self.nodata as f64, None)?;
            rasterband.set_no_data_value(Some(self.nodata as f64))?;

            self.dataset = Some(dataset);
        }

        Ok(self.dataset.as_mut().expect("dataset was just created"))
    }

    /// Write the in-bounds intersection of `rect` with the output extent.
    pub fn write_window(&mut self, rect: &TileRect, labels: &Array2<u32>) -> Result<()> {
        let (got_height, got_width) = labels.dim();
        if got_height != rect.height() || got_width != rect.width() {
            return Err(SliderError::LabelShapeMismatch {
                expected_width: rect.width(),
                expected_height: rect.height(),
                got_width,
                got_height,
            });
        }

        let in_bounds = TileRect::new(0, 0, self.width, self.height);
        let write = match rect.intersect(&in_bounds) {
            Some(write) => write,
            None => return Ok(()),
        };

        let y_off = write.y0 - rect.y0;
        let x_off = write.x0 - rect.x0;
        let clipped = labels.slice(s![
            y_off..y_off + write.height(),
            x_off..x_off + write.width()
        ]);
        let data_vec: Vec<u32> = clipped.iter().copied().collect();

        let dataset = self.ensure_dataset()?;
        let mut rasterband = dataset.rasterband(1)?;
        let mut buffer = Buffer::new((write.width(), write.height()), data_vec);
        rasterband.write(
            (write.x0 as isize, write.y0 as isize),
            (write.width(), write.height()),
            &mut buffer,
        )?;

        debug!(
            "Wrote window at ({},{}) size {}x{}",
            write.x0,
            write.y0,
            write.width(),
            write.height()
        );

        Ok(())
    }

    /// Stamp the input's georeference onto the output, close it, and move the
    /// temporary file to the final path.
    pub fn finalize(mut self, georef: &RasterMetadata) -> Result<PathBuf> {
        {
            let dataset = self.ensure_dataset()?;
            dataset.set_geo_transform(&georef.geotransform)?;
            dataset.set_projection(&georef.projection)?;
        }

        // Close the dataset so GDAL flushes everything before the rename
        self.dataset = None;
        fs::rename(&self.tmp_path, &self.final_path)?;

        info!("Wrote output raster: {}", self.final_path.display());
        Ok(self.final_path.clone())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        // Still holding a dataset here means finalize never ran: close the
        // handle and remove the partial file.
        if let Some(dataset) = self.dataset.take() {
            drop(dataset);
            debug!("Removing partial output: {}", self.tmp_path.display());
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
