//! File-backed microscope backend.
//!
//! Replays a previously recorded raw volume from disk: the file is one
//! z-ordered sequence of planes matching the configured [`ImageMeta`], mapped
//! into memory so captures are copy-only. Useful for driving downstream
//! consumers with real data during development.
//!
//! Free-run capture is not supported; the data is static.

use async_trait::async_trait;
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::config::Settings;
use crate::error::{AppResult, ScopeError};
use crate::hardware::backend::{sample_window, MicroscopeBackend};
use crate::signals::{HardwareDimensions, ImageMeta, Vector3};

/// Backend serving captures from a memory-mapped raw volume file.
#[derive(Debug)]
pub struct FileBackend {
    dims: HardwareDimensions,
    map: Mmap,
    planes: usize,
    closed: bool,
}

impl FileBackend {
    /// Maps `path` as a raw volume with the geometry of `meta`.
    ///
    /// The file length must be a whole number of planes. The z travel range
    /// is derived from the number of planes in the file; x/y bounds come from
    /// the configured stage limits.
    #[allow(unsafe_code)]
    pub fn open(path: &Path, meta: ImageMeta, settings: &Settings) -> AppResult<Self> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only and lives as long as the backend; the
        // file is expected to stay unmodified while mapped.
        let map = unsafe { Mmap::map(&file)? };

        let plane_size = meta.byte_size();
        if plane_size == 0 || map.len() % plane_size != 0 {
            return Err(ScopeError::Hardware(format!(
                "volume file {} is not a whole number of {}-byte planes",
                path.display(),
                plane_size
            )));
        }
        let planes = map.len() / plane_size;
        if planes == 0 {
            return Err(ScopeError::Hardware(format!(
                "volume file {} is empty",
                path.display()
            )));
        }

        let stage_min = settings.stage.min;
        let stage_max = Vector3::new(
            settings.stage.max.x,
            settings.stage.max.y,
            stage_min.z + (planes as f32 - 1.0) * meta.vertex_size.z,
        );
        let dims = HardwareDimensions {
            stage_min,
            stage_max,
            meta,
        };

        Ok(Self {
            dims,
            map,
            planes,
            closed: false,
        })
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(ScopeError::HardwareClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl MicroscopeBackend for FileBackend {
    fn dimensions(&self) -> HardwareDimensions {
        self.dims.clone()
    }

    fn initial_position(&self) -> Vector3 {
        self.dims.stage_min
    }

    async fn move_stage(&mut self, target: Vector3) -> AppResult<Vector3> {
        self.ensure_open()?;
        Ok(target.clamp(self.dims.stage_min, self.dims.stage_max))
    }

    async fn capture(&mut self, at: Vector3) -> AppResult<Bytes> {
        self.ensure_open()?;
        let plane =
            ((at.z - self.dims.stage_min.z) / self.dims.meta.vertex_size.z).round() as i64;
        let plane = plane.clamp(0, self.planes as i64 - 1);
        Ok(sample_window(&self.map, plane, self.dims.meta.byte_size()))
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}
