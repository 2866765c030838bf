//! Simulated microscope backend.
//!
//! Serves captures out of a procedurally generated volume so the full
//! agent/bridge path can run without hardware attached. The volume is seeded
//! deterministically, which keeps captures reproducible across runs.

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Settings;
use crate::error::{AppResult, ScopeError};
use crate::hardware::backend::{sample_window, MicroscopeBackend};
use crate::signals::{HardwareDimensions, ImageMeta, NumericType, Vector3};

const IMAGE_SIDE: u32 = 50;
const BLOB_COUNT: usize = 12;

/// Backend producing synthetic image data.
pub struct DemoBackend {
    dims: HardwareDimensions,
    volume: Vec<u8>,
    planes: usize,
    closed: bool,
}

impl DemoBackend {
    /// Builds a demo microscope within the configured stage bounds.
    pub fn new(settings: &Settings) -> Self {
        Self::with_seed(settings, 7)
    }

    /// Builds a demo microscope with an explicit volume seed.
    pub fn with_seed(settings: &Settings, seed: u64) -> Self {
        let meta = ImageMeta {
            width: IMAGE_SIDE,
            height: IMAGE_SIDE,
            vertex_size: Vector3::new(1.0, 1.0, 2.0),
            numeric_type: NumericType::Int8,
        };
        let dims = HardwareDimensions {
            stage_min: settings.stage.min,
            stage_max: settings.stage.max,
            meta,
        };

        let z_span = dims.stage_max.z - dims.stage_min.z;
        let planes = (z_span / dims.meta.vertex_size.z).floor() as usize + 1;
        let volume = generate_volume(planes, IMAGE_SIDE as usize, seed);

        Self {
            dims,
            volume,
            planes,
            closed: false,
        }
    }

    fn plane_of(&self, at: Vector3) -> i64 {
        ((at.z - self.dims.stage_min.z) / self.dims.meta.vertex_size.z).round() as i64
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(ScopeError::HardwareClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl MicroscopeBackend for DemoBackend {
    fn dimensions(&self) -> HardwareDimensions {
        self.dims.clone()
    }

    fn initial_position(&self) -> Vector3 {
        Vector3::default()
    }

    async fn move_stage(&mut self, target: Vector3) -> AppResult<Vector3> {
        self.ensure_open()?;
        Ok(target.clamp(self.dims.stage_min, self.dims.stage_max))
    }

    async fn capture(&mut self, at: Vector3) -> AppResult<Bytes> {
        self.ensure_open()?;
        let plane = self.plane_of(at).clamp(0, self.planes as i64 - 1);
        Ok(sample_window(
            &self.volume,
            plane,
            self.dims.meta.byte_size(),
        ))
    }

    fn supports_live(&self) -> bool {
        true
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Fills a volume with background noise and a handful of bright spheres.
fn generate_volume(planes: usize, side: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut volume: Vec<u8> = (0..planes * side * side)
        .map(|_| rng.gen_range(0..16))
        .collect();

    for _ in 0..BLOB_COUNT {
        let cx = rng.gen_range(0..side) as i64;
        let cy = rng.gen_range(0..side) as i64;
        let cz = rng.gen_range(0..planes) as i64;
        let radius = rng.gen_range(3..10) as i64;
        let brightness: u8 = rng.gen_range(128..=255);

        for z in (cz - radius).max(0)..(cz + radius).min(planes as i64) {
            for y in (cy - radius).max(0)..(cy + radius).min(side as i64) {
                for x in (cx - radius).max(0)..(cx + radius).min(side as i64) {
                    let d2 = (x - cx).pow(2) + (y - cy).pow(2) + (z - cz).pow(2);
                    if d2 <= radius.pow(2) {
                        let idx = (z as usize * side + y as usize) * side + x as usize;
                        volume[idx] = volume[idx].max(brightness);
                    }
                }
            }
        }
    }
    volume
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_have_the_advertised_size() {
        let mut backend = DemoBackend::new(&Settings::default());
        let meta_size = backend.dimensions().meta.byte_size();
        let image = backend.capture(Vector3::default()).await.unwrap();
        assert_eq!(image.len(), meta_size);
    }

    #[tokio::test]
    async fn captures_are_deterministic_per_seed() {
        let settings = Settings::default();
        let mut a = DemoBackend::with_seed(&settings, 42);
        let mut b = DemoBackend::with_seed(&settings, 42);
        let at = Vector3::new(0.0, 0.0, 10.0);
        assert_eq!(a.capture(at).await.unwrap(), b.capture(at).await.unwrap());
    }

    #[tokio::test]
    async fn different_planes_yield_different_images() {
        let mut backend = DemoBackend::new(&Settings::default());
        let near = backend.capture(Vector3::new(0.0, 0.0, -90.0)).await.unwrap();
        let far = backend.capture(Vector3::new(0.0, 0.0, 90.0)).await.unwrap();
        assert_ne!(near, far);
    }

    #[tokio::test]
    async fn closed_backend_refuses_io() {
        let mut backend = DemoBackend::new(&Settings::default());
        backend.shutdown().await.unwrap();
        assert!(matches!(
            backend.capture(Vector3::default()).await,
            Err(ScopeError::HardwareClosed)
        ));
    }
}
