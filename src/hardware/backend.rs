//! Device-level backend trait.
//!
//! A backend is the thin adapter around one concrete microscope: it moves the
//! stage, captures images and toggles the ablation laser. Everything above it
//! (state machine, clamping, signal emission, queuing) lives in
//! [`super::agent::MicroscopeAgent`], so a backend stays small and testable.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::AppResult;
use crate::signals::{HardwareDimensions, Vector3};

/// One concrete microscope device.
///
/// Methods take `&mut self`; the owning agent serializes access. Failures are
/// reported as errors, not panics, and leave the device in a state where
/// further calls are meaningful whenever the device allows that.
#[async_trait]
pub trait MicroscopeBackend: Send + 'static {
    /// Physical and geometric envelope of the device.
    fn dimensions(&self) -> HardwareDimensions;

    /// Stage position at startup.
    fn initial_position(&self) -> Vector3;

    /// Moves the stage and returns the position actually reached.
    async fn move_stage(&mut self, target: Vector3) -> AppResult<Vector3>;

    /// Captures one image at the given stage position.
    async fn capture(&mut self, at: Vector3) -> AppResult<Bytes>;

    /// Whether the device supports continuous free-run capture.
    fn supports_live(&self) -> bool {
        false
    }

    /// Pause between two free-run captures.
    fn live_interval(&self) -> Duration {
        Duration::from_millis(200)
    }

    /// Sets the ablation laser power. Devices without a laser ignore this.
    async fn set_laser_power(&mut self, _power: f32) -> AppResult<()> {
        Ok(())
    }

    /// Opens or closes the ablation shutter. Devices without one ignore this.
    async fn ablation_shutter(&mut self, _open: bool) -> AppResult<()> {
        Ok(())
    }

    /// Handles an opaque device-specific payload. Default: ignore.
    async fn device_specific(&mut self, _data: Vec<u8>) -> AppResult<()> {
        Ok(())
    }

    /// Releases device resources. Called exactly once.
    async fn shutdown(&mut self) -> AppResult<()>;
}

/// Copies the window of a procedural or memory-mapped volume that one capture
/// covers into a fresh buffer.
///
/// `plane` addresses a z-slab of `width * height * bytes_per_px` bytes inside
/// `volume`; out-of-range planes yield a zeroed buffer so scans past the data
/// edge stay well-formed.
pub(crate) fn sample_window(
    volume: &[u8],
    plane: i64,
    plane_size: usize,
) -> Bytes {
    if plane < 0 {
        return Bytes::from(vec![0u8; plane_size]);
    }
    let offset = plane as usize * plane_size;
    if offset + plane_size > volume.len() {
        return Bytes::from(vec![0u8; plane_size]);
    }
    Bytes::copy_from_slice(&volume[offset..offset + plane_size])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_window_copies_the_addressed_plane() {
        let volume: Vec<u8> = (0..20).collect();
        let plane = sample_window(&volume, 1, 5);
        assert_eq!(&plane[..], &[5, 6, 7, 8, 9]);
    }

    #[test]
    fn out_of_range_planes_are_zeroed() {
        let volume: Vec<u8> = (0..10).collect();
        assert!(sample_window(&volume, -1, 5).iter().all(|b| *b == 0));
        assert!(sample_window(&volume, 7, 5).iter().all(|b| *b == 0));
        assert_eq!(sample_window(&volume, 7, 5).len(), 5);
    }
}
