//! Hardware control layer.
//!
//! [`MicroscopeHardware`] is the uniform contract every consumer programs
//! against, whether the microscope is in-process or behind the network bridge.
//! [`backend::MicroscopeBackend`] is the much smaller device-level trait a
//! concrete microscope implements; [`agent::MicroscopeAgent`] lifts a backend
//! to the full contract by running it behind a command loop.

pub mod ablation;
pub mod agent;
pub mod backend;
pub mod demo;
pub mod file;
pub mod stack;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::AppResult;
use crate::signals::{
    AblationPoint, AcquireStack, HardwareDimensions, MicroscopeStatus, Vector3,
};

/// Readiness gate returned by [`MicroscopeHardware::sync`].
///
/// Resolves with `Ok(())` once the hardware has reached an idle state, or
/// with an error when the hardware failed or shut down while the caller was
/// waiting. Dropping the gate abandons the wait.
pub type SyncGate = oneshot::Receiver<AppResult<()>>;

/// Uniform control surface of a microscope.
///
/// Commands are applied asynchronously; acceptance does not mean completion.
/// Commands invalid in the current state are logged and ignored rather than
/// failed, so a controller may always fire-and-forget. Observed state is
/// available synchronously from the last received snapshot.
#[async_trait]
pub trait MicroscopeHardware: Send + Sync {
    /// Last observed status snapshot.
    fn status(&self) -> MicroscopeStatus;

    /// Last observed hardware envelope.
    fn hardware_dimensions(&self) -> HardwareDimensions;

    /// Requests a stage move to `target`. Out-of-bounds targets are clamped.
    async fn move_stage(&self, target: Vector3) -> AppResult<()>;

    /// Requests continuous free-run capture.
    async fn go_live(&self) -> AppResult<()>;

    /// Best-effort halt of whatever is in flight. Never fails on a closed
    /// peer; a stopped microscope is already stopped.
    async fn stop(&self) -> AppResult<()>;

    /// Requests a single capture at the current stage position.
    async fn snap_slice(&self) -> AppResult<()>;

    /// Requests a volumetric scan.
    async fn acquire_stack(&self, request: AcquireStack) -> AppResult<()>;

    /// Requests a point-ablation run.
    async fn ablate_points(&self, points: Vec<AblationPoint>) -> AppResult<()>;

    /// Forwards an opaque payload to the device backend.
    async fn device_specific(&self, data: Vec<u8>) -> AppResult<()>;

    /// Returns a gate that resolves once the hardware is idle.
    async fn sync(&self) -> AppResult<SyncGate>;

    /// Releases hardware resources. Idempotent; terminal.
    async fn shutdown(&self) -> AppResult<()>;
}
