//! Signal and state model of the microscope core.
//!
//! Discriminated value types describing hardware state, image geometry and
//! acquired data. Everything in this module is pure data: the hardware agent
//! produces these values, the network bridge moves them across the process
//! boundary, consumers interpret them. No behavior lives here beyond small
//! geometry helpers.
//!
//! # Signal Flow
//!
//! ```text
//! MicroscopeAgent --[MicroscopeSignal]--> bounded mpsc ---> local consumer / bridge
//! Remote client  --[MicroscopeCommand]--> bridge ---------> hardware contract
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Geometry
// =============================================================================

/// A position or extent in stage space (micrometers).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
}

impl Vector3 {
    /// Creates a vector from its components.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Creates a vector with all components set to `v`.
    pub fn splat(v: f32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Euclidean length.
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Clamps each component independently into `[min, max]`.
    pub fn clamp(self, min: Vector3, max: Vector3) -> Vector3 {
        Vector3 {
            x: self.x.clamp(min.x, max.x),
            y: self.y.clamp(min.y, max.y),
            z: self.z.clamp(min.z, max.z),
        }
    }
}

impl Add for Vector3 {
    type Output = Vector3;
    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector3 {
    type Output = Vector3;
    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vector3 {
    type Output = Vector3;
    fn mul(self, rhs: f32) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

// =============================================================================
// Hardware state
// =============================================================================

/// Coarse operating mode of the microscope.
///
/// Transitions happen only through the operations of the hardware contract;
/// `Shutdown` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Hardware is initializing; not yet accepting commands.
    Startup,
    /// Idle, accepting commands.
    Manual,
    /// Continuous free-run capture.
    Live,
    /// A volumetric stack acquisition is running.
    Stack,
    /// A point-ablation run is in progress.
    Ablation,
    /// Hardware resources have been released. Terminal.
    Shutdown,
}

/// Pixel sample type of captured images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericType {
    /// 8-bit unsigned pixels.
    Int8,
    /// 16-bit unsigned pixels.
    Int16,
}

impl NumericType {
    /// Bytes per pixel.
    pub fn bytes(&self) -> usize {
        match self {
            NumericType::Int8 => 1,
            NumericType::Int16 => 2,
        }
    }
}

/// Geometry of captured images: pixel extent, voxel size and sample type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Stage-space extent of one voxel.
    pub vertex_size: Vector3,
    /// Pixel sample type.
    pub numeric_type: NumericType,
}

impl ImageMeta {
    /// Size of one image in bytes.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.numeric_type.bytes()
    }
}

/// Point-in-time snapshot of the hardware. Emitted atomically whenever any
/// field changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeStatus {
    /// Current operating mode.
    pub state: ServerState,
    /// Last-known (possibly clamped) stage position.
    pub stage_position: Vector3,
    /// Whether an operation is in flight.
    pub busy: bool,
}

impl MicroscopeStatus {
    /// Snapshot with a replaced stage position.
    pub fn with_position(&self, stage_position: Vector3) -> Self {
        Self {
            stage_position,
            ..self.clone()
        }
    }

    /// Snapshot with a replaced state and busy flag.
    pub fn with_state(&self, state: ServerState, busy: bool) -> Self {
        Self {
            state,
            busy,
            ..self.clone()
        }
    }
}

impl Default for MicroscopeStatus {
    fn default() -> Self {
        Self {
            state: ServerState::Startup,
            stage_position: Vector3::default(),
            busy: false,
        }
    }
}

/// Physical and geometric envelope of the hardware.
///
/// `stage_min <= stage_max` componentwise. Immutable after hardware init
/// except on backend reconfiguration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HardwareDimensions {
    /// Lower stage travel bound per axis.
    pub stage_min: Vector3,
    /// Upper stage travel bound per axis.
    pub stage_max: Vector3,
    /// Image geometry of captures.
    pub meta: ImageMeta,
}

impl HardwareDimensions {
    /// Limits a position to the stage travel bounds.
    ///
    /// Each axis is clamped independently. A warning is recorded iff the
    /// target had to be changed; the clamped value is authoritative.
    pub fn coerce_position(&self, target: Vector3) -> Vector3 {
        let safe = target.clamp(self.stage_min, self.stage_max);
        if safe != target {
            warn!(
                ?target,
                coerced = ?safe,
                "had to coerce stage target into travel limits"
            );
        }
        safe
    }
}

// =============================================================================
// Acquired data
// =============================================================================

/// One captured 2D image plus its capture context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Monotonic id, strictly increasing within one agent lifetime.
    pub id: u64,
    /// Capture timestamp.
    pub created: DateTime<Utc>,
    /// Stage position at capture time.
    pub stage_position: Vector3,
    /// Payload size in bytes.
    pub size_bytes: u32,
    /// `(stack id, step index)` when part of a stack acquisition.
    pub stack: Option<(u64, u32)>,
    /// Image geometry at capture time.
    pub meta: ImageMeta,
    /// Raw pixel buffer.
    #[serde(skip, default)]
    pub data: Bytes,
}

/// Descriptor of one volumetric acquisition run. Emitted exactly once per
/// acquisition, before any of its slices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Monotonic id.
    pub id: u64,
    /// Clamped scan start position.
    pub from: Vector3,
    /// Clamped scan end position.
    pub to: Vector3,
    /// Number of slices this acquisition will produce (>= 1).
    pub step_count: u32,
    /// Creation time of the descriptor.
    pub created: DateTime<Utc>,
    /// Image geometry of the slices.
    pub meta: ImageMeta,
}

/// Outcome of a point-ablation request.
///
/// `per_point_time_ms.len() == points_processed` always holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AblationResults {
    /// Number of points that were actually processed.
    pub points_processed: u32,
    /// Wall-clock duration of the whole run in milliseconds.
    pub total_time_ms: u32,
    /// Per-point duration in milliseconds, in execution order.
    pub per_point_time_ms: Vec<u32>,
}

impl AblationResults {
    /// Mean per-point duration in milliseconds, `None` for an empty run.
    pub fn mean_ms(&self) -> Option<u32> {
        if self.per_point_time_ms.is_empty() {
            return None;
        }
        Some(self.per_point_time_ms.iter().sum::<u32>() / self.per_point_time_ms.len() as u32)
    }
}

// =============================================================================
// Wire envelopes
// =============================================================================

/// Server-to-client signal union: everything the hardware agent can emit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MicroscopeSignal {
    /// Status snapshot.
    Status(MicroscopeStatus),
    /// Hardware envelope.
    Dimensions(HardwareDimensions),
    /// One captured image.
    Slice(Slice),
    /// Stack acquisition descriptor.
    Stack(Stack),
    /// Ablation outcome.
    AblationResults(AblationResults),
}

/// Descriptor of a volumetric scan request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquireStack {
    /// Scan start; clamped into the travel bounds before use.
    pub start_position: Vector3,
    /// Scan end; clamped into the travel bounds before use.
    pub end_position: Vector3,
    /// Stage distance between two consecutive slices. Must be positive.
    pub step_size: f32,
}

/// One point of an ablation path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AblationPoint {
    /// Stage position of the point.
    pub position: Vector3,
    /// How long the laser dwells on the point.
    pub dwell_time: Duration,
    /// Switch the laser on when reaching this point.
    pub laser_on: bool,
    /// Switch the laser off after this point.
    pub laser_off: bool,
    /// Laser power applied at this point.
    pub laser_power: f32,
    /// Whether stage travel time counts against the dwell time.
    pub count_move_time: bool,
}

/// Client-to-server command union: everything a controller may request.
///
/// `Sync` is answered only once the hardware has returned to an idle state;
/// all other commands are acknowledged on receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MicroscopeCommand {
    /// Move the stage to a target position.
    MoveStage(Vector3),
    /// Switch to continuous free-run capture.
    GoLive,
    /// Best-effort halt of any in-flight operation.
    Stop,
    /// Capture a single image at the current position.
    SnapSlice,
    /// Start a volumetric scan.
    AcquireStack(AcquireStack),
    /// Run a point-ablation path.
    AblatePoints(Vec<AblationPoint>),
    /// Release hardware resources. Terminal.
    Shutdown,
    /// Escape hatch passed through unmodified to the backend.
    DeviceSpecific(Vec<u8>),
    /// Wait until the hardware is idle.
    Sync,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ImageMeta {
        ImageMeta {
            width: 50,
            height: 50,
            vertex_size: Vector3::splat(1.0),
            numeric_type: NumericType::Int16,
        }
    }

    #[test]
    fn byte_size_accounts_for_numeric_type() {
        assert_eq!(meta().byte_size(), 50 * 50 * 2);
        let mut m = meta();
        m.numeric_type = NumericType::Int8;
        assert_eq!(m.byte_size(), 50 * 50);
    }

    #[test]
    fn coerce_clamps_componentwise() {
        let dims = HardwareDimensions {
            stage_min: Vector3::splat(-100.0),
            stage_max: Vector3::splat(100.0),
            meta: meta(),
        };
        let coerced = dims.coerce_position(Vector3::new(-400.0, 0.0, 0.0));
        assert_eq!(coerced, Vector3::new(-100.0, 0.0, 0.0));

        // in-bounds targets pass through untouched
        let inside = Vector3::new(12.5, -99.9, 100.0);
        assert_eq!(dims.coerce_position(inside), inside);
    }

    #[test]
    fn ablation_results_mean() {
        let results = AblationResults {
            points_processed: 3,
            total_time_ms: 60,
            per_point_time_ms: vec![10, 20, 30],
        };
        assert_eq!(results.mean_ms(), Some(20));
        assert_eq!(
            results.per_point_time_ms.len(),
            results.points_processed as usize
        );

        let empty = AblationResults {
            points_processed: 0,
            total_time_ms: 0,
            per_point_time_ms: vec![],
        };
        assert_eq!(empty.mean_ms(), None);
    }
}
