//! Stack scan planning.
//!
//! Turns an [`AcquireStack`] request into the concrete list of stage
//! positions a volumetric acquisition visits. Planning happens once, up
//! front, against the clamped travel bounds; the acquisition task then only
//! iterates.

use crate::error::{AppResult, ScopeError};
use crate::signals::{AcquireStack, HardwareDimensions, Vector3};

/// Planned slice positions of one stack acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct StackPlan {
    /// Clamped scan start.
    pub start: Vector3,
    /// Clamped scan end.
    pub end: Vector3,
    /// Number of slices, always >= 1.
    pub steps: u32,
    step_vec: Vector3,
}

impl StackPlan {
    /// Plans a scan from `request` within `dims`.
    ///
    /// Both endpoints are clamped into the travel bounds first, then the step
    /// count is derived from the clamped distance. A degenerate scan (both
    /// endpoints equal, or a step size longer than the scan) still yields one
    /// slice at the start position.
    pub fn new(request: &AcquireStack, dims: &HardwareDimensions) -> AppResult<Self> {
        if request.step_size <= 0.0 || !request.step_size.is_finite() {
            return Err(ScopeError::Hardware(format!(
                "stack step size must be positive, got {}",
                request.step_size
            )));
        }

        let start = dims.coerce_position(request.start_position);
        let end = dims.coerce_position(request.end_position);
        let span = end - start;
        let steps = (span.length() / request.step_size).round().max(1.0) as u32;

        // direction scaled so that position(steps - 1) lands on `end`
        let step_vec = if steps > 1 {
            span * (1.0 / (steps - 1) as f32)
        } else {
            Vector3::default()
        };

        Ok(Self {
            start,
            end,
            steps,
            step_vec,
        })
    }

    /// Stage position of slice `index`.
    pub fn position(&self, index: u32) -> Vector3 {
        self.start + self.step_vec * index as f32
    }
}
