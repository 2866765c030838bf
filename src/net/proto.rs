//! Wire bindings and domain conversions.
//!
//! Domain -> wire conversions are infallible. Wire -> domain conversions
//! return [`ScopeError::Codec`] for anything malformed (missing submessages,
//! unknown enum values, out-of-range timestamps); callers drop such messages
//! with a warning instead of tearing the connection down.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

use crate::error::ScopeError;
use crate::signals;

/// Generated protobuf/gRPC bindings.
#[allow(clippy::all, missing_docs)]
pub mod pb {
    tonic::include_proto!("microscope.v1");
}

// ---------------------------------------------------------------------------
// Geometry and enums
// ---------------------------------------------------------------------------

impl From<signals::Vector3> for pb::Vector3 {
    fn from(v: signals::Vector3) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<pb::Vector3> for signals::Vector3 {
    fn from(v: pb::Vector3) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

fn require_vec(v: Option<pb::Vector3>, field: &str) -> Result<signals::Vector3, ScopeError> {
    v.map(signals::Vector3::from)
        .ok_or_else(|| ScopeError::Codec(format!("missing vector field {field}")))
}

impl From<signals::ServerState> for pb::ServerState {
    fn from(state: signals::ServerState) -> Self {
        match state {
            signals::ServerState::Startup => pb::ServerState::Startup,
            signals::ServerState::Manual => pb::ServerState::Manual,
            signals::ServerState::Live => pb::ServerState::Live,
            signals::ServerState::Stack => pb::ServerState::Stack,
            signals::ServerState::Ablation => pb::ServerState::Ablation,
            signals::ServerState::Shutdown => pb::ServerState::Shutdown,
        }
    }
}

impl TryFrom<pb::ServerState> for signals::ServerState {
    type Error = ScopeError;

    fn try_from(state: pb::ServerState) -> Result<Self, ScopeError> {
        match state {
            pb::ServerState::Startup => Ok(signals::ServerState::Startup),
            pb::ServerState::Manual => Ok(signals::ServerState::Manual),
            pb::ServerState::Live => Ok(signals::ServerState::Live),
            pb::ServerState::Stack => Ok(signals::ServerState::Stack),
            pb::ServerState::Ablation => Ok(signals::ServerState::Ablation),
            pb::ServerState::Shutdown => Ok(signals::ServerState::Shutdown),
            pb::ServerState::Unknown => {
                Err(ScopeError::Codec("unknown server state".to_string()))
            }
        }
    }
}

impl From<signals::NumericType> for pb::NumericType {
    fn from(numeric: signals::NumericType) -> Self {
        match numeric {
            signals::NumericType::Int8 => pb::NumericType::Int8,
            signals::NumericType::Int16 => pb::NumericType::Int16,
        }
    }
}

impl TryFrom<pb::NumericType> for signals::NumericType {
    type Error = ScopeError;

    fn try_from(numeric: pb::NumericType) -> Result<Self, ScopeError> {
        match numeric {
            pb::NumericType::Int8 => Ok(signals::NumericType::Int8),
            pb::NumericType::Int16 => Ok(signals::NumericType::Int16),
            pb::NumericType::Unknown => {
                Err(ScopeError::Codec("unknown numeric type".to_string()))
            }
        }
    }
}

impl From<signals::ImageMeta> for pb::ImageMeta {
    fn from(meta: signals::ImageMeta) -> Self {
        Self {
            width: meta.width,
            height: meta.height,
            vertex_size: Some(meta.vertex_size.into()),
            numeric_type: pb::NumericType::from(meta.numeric_type) as i32,
        }
    }
}

impl TryFrom<pb::ImageMeta> for signals::ImageMeta {
    type Error = ScopeError;

    fn try_from(meta: pb::ImageMeta) -> Result<Self, ScopeError> {
        let numeric = pb::NumericType::try_from(meta.numeric_type)
            .map_err(|_| ScopeError::Codec("numeric type out of range".to_string()))?;
        Ok(Self {
            width: meta.width,
            height: meta.height,
            vertex_size: require_vec(meta.vertex_size, "vertex_size")?,
            numeric_type: numeric.try_into()?,
        })
    }
}

fn require_meta(meta: Option<pb::ImageMeta>) -> Result<signals::ImageMeta, ScopeError> {
    meta.ok_or_else(|| ScopeError::Codec("missing image meta".to_string()))?
        .try_into()
}

fn decode_timestamp(ms: i64) -> Result<DateTime<Utc>, ScopeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ScopeError::Codec(format!("timestamp {ms} out of range")))
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

impl From<signals::MicroscopeStatus> for pb::MicroscopeStatus {
    fn from(status: signals::MicroscopeStatus) -> Self {
        Self {
            state: pb::ServerState::from(status.state) as i32,
            stage_position: Some(status.stage_position.into()),
            busy: status.busy,
        }
    }
}

impl TryFrom<pb::MicroscopeStatus> for signals::MicroscopeStatus {
    type Error = ScopeError;

    fn try_from(status: pb::MicroscopeStatus) -> Result<Self, ScopeError> {
        let state = pb::ServerState::try_from(status.state)
            .map_err(|_| ScopeError::Codec("server state out of range".to_string()))?;
        Ok(Self {
            state: state.try_into()?,
            stage_position: require_vec(status.stage_position, "stage_position")?,
            busy: status.busy,
        })
    }
}

impl From<signals::HardwareDimensions> for pb::HardwareDimensions {
    fn from(dims: signals::HardwareDimensions) -> Self {
        Self {
            stage_min: Some(dims.stage_min.into()),
            stage_max: Some(dims.stage_max.into()),
            meta: Some(dims.meta.into()),
        }
    }
}

impl TryFrom<pb::HardwareDimensions> for signals::HardwareDimensions {
    type Error = ScopeError;

    fn try_from(dims: pb::HardwareDimensions) -> Result<Self, ScopeError> {
        Ok(Self {
            stage_min: require_vec(dims.stage_min, "stage_min")?,
            stage_max: require_vec(dims.stage_max, "stage_max")?,
            meta: require_meta(dims.meta)?,
        })
    }
}

impl From<signals::Slice> for pb::Slice {
    fn from(slice: signals::Slice) -> Self {
        let (stack_id, stack_step_index) = match slice.stack {
            Some((id, step)) => (id as i64, step as i32),
            None => (-1, 0),
        };
        Self {
            id: slice.id,
            created_ms: slice.created.timestamp_millis(),
            stage_position: Some(slice.stage_position.into()),
            size_bytes: slice.size_bytes,
            stack_id,
            stack_step_index,
            meta: Some(slice.meta.into()),
            data: slice.data.to_vec(),
        }
    }
}

impl TryFrom<pb::Slice> for signals::Slice {
    type Error = ScopeError;

    fn try_from(slice: pb::Slice) -> Result<Self, ScopeError> {
        let stack = if slice.stack_id < 0 {
            None
        } else {
            Some((slice.stack_id as u64, slice.stack_step_index as u32))
        };
        Ok(Self {
            id: slice.id,
            created: decode_timestamp(slice.created_ms)?,
            stage_position: require_vec(slice.stage_position, "stage_position")?,
            size_bytes: slice.size_bytes,
            stack,
            meta: require_meta(slice.meta)?,
            data: slice.data.into(),
        })
    }
}

impl From<signals::Stack> for pb::Stack {
    fn from(stack: signals::Stack) -> Self {
        Self {
            id: stack.id,
            from: Some(stack.from.into()),
            to: Some(stack.to.into()),
            step_count: stack.step_count,
            created_ms: stack.created.timestamp_millis(),
            meta: Some(stack.meta.into()),
        }
    }
}

impl TryFrom<pb::Stack> for signals::Stack {
    type Error = ScopeError;

    fn try_from(stack: pb::Stack) -> Result<Self, ScopeError> {
        Ok(Self {
            id: stack.id,
            from: require_vec(stack.from, "from")?,
            to: require_vec(stack.to, "to")?,
            step_count: stack.step_count,
            created: decode_timestamp(stack.created_ms)?,
            meta: require_meta(stack.meta)?,
        })
    }
}

impl From<signals::AblationResults> for pb::AblationResults {
    fn from(results: signals::AblationResults) -> Self {
        Self {
            points_processed: results.points_processed,
            total_time_ms: results.total_time_ms,
            per_point_time_ms: results.per_point_time_ms,
        }
    }
}

impl From<pb::AblationResults> for signals::AblationResults {
    fn from(results: pb::AblationResults) -> Self {
        Self {
            points_processed: results.points_processed,
            total_time_ms: results.total_time_ms,
            per_point_time_ms: results.per_point_time_ms,
        }
    }
}

impl From<signals::MicroscopeSignal> for pb::MicroscopeSignal {
    fn from(signal: signals::MicroscopeSignal) -> Self {
        use pb::microscope_signal::Signal;
        let signal = match signal {
            signals::MicroscopeSignal::Status(status) => Signal::Status(status.into()),
            signals::MicroscopeSignal::Dimensions(dims) => Signal::Dimensions(dims.into()),
            signals::MicroscopeSignal::Slice(slice) => Signal::Slice(slice.into()),
            signals::MicroscopeSignal::Stack(stack) => Signal::Stack(stack.into()),
            signals::MicroscopeSignal::AblationResults(results) => {
                Signal::AblationResults(results.into())
            }
        };
        Self {
            signal: Some(signal),
        }
    }
}

impl TryFrom<pb::MicroscopeSignal> for signals::MicroscopeSignal {
    type Error = ScopeError;

    fn try_from(signal: pb::MicroscopeSignal) -> Result<Self, ScopeError> {
        use pb::microscope_signal::Signal;
        match signal
            .signal
            .ok_or_else(|| ScopeError::Codec("empty signal envelope".to_string()))?
        {
            Signal::Status(status) => Ok(Self::Status(status.try_into()?)),
            Signal::Dimensions(dims) => Ok(Self::Dimensions(dims.try_into()?)),
            Signal::Slice(slice) => Ok(Self::Slice(slice.try_into()?)),
            Signal::Stack(stack) => Ok(Self::Stack(stack.try_into()?)),
            Signal::AblationResults(results) => Ok(Self::AblationResults(results.into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl From<signals::AblationPoint> for pb::AblationPoint {
    fn from(point: signals::AblationPoint) -> Self {
        Self {
            position: Some(point.position.into()),
            dwell_time_us: point.dwell_time.as_micros() as u64,
            laser_on: point.laser_on,
            laser_off: point.laser_off,
            laser_power: point.laser_power,
            count_move_time: point.count_move_time,
        }
    }
}

impl TryFrom<pb::AblationPoint> for signals::AblationPoint {
    type Error = ScopeError;

    fn try_from(point: pb::AblationPoint) -> Result<Self, ScopeError> {
        Ok(Self {
            position: require_vec(point.position, "position")?,
            dwell_time: Duration::from_micros(point.dwell_time_us),
            laser_on: point.laser_on,
            laser_off: point.laser_off,
            laser_power: point.laser_power,
            count_move_time: point.count_move_time,
        })
    }
}

impl From<signals::MicroscopeCommand> for pb::CommandRequest {
    fn from(command: signals::MicroscopeCommand) -> Self {
        use pb::command_request::Command;
        let command = match command {
            signals::MicroscopeCommand::MoveStage(target) => Command::MoveStage(pb::MoveStage {
                target: Some(target.into()),
            }),
            signals::MicroscopeCommand::GoLive => Command::GoLive(pb::GoLive {}),
            signals::MicroscopeCommand::Stop => Command::Stop(pb::Stop {}),
            signals::MicroscopeCommand::SnapSlice => Command::SnapSlice(pb::SnapSlice {}),
            signals::MicroscopeCommand::AcquireStack(request) => {
                Command::AcquireStack(pb::AcquireStack {
                    start_position: Some(request.start_position.into()),
                    end_position: Some(request.end_position.into()),
                    step_size: request.step_size,
                })
            }
            signals::MicroscopeCommand::AblatePoints(points) => {
                Command::AblatePoints(pb::AblatePoints {
                    points: points.into_iter().map(Into::into).collect(),
                })
            }
            signals::MicroscopeCommand::Shutdown => Command::Shutdown(pb::Shutdown {}),
            signals::MicroscopeCommand::DeviceSpecific(data) => {
                Command::DeviceSpecific(pb::DeviceSpecific { data })
            }
            signals::MicroscopeCommand::Sync => Command::Sync(pb::Sync {}),
        };
        Self {
            command: Some(command),
        }
    }
}

impl TryFrom<pb::CommandRequest> for signals::MicroscopeCommand {
    type Error = ScopeError;

    fn try_from(request: pb::CommandRequest) -> Result<Self, ScopeError> {
        use pb::command_request::Command;
        match request
            .command
            .ok_or_else(|| ScopeError::Codec("empty command envelope".to_string()))?
        {
            Command::MoveStage(move_stage) => Ok(Self::MoveStage(require_vec(
                move_stage.target,
                "target",
            )?)),
            Command::GoLive(_) => Ok(Self::GoLive),
            Command::Stop(_) => Ok(Self::Stop),
            Command::SnapSlice(_) => Ok(Self::SnapSlice),
            Command::AcquireStack(acquire) => Ok(Self::AcquireStack(signals::AcquireStack {
                start_position: require_vec(acquire.start_position, "start_position")?,
                end_position: require_vec(acquire.end_position, "end_position")?,
                step_size: acquire.step_size,
            })),
            Command::AblatePoints(ablate) => Ok(Self::AblatePoints(
                ablate
                    .points
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Command::Shutdown(_) => Ok(Self::Shutdown),
            Command::DeviceSpecific(device) => Ok(Self::DeviceSpecific(device.data)),
            Command::Sync(_) => Ok(Self::Sync),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MicroscopeStatus, ServerState, Vector3};

    #[test]
    fn slice_stack_membership_uses_a_sentinel() {
        let meta = signals::ImageMeta {
            width: 2,
            height: 2,
            vertex_size: Vector3::splat(1.0),
            numeric_type: signals::NumericType::Int8,
        };
        let loose = signals::Slice {
            id: 9,
            created: Utc::now(),
            stage_position: Vector3::default(),
            size_bytes: 4,
            stack: None,
            meta: meta.clone(),
            data: bytes::Bytes::from_static(&[0, 1, 2, 3]),
        };
        let wire = pb::Slice::from(loose.clone());
        assert_eq!(wire.stack_id, -1);
        let back = signals::Slice::try_from(wire).unwrap();
        assert_eq!(back.stack, None);

        let member = signals::Slice {
            stack: Some((3, 7)),
            ..loose
        };
        let back = signals::Slice::try_from(pb::Slice::from(member)).unwrap();
        assert_eq!(back.stack, Some((3, 7)));
    }

    #[test]
    fn unknown_enum_values_are_codec_errors() {
        let status = pb::MicroscopeStatus {
            state: pb::ServerState::Unknown as i32,
            stage_position: Some(Vector3::default().into()),
            busy: false,
        };
        assert!(matches!(
            MicroscopeStatus::try_from(status),
            Err(ScopeError::Codec(_))
        ));
    }

    #[test]
    fn missing_submessages_are_codec_errors() {
        let status = pb::MicroscopeStatus {
            state: pb::ServerState::Manual as i32,
            stage_position: None,
            busy: true,
        };
        assert!(matches!(
            MicroscopeStatus::try_from(status),
            Err(ScopeError::Codec(_))
        ));
    }

    #[test]
    fn status_survives_the_wire() {
        let status = MicroscopeStatus {
            state: ServerState::Stack,
            stage_position: Vector3::new(1.0, -2.0, 3.5),
            busy: true,
        };
        let back = MicroscopeStatus::try_from(pb::MicroscopeStatus::from(status.clone())).unwrap();
        assert_eq!(back, status);
    }
}
