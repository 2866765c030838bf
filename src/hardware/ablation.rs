//! Ablation path construction.
//!
//! Helpers that turn user-drawn geometry into the [`AblationPoint`] lists the
//! hardware executes. Two sampling strategies exist: grid sampling snaps a
//! line onto a fixed lattice and is what tiled shutter hardware wants, smooth
//! sampling spaces points evenly along the line for galvo-style scanners.

use std::time::Duration;

use crate::config::AblationSettings;
use crate::signals::{AblationPoint, Vector3};

/// Samples `from -> to` on a lattice with `cell_size` spacing.
///
/// Consecutive duplicates (several line samples falling into the same cell)
/// are collapsed. The first and last cells of the line are always included.
pub fn sample_line_grid(from: Vector3, to: Vector3, cell_size: f32) -> Vec<Vector3> {
    let snap = |p: Vector3| {
        Vector3::new(
            (p.x / cell_size).round() * cell_size,
            (p.y / cell_size).round() * cell_size,
            (p.z / cell_size).round() * cell_size,
        )
    };

    let mut points = Vec::new();
    for p in sample_line_smooth(from, to, cell_size * 0.5) {
        let cell = snap(p);
        if points.last() != Some(&cell) {
            points.push(cell);
        }
    }
    points
}

/// Samples `from -> to` with evenly spaced points `step_size` apart.
///
/// Always yields the start point; the end point is appended when the stepping
/// does not land on it. A zero-length line yields the single point.
pub fn sample_line_smooth(from: Vector3, to: Vector3, step_size: f32) -> Vec<Vector3> {
    let span = to - from;
    let length = span.length();
    if length == 0.0 || step_size <= 0.0 {
        return vec![from];
    }

    let steps = (length / step_size).floor() as u32;
    let dir = span * (1.0 / length);

    let mut points = Vec::with_capacity(steps as usize + 2);
    for i in 0..=steps {
        points.push(from + dir * (i as f32 * step_size));
    }
    if points.last() != Some(&to) {
        points.push(to);
    }
    points
}

/// Expands raw positions into an executable laser path.
///
/// The laser is switched on at the first point and off at the last; dwell
/// time, power and move-time accounting come from `settings`. With
/// `repetitions > 1` the whole path repeats, toggling the laser per pass so a
/// repositioning move between passes never burns tissue.
pub fn build_laser_path(positions: &[Vector3], settings: &AblationSettings) -> Vec<AblationPoint> {
    if positions.is_empty() {
        return Vec::new();
    }

    let dwell = Duration::from_micros(settings.dwell_time_us);
    let mut path = Vec::with_capacity(positions.len() * settings.repetitions.max(1) as usize);

    for _ in 0..settings.repetitions.max(1) {
        let last = positions.len() - 1;
        for (i, pos) in positions.iter().enumerate() {
            path.push(AblationPoint {
                position: *pos,
                dwell_time: dwell,
                laser_on: i == 0,
                laser_off: i == last,
                laser_power: settings.laser_power,
                count_move_time: settings.count_move_time,
            });
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_sampling_covers_both_endpoints() {
        let points = sample_line_smooth(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            3.0,
        );
        assert_eq!(points.first(), Some(&Vector3::new(0.0, 0.0, 0.0)));
        assert_eq!(points.last(), Some(&Vector3::new(10.0, 0.0, 0.0)));
        // 0, 3, 6, 9, 10
        assert_eq!(points.len(), 5);
    }

    #[test]
    fn smooth_sampling_of_zero_length_line() {
        let at = Vector3::splat(2.0);
        assert_eq!(sample_line_smooth(at, at, 1.0), vec![at]);
    }

    #[test]
    fn grid_sampling_collapses_duplicates() {
        let points = sample_line_grid(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(4.0, 0.0, 0.0),
            2.0,
        );
        // cells 0, 2, 4 along x, each exactly once
        assert_eq!(points.len(), 3);
        for pair in points.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn laser_path_toggles_laser_per_pass() {
        let positions = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        let settings = AblationSettings {
            laser_power: 0.8,
            dwell_time_us: 100,
            repetitions: 2,
            ..AblationSettings::default()
        };
        let path = build_laser_path(&positions, &settings);
        assert_eq!(path.len(), 6);
        // each pass starts with laser_on and ends with laser_off
        assert!(path[0].laser_on && path[2].laser_off);
        assert!(path[3].laser_on && path[5].laser_off);
        assert!(!path[1].laser_on && !path[1].laser_off);
        assert_eq!(path[0].laser_power, 0.8);
        assert_eq!(path[0].dwell_time, Duration::from_micros(100));
    }

    #[test]
    fn empty_positions_yield_empty_path() {
        assert!(build_laser_path(&[], &AblationSettings::default()).is_empty());
    }
}
