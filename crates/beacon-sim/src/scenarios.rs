use beacon_core::{Location, LocationCoordinate, LocationUpdate};
use beacon_node::LocationFix;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryScenario {
    /// Chance that a single publish attempt fails.
    pub publish_failure_percent: u8,
    pub fix_interval_ms: u64,
    pub fixes: usize,
}

pub const PRACTICAL_BASELINE: DeliveryScenario = DeliveryScenario {
    publish_failure_percent: 10,
    fix_interval_ms: 1_000,
    fixes: 120,
};

pub fn practical_baseline() -> DeliveryScenario {
    PRACTICAL_BASELINE
}

/// Evenly spaced fixes along the straight line from `from` to `to`, the
/// first at `start_ms`.
pub fn straight_line_route(
    from: LocationCoordinate,
    to: LocationCoordinate,
    fixes: usize,
    start_ms: f64,
    interval_ms: u64,
) -> Vec<LocationFix> {
    let steps = fixes.saturating_sub(1).max(1) as f64;
    (0..fixes)
        .map(|i| {
            let t = i as f64 / steps;
            let coordinate = LocationCoordinate::new(
                from.latitude + (to.latitude - from.latitude) * t,
                from.longitude + (to.longitude - from.longitude) * t,
            );
            let timestamp_ms = start_ms + (i as u64 * interval_ms) as f64;
            let location = Location::new(coordinate, timestamp_ms).with_horizontal_accuracy(5.0);
            LocationFix::new(LocationUpdate::new(location), timestamp_ms)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use beacon_core::LocationCoordinate;

    use super::{practical_baseline, straight_line_route};

    #[test]
    fn practical_baseline_is_reasonable() {
        let baseline = practical_baseline();
        assert_eq!(baseline.publish_failure_percent, 10);
        assert_eq!(baseline.fix_interval_ms, 1_000);
        assert!(baseline.fixes > 0);
    }

    #[test]
    fn route_starts_and_ends_on_the_endpoints() {
        let from = LocationCoordinate::new(51.50, -0.12);
        let to = LocationCoordinate::new(51.52, -0.10);
        let route = straight_line_route(from, to, 5, 1_000.0, 500);
        assert_eq!(route.len(), 5);
        assert_eq!(route[0].position(), from);
        let last = route[4].position();
        assert!((last.latitude - to.latitude).abs() < 1e-9);
        assert!((last.longitude - to.longitude).abs() < 1e-9);
        assert_eq!(route[4].now_ms, 3_000.0);
        assert_eq!(route[2].update.location.horizontal_accuracy_m, Some(5.0));
    }

    #[test]
    fn single_fix_route_sits_at_the_start() {
        let from = LocationCoordinate::new(1.0, 2.0);
        let route = straight_line_route(from, LocationCoordinate::new(3.0, 4.0), 1, 0.0, 1_000);
        assert_eq!(route.len(), 1);
        assert_eq!(route[0].position(), from);
    }
}
