use crate::location::LocationCoordinate;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle (haversine) distance between two coordinates, in meters.
pub fn distance_m(from: LocationCoordinate, to: LocationCoordinate) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (to.longitude - from.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::distance_m;
    use crate::location::LocationCoordinate;

    #[test]
    fn distance_to_self_is_zero() {
        let p = LocationCoordinate::new(51.5, -0.12);
        assert_eq!(distance_m(p, p), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = distance_m(
            LocationCoordinate::new(0.0, 0.0),
            LocationCoordinate::new(1.0, 0.0),
        );
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = LocationCoordinate::new(52.2, 21.0);
        let b = LocationCoordinate::new(50.06, 19.94);
        assert!((distance_m(a, b) - distance_m(b, a)).abs() < 1e-6);
    }
}
