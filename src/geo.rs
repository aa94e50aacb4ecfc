//! Spherical-earth distance and offset helpers.
//!
//! Everything here is pure. The earth is treated as a sphere of radius
//! [`EARTH_RADIUS_M`], which is accurate to well under one percent for
//! the short distances a charger map deals with.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude / longitude pair in degrees.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Latitude within [-90, 90] and longitude within [-180, 180].
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((latitude, longitude): (f64, f64)) -> Self {
        Self::new(latitude, longitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// An axis-aligned latitude / longitude rectangle. Both axes are
/// inclusive.
///
/// When `west > east` the rectangle crosses the antimeridian and covers
/// longitudes `>= west` or `<= east`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    pub const fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    /// The square of side `2 * radius_m` centered on `center`.
    ///
    /// Latitudes are clamped to the poles and longitudes wrapped into
    /// [-180, 180), so the result may cross the antimeridian. A square
    /// that reaches a pole or is wider than the globe spans every
    /// longitude.
    pub fn around(center: Coordinate, radius_m: f64) -> Self {
        let south_west = offset_meters(center, -radius_m, -radius_m);
        let north_east = offset_meters(center, radius_m, radius_m);

        let south = south_west.latitude.max(-90.0);
        let north = north_east.latitude.min(90.0);

        let span = north_east.longitude - south_west.longitude;
        let reaches_pole = south <= -90.0 || north >= 90.0;

        let (west, east) = if reaches_pole || !(span < 360.0) {
            (-180.0, 180.0)
        } else {
            (
                wrap_longitude(south_west.longitude),
                wrap_longitude(north_east.longitude),
            )
        };

        Self {
            south,
            west,
            north,
            east,
        }
    }

    /// Every side is in range and `south <= north`.
    pub fn is_valid(&self) -> bool {
        let south_west = Coordinate::new(self.south, self.west);
        let north_east = Coordinate::new(self.north, self.east);

        south_west.is_valid() && north_east.is_valid() && self.south <= self.north
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        let Coordinate {
            latitude,
            longitude,
        } = point;

        if latitude < self.south || latitude > self.north {
            return false;
        }

        if self.west <= self.east {
            self.west <= longitude && longitude <= self.east
        } else {
            longitude >= self.west || longitude <= self.east
        }
    }
}

fn wrap_longitude(longitude: f64) -> f64 {
    (longitude + 180.0).rem_euclid(360.0) - 180.0
}

/// Great-circle distance between two points using the haversine
/// formula.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push `h` a hair past 1 for antipodal points
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Moves `origin` by the given number of meters north and east using a
/// local flat-earth approximation.
///
/// The longitude step is divided by `cos(latitude)`, so this is
/// degenerate at ±90° and must not be called there.
pub fn offset_meters(origin: Coordinate, d_lat_m: f64, d_lng_m: f64) -> Coordinate {
    let d_lat = (d_lat_m / EARTH_RADIUS_M).to_degrees();
    let d_lng = (d_lng_m / (EARTH_RADIUS_M * origin.latitude.to_radians().cos())).to_degrees();

    Coordinate::new(origin.latitude + d_lat, origin.longitude + d_lng)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISBON: Coordinate = Coordinate::new(38.7369, -9.1366);
    const PORTO: Coordinate = Coordinate::new(41.1579, -8.6291);

    fn sample_points() -> Vec<Coordinate> {
        let mut points = vec![];
        for lat in (-80..=80).step_by(20) {
            for lng in (-180..=180).step_by(45) {
                points.push(Coordinate::new(lat as f64 + 0.25, lng as f64));
            }
        }
        points
    }

    #[test]
    fn distance_to_self_is_zero() {
        for p in sample_points() {
            assert_eq!(distance_meters(p, p), 0.0, "{p}");
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let points = sample_points();
        for a in &points {
            for b in &points {
                let ab = distance_meters(*a, *b);
                let ba = distance_meters(*b, *a);
                assert!((ab - ba).abs() < 1e-6, "{a} -> {b}: {ab} vs {ba}");
            }
        }
    }

    #[test]
    fn lisbon_to_porto() {
        let d = distance_meters(LISBON, PORTO);
        assert!((d - 272_650.0).abs() < 1_500.0, "{d}");
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = distance_meters(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "{d}");
    }

    #[test]
    fn offset_round_trips_through_distance() {
        for center in sample_points() {
            for meters in [10.0, 250.0, 1_000.0, 5_000.0] {
                let north = offset_meters(center, meters, 0.0);
                let d = distance_meters(center, north);
                assert!((d - meters).abs() / meters < 0.01, "{center} north {meters}: {d}");

                let east = offset_meters(center, 0.0, meters);
                let d = distance_meters(center, east);
                assert!((d - meters).abs() / meters < 0.01, "{center} east {meters}: {d}");
            }
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let bounds = Bounds::new(38.0, -10.0, 39.0, -9.0);

        assert!(bounds.contains(LISBON));
        assert!(bounds.contains(Coordinate::new(38.0, -10.0)));
        assert!(bounds.contains(Coordinate::new(39.0, -9.0)));
        assert!(!bounds.contains(PORTO));
        assert!(!bounds.contains(Coordinate::new(38.5, -8.999)));
    }

    #[test]
    fn bounds_across_the_antimeridian() {
        let bounds = Bounds::new(-20.0, 170.0, -10.0, -170.0);

        assert!(bounds.contains(Coordinate::new(-15.0, 175.0)));
        assert!(bounds.contains(Coordinate::new(-15.0, -175.0)));
        assert!(!bounds.contains(Coordinate::new(-15.0, 0.0)));
    }

    #[test]
    fn bounds_around_contain_the_radius() {
        let bounds = Bounds::around(LISBON, 1_000.0);

        assert!(bounds.contains(LISBON));
        assert!(bounds.contains(offset_meters(LISBON, 999.0, 0.0)));
        assert!(bounds.contains(offset_meters(LISBON, 0.0, -999.0)));
        assert!(!bounds.contains(offset_meters(LISBON, 1_001.0, 0.0)));
    }

    #[test]
    fn bounds_around_wrap_across_the_antimeridian() {
        let center = Coordinate::new(0.0, 179.999);
        let bounds = Bounds::around(center, 1_000.0);

        assert!(bounds.is_valid(), "{bounds:?}");
        assert!(bounds.west > bounds.east, "{bounds:?}");
        assert!(bounds.contains(center));
        assert!(bounds.contains(Coordinate::new(0.0, -179.999)));
        assert!(!bounds.contains(Coordinate::new(0.0, 0.0)));
    }

    #[test]
    fn bounds_around_clamp_at_the_poles() {
        let center = Coordinate::new(89.999, 10.0);
        let bounds = Bounds::around(center, 1_000.0);

        assert!(bounds.is_valid(), "{bounds:?}");
        assert_eq!(bounds.north, 90.0);
        assert_eq!((bounds.west, bounds.east), (-180.0, 180.0));
        assert!(bounds.contains(center));
        assert!(bounds.contains(Coordinate::new(89.9995, -170.0)));

        let bounds = Bounds::around(Coordinate::new(-90.0, 0.0), 1_000.0);
        assert!(bounds.is_valid(), "{bounds:?}");
        assert_eq!(bounds.south, -90.0);
    }

    #[test]
    fn bounds_validation() {
        assert!(Bounds::new(38.0, -10.0, 39.0, -9.0).is_valid());
        assert!(Bounds::new(-20.0, 170.0, -10.0, -170.0).is_valid());
        assert!(Bounds::new(-90.0, -180.0, 90.0, 180.0).is_valid());
        assert!(!Bounds::new(39.0, -10.0, 38.0, -9.0).is_valid());
        assert!(!Bounds::new(38.0, -10.0, 91.0, -9.0).is_valid());
        assert!(!Bounds::new(38.0, -181.0, 39.0, -9.0).is_valid());
        assert!(!Bounds::new(f64::NAN, -10.0, 39.0, -9.0).is_valid());
    }

    #[test]
    fn coordinate_validation() {
        assert!(LISBON.is_valid());
        assert!(Coordinate::new(90.0, 180.0).is_valid());
        assert!(Coordinate::new(-90.0, -180.0).is_valid());
        assert!(!Coordinate::new(90.1, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }
}
