//! Spatial restrictor regions.
//!
//! Regions arrive as flat numeric parameter lists from the recognized
//! `qserv_areaspec_*` WHERE predicates. Parameter arity is validated here;
//! geometry is reduced to conservative bounding boxes on the sphere, which is
//! all chunk selection needs (false-positive chunks are filtered by the
//! workers, missed chunks would be wrong).

use serde::{Deserialize, Serialize};
use skyq_common::{CzarError, Result};

/// Longitude/latitude bounding box in degrees. `lon_min > lon_max` encodes a
/// box wrapping the 0/360 meridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western edge, degrees in `[0, 360)`.
    pub lon_min: f64,
    /// Eastern edge, degrees in `[0, 360)`.
    pub lon_max: f64,
    /// Southern edge, degrees in `[-90, 90]`.
    pub lat_min: f64,
    /// Northern edge, degrees in `[-90, 90]`.
    pub lat_max: f64,
}

impl BoundingBox {
    /// Whether the box wraps the prime meridian.
    pub fn wraps(&self) -> bool {
        self.lon_min > self.lon_max
    }

    /// Whether a longitude interval `[a, b]` (non-wrapping) overlaps this box.
    pub fn overlaps_lon(&self, a: f64, b: f64) -> bool {
        if self.wraps() {
            b >= self.lon_min || a <= self.lon_max
        } else {
            b >= self.lon_min && a <= self.lon_max
        }
    }

    /// Whether a latitude interval `[a, b]` overlaps this box.
    pub fn overlaps_lat(&self, a: f64, b: f64) -> bool {
        b >= self.lat_min && a <= self.lat_max
    }
}

/// A recognized spatial restrictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Region {
    /// Longitude/latitude box: `(lon1, lat1, lon2, lat2)`.
    Box {
        /// Western edge in degrees.
        lon1: f64,
        /// Southern edge in degrees.
        lat1: f64,
        /// Eastern edge in degrees.
        lon2: f64,
        /// Northern edge in degrees.
        lat2: f64,
    },
    /// Small circle: `(lon, lat, radius)` in degrees.
    Circle {
        /// Center longitude in degrees.
        lon: f64,
        /// Center latitude in degrees.
        lat: f64,
        /// Radius in degrees.
        radius: f64,
    },
    /// Ellipse: `(lon, lat, semi_major, semi_minor, pos_angle)` in degrees.
    Ellipse {
        /// Center longitude in degrees.
        lon: f64,
        /// Center latitude in degrees.
        lat: f64,
        /// Semi-major axis in degrees.
        semi_major: f64,
        /// Semi-minor axis in degrees.
        semi_minor: f64,
        /// Position angle in degrees.
        pos_angle: f64,
    },
    /// Convex polygon as `(lon, lat)` vertices.
    Polygon {
        /// Vertices in degrees.
        vertices: Vec<(f64, f64)>,
    },
}

impl Region {
    /// Build a box region from restrictor parameters.
    pub fn box_from_params(params: &[f64]) -> Result<Region> {
        if params.len() != 4 {
            return Err(CzarError::Unsupported(
                "invalid number of parameters for box restrictor".to_string(),
            ));
        }
        Ok(Region::Box {
            lon1: params[0],
            lat1: params[1],
            lon2: params[2],
            lat2: params[3],
        })
    }

    /// Build a circle region from restrictor parameters.
    pub fn circle_from_params(params: &[f64]) -> Result<Region> {
        if params.len() != 3 {
            return Err(CzarError::Unsupported(
                "invalid number of parameters for circle restrictor".to_string(),
            ));
        }
        if params[2] < 0.0 {
            return Err(CzarError::Unsupported(
                "circle restrictor radius must be non-negative".to_string(),
            ));
        }
        Ok(Region::Circle {
            lon: params[0],
            lat: params[1],
            radius: params[2],
        })
    }

    /// Build an ellipse region from restrictor parameters.
    pub fn ellipse_from_params(params: &[f64]) -> Result<Region> {
        if params.len() != 5 {
            return Err(CzarError::Unsupported(
                "invalid number of parameters for ellipse restrictor".to_string(),
            ));
        }
        Ok(Region::Ellipse {
            lon: params[0],
            lat: params[1],
            semi_major: params[2],
            semi_minor: params[3],
            pos_angle: params[4],
        })
    }

    /// Build a polygon region from restrictor parameters.
    ///
    /// Vertices come in `(lon, lat)` pairs; at least three vertices.
    pub fn polygon_from_params(params: &[f64]) -> Result<Region> {
        if params.len() < 6 || params.len() % 2 != 0 {
            return Err(CzarError::Unsupported(
                "invalid number of parameters for polygon restrictor".to_string(),
            ));
        }
        let vertices = params
            .chunks(2)
            .map(|p| (p[0], p[1]))
            .collect::<Vec<_>>();
        Ok(Region::Polygon { vertices })
    }

    /// Conservative bounding box, clipped to the sphere.
    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            Region::Box {
                lon1,
                lat1,
                lon2,
                lat2,
            } => clip(
                normalize_lon(*lon1),
                normalize_lon(*lon2),
                lat1.min(*lat2),
                lat1.max(*lat2),
            ),
            Region::Circle { lon, lat, radius } => circle_bbox(*lon, *lat, *radius),
            Region::Ellipse {
                lon,
                lat,
                semi_major,
                ..
            } => circle_bbox(*lon, *lat, *semi_major),
            Region::Polygon { vertices } => {
                let lat_min = vertices.iter().map(|v| v.1).fold(f64::MAX, f64::min);
                let lat_max = vertices.iter().map(|v| v.1).fold(f64::MIN, f64::max);
                let lon_min = vertices.iter().map(|v| v.0).fold(f64::MAX, f64::min);
                let lon_max = vertices.iter().map(|v| v.0).fold(f64::MIN, f64::max);
                clip(
                    normalize_lon(lon_min),
                    normalize_lon(lon_max),
                    lat_min,
                    lat_max,
                )
            }
        }
    }
}

fn circle_bbox(lon: f64, lat: f64, radius: f64) -> BoundingBox {
    let lat_min = (lat - radius).max(-90.0);
    let lat_max = (lat + radius).min(90.0);
    // Near a pole the circle covers every longitude.
    if lat_min <= -90.0 + f64::EPSILON || lat_max >= 90.0 - f64::EPSILON {
        return BoundingBox {
            lon_min: 0.0,
            lon_max: 360.0,
            lat_min,
            lat_max,
        };
    }
    let widest_lat = if lat_min.abs() > lat_max.abs() {
        lat_min
    } else {
        lat_max
    };
    let cos_lat = widest_lat.to_radians().cos().max(1e-9);
    let dlon = (radius / cos_lat).min(180.0);
    clip(
        normalize_lon(lon - dlon),
        normalize_lon(lon + dlon),
        lat_min,
        lat_max,
    )
}

fn clip(lon_min: f64, lon_max: f64, lat_min: f64, lat_max: f64) -> BoundingBox {
    BoundingBox {
        lon_min,
        lon_max,
        lat_min: lat_min.max(-90.0),
        lat_max: lat_max.min(90.0),
    }
}

/// Normalize a longitude into `[0, 360)`.
pub fn normalize_lon(lon: f64) -> f64 {
    let l = lon % 360.0;
    if l < 0.0 { l + 360.0 } else { l }
}
