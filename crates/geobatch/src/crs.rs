//! Coordinate reference systems understood by the batcher.
//!
//! Layers arrive either in geographic WGS 84 (EPSG:4326 / CRS84) or in
//! spherical Web Mercator (EPSG:3857 and its legacy aliases). Everything is
//! uploaded as EPSG:4326.

use crate::{GeoBatchError, Result};
use geojson::{Position, Value};
use std::fmt;

/// The reference system every batch is uploaded in.
pub const TARGET_EPSG: u32 = 4326;

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters. Web Mercator uses it as
    /// the sphere radius.
    pub const A: f64 = 6_378_137.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// Geographic lon/lat degrees on WGS 84.
    Wgs84,
    /// Spherical ("pseudo") Mercator meters.
    WebMercator,
}

impl Crs {
    /// Parses a CRS name as found in a GeoJSON `crs` member or on the command
    /// line: `EPSG:3857`, `urn:ogc:def:crs:EPSG::4326`, `CRS84`, ...
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Ok(Crs::Wgs84);
        }

        let code = upper.rsplit(':').next().unwrap_or_default();
        match code {
            "4326" => Ok(Crs::Wgs84),
            "3857" | "900913" | "3785" | "102100" | "102113" => Ok(Crs::WebMercator),
            _ => Err(GeoBatchError::UnsupportedCrs(name.to_owned())),
        }
    }

    pub fn epsg(self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
        }
    }

    /// Reprojects a geometry from this CRS to EPSG:4326. Z values are kept.
    pub fn to_wgs84(self, value: &mut Value) {
        match self {
            Crs::Wgs84 => {}
            Crs::WebMercator => for_each_position(value, &mut mercator_to_lon_lat),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Inverse spherical Mercator, in place on `[x, y, ..]`.
#[inline]
fn mercator_to_lon_lat(position: &mut Position) {
    if position.len() < 2 {
        return;
    }
    let (x, y) = (position[0], position[1]);
    let lon = (x / wgs84::A).to_degrees();
    let lat = (2.0 * (y / wgs84::A).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    position[0] = lon;
    position[1] = lat;
}

fn for_each_position(value: &mut Value, f: &mut impl FnMut(&mut Position)) {
    match value {
        Value::Point(p) => f(p),
        Value::MultiPoint(ps) | Value::LineString(ps) => ps.iter_mut().for_each(|p| f(p)),
        Value::MultiLineString(lines) => lines.iter_mut().flatten().for_each(|p| f(p)),
        Value::Polygon(rings) => rings.iter_mut().flatten().for_each(|p| f(p)),
        Value::MultiPolygon(polys) => polys
            .iter_mut()
            .flatten()
            .flatten()
            .for_each(|p| f(p)),
        Value::GeometryCollection(geoms) => {
            for g in geoms {
                for_each_position(&mut g.value, f);
            }
        }
    }
}
