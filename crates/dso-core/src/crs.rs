//! Coordinate reference systems supported by the gateway.
//!
//! The DSO profile restricts the `Accept-Crs` / `Content-Crs` headers to a
//! fixed set of EPSG codes. All actual reprojection happens inside PostGIS
//! (`ST_Transform`); this module only carries the negotiated identifiers and
//! the bounding boxes used for coordinate auto-detection.

use dso_error::{ApiError, Result};

/// A coordinate reference system accepted in request/response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crs {
    /// WGS 84 (EPSG:4326), longitude/latitude.
    Wgs84,
    /// Dutch Rijksdriehoek / Amersfoort new (EPSG:28992).
    RdNew,
    /// Web Mercator (EPSG:3857), used by slippy-map tiles.
    WebMercator,
    /// ETRS89 (EPSG:4258).
    Etrs89,
}

impl Crs {
    /// Numeric EPSG/SRID code.
    #[must_use]
    pub const fn srid(self) -> i32 {
        match self {
            Self::Wgs84 => 4326,
            Self::RdNew => 28992,
            Self::WebMercator => 3857,
            Self::Etrs89 => 4258,
        }
    }

    /// Parse an `Accept-Crs` header value.
    ///
    /// Accepts the plain `EPSG:<code>` notation (case-insensitive) and the
    /// OGC URN form `urn:ogc:def:crs:EPSG::<code>`.
    ///
    /// # Errors
    ///
    /// `NotAcceptable` when the value is malformed or names an unsupported
    /// system.
    pub fn from_header(value: &str) -> Result<Self> {
        let lower = value.trim().to_ascii_lowercase();
        let code = lower
            .strip_prefix("urn:ogc:def:crs:epsg::")
            .or_else(|| lower.strip_prefix("epsg:"))
            .ok_or_else(|| ApiError::NotAcceptable {
                message: format!("Chosen CRS is invalid: {value}"),
            })?;

        match code {
            "4326" => Ok(Self::Wgs84),
            "28992" => Ok(Self::RdNew),
            "3857" => Ok(Self::WebMercator),
            "4258" => Ok(Self::Etrs89),
            _ => Err(ApiError::NotAcceptable {
                message: format!("Chosen CRS is not supported: {value}"),
            }),
        }
    }

    /// The canonical header notation, e.g. `EPSG:4326`.
    #[must_use]
    pub fn to_header(self) -> String {
        format!("EPSG:{}", self.srid())
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EPSG:{}", self.srid())
    }
}

/// Check whether latitude/longitude fall inside the Netherlands bounding box.
///
/// Latitude is the vertical north-south axis, longitude the horizontal
/// west-east axis.
#[must_use]
pub fn valid_nl_wgs84(latitude: f64, longitude: f64) -> bool {
    (50.803_721_015..=53.510_403_347_4).contains(&latitude)
        && (3.314_971_144_23..=7.092_053_256_87).contains(&longitude)
}

/// Check whether X/Y fit in the Rijksdriehoek bounding box.
#[must_use]
pub fn valid_rd(x: f64, y: f64) -> bool {
    (0.0..=280_000.0).contains(&x) && (300_000.0..=625_000.0).contains(&y)
}

/// Bounding box of the Amsterdam region in WGS84, used by the TileJSON
/// endpoint: `[west, south, east, north]`.
pub const AMSTERDAM_BOUNDS: [f64; 4] = [4.581_64, 52.034_05, 5.313_60, 52.538_74];

/// Dam Square in WGS84 with the default zoom, used as TileJSON center.
pub const DAM_SQUARE: [f64; 3] = [4.892_84, 52.373_05, 12.0];
