//! Conversion of query-string values to typed values.
//!
//! All parsers are strict and locale-free: no exponent notation for numbers,
//! no NaN/infinity, ISO-8601 only for dates and times.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use geo_types::Point;
use regex::Regex;

use dso_error::{ApiError, Result};

use crate::crs::{valid_nl_wgs84, valid_rd, Crs};
use crate::schema::FieldKind;

// Don't want NaN, -inf or '0.321000e+2' to be accepted.
static RE_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("valid regex"));

static RE_POINT_XY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?\d+(?:\.\d+)?),([-+]?\d+(?:\.\d+)?)$").expect("valid regex")
});

static RE_POINT_WKT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^POINT\(([-+]?\d+(?:\.\d+)?) ([-+]?\d+(?:\.\d+)?)\)$").expect("valid regex")
});

/// A typed filter value, ready for SQL parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValue {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Time(NaiveTime),
    /// A point with the SRID it was interpreted in.
    Point(Point<f64>, i32),
}

/// A parsed ISO date input that distinguishes date-only from full datetime.
///
/// Comparisons against `date-time` columns treat a date-only input as a whole
/// day instead of midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateOrDateTime {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

/// Parse a boolean: `true|1|false|0`, case-insensitive.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid("expect true/false")),
    }
}

/// Parse a number; rejects exponents, NaN and infinities.
pub fn parse_number(value: &str) -> Result<f64> {
    if !RE_DECIMAL.is_match(value) {
        return Err(invalid("expecting number"));
    }
    value.parse().map_err(|_| invalid("expecting number"))
}

/// Parse an integer.
pub fn parse_integer(value: &str) -> Result<i64> {
    value.parse().map_err(|_| invalid("expecting integer"))
}

/// Parse an ISO date or datetime.
///
/// A bare `YYYY-MM-DD` is returned as a date so callers can compare against
/// the whole day; everything else must be a full ISO-8601 datetime.
pub fn parse_iso_date(value: &str) -> Result<DateOrDateTime> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(DateOrDateTime::Date(date));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(DateOrDateTime::DateTime(dt.with_timezone(&Utc)));
    }
    // Also accept a naive datetime without offset, interpreted as UTC.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(DateOrDateTime::DateTime(naive.and_utc()));
        }
    }

    Err(invalid("Enter a valid ISO date-time, or single date."))
}

/// Parse a `HH:MM`, `HH:MM:SS` or `HH:MM:SS.fff` time.
pub fn parse_time(value: &str) -> Result<NaiveTime> {
    for format in ["%H:%M:%S", "%H:%M", "%H:%M:%S%.f"] {
        if let Ok(time) = NaiveTime::parse_from_str(value, format) {
            return Ok(time);
        }
    }
    Err(invalid("Enter a valid time."))
}

/// Parse a point value: `x,y` or `POINT(x y)`.
///
/// The input CRS is taken from the request's `Accept-Crs`. Without one (or
/// with WGS84/RD), coordinates are auto-corrected:
/// - a pair inside the NL WGS84 bounding box is interpreted as lat/lon and
///   reordered to lon/lat;
/// - a pair inside the Dutch RD bounding box is returned in RD (SRID 28992);
/// - any other SRID is passed through untouched.
pub fn parse_point(value: &str, input_crs: Option<Crs>) -> Result<(Point<f64>, i32)> {
    let (x, y) = split_point(value)?;
    let srid = input_crs.map(Crs::srid);

    // Try WGS84 coordinates first. Latitude is the vertical axis, so a
    // lat,lon input has x/y swapped.
    if srid.is_none() || srid == Some(4326) {
        if valid_nl_wgs84(x, y) {
            return Ok((Point::new(y, x), 4326));
        }
        if valid_nl_wgs84(y, x) {
            return Ok((Point::new(x, y), 4326));
        }
    }

    // Try Dutch Rijksdriehoek coordinates.
    if (srid.is_none() || srid == Some(28992)) && valid_rd(x, y) {
        return Ok((Point::new(x, y), 28992));
    }

    // Leave other systems untouched.
    if let Some(srid) = srid {
        if srid != 4326 && srid != 28992 {
            return Ok((Point::new(x, y), srid));
        }
    }

    Err(invalid(&format!("Invalid x,y values: {x},{y}")))
}

fn split_point(value: &str) -> Result<(f64, f64)> {
    let captures = RE_POINT_XY
        .captures(value)
        .or_else(|| RE_POINT_WKT.captures(value))
        .ok_or_else(|| invalid(&format!("not a valid point: '{value}'")))?;

    let x: f64 = captures[1]
        .parse()
        .map_err(|_| invalid(&format!("not a valid point: '{value}'")))?;
    let y: f64 = captures[2]
        .parse()
        .map_err(|_| invalid(&format!("not a valid point: '{value}'")))?;

    // The regexp can still produce infinities through very long digit runs.
    if !(x.is_finite() && y.is_finite()) {
        return Err(invalid(&format!("not a valid point: '{value}'")));
    }

    Ok((x, y))
}

/// Parse a raw value according to the field's scalar kind.
///
/// Date-time fields go through [`parse_iso_date`] so date-only inputs keep
/// their day semantics; geometry kinds are not handled here (they need the
/// request CRS, see [`parse_point`]).
pub fn parse_scalar(kind: FieldKind, value: &str) -> Result<ParsedValue> {
    match kind {
        FieldKind::Boolean => parse_bool(value).map(ParsedValue::Bool),
        FieldKind::Integer => parse_integer(value).map(ParsedValue::Int),
        FieldKind::Number => parse_number(value).map(ParsedValue::Number),
        FieldKind::Date => match parse_iso_date(value)? {
            DateOrDateTime::Date(d) => Ok(ParsedValue::Date(d)),
            DateOrDateTime::DateTime(_) => Err(invalid("Enter a valid date.")),
        },
        FieldKind::DateTime => Ok(match parse_iso_date(value)? {
            DateOrDateTime::Date(d) => ParsedValue::Date(d),
            DateOrDateTime::DateTime(dt) => ParsedValue::DateTime(dt),
        }),
        FieldKind::Time => parse_time(value).map(ParsedValue::Time),
        _ => Ok(ParsedValue::Text(value.to_string())),
    }
}

fn invalid(reason: &str) -> ApiError {
    ApiError::InvalidValue {
        field:  String::new(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn test_parse_number_rejects_special_forms() {
        assert_eq!(parse_number("10.5").unwrap(), 10.5);
        assert!(parse_number("NaN").is_err());
        assert!(parse_number("-inf").is_err());
        assert!(parse_number("0.321000e+2").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn test_parse_iso_date_variants() {
        assert!(matches!(
            parse_iso_date("2020-01-01").unwrap(),
            DateOrDateTime::Date(_)
        ));
        assert!(matches!(
            parse_iso_date("2020-01-01T12:30:00Z").unwrap(),
            DateOrDateTime::DateTime(_)
        ));
        assert!(matches!(
            parse_iso_date("2020-01-01T12:30:00+01:00").unwrap(),
            DateOrDateTime::DateTime(_)
        ));
    }

    #[test]
    fn test_parse_iso_date_error_message() {
        let err = parse_iso_date("2020-01-fubar").unwrap_err();
        assert!(err
            .to_string()
            .contains("Enter a valid ISO date-time, or single date."));
    }

    #[test]
    fn test_parse_time_formats() {
        assert!(parse_time("20:05").is_ok());
        assert!(parse_time("20:05:12").is_ok());
        assert!(parse_time("20:05:12.125").is_ok());
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("noon").is_err());
    }

    #[test]
    fn test_point_lat_lon_is_swapped() {
        // Amsterdam as lat,lon: reordered to lon,lat.
        let (point, srid) = parse_point("52.373,4.893", None).unwrap();
        assert_eq!(srid, 4326);
        assert!((point.x() - 4.893).abs() < 1e-9);
        assert!((point.y() - 52.373).abs() < 1e-9);

        // Already lon,lat: kept as-is.
        let (point, _) = parse_point("4.893,52.373", None).unwrap();
        assert!((point.x() - 4.893).abs() < 1e-9);
    }

    #[test]
    fn test_point_rd_detection() {
        let (point, srid) = parse_point("123207,486624", None).unwrap();
        assert_eq!(srid, 28992);
        assert!((point.x() - 123_207.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_wkt_notation() {
        let (_, srid) = parse_point("POINT(123207 486624)", None).unwrap();
        assert_eq!(srid, 28992);
    }

    #[test]
    fn test_point_outside_any_bounds() {
        assert!(parse_point("1,1", None).is_err());
        // With an explicit non-NL SRID the values pass through.
        let (_, srid) = parse_point("1,1", Some(Crs::WebMercator)).unwrap();
        assert_eq!(srid, 3857);
    }

    #[test]
    fn test_parse_scalar_datetime_field_accepts_date() {
        let parsed = parse_scalar(FieldKind::DateTime, "2021-02-03").unwrap();
        assert!(matches!(parsed, ParsedValue::Date(_)));
    }
}
