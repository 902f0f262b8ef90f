//! Transverse Mercator (WGS84) projection used to turn (longitude, latitude)
//! into planar meters before the octree's rotate+offset step (see
//! [`crate::geometry`]).
//!
//! The central meridian, scale factor and false easting/northing are fixed
//! constants tuned so that the central-California study region projects
//! with minimal distortion — the same role the reference implementation's
//! `Projector` class plays, parameterized with the classic Redfearn /
//! Snyder 6th-order series (the same family of formulas underlying most
//! UTM-style projections).

use crate::error::ProjectorError;

/// WGS84 semi-major axis, meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Central meridian of the projection, degrees.
pub const CENTRAL_MERIDIAN_DEG: f64 = -123.0;
/// Scale factor at the central meridian.
pub const SCALE_FACTOR: f64 = 0.999_6;
/// False easting, meters.
pub const FALSE_EASTING: f64 = 500_000.0;
/// False northing, meters: offsets the usual equator-relative UTM northing
/// (~3.8-4.5 million meters at California's latitudes) down near zero, the
/// same role a region-specific state-plane false northing plays.
pub const FALSE_NORTHING: f64 = -3_800_000.0;

/// Coordinates further than this from the central meridian are considered
/// outside the domain the projection was tuned for.
const MAX_DELTA_LON_DEG: f64 = 12.0;

fn deg2rad(d: f64) -> f64 {
    d.to_radians()
}

fn rad2deg(r: f64) -> f64 {
    r.to_degrees()
}

/// Forward Transverse Mercator projection: (lon, lat) in degrees (WGS84) to
/// (x, y) in planar meters.
///
/// Returns [`ProjectorError::OutOfDomain`] if `lon` is too far from
/// [`CENTRAL_MERIDIAN_DEG`] for the series to stay accurate.
pub fn project(lon_deg: f64, lat_deg: f64) -> Result<(f64, f64), ProjectorError> {
    let delta_lon = lon_deg - CENTRAL_MERIDIAN_DEG;
    if delta_lon.abs() > MAX_DELTA_LON_DEG || !(-90.0..=90.0).contains(&lat_deg) {
        return Err(ProjectorError::OutOfDomain);
    }

    let a = WGS84_A;
    let f = WGS84_F;
    let e2 = f * (2.0 - f);
    let ep2 = e2 / (1.0 - e2);

    let phi = deg2rad(lat_deg);
    let lambda = deg2rad(lon_deg);
    let lambda0 = deg2rad(CENTRAL_MERIDIAN_DEG);

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let big_a = (lambda - lambda0) * cos_phi;

    let m = meridian_arc(phi, e2);

    let x = FALSE_EASTING
        + SCALE_FACTOR
            * n
            * (big_a
                + (1.0 - t + c) * big_a.powi(3) / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * big_a.powi(5) / 120.0);

    let y = FALSE_NORTHING
        + SCALE_FACTOR
            * (m + n
                * tan_phi
                * (big_a.powi(2) / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * big_a.powi(4) / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * big_a.powi(6)
                        / 720.0));

    Ok((x, y))
}

/// Inverse Transverse Mercator: (x, y) planar meters back to (lon, lat) in
/// degrees (WGS84).
pub fn inv_project(x: f64, y: f64) -> Result<(f64, f64), ProjectorError> {
    let a = WGS84_A;
    let f = WGS84_F;
    let e2 = f * (2.0 - f);
    let ep2 = e2 / (1.0 - e2);
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let m = (y - FALSE_NORTHING) / SCALE_FACTOR;
    let mu = m / (a * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = tan_phi1 * tan_phi1;
    let n1 = a / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = a * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = (x - FALSE_EASTING) / (n1 * SCALE_FACTOR);

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);

    let lambda0 = deg2rad(CENTRAL_MERIDIAN_DEG);
    let lambda = lambda0
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    let lon_deg = rad2deg(lambda);
    let lat_deg = rad2deg(phi);

    if (lon_deg - CENTRAL_MERIDIAN_DEG).abs() > MAX_DELTA_LON_DEG || !(-90.0..=90.0).contains(&lat_deg) {
        return Err(ProjectorError::OutOfDomain);
    }

    Ok((lon_deg, lat_deg))
}

/// Meridian arc length from the equator to latitude `phi` (radians).
fn meridian_arc(phi: f64, e2: f64) -> f64 {
    let a = WGS84_A;
    a * ((1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e2 * e2 / 32.0 + 45.0 * e2.powi(3) / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e2 * e2 / 256.0 + 45.0 * e2.powi(3) / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e2.powi(3) / 3072.0) * (6.0 * phi).sin())
}
