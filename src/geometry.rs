//! Octree address arithmetic over the central-California projected domain.
//!
//! An [`Address`] names a cube in an octree of side [`ROOTLEN`] ticks at the
//! root, refined by doubling the number of cubes per axis at every level
//! (spec §3). [`Geometry`] is the capability that converts between
//! geographic coordinates and addresses; [`CenCalGeometry`] is its only
//! implementation today, kept behind the trait so a future region could add
//! a second one without touching [`crate::store`] or [`crate::query`].

use serde::{Deserialize, Serialize};

use crate::error::{GeometryError, ProjectorError};
use crate::projector;

/// Side length of the root cube, meters (applies identically to the x, y
/// and z tick axes; the z axis additionally carries the [`VERTEXAG`]
/// stretch baked into [`r_of`]).
pub const ROOTLEN: f64 = 2_097_152.0; // 2^21
/// Margin added to the rotated, projected x coordinate so the study region
/// sits inside the positive tick cube.
pub const BUFFERNW: f64 = 300_000.0;
/// Margin added to the rotated, projected y coordinate. Larger than
/// `BUFFERNW` because the rotation mixes the large false-northing-adjusted
/// northing component into this axis more heavily than into the other.
pub const BUFFERSW: f64 = 600_000.0;
/// Half the vertical domain's tick span, meters: chosen so that `r` (see
/// [`CenCalGeometry::lon_lat_elev_to_addr`]) stays inside `[0, ROOTLEN)` for
/// every elevation between [`MIN_ELEV`] and its mirror image above sea
/// level. Not a literal claim about the tallest peak in the domain.
pub const MAXELEV: f64 = 50_000.0;
/// Vertical exaggeration: ratio of horizontal to vertical edge length at a
/// given octree level.
pub const VERTEXAG: f64 = 4.0;
/// Rotation (degrees, counter-clockwise) applied to the projected plane so
/// the California coastline's regional strike lines up with the tick axes.
pub const ROTATION_DEG: f64 = -39.0;
/// Elevations below this are clamped before any lookup (spec §4.6.6, §9a).
pub const MIN_ELEV: f64 = -45_000.0;

/// Number of ticks spanning the root cube along one axis (`1 << 31`).
const ROOT_TICKS: u64 = 1u64 << 31;

/// Tick spacing of the cube grid at `level`: `0x8000_0000 >> level`.
pub fn tick_len(level: u8) -> u32 {
    if level == 0 {
        0x8000_0000
    } else if level <= 31 {
        0x8000_0000u32 >> level
    } else {
        0
    }
}

/// Whether a node of a given type can exist at all (levels are addressed in
/// `[0, 31]`).
pub fn is_valid_level(level: u8) -> bool {
    level <= 31
}

/// The type of node stored at an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Leaf,
    Interior,
}

/// A cube in the octree: ticks `(x, y, z)` at `level`, canonically aligned
/// to a multiple of [`tick_len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub level: u8,
    pub node_type: NodeType,
}

impl Address {
    pub fn new(x: u32, y: u32, z: u32, level: u8, node_type: NodeType) -> Self {
        let addr = Address {
            x,
            y,
            z,
            level,
            node_type,
        };
        debug_assert!(
            addr.is_canonical(),
            "address ticks {:?} are not aligned to level {} grid",
            (x, y, z),
            level
        );
        addr
    }

    /// Whether `x`, `y` and `z` are all multiples of [`tick_len`] for this
    /// address's level (spec §4.4: "All addressing is canonical").
    pub fn is_canonical(&self) -> bool {
        let t = tick_len(self.level) as u64;
        if t == 0 {
            return self.x == 0 && self.y == 0 && self.z == 0;
        }
        self.x as u64 % t == 0 && self.y as u64 % t == 0 && self.z as u64 % t == 0
    }

    /// The cube's key, ignoring node type — two addresses that differ only
    /// in `node_type` name the same position and collide in the store.
    pub fn key(&self) -> (u32, u32, u32, u8) {
        (self.x, self.y, self.z, self.level)
    }
}

/// A geographic coordinate (WGS84 degrees + meters above mean sea level).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LonLatElev {
    pub lon: f64,
    pub lat: f64,
    pub elev: f64,
}

/// The geometry capability: converts between [`LonLatElev`] and [`Address`].
///
/// Kept as a trait (spec §9 design note) even though [`CenCalGeometry`] is
/// its only implementation today.
pub trait Geometry {
    fn lon_lat_elev_to_addr(
        &self,
        point: LonLatElev,
        level: u8,
    ) -> Result<Address, GeometryError>;

    fn addr_to_lon_lat_elev(&self, addr: Address) -> Result<LonLatElev, GeometryError>;

    fn edge_len(&self, level: u8) -> f64;

    fn level(&self, edge_len: f64) -> Result<u8, GeometryError>;

    fn find_parent(&self, addr: Address) -> Option<Address>;

    fn vert_exag(&self) -> f64;

    fn metadata(&self) -> serde_json::Value;
}

/// The one concrete [`Geometry`]: the central-California projected domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenCalGeometry;

impl CenCalGeometry {
    pub fn new() -> Self {
        CenCalGeometry
    }

    fn rotate(&self, x: f64, y: f64) -> (f64, f64) {
        let theta = ROTATION_DEG.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();
        (x * cos_t - y * sin_t, x * sin_t + y * cos_t)
    }

    fn unrotate(&self, p: f64, q: f64) -> (f64, f64) {
        let theta = (-ROTATION_DEG).to_radians();
        let (sin_t, cos_t) = theta.sin_cos();
        (p * cos_t - q * sin_t, p * sin_t + q * cos_t)
    }
}

impl Geometry for CenCalGeometry {
    fn lon_lat_elev_to_addr(
        &self,
        point: LonLatElev,
        level: u8,
    ) -> Result<Address, GeometryError> {
        if !is_valid_level(level) {
            return Err(GeometryError::LevelTooDeep(level));
        }

        let (px, py) = projector::project(point.lon, point.lat)
            .map_err(GeometryError::Projector)?;
        let (rx, ry) = self.rotate(px, py);
        let p = rx + BUFFERNW;
        let q = ry + BUFFERSW;
        let r = ROOTLEN - (point.elev + MAXELEV) * VERTEXAG;

        let edge = self.edge_len(level);
        let tick = tick_len(level) as u64;

        let to_tick = |v: f64| -> u32 {
            let idx = (v / edge).floor();
            let idx = idx.max(0.0) as u64;
            (idx * tick) as u32
        };

        Ok(Address::new(
            to_tick(p),
            to_tick(q),
            to_tick(r),
            level,
            NodeType::Leaf,
        ))
    }

    fn addr_to_lon_lat_elev(&self, addr: Address) -> Result<LonLatElev, GeometryError> {
        let edge = self.edge_len(addr.level);
        let tick = tick_len(addr.level) as f64;

        let center = |coord: u32| -> f64 {
            if tick == 0.0 {
                edge / 2.0
            } else {
                (coord as f64 / tick) * edge + edge / 2.0
            }
        };

        let p = center(addr.x);
        let q = center(addr.y);
        let r = center(addr.z);

        let rx = p - BUFFERNW;
        let ry = q - BUFFERSW;
        let (px, py) = self.unrotate(rx, ry);

        let (lon, lat) =
            projector::inv_project(px, py).map_err(GeometryError::Projector)?;
        let elev = (ROOTLEN - r) / VERTEXAG - MAXELEV;

        Ok(LonLatElev { lon, lat, elev })
    }

    fn edge_len(&self, level: u8) -> f64 {
        ROOTLEN / 2f64.powi(level as i32)
    }

    fn level(&self, edge_len: f64) -> Result<u8, GeometryError> {
        if edge_len <= 0.0 || !edge_len.is_finite() {
            return Err(GeometryError::NotAPowerOfTwoLevel(edge_len));
        }
        let ratio = ROOTLEN / edge_len;
        let level = ratio.log2().round();
        if !(0.0..=31.0).contains(&level) {
            return Err(GeometryError::NotAPowerOfTwoLevel(edge_len));
        }
        let level = level as u8;
        if (self.edge_len(level) - edge_len).abs() > edge_len * 1e-9 {
            return Err(GeometryError::NotAPowerOfTwoLevel(edge_len));
        }
        Ok(level)
    }

    fn find_parent(&self, addr: Address) -> Option<Address> {
        if addr.level == 0 {
            return None;
        }
        let parent_level = addr.level - 1;
        let parent_tick = tick_len(parent_level) as u64;
        let shift = |v: u32| -> u32 { ((v as u64 / parent_tick) * parent_tick) as u32 };
        Some(Address::new(
            shift(addr.x),
            shift(addr.y),
            shift(addr.z),
            parent_level,
            addr.node_type,
        ))
    }

    fn vert_exag(&self) -> f64 {
        VERTEXAG
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "region": "central-california",
            "rootlen_m": ROOTLEN,
            "buffer_nw_m": BUFFERNW,
            "buffer_sw_m": BUFFERSW,
            "max_elev_m": MAXELEV,
            "min_elev_m": MIN_ELEV,
            "vert_exag": VERTEXAG,
            "rotation_deg": ROTATION_DEG,
            "projector": {
                "central_meridian_deg": projector::CENTRAL_MERIDIAN_DEG,
                "scale_factor": projector::SCALE_FACTOR,
                "false_easting_m": projector::FALSE_EASTING,
                "false_northing_m": projector::FALSE_NORTHING,
            },
            "cells_per_wavelength": crate::query::CELLS_PER_WAVELENGTH,
        })
    }
}

impl From<ProjectorError> for GeometryError {
    fn from(e: ProjectorError) -> Self {
        GeometryError::Projector(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_length_level_duality() {
        let geom = CenCalGeometry::new();
        for level in 0u8..20 {
            let edge = geom.edge_len(level);
            assert_eq!(geom.level(edge).unwrap(), level);
        }
    }

    #[test]
    fn edge_len_halves_every_level() {
        let geom = CenCalGeometry::new();
        let mut len = ROOTLEN;
        for level in 0u8..19 {
            assert_eq!(geom.edge_len(level), len);
            len /= 2.0;
        }
    }

    #[test]
    fn address_round_trip() {
        let geom = CenCalGeometry::new();
        let point = LonLatElev {
            lon: -122.4,
            lat: 37.7,
            elev: -500.0,
        };
        for level in 0u8..12 {
            let addr = geom.lon_lat_elev_to_addr(point, level).unwrap();
            assert!(addr.is_canonical());
            let center = geom.addr_to_lon_lat_elev(addr).unwrap();
            let addr2 = geom.lon_lat_elev_to_addr(center, level).unwrap();
            assert_eq!(addr.key(), addr2.key());
        }
    }

    #[test]
    fn parent_strictly_contains_child() {
        let geom = CenCalGeometry::new();
        let point = LonLatElev {
            lon: -121.9,
            lat: 36.6,
            elev: 100.0,
        };
        let addr = geom.lon_lat_elev_to_addr(point, 10).unwrap();
        let parent = geom.find_parent(addr).unwrap();
        assert_eq!(parent.level, addr.level - 1);

        let child_edge = geom.edge_len(addr.level);
        let parent_edge = geom.edge_len(parent.level);
        assert!(parent_edge > child_edge);

        // parent cube [parent.x, parent.x + parent_tick) must contain
        // child cube [addr.x, addr.x + child_tick).
        let parent_tick = tick_len(parent.level);
        let child_tick = tick_len(addr.level);
        assert!(addr.x >= parent.x && addr.x + child_tick <= parent.x + parent_tick);
        assert!(addr.y >= parent.y && addr.y + child_tick <= parent.y + parent_tick);
        assert!(addr.z >= parent.z && addr.z + child_tick <= parent.z + parent_tick);
    }

    #[test]
    fn level_zero_has_no_parent() {
        let geom = CenCalGeometry::new();
        let addr = Address::new(0, 0, 0, 0, NodeType::Leaf);
        assert!(geom.find_parent(addr).is_none());
    }

    #[test]
    fn non_power_of_two_edge_length_is_rejected() {
        let geom = CenCalGeometry::new();
        assert!(geom.level(123.456).is_err());
    }
}
