//! The fixed-layout value bundle stored at every octree node (spec §4.3).
//!
//! Field order and sentinels are taken from the reference implementation's
//! `TestAverager.cc` fixture (`Vp, Vs, Density, Qp, Qs, DepthFreeSurf,
//! FaultBlock, Zone`). The binary layout is manual (`byteorder`) rather than
//! derived, since it must match this exact field order and width on disk
//! regardless of struct field order in a future refactor.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Sentinel for a missing floating-point value.
pub const NODATA_F32: f32 = -999.0;
/// Sentinel for a missing integer value.
pub const NODATA_I16: i16 = -999;
/// `FaultBlock`/`Zone` value written into an interior node, where no single
/// child value applies (spec §4.5.2).
pub const INTERIOR_BLOCK: i16 = -1;
pub const INTERIOR_ZONE: i16 = -1;

/// On-disk record size in bytes: six `f32` fields plus two `i16` fields.
pub const PAYLOAD_BYTES: usize = 6 * 4 + 2 * 2;

/// Type code for an on-disk `f32` field (see [`FieldDescriptor`]).
pub const TYPE_F32: u8 = 0;
/// Type code for an on-disk `i16` field.
pub const TYPE_I16: u8 = 1;

/// One field of the published on-disk schema: name, type code, byte size and
/// byte offset within a record. Written into the store header (spec §6) so
/// a reader can check bit-compatibility without hard-coding the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub type_code: u8,
    pub size: u8,
    pub offset: u16,
}

/// The published on-disk schema, in the exact field order spec §6 pins:
/// `Vp, Vs, Density, Qp, Qs, DepthFreeSurf, FaultBlock, Zone`.
pub fn schema() -> Vec<FieldDescriptor> {
    let f32_field = |name: &str, offset: u16| FieldDescriptor {
        name: name.to_string(),
        type_code: TYPE_F32,
        size: 4,
        offset,
    };
    let i16_field = |name: &str, offset: u16| FieldDescriptor {
        name: name.to_string(),
        type_code: TYPE_I16,
        size: 2,
        offset,
    };
    vec![
        f32_field("Vp", 0),
        f32_field("Vs", 4),
        f32_field("Density", 8),
        f32_field("Qp", 12),
        f32_field("Qs", 16),
        f32_field("DepthFreeSurf", 20),
        i16_field("FaultBlock", 24),
        i16_field("Zone", 26),
    ]
}

/// The geophysical values attached to one octree node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub vp: f32,
    pub vs: f32,
    pub density: f32,
    pub qp: f32,
    pub qs: f32,
    pub depth_free_surf: f32,
    pub fault_block: i16,
    pub zone: i16,
}

impl Payload {
    /// A payload with every field set to its `NODATA` sentinel.
    pub fn nodata() -> Self {
        Payload {
            vp: NODATA_F32,
            vs: NODATA_F32,
            density: NODATA_F32,
            qp: NODATA_F32,
            qs: NODATA_F32,
            depth_free_surf: NODATA_F32,
            fault_block: NODATA_I16,
            zone: NODATA_I16,
        }
    }

    /// An interior-node placeholder: all float fields `NODATA`, block/zone
    /// set to their dedicated interior sentinels.
    pub fn interior_placeholder() -> Self {
        Payload {
            fault_block: INTERIOR_BLOCK,
            zone: INTERIOR_ZONE,
            ..Payload::nodata()
        }
    }

    /// The canonical field order and names, for tools that want to describe
    /// the on-disk schema without hard-coding it (spec §4.3's "Payload
    /// Fields" table).
    pub const FIELD_NAMES: [&'static str; 8] = [
        "Vp",
        "Vs",
        "Density",
        "Qp",
        "Qs",
        "DepthFreeSurf",
        "FaultBlock",
        "Zone",
    ];

    /// Writes this payload in its fixed binary layout.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(self.vp)?;
        w.write_f32::<LittleEndian>(self.vs)?;
        w.write_f32::<LittleEndian>(self.density)?;
        w.write_f32::<LittleEndian>(self.qp)?;
        w.write_f32::<LittleEndian>(self.qs)?;
        w.write_f32::<LittleEndian>(self.depth_free_surf)?;
        w.write_i16::<LittleEndian>(self.fault_block)?;
        w.write_i16::<LittleEndian>(self.zone)?;
        Ok(())
    }

    /// Reads a payload previously written by [`Self::encode`].
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Payload {
            vp: r.read_f32::<LittleEndian>()?,
            vs: r.read_f32::<LittleEndian>()?,
            density: r.read_f32::<LittleEndian>()?,
            qp: r.read_f32::<LittleEndian>()?,
            qs: r.read_f32::<LittleEndian>()?,
            depth_free_surf: r.read_f32::<LittleEndian>()?,
            fault_block: r.read_i16::<LittleEndian>()?,
            zone: r.read_i16::<LittleEndian>()?,
        })
    }

    /// Value of the named field, or `None` if `name` is not one of the
    /// eight stored fields (callers also recognize the synthetic
    /// `"Elevation"` column; that one is computed by [`crate::query`], not
    /// stored here).
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "Vp" => Some(self.vp as f64),
            "Vs" => Some(self.vs as f64),
            "Density" => Some(self.density as f64),
            "Qp" => Some(self.qp as f64),
            "Qs" => Some(self.qs as f64),
            "DepthFreeSurf" => Some(self.depth_free_surf as f64),
            "FaultBlock" => Some(self.fault_block as f64),
            "Zone" => Some(self.zone as f64),
            _ => None,
        }
    }
}
