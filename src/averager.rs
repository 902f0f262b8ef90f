//! Bottom-up interior-node aggregation (spec §4.5): given a store populated
//! only at leaves, fills in every ancestor cube with values summarizing its
//! children, so coarse-resolution queries (MAXRES on a shallow leaf,
//! FIXEDRES/WAVERES landing above the finest populated level) still get a
//! representative answer instead of a fallback to `NODATA`.
//!
//! Grounded in the reference implementation's `TestAverager.cc` fixture
//! (`in.etree` → `out.etree`, level 2, a single populated leaf) for the
//! basic mean-of-one-child case; the disagreement rule for `FaultBlock` and
//! `Zone` (sentinel when children disagree) is this crate's own decision,
//! recorded in the design notes, since the disagreement fixture itself was
//! stripped from the retrievable source.

use std::collections::HashMap;

use crate::error::{ErrorHandler, StoreError};
use crate::geometry::{tick_len, Address, NodeType};
use crate::payload::{Payload, INTERIOR_BLOCK, INTERIOR_ZONE, NODATA_F32, NODATA_I16};
use crate::store::OctreeStore;

type Key = (u32, u32, u32, u8);

fn parent_key(key: Key) -> Key {
    let (x, y, z, level) = key;
    if level == 0 {
        return key;
    }
    let parent_level = level - 1;
    let tick = tick_len(parent_level) as u64;
    let align = |v: u32| -> u32 { ((v as u64 / tick) * tick) as u32 };
    (align(x), align(y), align(z), parent_level)
}

/// Mean of the non-`NODATA` values in `values`, or `NODATA_F32` if none are
/// valid.
fn mean_ignoring_nodata(values: &[f32]) -> f32 {
    let valid: Vec<f32> = values.iter().copied().filter(|v| *v != NODATA_F32).collect();
    if valid.is_empty() {
        NODATA_F32
    } else {
        valid.iter().sum::<f32>() / valid.len() as f32
    }
}

/// The common value of `values` if every non-`NODATA` entry agrees, else
/// `sentinel`.
fn common_or_sentinel(values: &[i16], sentinel: i16) -> i16 {
    let mut valid = values.iter().copied().filter(|v| *v != NODATA_I16);
    match valid.next() {
        None => NODATA_I16,
        Some(first) => {
            if valid.all(|v| v == first) {
                first
            } else {
                sentinel
            }
        }
    }
}

fn aggregate(children: &[Payload]) -> Payload {
    let vp: Vec<f32> = children.iter().map(|p| p.vp).collect();
    let vs: Vec<f32> = children.iter().map(|p| p.vs).collect();
    let density: Vec<f32> = children.iter().map(|p| p.density).collect();
    let qp: Vec<f32> = children.iter().map(|p| p.qp).collect();
    let qs: Vec<f32> = children.iter().map(|p| p.qs).collect();
    let depth: Vec<f32> = children.iter().map(|p| p.depth_free_surf).collect();
    let blocks: Vec<i16> = children.iter().map(|p| p.fault_block).collect();
    let zones: Vec<i16> = children.iter().map(|p| p.zone).collect();

    Payload {
        vp: mean_ignoring_nodata(&vp),
        vs: mean_ignoring_nodata(&vs),
        density: mean_ignoring_nodata(&density),
        qp: mean_ignoring_nodata(&qp),
        qs: mean_ignoring_nodata(&qs),
        depth_free_surf: mean_ignoring_nodata(&depth),
        fault_block: common_or_sentinel(&blocks, INTERIOR_BLOCK),
        zone: common_or_sentinel(&zones, INTERIOR_ZONE),
    }
}

/// Builds the interior levels of `output` from the leaves of `input`.
///
/// `input` and `output` may be the same store reopened for read-write, or
/// distinct stores (mirroring the reference tool's separate `in.etree` /
/// `out.etree` files). Already-populated addresses in `output` are left
/// untouched; this makes repeated averaging idempotent.
///
/// Owns an [`ErrorHandler`] (spec §3's lifecycle note: "ErrorHandler is
/// owned by exactly one top-level component — creator, averager, or
/// query"), driven alongside the `Result`-based Rust API rather than
/// instead of it.
#[derive(Default)]
pub struct Averager {
    error_handler: ErrorHandler,
}

impl Averager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    pub fn average(&mut self, input: &OctreeStore, output: &mut OctreeStore) -> Result<(), StoreError> {
        match self.average_inner(input, output) {
            Ok(()) => {
                self.error_handler.reset_status();
                Ok(())
            }
            Err(e) => {
                self.error_handler.error(e.to_string());
                Err(e)
            }
        }
    }

    fn average_inner(&self, input: &OctreeStore, output: &mut OctreeStore) -> Result<(), StoreError> {
        let leaves = input.iter()?;
        let max_level = leaves.iter().map(|(a, _)| a.level).max().unwrap_or(0);

        let mut nodes: HashMap<Key, (Payload, NodeType)> = HashMap::new();
        for (addr, payload) in &leaves {
            nodes.insert(addr.key(), (*payload, addr.node_type));
        }

        for level in (1..=max_level).rev() {
            let mut groups: HashMap<Key, Vec<Payload>> = HashMap::new();
            for (&key, &(payload, _)) in nodes.iter() {
                if key.3 != level {
                    continue;
                }
                groups.entry(parent_key(key)).or_default().push(payload);
            }
            log::debug!("averaging level {level} into {} parent cubes", groups.len());
            for (parent, children) in groups {
                nodes.entry(parent).or_insert_with(|| (aggregate(&children), NodeType::Interior));
            }
        }

        for (&(x, y, z, level), &(payload, node_type)) in nodes.iter() {
            let addr = Address::new(x, y, z, level, node_type);
            match output.search(addr) {
                Ok(Some((found, _))) if found.key() == addr.key() => continue,
                _ => output.insert(addr, payload)?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpenMode;
    use tempfile::tempdir;

    fn leaf_payload(vp: f32, block: i16) -> Payload {
        Payload {
            vp,
            vs: vp / 10.0,
            density: 2.6,
            qp: 500.0,
            qs: 250.0,
            depth_free_surf: 50.0,
            fault_block: block,
            zone: block,
        }
    }

    #[test]
    fn single_leaf_averages_to_its_own_value() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("in.etree");
        let out_path = dir.path().join("out.etree");

        let mut input = OctreeStore::open(&in_path, OpenMode::ReadWrite, 8).unwrap();
        // level 2, tick (2, 0, 2) in TestAverager.cc's fixture units.
        let leaf = Address::new(
            2 * tick_len(2),
            0,
            2 * tick_len(2),
            2,
            NodeType::Leaf,
        );
        let payload = Payload {
            vp: 10.0,
            vs: 1.0,
            density: 0.1,
            qp: 0.01,
            qs: 0.001,
            depth_free_surf: 100.0,
            fault_block: 1,
            zone: 1,
        };
        input.insert(leaf, payload).unwrap();

        let mut output = OctreeStore::open(&out_path, OpenMode::ReadWrite, 8).unwrap();
        Averager::new().average(&input, &mut output).unwrap();

        let parent = Address::new(0, 0, 0, 1, NodeType::Interior);
        let (_found, agg) = output.search(parent).unwrap().unwrap();
        assert_eq!(agg.vp, 10.0);
        assert_eq!(agg.fault_block, 1);
    }

    #[test]
    fn disagreeing_children_yield_interior_sentinel() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("in.etree");
        let out_path = dir.path().join("out.etree");

        let mut input = OctreeStore::open(&in_path, OpenMode::ReadWrite, 8).unwrap();
        let level = 3;
        let t = tick_len(level);
        let a = Address::new(0, 0, 0, level, NodeType::Leaf);
        let b = Address::new(t, 0, 0, level, NodeType::Leaf);
        input.insert(a, leaf_payload(100.0, 1)).unwrap();
        input.insert(b, leaf_payload(200.0, 2)).unwrap();

        let mut output = OctreeStore::open(&out_path, OpenMode::ReadWrite, 8).unwrap();
        Averager::new().average(&input, &mut output).unwrap();

        let parent = Address::new(0, 0, 0, level - 1, NodeType::Interior);
        let (_found, agg) = output.search(parent).unwrap().unwrap();
        assert_eq!(agg.vp, 150.0);
        assert_eq!(agg.fault_block, INTERIOR_BLOCK);
    }

    #[test]
    fn averaging_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("in.etree");
        let out_path = dir.path().join("out.etree");

        let mut input = OctreeStore::open(&in_path, OpenMode::ReadWrite, 8).unwrap();
        let level = 2;
        let t = tick_len(level);
        input
            .insert(Address::new(0, 0, 0, level, NodeType::Leaf), leaf_payload(42.0, 7))
            .unwrap();
        input
            .insert(Address::new(t, 0, 0, level, NodeType::Leaf), leaf_payload(42.0, 7))
            .unwrap();

        let mut output = OctreeStore::open(&out_path, OpenMode::ReadWrite, 8).unwrap();
        Averager::new().average(&input, &mut output).unwrap();
        let before = output.iter().unwrap();

        Averager::new().average(&input, &mut output).unwrap();
        let after = output.iter().unwrap();

        assert_eq!(before.len(), after.len());
    }
}
