//! On-disk octree database: a flat, append-only record file plus a
//! directory (address → file offset) sidecar, the same split the reference
//! implementation's etree-backed storage uses and the one modeled in the
//! teacher's `GridCellDirectory` (a page directory serialized separately
//! from the payload data it indexes).
//!
//! Unlike the teacher's `PageManager`, this store is single-threaded and
//! non-reentrant (spec §5): no `Mutex`, no background flush thread. The
//! only interior mutability is the bounded LRU of decoded [`Payload`]s,
//! which a read-only `search` still needs to update.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StoreError;
use crate::geometry::{tick_len, Address, CenCalGeometry, Geometry, NodeType};
use crate::lru_cache::lru::Lru;
use crate::payload::{self, FieldDescriptor, Payload, PAYLOAD_BYTES};

const MAGIC: u32 = 0xCE_CA_1_D;
const SCHEMA_VERSION: u16 = 1;
/// 1 tag byte (node type) + the payload's fixed record.
const RECORD_BYTES: usize = 1 + PAYLOAD_BYTES;

/// Writes the data file's header (spec §6): magic, version, the published
/// payload schema and a free-form metadata blob (geometry/projector
/// constants), each length-prefixed JSON so a reader never needs to guess
/// field widths. Returns the file offset the first record starts at.
fn write_header(file: &mut File, metadata: &serde_json::Value) -> Result<u64, StoreError> {
    file.write_u32::<LittleEndian>(MAGIC)?;
    file.write_u16::<LittleEndian>(SCHEMA_VERSION)?;

    let schema_json = serde_json::to_vec(&payload::schema())
        .map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;
    file.write_u32::<LittleEndian>(schema_json.len() as u32)?;
    file.write_all(&schema_json)?;

    let metadata_json =
        serde_json::to_vec(metadata).map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;
    file.write_u32::<LittleEndian>(metadata_json.len() as u32)?;
    file.write_all(&metadata_json)?;

    Ok(file.stream_position()?)
}

/// Reads and validates the data file's header, returning the schema it
/// describes, its metadata blob, and the offset the first record starts at.
fn read_header(
    file: &mut File,
) -> Result<(Vec<FieldDescriptor>, serde_json::Value, u64), StoreError> {
    file.seek(SeekFrom::Start(0))?;
    let magic = file.read_u32::<LittleEndian>()?;
    let version = file.read_u16::<LittleEndian>()?;
    if magic != MAGIC || version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch);
    }

    let schema_len = file.read_u32::<LittleEndian>()? as usize;
    let mut schema_buf = vec![0u8; schema_len];
    file.read_exact(&mut schema_buf)?;
    let schema: Vec<FieldDescriptor> = serde_json::from_slice(&schema_buf)
        .map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;
    if schema != payload::schema() {
        return Err(StoreError::SchemaMismatch);
    }

    let metadata_len = file.read_u32::<LittleEndian>()? as usize;
    let mut metadata_buf = vec![0u8; metadata_len];
    file.read_exact(&mut metadata_buf)?;
    let metadata: serde_json::Value = serde_json::from_slice(&metadata_buf)
        .map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;

    let data_start = file.stream_position()?;
    Ok((schema, metadata, data_start))
}

type Key = (u32, u32, u32, u8);

/// Whether a store was opened to accept [`OctreeStore::insert`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DirEntry {
    offset: u64,
    node_type: NodeType,
}

#[derive(Serialize, Deserialize)]
struct DirectoryFile {
    magic: u32,
    version: u16,
    record_bytes: u32,
    entries: HashMap<Key, DirEntry>,
}

impl DirectoryFile {
    fn empty() -> Self {
        DirectoryFile {
            magic: MAGIC,
            version: SCHEMA_VERSION,
            record_bytes: RECORD_BYTES as u32,
            entries: HashMap::new(),
        }
    }
}

/// Whether `ancestor` (at `ancestor_level`) covers `key` (a finer-or-equal
/// cube). Two cubes at the same level "cover" each other only when they are
/// identical.
///
/// Disjointness (spec §4.4) is a constraint on *leaves* only: "every
/// interior node has at least one descendant leaf" (spec §3) means interior
/// aggregates are expected to nest over the leaves (and other interiors)
/// they summarize, so this is only ever consulted for a leaf/leaf pair.
fn covers(ancestor_level: u8, ancestor: (u32, u32, u32), key_level: u8, key: (u32, u32, u32)) -> bool {
    if ancestor_level > key_level {
        return false;
    }
    let tick = tick_len(ancestor_level) as u64;
    let align = |v: u32| -> u32 { ((v as u64 / tick) * tick) as u32 };
    align(key.0) == ancestor.0 && align(key.1) == ancestor.1 && align(key.2) == ancestor.2
}

/// A flat, single-file octree database: insert disjoint cubes, look a point
/// up by exact address or nearest populated ancestor (spec §4.4).
pub struct OctreeStore {
    path: PathBuf,
    directory_path: PathBuf,
    mode: OpenMode,
    file: File,
    directory: DirectoryFile,
    dirty: bool,
    cache: RefCell<Lru<Key, Payload>>,
    cache_capacity: usize,
    /// Free-form metadata blob read from (or, for a fresh store, written
    /// into) the data file header (spec §6).
    metadata: serde_json::Value,
}

impl OctreeStore {
    /// Opens (creating if necessary, in [`OpenMode::ReadWrite`]) the data
    /// file at `path` and its `<path>.dir` directory sidecar.
    ///
    /// `cache_mb` bounds the decoded-payload LRU; it is a soft budget, not a
    /// hard memory cap (spec §5's "approximate, not exact" wording for the
    /// page cache).
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        cache_mb: usize,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut directory_file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        directory_file_name.push(".dir");
        let directory_path = path.with_file_name(directory_file_name);

        let mut file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&path)?,
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        };

        let is_fresh = file.metadata()?.len() == 0;
        let metadata = if is_fresh {
            if mode == OpenMode::ReadOnly {
                return Err(StoreError::CorruptDirectory(format!(
                    "missing header in {}",
                    path.display()
                )));
            }
            let metadata = CenCalGeometry::new().metadata();
            write_header(&mut file, &metadata)?;
            metadata
        } else {
            let (_schema, metadata, _data_start) = read_header(&mut file)?;
            metadata
        };

        let directory = if directory_path.exists() {
            let dir_file = File::open(&directory_path)?;
            let parsed: DirectoryFile = bincode::deserialize_from(dir_file)
                .map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;
            if parsed.magic != MAGIC || parsed.version != SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch);
            }
            if parsed.record_bytes as usize != RECORD_BYTES {
                return Err(StoreError::SchemaMismatch);
            }
            parsed
        } else if mode == OpenMode::ReadOnly {
            return Err(StoreError::CorruptDirectory(format!(
                "missing directory file {}",
                directory_path.display()
            )));
        } else {
            DirectoryFile::empty()
        };

        let cache_capacity = (cache_mb * 1_000_000 / PAYLOAD_BYTES.max(1)).max(16);

        Ok(OctreeStore {
            path,
            directory_path,
            mode,
            file,
            directory,
            dirty: false,
            cache: RefCell::new(Lru::new()),
            cache_capacity,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The free-form metadata blob recorded in this store's header (spec
    /// §6), e.g. the geometry/projector constants it was built under.
    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.directory.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.entries.is_empty()
    }

    /// Inserts `payload` at `addr`. Fails if `addr` is a leaf and any
    /// ancestor or descendant *leaf* is already populated (spec §4.4: leaves
    /// must be disjoint). Interior nodes are expected to nest over the
    /// leaves (and other interiors) they aggregate (spec §3, §4.5) and so
    /// are exempt from this check.
    pub fn insert(&mut self, addr: Address, payload: Payload) -> Result<(), StoreError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }
        if !addr.is_canonical() {
            return Err(StoreError::NonCanonicalAddress { level: addr.level });
        }

        let new_key = addr.key();
        if addr.node_type == NodeType::Leaf {
            for (&existing_key, entry) in self.directory.entries.iter() {
                if entry.node_type != NodeType::Leaf {
                    continue;
                }
                let conflict = if existing_key.3 <= new_key.3 {
                    covers(
                        existing_key.3,
                        (existing_key.0, existing_key.1, existing_key.2),
                        new_key.3,
                        (new_key.0, new_key.1, new_key.2),
                    )
                } else {
                    covers(
                        new_key.3,
                        (new_key.0, new_key.1, new_key.2),
                        existing_key.3,
                        (existing_key.0, existing_key.1, existing_key.2),
                    )
                };
                if conflict {
                    let existing = Address {
                        x: existing_key.0,
                        y: existing_key.1,
                        z: existing_key.2,
                        level: existing_key.3,
                        node_type: entry.node_type,
                    };
                    return Err(StoreError::NotDisjoint { new: addr, existing });
                }
            }
        }

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[match addr.node_type {
            NodeType::Leaf => 0u8,
            NodeType::Interior => 1u8,
        }])?;
        payload.encode(&mut self.file)?;

        self.directory.entries.insert(
            new_key,
            DirEntry {
                offset,
                node_type: addr.node_type,
            },
        );
        self.cache.borrow_mut().insert(new_key, payload);
        self.dirty = true;
        Ok(())
    }

    /// Looks up `addr` exactly; on a miss, walks up through coarser
    /// ancestors until a populated one is found (spec §4.4's "nearest
    /// populated ancestor" fallback used by [`crate::query`]'s MAXRES mode).
    pub fn search(&self, addr: Address) -> Result<Option<(Address, Payload)>, StoreError> {
        let mut level = addr.level;
        let mut x = addr.x;
        let mut y = addr.y;
        let mut z = addr.z;

        loop {
            if let Some(&entry) = self.directory.entries.get(&(x, y, z, level)) {
                let payload = self.fetch(&(x, y, z, level), entry.offset)?;
                let found = Address {
                    x,
                    y,
                    z,
                    level,
                    node_type: entry.node_type,
                };
                return Ok(Some((found, payload)));
            }
            if level == 0 {
                return Ok(None);
            }
            level -= 1;
            let tick = tick_len(level) as u64;
            x = ((x as u64 / tick) * tick) as u32;
            y = ((y as u64 / tick) * tick) as u32;
            z = ((z as u64 / tick) * tick) as u32;
        }
    }

    fn fetch(&self, key: &Key, offset: u64) -> Result<Payload, StoreError> {
        if let Some(payload) = self.cache.borrow_mut().touch(key) {
            return Ok(*payload);
        }

        log::trace!("cache miss at {key:?}, faulting record from offset {offset}");
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut tag = [0u8; 1];
        file.read_exact(&mut tag)?;
        let payload = Payload::decode(&mut file)?;

        let mut cache = self.cache.borrow_mut();
        if cache.len() >= self.cache_capacity {
            if let Some((lru_key, _)) = cache.iter().next().map(|(k, v)| (*k, *v)) {
                log::trace!("evicting {lru_key:?} from page cache");
                cache.remove(&lru_key);
            }
        }
        cache.insert(*key, payload);
        Ok(payload)
    }

    /// All populated nodes, ordered coarse-to-fine (root-ward first) as a
    /// best-effort preorder: the directory has no explicit tree pointers,
    /// so ties within a level are broken by tick coordinate.
    pub fn iter(&self) -> Result<Vec<(Address, Payload)>, StoreError> {
        let mut keys: Vec<Key> = self.directory.entries.keys().copied().collect();
        keys.sort_by_key(|k| (k.3, k.0, k.1, k.2));

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = self.directory.entries[&key];
            let payload = self.fetch(&key, entry.offset)?;
            out.push((
                Address {
                    x: key.0,
                    y: key.1,
                    z: key.2,
                    level: key.3,
                    node_type: entry.node_type,
                },
                payload,
            ));
        }
        Ok(out)
    }

    /// Flushes the directory sidecar to disk, if it has changed since the
    /// last flush. Called automatically on [`Drop`]; exposed so callers can
    /// observe and propagate I/O errors instead of losing them at drop time.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        if self.mode == OpenMode::ReadWrite && self.dirty {
            let dir_file = File::create(&self.directory_path)?;
            bincode::serialize_into(dir_file, &self.directory)
                .map_err(|e| StoreError::CorruptDirectory(e.to_string()))?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for OctreeStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("failed to flush octree store {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CenCalGeometry, Geometry, LonLatElev};

    fn sample_payload(tag: f32) -> Payload {
        Payload {
            vp: tag,
            vs: tag / 2.0,
            density: 2.5,
            qp: 100.0,
            qs: 50.0,
            depth_free_surf: 10.0,
            fault_block: 3,
            zone: 4,
        }
    }

    #[test]
    fn insert_then_search_exact_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();

        let geom = CenCalGeometry::new();
        let point = LonLatElev {
            lon: -122.0,
            lat: 37.0,
            elev: -1000.0,
        };
        let addr = geom.lon_lat_elev_to_addr(point, 8).unwrap();
        store.insert(addr, sample_payload(5.0)).unwrap();

        let (found, payload) = store.search(addr).unwrap().unwrap();
        assert_eq!(found.key(), addr.key());
        assert_eq!(payload.vp, 5.0);
    }

    #[test]
    fn search_falls_back_to_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();

        let geom = CenCalGeometry::new();
        let point = LonLatElev {
            lon: -122.0,
            lat: 37.0,
            elev: -1000.0,
        };
        let coarse = geom.lon_lat_elev_to_addr(point, 4).unwrap();
        store.insert(coarse, sample_payload(9.0)).unwrap();

        let fine = geom.lon_lat_elev_to_addr(point, 10).unwrap();
        let (found, payload) = store.search(fine).unwrap().unwrap();
        assert_eq!(found.key(), coarse.key());
        assert_eq!(payload.vp, 9.0);
    }

    #[test]
    fn insert_rejects_ancestor_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();

        let geom = CenCalGeometry::new();
        let point = LonLatElev {
            lon: -121.0,
            lat: 36.5,
            elev: 0.0,
        };
        let coarse = geom.lon_lat_elev_to_addr(point, 3).unwrap();
        let fine = geom.lon_lat_elev_to_addr(point, 9).unwrap();

        store.insert(coarse, sample_payload(1.0)).unwrap();
        let err = store.insert(fine, sample_payload(2.0)).unwrap_err();
        assert!(matches!(err, StoreError::NotDisjoint { .. }));
    }

    #[test]
    fn interior_nodes_may_nest_over_leaves_and_other_interiors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();

        let leaf = Address::new(0x4000_0000, 0, 0x4000_0000, 1, NodeType::Leaf);
        store.insert(leaf, sample_payload(1.0)).unwrap();

        // An interior aggregate directly over the leaf above, and a
        // coarser interior aggregate over that, are both the expected
        // shape of an averaged store (spec §3, §4.5) -- not a
        // disjointness violation.
        let interior_over_leaf = Address::new(0, 0, 0, 0, NodeType::Interior);
        store.insert(interior_over_leaf, sample_payload(2.0)).unwrap();
    }

    #[test]
    fn read_only_store_rejects_insert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        {
            let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();
            let addr = Address::new(0, 0, 0, 0, NodeType::Leaf);
            store.insert(addr, Payload::nodata()).unwrap();
        }

        let mut ro = OctreeStore::open(&path, OpenMode::ReadOnly, 16).unwrap();
        let addr = Address::new(0x4000_0000, 0, 0, 1, NodeType::Leaf);
        let err = ro.insert(addr, Payload::nodata()).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }

    #[test]
    fn directory_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let addr = Address::new(0, 0, 0, 0, NodeType::Leaf);
        {
            let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();
            store.insert(addr, sample_payload(42.0)).unwrap();
            store.close().unwrap();
        }

        let reopened = OctreeStore::open(&path, OpenMode::ReadOnly, 16).unwrap();
        let (_found, payload) = reopened.search(addr).unwrap().unwrap();
        assert_eq!(payload.vp, 42.0);
    }

    #[test]
    fn iter_is_coarse_to_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();

        let child = Address::new(0x4000_0000, 0, 0, 1, NodeType::Leaf);
        let other = Address::new(0, 0x4000_0000, 0, 1, NodeType::Leaf);
        store.insert(child, sample_payload(2.0)).unwrap();
        store.insert(other, sample_payload(3.0)).unwrap();

        let all = store.iter().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].0.level <= all[1].0.level);
    }

    #[test]
    fn random_disjoint_leaves_survive_cache_eviction() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        // cache_mb is tiny relative to the number of leaves inserted below,
        // so most lookups will miss the in-memory LRU and re-read from disk.
        let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 0).unwrap();

        let level = 12u8;
        let tick = tick_len(level) as u32;
        let span = 1u32 << level;

        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut placed = Vec::new();
        let mut seen = std::collections::HashSet::new();
        while placed.len() < 64 {
            let ix = rng.gen_range(0..span);
            let iy = rng.gen_range(0..span);
            let iz = rng.gen_range(0..span);
            if !seen.insert((ix, iy, iz)) {
                continue;
            }
            let addr = Address::new(ix * tick, iy * tick, iz * tick, level, NodeType::Leaf);
            let tag = placed.len() as f32;
            store.insert(addr, sample_payload(tag)).unwrap();
            placed.push((addr, tag));
        }

        for (addr, tag) in &placed {
            let (_found, payload) = store.search(*addr).unwrap().unwrap();
            assert_eq!(payload.vp, *tag);
        }
    }

    #[test]
    fn fresh_store_writes_geometry_metadata_and_it_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");

        let expected = CenCalGeometry::new().metadata();
        {
            let store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();
            assert_eq!(store.metadata(), &expected);
        }

        let reopened = OctreeStore::open(&path, OpenMode::ReadOnly, 16).unwrap();
        assert_eq!(reopened.metadata(), &expected);
    }

    #[test]
    fn reopen_rejects_file_with_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vm");
        let dir_path = dir.path().join("test.vm.dir");
        {
            let mut store = OctreeStore::open(&path, OpenMode::ReadWrite, 16).unwrap();
            store
                .insert(Address::new(0, 0, 0, 0, NodeType::Leaf), sample_payload(1.0))
                .unwrap();
            store.close().unwrap();
        }

        // Directory sidecar is untouched; only the header's magic is
        // corrupted, so this is purely a schema-mismatch case and not a
        // directory-parsing failure.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_u32::<LittleEndian>(0xDEAD_BEEF).unwrap();
        }

        let err = OctreeStore::open(&path, OpenMode::ReadOnly, 16).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch));
        // Sanity check the directory file was indeed left alone.
        assert!(dir_path.exists());
    }
}
