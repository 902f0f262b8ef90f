//! `VMQuery`: the single point-lookup entry point (spec §4.6), wrapping a
//! primary [`OctreeStore`] (and an optional extended-domain fallback store)
//! behind a small state machine — `Unbound → Configured → Open →
//! Configured` — mirroring the reference query engine's
//! `cencalvm::query::VMQuery` lifecycle (`filename()`/`open()`/`query()`/
//! `close()`), exercised end to end in `TestVMQuery.cc`.

use std::path::{Path, PathBuf};

use crate::error::{ErrorHandler, QueryError};
use crate::geometry::{CenCalGeometry, Geometry, LonLatElev, MIN_ELEV};
use crate::payload::{Payload, NODATA_F32};
use crate::store::{OctreeStore, OpenMode};

/// Shear-wavelength-tuned resolution: target cell edge length is this
/// fraction of the local shear wavelength (`Vs * period`).
pub const CELLS_PER_WAVELENGTH: f64 = 0.5;

/// The eight stored [`Payload`] fields plus the synthetic `Elevation`
/// column, in the reference implementation's default column order
/// (`TestVMQuery.cc`'s `defaultNumVals == 9`).
pub const DEFAULT_VALUE_NAMES: [&str; 9] = [
    "Vp",
    "Vs",
    "Density",
    "Qp",
    "Qs",
    "DepthFreeSurf",
    "FaultBlock",
    "Zone",
    "Elevation",
];

/// Default soft cap on the store's decoded-payload cache, megabytes.
pub const DEFAULT_CACHE_MB: usize = 16;

/// Default squash limit: elevations below this (meters, negative is down)
/// are never squashed onto the free surface.
pub const DEFAULT_SQUASH_LIMIT: f64 = -2000.0;

/// How a query resolves to an octree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Finest populated leaf (or its nearest populated ancestor).
    MaxRes,
    /// A caller-specified resolution, in meters.
    FixedRes,
    /// Tuned to the local shear wavelength (spec §4.6.4).
    WaveRes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unbound,
    Configured,
    Open,
}

/// A configured, opened point query against a velocity model database.
pub struct VMQuery {
    state: State,
    filename: Option<PathBuf>,
    extended_filename: Option<PathBuf>,
    cache_mb: usize,
    query_type: QueryType,
    /// Meters for `FixedRes`, seconds for `WaveRes`; unused for `MaxRes`.
    resolution_param: f64,
    value_names: Vec<String>,
    squash_topo: bool,
    squash_limit: f64,
    store: Option<OctreeStore>,
    extended_store: Option<OctreeStore>,
    geometry: CenCalGeometry,
    error_handler: ErrorHandler,
}

impl Default for VMQuery {
    fn default() -> Self {
        VMQuery {
            state: State::Unbound,
            filename: None,
            extended_filename: None,
            cache_mb: DEFAULT_CACHE_MB,
            query_type: QueryType::MaxRes,
            resolution_param: 0.0,
            value_names: DEFAULT_VALUE_NAMES.iter().map(|s| s.to_string()).collect(),
            squash_topo: false,
            squash_limit: DEFAULT_SQUASH_LIMIT,
            store: None,
            extended_store: None,
            geometry: CenCalGeometry::new(),
            error_handler: ErrorHandler::new(),
        }
    }
}

impl VMQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    fn require_not_open(&self) -> Result<(), QueryError> {
        if self.state == State::Open {
            Err(QueryError::InvalidState("database is open"))
        } else {
            Ok(())
        }
    }

    /// Sets the primary database file. Must be called before [`Self::open`].
    pub fn set_filename(&mut self, path: impl AsRef<Path>) -> Result<(), QueryError> {
        self.require_not_open()?;
        self.filename = Some(path.as_ref().to_path_buf());
        if self.state == State::Unbound {
            self.state = State::Configured;
        }
        Ok(())
    }

    /// Sets a secondary database consulted when the primary store has no
    /// data at all for a point (spec §4.6.7's extended-domain fallback).
    pub fn set_extended_filename(&mut self, path: impl AsRef<Path>) -> Result<(), QueryError> {
        self.require_not_open()?;
        self.extended_filename = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    pub fn set_cache_size(&mut self, cache_mb: usize) -> Result<(), QueryError> {
        self.require_not_open()?;
        self.cache_mb = cache_mb;
        Ok(())
    }

    pub fn set_query_type(&mut self, query_type: QueryType) -> Result<(), QueryError> {
        self.query_type = query_type;
        Ok(())
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Sets the resolution parameter (meters for `FixedRes`, seconds for
    /// `WaveRes`). Rejects non-positive values (open question §9b).
    pub fn set_query_res(&mut self, value: f64) -> Result<(), QueryError> {
        if !(value > 0.0) {
            return Err(QueryError::InvalidArgument(value));
        }
        self.resolution_param = value;
        Ok(())
    }

    /// Sets the list (and order) of values a subsequent [`Self::query`]
    /// returns. Each name must be one of [`DEFAULT_VALUE_NAMES`].
    pub fn set_query_vals(&mut self, names: &[&str]) -> Result<(), QueryError> {
        for name in names {
            if !DEFAULT_VALUE_NAMES.contains(name) {
                return Err(QueryError::UnknownValueName(name.to_string()));
            }
        }
        self.value_names = names.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    pub fn query_vals(&self) -> &[String] {
        &self.value_names
    }

    /// Enables or disables topography squash, optionally setting the
    /// squash limit (defaults to [`DEFAULT_SQUASH_LIMIT`]).
    pub fn set_squash(&mut self, on: bool, limit: Option<f64>) {
        self.squash_topo = on;
        if let Some(limit) = limit {
            self.squash_limit = limit;
        }
    }

    pub fn squash_enabled(&self) -> bool {
        self.squash_topo
    }

    pub fn squash_limit(&self) -> f64 {
        self.squash_limit
    }

    /// Opens the primary (and, if set, extended) store for querying.
    pub fn open(&mut self) -> Result<(), QueryError> {
        if self.state == State::Open {
            return Err(QueryError::InvalidState("database is already open"));
        }
        let filename = self.filename.clone().ok_or(QueryError::FilenameNotSet)?;
        let store = OctreeStore::open(&filename, OpenMode::ReadOnly, self.cache_mb)?;
        let extended_store = match &self.extended_filename {
            Some(path) => Some(OctreeStore::open(path, OpenMode::ReadOnly, self.cache_mb)?),
            None => None,
        };
        self.store = Some(store);
        self.extended_store = extended_store;
        self.state = State::Open;
        self.error_handler.reset_status();
        Ok(())
    }

    /// Closes the store(s) opened by [`Self::open`], returning to the
    /// `Configured` state so filenames/parameters can be changed and the
    /// query reopened.
    pub fn close(&mut self) -> Result<(), QueryError> {
        if self.state != State::Open {
            return Err(QueryError::InvalidState("database is not open"));
        }
        if let Some(mut store) = self.store.take() {
            store.close()?;
        }
        if let Some(mut store) = self.extended_store.take() {
            store.close()?;
        }
        self.state = State::Configured;
        Ok(())
    }

    fn resolved_level(&self, probe_vs: Option<f32>) -> u8 {
        match self.query_type {
            QueryType::MaxRes => 31,
            // Spec §4.6.1: "L = geometry.level(R x VERTEXAG)" -- the
            // caller's resolution is vertical meters, edge_len() is the
            // horizontal (= VERTEXAG x vertical) tick-space length.
            QueryType::FixedRes => {
                self.level_for_edge_length(self.resolution_param * self.geometry.vert_exag())
            }
            QueryType::WaveRes => {
                let vs = probe_vs.filter(|v| *v != NODATA_F32).unwrap_or(1000.0) as f64;
                let wavelength = vs * self.resolution_param;
                let target = wavelength * CELLS_PER_WAVELENGTH;
                self.coarsest_level_at_most(target.max(1.0))
            }
        }
    }

    fn level_for_edge_length(&self, target: f64) -> u8 {
        let mut best_level = 0u8;
        let mut best_diff = f64::MAX;
        for level in 0u8..=31 {
            let diff = (self.geometry.edge_len(level) - target).abs();
            if diff < best_diff {
                best_diff = diff;
                best_level = level;
            }
        }
        best_level
    }

    /// The coarsest level whose edge length is at most `target` (spec
    /// §4.6.1: "pick the deepest node whose vertical edge length ≤ Vs × T ×
    /// k", i.e. at least `CELLS_PER_WAVELENGTH` cells per shear wavelength).
    /// Edge length strictly decreases with level, so this is the first
    /// level (scanning from 0) that satisfies the bound.
    fn coarsest_level_at_most(&self, target: f64) -> u8 {
        for level in 0u8..=31 {
            if self.geometry.edge_len(level) <= target {
                return level;
            }
        }
        31
    }

    /// Looks a point up in `store`/`extended_store`, applying the
    /// elevation clamp (spec §9a) and topography squash before resolving
    /// the octree level and dispatching to [`OctreeStore::search`].
    pub fn query(&mut self, lon: f64, lat: f64, elev: f64) -> Result<Vec<f64>, QueryError> {
        if self.state != State::Open {
            self.error_handler.error("query() called while database is not open");
            return Err(QueryError::InvalidState("database is not open"));
        }

        let clamped_elev = elev.max(MIN_ELEV);

        let store = self.store.as_ref().expect("open() populates store");

        // Squash, if triggered, also yields the DepthFreeSurf probed to
        // relocate the query -- reused below for the Elevation column so
        // it is not looked up twice (spec §4.6.3).
        let (effective_elev, squash_depth) =
            match self.squash_effective_elevation(store, lon, lat, clamped_elev) {
                Ok(e) => e,
                Err(e) => {
                    self.error_handler.error(e.to_string());
                    return Err(e);
                }
            };

        // One MAXRES lookup at the effective location serves both the
        // WAVERES Vs probe and, when squash did not trigger, the
        // DepthFreeSurf feeding the Elevation column (spec §4.6.2: "the
        // Elevation column always uses the MAXRES lookup").
        let maxres_hit = self.lookup_with_fallback(store, lon, lat, effective_elev, 31)?;

        let probe_vs = if self.query_type == QueryType::WaveRes {
            maxres_hit.as_ref().map(|(_, p)| p.vs)
        } else {
            None
        };

        let level = self.resolved_level(probe_vs);

        let found = if level == 31 {
            maxres_hit.clone()
        } else {
            self.lookup_with_fallback(store, lon, lat, effective_elev, level)?
        };

        let elevation_depth = squash_depth.or_else(|| {
            maxres_hit
                .as_ref()
                .map(|(_, p)| p.depth_free_surf)
                .filter(|d| *d != NODATA_F32)
        });

        let (_addr, payload) = match found {
            Some(hit) => hit,
            None => {
                self.error_handler.warning("no data at the requested point");
                return Ok(self
                    .value_names
                    .iter()
                    .map(|name| {
                        if name == "Elevation" {
                            elevation_depth
                                .map(|d| clamped_elev + d as f64)
                                .unwrap_or(NODATA_F32 as f64)
                        } else {
                            NODATA_F32 as f64
                        }
                    })
                    .collect());
            }
        };

        let mut out = Vec::with_capacity(self.value_names.len());
        for name in &self.value_names {
            if name == "Elevation" {
                out.push(
                    elevation_depth
                        .map(|d| clamped_elev + d as f64)
                        .unwrap_or(NODATA_F32 as f64),
                );
                continue;
            }
            out.push(payload.get(name).unwrap_or(NODATA_F32 as f64));
        }
        Ok(out)
    }

    fn lookup(
        &self,
        store: &OctreeStore,
        lon: f64,
        lat: f64,
        elev: f64,
        level: u8,
    ) -> Result<Option<(crate::geometry::Address, Payload)>, QueryError> {
        let addr = self
            .geometry
            .lon_lat_elev_to_addr(LonLatElev { lon, lat, elev }, level)?;
        Ok(store.search(addr)?)
    }

    /// Looks a point up in `primary`, falling back to the extended-domain
    /// store (if attached) on a "no data" result -- no covering node at all,
    /// or a covering node whose `Vs` is `NODATA` (spec §4.6.4). The first
    /// store to produce real data wins; if neither does, the primary's own
    /// result (possibly `None`, possibly a NODATA-`Vs` payload) is returned.
    fn lookup_with_fallback(
        &self,
        primary: &OctreeStore,
        lon: f64,
        lat: f64,
        elev: f64,
        level: u8,
    ) -> Result<Option<(crate::geometry::Address, Payload)>, QueryError> {
        let primary_hit = self.lookup(primary, lon, lat, elev, level)?;
        let is_no_data = match &primary_hit {
            None => true,
            Some((_, payload)) => payload.vs == NODATA_F32,
        };
        if !is_no_data {
            return Ok(primary_hit);
        }
        if let Some(extended) = self.extended_store.as_ref() {
            log::debug!(
                "primary store has no data at ({lon}, {lat}, {elev}) level {level}, trying extended store"
            );
            if let Some(hit) = self.lookup(extended, lon, lat, elev, level)? {
                if hit.1.vs != NODATA_F32 {
                    return Ok(Some(hit));
                }
            }
        }
        Ok(primary_hit)
    }

    /// Resolves the elevation squash transform (spec §4.6.3). Returns the
    /// effective elevation to query at, and, when squash actually
    /// relocated the query, the `DepthFreeSurf` value used to do so (so
    /// callers can reuse it for the `Elevation` column instead of probing
    /// twice).
    fn squash_effective_elevation(
        &self,
        store: &OctreeStore,
        lon: f64,
        lat: f64,
        elev: f64,
    ) -> Result<(f64, Option<f32>), QueryError> {
        // Spec §4.6.3: squash applies when the query elevation is >= the
        // limit, so the limit itself is squashed (only strictly-below is
        // excluded).
        if !self.squash_topo || elev < self.squash_limit {
            return Ok((elev, None));
        }
        // Above the squash limit: pin the query onto the free surface by
        // probing DepthFreeSurf at the limit and re-targeting there.
        match self.lookup_with_fallback(store, lon, lat, self.squash_limit, 31)? {
            Some((_, payload)) if payload.depth_free_surf != NODATA_F32 => {
                Ok((-(payload.depth_free_surf as f64), Some(payload.depth_free_surf)))
            }
            _ => Ok((elev, None)),
        }
    }
}
