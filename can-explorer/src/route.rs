//! External boundaries: route metadata and DBC persistence
//!
//! Both are blocking and are called from the driver through
//! `spawn_blocking` or from application setup code.

use crate::signals::Dbc;
use crate::types::{ExplorerError, Result, Route};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Looks up a recording by name
pub trait RouteProvider: Send + Sync {
    /// `Ok(None)` means the route cannot be loaded
    fn fetch_route(&self, name: &str) -> Result<Option<Route>>;
}

/// Route provider backed by a JSON object of `name -> {url, proclog}`
#[derive(Debug, Clone, Default)]
pub struct JsonRouteProvider {
    routes: BTreeMap<String, Route>,
}

impl JsonRouteProvider {
    pub fn from_json(json: &str) -> Result<Self> {
        let routes: BTreeMap<String, Route> = serde_json::from_str(json)?;
        Ok(Self { routes })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let provider = Self::from_json(&json)?;
        log::debug!("Loaded {} routes from {:?}", provider.routes.len(), path);
        Ok(provider)
    }

    /// Rewrite every route's base location to `{base}/{name}`
    ///
    /// Lets a config point a route file at a local mirror of the recordings.
    pub fn with_base_override(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        for (name, route) in self.routes.iter_mut() {
            route.url = format!("{}/{}", base, name);
        }
        self
    }
}

impl RouteProvider for JsonRouteProvider {
    fn fetch_route(&self, name: &str) -> Result<Option<Route>> {
        Ok(self.routes.get(name).filter(|route| route.part_count > 0).cloned())
    }
}

/// Resolve a route or fail with `RouteNotFound`
pub fn require_route(provider: &dyn RouteProvider, name: &str) -> Result<Route> {
    provider
        .fetch_route(name)?
        .ok_or_else(|| ExplorerError::RouteNotFound(name.to_string()))
}

/// Loads and saves DBC files
pub trait DbcStore: Send + Sync {
    /// Load a DBC by name, returning the file name it was loaded from
    fn load(&self, name: &str) -> Result<(String, Dbc)>;

    /// Write a DBC under `filename`, returning when it was written
    fn save(&self, dbc: &Dbc, filename: &str) -> Result<DateTime<Utc>>;
}

/// DBC store over a directory of `.dbc` files
#[derive(Debug, Clone)]
pub struct FsDbcStore {
    dir: PathBuf,
}

impl FsDbcStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(name: &str) -> String {
        if name.ends_with(".dbc") {
            name.to_string()
        } else {
            format!("{}.dbc", name)
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(Self::file_name(name))
    }
}

impl DbcStore for FsDbcStore {
    fn load(&self, name: &str) -> Result<(String, Dbc)> {
        let filename = Self::file_name(name);
        let dbc = Dbc::from_file(&self.dir.join(&filename))?;
        log::info!("Loaded {} ({} frames)", filename, dbc.stats().num_frames);
        Ok((filename, dbc))
    }

    fn save(&self, dbc: &Dbc, filename: &str) -> Result<DateTime<Utc>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(filename);
        std::fs::write(&path, dbc.to_dbc_text())?;
        let saved_at = Utc::now();
        log::info!("Saved DBC to {:?}", path);
        Ok(saved_at)
    }
}
