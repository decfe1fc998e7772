//! Append-only, content-addressed store of zone-configuration versions.
//!
//! Layout: one directory holding immutable `v{N}.geojson` snapshots plus a
//! `latest` indirection file. Ids are sequential starting at 1; semantically
//! identical submissions (canonical-hash match) reuse the existing version
//! instead of writing a new one.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::zones::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRef {
    Latest,
    Id(u64),
}

impl FromStr for VersionRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(VersionRef::Latest);
        }
        let digits = s.strip_prefix('v').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(VersionRef::Id)
            .map_err(|_| Error::Validation(format!("bad version reference '{s}'")))
    }
}

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionRef::Latest => write!(f, "latest"),
            VersionRef::Id(id) => write!(f, "v{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub id: u64,
    pub size_bytes: u64,
    pub zone_count: usize,
}

pub struct VersionStore {
    dir: PathBuf,
}

impl VersionStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::storage(format!("creating {}", dir.display()), e))?;
        Ok(VersionStore { dir })
    }

    /// Validate, deduplicate, and persist a configuration.
    ///
    /// Returns `(id, true)` for a newly created version, `(id, false)` when
    /// the canonical hash matches an existing one (no write happens).
    pub fn save(&self, geojson: &str) -> Result<(u64, bool)> {
        let config = Configuration::from_geojson_str(geojson)?;
        let hash = config.canonical_hash();

        let existing = self.scan()?;
        for (id, path) in &existing {
            match fs::read_to_string(path) {
                Ok(text) => match Configuration::from_geojson_str(&text) {
                    Ok(stored) if stored.canonical_hash() == hash => {
                        tracing::info!(version = id, "configuration already stored");
                        return Ok((*id, false));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(version = id, error = %e, "unreadable stored version")
                    }
                },
                Err(e) => {
                    tracing::warn!(version = id, error = %e, "unreadable stored version")
                }
            }
        }

        let next_id = existing.last().map(|(id, _)| id + 1).unwrap_or(1);
        let final_path = self.version_path(next_id);
        let tmp_path = final_path.with_extension("geojson.tmp");

        fs::write(&tmp_path, geojson)
            .map_err(|e| Error::storage(format!("writing {}", tmp_path.display()), e))?;
        fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::storage(format!("persisting {}", final_path.display()), e)
        })?;
        self.write_latest(next_id)?;

        tracing::info!(version = next_id, zones = config.zone_count(), "stored new version");
        Ok((next_id, true))
    }

    pub fn load(&self, version: VersionRef) -> Result<(u64, Configuration)> {
        let (id, text) = self.read_raw(version)?;
        let config = Configuration::from_geojson_str(&text)
            .map_err(|e| Error::Validation(format!("stored version v{id} is invalid: {e}")))?;
        Ok((id, config))
    }

    /// Raw GeoJSON of a stored version, for history download.
    pub fn read_raw(&self, version: VersionRef) -> Result<(u64, String)> {
        let id = self.resolve(version)?;
        let path = self.version_path(id);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("v{id}"))
            } else {
                Error::storage(format!("reading {}", path.display()), e)
            }
        })?;
        Ok((id, text))
    }

    /// Version metadata, newest first.
    pub fn list(&self) -> Result<Vec<VersionInfo>> {
        let mut infos = Vec::new();
        for (id, path) in self.scan()?.into_iter().rev() {
            let size_bytes = fs::metadata(&path)
                .map_err(|e| Error::storage(format!("stat {}", path.display()), e))?
                .len();
            let zone_count = fs::read_to_string(&path)
                .ok()
                .and_then(|text| Configuration::from_geojson_str(&text).ok())
                .map(|config| config.zone_count())
                .unwrap_or(0);
            infos.push(VersionInfo {
                id,
                size_bytes,
                zone_count,
            });
        }
        Ok(infos)
    }

    fn resolve(&self, version: VersionRef) -> Result<u64> {
        match version {
            VersionRef::Id(id) => {
                if self.version_path(id).exists() {
                    Ok(id)
                } else {
                    Err(Error::NotFound(format!("v{id}")))
                }
            }
            VersionRef::Latest => self
                .scan()?
                .last()
                .map(|(id, _)| *id)
                .ok_or_else(|| Error::NotFound("latest (store is empty)".to_string())),
        }
    }

    /// Existing versions sorted by id, ascending. Files that do not match
    /// the `v{N}.geojson` pattern are ignored.
    fn scan(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::storage(format!("reading {}", self.dir.display()), e))?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::storage(format!("reading {}", self.dir.display()), e))?;
            if let Some(id) = parse_version_file_name(&entry.path()) {
                versions.push((id, entry.path()));
            }
        }
        versions.sort_by_key(|(id, _)| *id);
        Ok(versions)
    }

    fn version_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("v{id}.geojson"))
    }

    fn write_latest(&self, id: u64) -> Result<()> {
        let path = self.dir.join("latest");
        let tmp = self.dir.join("latest.tmp");
        fs::write(&tmp, format!("v{id}\n"))
            .map_err(|e| Error::storage(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::storage(format!("persisting {}", path.display()), e))
    }
}

fn parse_version_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".geojson")?;
    let digits = stem.strip_prefix('v')?;
    digits.parse().ok()
}
