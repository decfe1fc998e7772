//! Runtime settings for the tagging and rebuild pipeline.
//!
//! Loaded from a TOML file when present; every field has a default matching
//! the standard single-region deployment (one base PBF, one OSRM container).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory shared with the routing engine. Holds the base PBF, the
    /// version history, the tagged dataset, and the compiled graph.
    pub data_dir: PathBuf,

    /// File name of the base (untagged) PBF inside `data_dir`. Read-only.
    pub base_pbf: String,

    /// Stem used for the tagged dataset and all compiled graph artifacts.
    pub graph_base: String,

    /// Routing profile handed to the extract stage.
    pub profile: PathBuf,

    /// Per-stage timeout. Exceeding it is treated like a non-zero exit.
    pub stage_timeout_secs: u64,

    /// Graph artifact suffixes checked after the last stage. Each must exist
    /// and be non-empty before the engine is restarted.
    pub verify_suffixes: Vec<String>,

    /// Command that restarts the routing engine against the new graph.
    pub restart_command: Vec<String>,

    /// Timeout for the restart command.
    pub restart_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("/data"),
            base_pbf: "region-latest.osm.pbf".to_string(),
            graph_base: "region".to_string(),
            profile: PathBuf::from("/profiles/car_avoid.lua"),
            stage_timeout_secs: 3600,
            verify_suffixes: vec!["hsgr".to_string(), "prf".to_string()],
            restart_command: vec![
                "docker".to_string(),
                "restart".to_string(),
                "osrm".to_string(),
            ],
            restart_timeout_secs: 60,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::storage(format!("reading settings {}", path.display()), e))?;
        toml::from_str(&text)
            .map_err(|e| Error::Validation(format!("bad settings {}: {e}", path.display())))
    }

    pub fn base_pbf_path(&self) -> PathBuf {
        self.data_dir.join(&self.base_pbf)
    }

    /// Serving location of the tagged dataset, populated at swap time.
    pub fn tagged_osm_path(&self) -> PathBuf {
        self.data_dir.join(self.tagged_osm_name())
    }

    /// Job-scoped build directory. Everything a rebuild writes lands here
    /// and stays invisible to the serving engine until the swap promotes it.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("rebuild_staging")
    }

    /// Tagged dataset as written by the spatial tagger, input to
    /// `osrm-extract`. The toolchain derives its artifact names from this
    /// path, so the artifacts land in the staging directory too.
    pub fn staged_tagged_osm_path(&self) -> PathBuf {
        self.staging_dir().join(self.tagged_osm_name())
    }

    /// Name prefix shared by every job-scoped file (the tagged dataset and
    /// all `.osrm*` artifacts); the swap promotes files matching it.
    pub fn job_file_prefix(&self) -> String {
        format!("{}.tagged.", self.graph_base)
    }

    fn tagged_osm_name(&self) -> String {
        format!("{}.tagged.osm", self.graph_base)
    }

    fn artifact_file_name(&self, suffix: &str) -> String {
        format!("{}.tagged.osrm.{suffix}", self.graph_base)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("avoidzones_history")
    }

    /// Marker recording which configuration version the engine is serving.
    /// Written only after a successful restart, read back at startup.
    pub fn serving_marker_path(&self) -> PathBuf {
        self.data_dir.join("serving_version")
    }

    /// Serving locations of the graph artifacts the engine loads.
    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        self.verify_suffixes
            .iter()
            .map(|suffix| self.data_dir.join(self.artifact_file_name(suffix)))
            .collect()
    }

    /// Staged artifacts that must exist and be non-empty before the swap.
    pub fn staged_artifact_paths(&self) -> Vec<PathBuf> {
        let staging = self.staging_dir();
        self.verify_suffixes
            .iter()
            .map(|suffix| staging.join(self.artifact_file_name(suffix)))
            .collect()
    }
}
