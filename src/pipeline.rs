//! Rebuild orchestration: a single-writer state machine that turns a stored
//! configuration version into a live routing graph.
//!
//! One job at a time holds the exclusive slot. The pipeline is a sequence of
//! blocking phases: tagging, the three external compilation stages, artifact
//! verification, and the engine swap. The tagged dataset and the compiled
//! artifacts are built in a job-scoped staging directory and promoted into
//! the serving location only during the swap, so a failure anywhere before
//! that leaves the serving graph files and version untouched. The slot is
//! released on every terminal path.

use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dataset::{MapDataset, OsmXmlWriter};
use crate::error::{Error, Result};
use crate::index::ZoneIndex;
use crate::settings::Settings;
use crate::store::{VersionRef, VersionStore};
use crate::tagger::{self, TagStats};

/// External compilation stages, in fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Partition,
    Customize,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Partition, Stage::Customize];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Partition => "partition",
            Stage::Customize => "customize",
        }
    }
}

/// Exit status and combined stdout/stderr of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub status: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

/// Seam for the external graph-compilation toolchain. The orchestrator
/// interprets nothing beyond exit status and captured output.
pub trait StageRunner: Send + Sync {
    fn run(&self, stage: Stage, input: &Path, profile: &Path) -> io::Result<StageOutput>;
}

/// Seam for the live routing engine process.
pub trait EngineControl: Send + Sync {
    /// Which version the engine is currently serving, probed at startup.
    fn serving_version(&self) -> Option<u64>;

    /// Restart the engine against the newly compiled graph. Effectively
    /// atomic from the caller's perspective: either the engine comes up
    /// serving the new graph or this reports failure.
    fn restart(&self) -> std::result::Result<(), String>;
}

/// Loads the base (untagged) dataset for a job.
pub trait DatasetProvider: Send + Sync {
    fn load(&self) -> Result<MapDataset>;
}

pub struct PbfProvider {
    path: PathBuf,
}

impl PbfProvider {
    pub fn new(path: PathBuf) -> Self {
        PbfProvider { path }
    }
}

impl DatasetProvider for PbfProvider {
    fn load(&self) -> Result<MapDataset> {
        MapDataset::from_pbf(&self.path)
    }
}

/// Runs the OSRM toolchain as external processes.
pub struct ProcessStageRunner {
    settings: Settings,
}

impl ProcessStageRunner {
    pub fn new(settings: Settings) -> Self {
        ProcessStageRunner { settings }
    }
}

impl StageRunner for ProcessStageRunner {
    fn run(&self, stage: Stage, input: &Path, profile: &Path) -> io::Result<StageOutput> {
        // The toolchain derives the artifact stem from the input name, so
        // running against the staged dataset keeps every artifact staged.
        let stem = input.with_extension("osrm");
        let command: Vec<String> = match stage {
            Stage::Extract => vec![
                "osrm-extract".to_string(),
                "-p".to_string(),
                profile.display().to_string(),
                input.display().to_string(),
            ],
            Stage::Partition => vec![
                "osrm-partition".to_string(),
                stem.display().to_string(),
            ],
            Stage::Customize => vec![
                "osrm-customize".to_string(),
                stem.display().to_string(),
            ],
        };
        run_with_timeout(
            &command,
            Duration::from_secs(self.settings.stage_timeout_secs),
        )
    }
}

/// Restarts the engine via a configured command (classically
/// `docker restart osrm`) and probes the serving version from the marker
/// file written after each successful swap.
pub struct CommandEngine {
    settings: Settings,
}

impl CommandEngine {
    pub fn new(settings: Settings) -> Self {
        CommandEngine { settings }
    }
}

impl EngineControl for CommandEngine {
    fn serving_version(&self) -> Option<u64> {
        let text = fs::read_to_string(self.settings.serving_marker_path()).ok()?;
        text.trim().strip_prefix('v')?.parse().ok()
    }

    fn restart(&self) -> std::result::Result<(), String> {
        let outcome = run_with_timeout(
            &self.settings.restart_command,
            Duration::from_secs(self.settings.restart_timeout_secs),
        )
        .map_err(|e| format!("failed to launch restart command: {e}"))?;

        if outcome.timed_out {
            return Err(format!(
                "restart command timed out after {}s: {}",
                self.settings.restart_timeout_secs, outcome.output
            ));
        }
        match outcome.status {
            Some(0) => Ok(()),
            Some(code) => Err(format!(
                "restart command exited with status {code}: {}",
                outcome.output
            )),
            None => Err(format!(
                "restart command terminated by signal: {}",
                outcome.output
            )),
        }
    }
}

/// Spawn a command with piped output, poll `try_wait` against a deadline,
/// and kill it on timeout. Output pipes are drained by reader threads so a
/// chatty stage cannot deadlock on a full pipe buffer.
pub(crate) fn run_with_timeout(command: &[String], timeout: Duration) -> io::Result<StageOutput> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_thread = child.stdout.take().map(drain_pipe);
    let stderr_thread = child.stderr.take().map(drain_pipe);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => thread::sleep(Duration::from_millis(100)),
        }
    };

    let mut output = String::new();
    if let Some(handle) = stdout_thread {
        output.push_str(&handle.join().unwrap_or_default());
    }
    if let Some(handle) = stderr_thread {
        output.push_str(&handle.join().unwrap_or_default());
    }

    Ok(StageOutput {
        status: status.and_then(|s| s.code()),
        output,
        timed_out,
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Tagging,
    StageRunning(Stage),
    Verifying,
    Swapping,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Tagging => write!(f, "tagging"),
            JobState::StageRunning(stage) => write!(f, "running {}", stage.name()),
            JobState::Verifying => write!(f, "verifying"),
            JobState::Swapping => write!(f, "swapping"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageLog {
    pub stage: String,
    pub output: String,
}

/// Result of a completed `apply`.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub version_id: u64,
    /// True when the target version was already serving and the whole
    /// pipeline was skipped.
    pub reused: bool,
    pub stats: Option<TagStats>,
    pub stage_logs: Vec<StageLog>,
}

pub struct Orchestrator {
    settings: Settings,
    store: VersionStore,
    provider: Box<dyn DatasetProvider>,
    runner: Box<dyn StageRunner>,
    engine: Box<dyn EngineControl>,
    busy: AtomicBool,
    state: Mutex<JobState>,
    serving: Mutex<Option<u64>>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: VersionStore,
        provider: Box<dyn DatasetProvider>,
        runner: Box<dyn StageRunner>,
        engine: Box<dyn EngineControl>,
    ) -> Self {
        let serving = engine.serving_version();
        if let Some(version) = serving {
            tracing::info!(version, "engine currently serving stored version");
        }
        Orchestrator {
            settings,
            store,
            provider,
            runner,
            engine,
            busy: AtomicBool::new(false),
            state: Mutex::new(JobState::Idle),
            serving: Mutex::new(serving),
        }
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn serving_version(&self) -> Option<u64> {
        *self.serving.lock()
    }

    /// Run the full rebuild pipeline for a stored version.
    ///
    /// Fails fast with [`Error::Busy`] while another job is active; jobs are
    /// never queued. Applying the version that is already serving is a
    /// no-op: the dedup check happens before any side effect.
    pub fn apply(&self, version: VersionRef) -> Result<JobSummary> {
        let _slot = self.acquire_slot()?;

        let (id, config) = self.store.load(version)?;
        if self.serving_version() == Some(id) {
            tracing::info!(version = id, "version already serving, nothing to do");
            return Ok(JobSummary {
                version_id: id,
                reused: true,
                stats: None,
                stage_logs: Vec::new(),
            });
        }

        self.set_state(JobState::Tagging);
        tracing::info!(version = id, zones = config.zone_count(), "starting rebuild");
        self.prepare_staging()?;
        let stats = self.run_tagging(config)?;

        let tagged_path = self.settings.staged_tagged_osm_path();
        let mut stage_logs = Vec::new();
        for stage in Stage::ALL {
            self.set_state(JobState::StageRunning(stage));
            tracing::info!(stage = stage.name(), "running compilation stage");

            let outcome = self
                .runner
                .run(stage, &tagged_path, &self.settings.profile)
                .map_err(|e| Error::stage(stage.name(), format!("failed to launch: {e}")))?;

            if outcome.timed_out {
                return Err(Error::Stage {
                    stage: stage.name().to_string(),
                    detail: format!(
                        "timed out after {}s",
                        self.settings.stage_timeout_secs
                    ),
                    output: outcome.output,
                });
            }
            match outcome.status {
                Some(0) => stage_logs.push(StageLog {
                    stage: stage.name().to_string(),
                    output: outcome.output,
                }),
                Some(code) => {
                    return Err(Error::Stage {
                        stage: stage.name().to_string(),
                        detail: format!("exited with status {code}"),
                        output: outcome.output,
                    })
                }
                None => {
                    return Err(Error::Stage {
                        stage: stage.name().to_string(),
                        detail: "terminated by signal".to_string(),
                        output: outcome.output,
                    })
                }
            }
        }

        self.set_state(JobState::Verifying);
        for artifact in self.settings.staged_artifact_paths() {
            let non_empty = fs::metadata(&artifact).map(|m| m.len() > 0).unwrap_or(false);
            if !non_empty {
                return Err(Error::ArtifactMissing(artifact.display().to_string()));
            }
        }

        // The serving location is only touched after every staged artifact
        // has been verified present and non-empty.
        self.set_state(JobState::Swapping);
        self.promote_staged()?;
        self.engine.restart().map_err(Error::Engine)?;

        self.record_serving(id);
        tracing::info!(version = id, "rebuild complete, engine serving new graph");

        Ok(JobSummary {
            version_id: id,
            reused: false,
            stats: Some(stats),
            stage_logs,
        })
    }

    /// Reverting is applying a historical version; there is no separate
    /// code path.
    pub fn revert(&self, version: VersionRef) -> Result<JobSummary> {
        self.apply(version)
    }

    /// Reset the job-scoped build directory, discarding leftovers from any
    /// earlier failed job.
    fn prepare_staging(&self) -> Result<()> {
        let staging = self.settings.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| Error::storage(format!("clearing {}", staging.display()), e))?;
        }
        fs::create_dir_all(&staging)
            .map_err(|e| Error::storage(format!("creating {}", staging.display()), e))
    }

    /// Move every job-scoped file from staging into the serving location.
    /// Staging lives inside the data directory, so each move is a rename on
    /// the same filesystem.
    fn promote_staged(&self) -> Result<()> {
        let staging = self.settings.staging_dir();
        let prefix = self.settings.job_file_prefix();
        let entries = fs::read_dir(&staging)
            .map_err(|e| Error::storage(format!("reading {}", staging.display()), e))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::storage(format!("reading {}", staging.display()), e))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let target = self.settings.data_dir.join(&name);
            fs::rename(entry.path(), &target)
                .map_err(|e| Error::storage(format!("promoting {}", target.display()), e))?;
        }
        Ok(())
    }

    /// Tag the base dataset into a temp file, then rename into place so the
    /// stages never see a partially-written tagged dataset.
    fn run_tagging(&self, config: crate::zones::Configuration) -> Result<TagStats> {
        let dataset = self.provider.load()?;
        let index = ZoneIndex::build(config);

        let tagged_path = self.settings.staged_tagged_osm_path();
        let tmp_path = tagged_path.with_extension("osm.tmp");

        let result = (|| {
            let file = fs::File::create(&tmp_path).map_err(|e| {
                Error::stage("tagging", format!("failed to create {}: {e}", tmp_path.display()))
            })?;
            let mut sink = OsmXmlWriter::new(BufWriter::new(file));
            tagger::retag(&dataset, &index, &mut sink)
        })();

        match result {
            Ok(stats) => {
                fs::rename(&tmp_path, &tagged_path).map_err(|e| {
                    let _ = fs::remove_file(&tmp_path);
                    Error::stage(
                        "tagging",
                        format!("failed to persist {}: {e}", tagged_path.display()),
                    )
                })?;
                Ok(stats)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn acquire_slot(&self) -> Result<SlotGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        Ok(SlotGuard { orchestrator: self })
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock() = state;
    }

    fn record_serving(&self, id: u64) {
        *self.serving.lock() = Some(id);
        // The marker only feeds the startup probe; a failed write must not
        // fail a job whose swap already happened.
        let marker = self.settings.serving_marker_path();
        let tmp = marker.with_extension("tmp");
        let written = fs::write(&tmp, format!("v{id}\n"))
            .and_then(|_| fs::rename(&tmp, &marker));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to persist serving-version marker");
        }
    }
}

/// Releases the exclusive job slot on every terminal path.
struct SlotGuard<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.set_state(JobState::Idle);
        self.orchestrator.busy.store(false, Ordering::Release);
    }
}
