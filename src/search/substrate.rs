//! Job execution substrate.
//!
//! The controller never runs calculations itself. It hands a [`JobRequest`]
//! to a [`JobSubstrate`] and polls until the job reaches a terminal state.
//!
//! Two substrates ship with the crate:
//!
//! - [`CommandSubstrate`] launches the configured `code` once per job in
//!   `<workdir>/job-<pk>/`. The request is written to `input.json` and its
//!   path exported as `OCCSEARCH_JOB_INPUT`; on exit code 0 the process is
//!   expected to have written the resulting occupation matrix as JSON to
//!   `OCCSEARCH_JOB_OUTPUT` (`output.json`).
//! - [`InProcessSubstrate`] runs a closure on the rayon pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::schema::{CalculationInputs, ConstraintCard, JobInput, OccupationMatrix, Pk};

/// Environment variable holding the path of `input.json`.
pub const JOB_INPUT_ENV: &str = "OCCSEARCH_JOB_INPUT";
/// Environment variable holding the path the job writes its matrix to.
pub const JOB_OUTPUT_ENV: &str = "OCCSEARCH_JOB_OUTPUT";

/// Occupation constraint applied to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintTarget {
    pub matrix: OccupationMatrix,
    pub card: ConstraintCard,
}

/// Everything a substrate needs to run one calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub pk: Pk,
    pub generation: usize,
    /// Position within the batch.
    pub index: usize,
    pub input: JobInput,
    pub calculation: CalculationInputs,
    /// Per-site starting magnetization.
    pub starting_magnetization: BTreeMap<String, f64>,
    #[serde(default)]
    pub target: Option<ConstraintTarget>,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub exit_code: i32,
    /// Final occupation matrix, when the job produced one.
    pub occupations: Option<OccupationMatrix>,
}

impl JobOutcome {
    pub fn converged(occupations: OccupationMatrix) -> Self {
        Self {
            exit_code: 0,
            occupations: Some(occupations),
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            exit_code,
            occupations: None,
        }
    }
}

/// Result of polling a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPoll {
    Pending,
    Finished(JobOutcome),
}

/// Submit/poll interface to whatever runs the calculations.
pub trait JobSubstrate {
    /// Start a job. Returns as soon as the job is queued.
    fn submit(&mut self, request: JobRequest) -> Result<(), SubstrateError>;

    /// Check a previously submitted job. A `Finished` result is reported once.
    fn poll(&mut self, pk: Pk) -> Result<JobPoll, SubstrateError>;
}

impl<T: JobSubstrate + ?Sized> JobSubstrate for &mut T {
    fn submit(&mut self, request: JobRequest) -> Result<(), SubstrateError> {
        (**self).submit(request)
    }

    fn poll(&mut self, pk: Pk) -> Result<JobPoll, SubstrateError> {
        (**self).poll(pk)
    }
}

impl<T: JobSubstrate + ?Sized> JobSubstrate for Box<T> {
    fn submit(&mut self, request: JobRequest) -> Result<(), SubstrateError> {
        (**self).submit(request)
    }

    fn poll(&mut self, pk: Pk) -> Result<JobPoll, SubstrateError> {
        (**self).poll(pk)
    }
}

/// Substrate failures. The runner records these as failed jobs.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize job input: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Job {0} has an empty command")]
    EmptyCommand(Pk),
    #[error("Job {0} was never submitted")]
    UnknownJob(Pk),
    #[error("Job {0} was already submitted")]
    DuplicateJob(Pk),
    #[error("Job result table is poisoned")]
    Poisoned,
}

struct RunningJob {
    child: Child,
    dir: PathBuf,
}

/// One child process per job.
pub struct CommandSubstrate {
    workdir: PathBuf,
    running: HashMap<Pk, RunningJob>,
}

impl CommandSubstrate {
    pub fn new<P: Into<PathBuf>>(workdir: P) -> Self {
        Self {
            workdir: workdir.into(),
            running: HashMap::new(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory a job runs in.
    pub fn job_dir(&self, pk: Pk) -> PathBuf {
        self.workdir.join(format!("job-{}", pk))
    }

    fn read_output(dir: &Path, pk: Pk) -> Option<OccupationMatrix> {
        let path = dir.join("output.json");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Job {} exited cleanly but {} is unreadable: {}", pk, path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(matrix) => Some(matrix),
            Err(e) => {
                log::warn!("Job {} wrote an invalid occupation matrix: {}", pk, e);
                None
            }
        }
    }
}

impl JobSubstrate for CommandSubstrate {
    fn submit(&mut self, request: JobRequest) -> Result<(), SubstrateError> {
        let pk = request.pk;
        if self.running.contains_key(&pk) {
            return Err(SubstrateError::DuplicateJob(pk));
        }
        let mut words = request.calculation.code.split_whitespace();
        let program = words.next().ok_or(SubstrateError::EmptyCommand(pk))?;

        let dir = self.job_dir(pk);
        fs::create_dir_all(&dir)?;
        // The child runs inside `dir`, so the paths it is handed must not be
        // relative to our own working directory.
        let dir = fs::canonicalize(&dir)?;
        let input_path = dir.join("input.json");
        let output_path = dir.join("output.json");
        fs::write(&input_path, serde_json::to_string_pretty(&request)?)?;

        let mut cmd = Command::new(program);
        cmd.args(words);
        cmd.current_dir(&dir);
        cmd.env(JOB_INPUT_ENV, &input_path);
        cmd.env(JOB_OUTPUT_ENV, &output_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(File::create(dir.join("stdout.log"))?));
        cmd.stderr(Stdio::from(File::create(dir.join("stderr.log"))?));

        let child = cmd.spawn()?;
        log::debug!("Job {} started as process {} in {}", pk, child.id(), dir.display());
        self.running.insert(pk, RunningJob { child, dir });
        Ok(())
    }

    fn poll(&mut self, pk: Pk) -> Result<JobPoll, SubstrateError> {
        let job = self
            .running
            .get_mut(&pk)
            .ok_or(SubstrateError::UnknownJob(pk))?;
        let Some(status) = job.child.try_wait()? else {
            return Ok(JobPoll::Pending);
        };

        let dir = job.dir.clone();
        self.running.remove(&pk);

        // Killed by a signal: no exit code.
        let exit_code = status.code().unwrap_or(-1);
        let occupations = if exit_code == 0 {
            Self::read_output(&dir, pk)
        } else {
            None
        };
        Ok(JobPoll::Finished(JobOutcome {
            exit_code,
            occupations,
        }))
    }
}

type Executor = dyn Fn(&JobRequest) -> JobOutcome + Send + Sync;

/// Runs each job as a closure on the rayon thread pool.
///
/// A panicking closure is reported as a failed job with exit code -1.
pub struct InProcessSubstrate {
    executor: Arc<Executor>,
    finished: Arc<Mutex<HashMap<Pk, JobOutcome>>>,
    submitted: HashSet<Pk>,
}

impl InProcessSubstrate {
    pub fn new<F>(executor: F) -> Self
    where
        F: Fn(&JobRequest) -> JobOutcome + Send + Sync + 'static,
    {
        Self {
            executor: Arc::new(executor),
            finished: Arc::new(Mutex::new(HashMap::new())),
            submitted: HashSet::new(),
        }
    }

    /// Jobs submitted but not yet reported finished.
    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }
}

impl JobSubstrate for InProcessSubstrate {
    fn submit(&mut self, request: JobRequest) -> Result<(), SubstrateError> {
        if !self.submitted.insert(request.pk) {
            return Err(SubstrateError::DuplicateJob(request.pk));
        }
        let executor = Arc::clone(&self.executor);
        let finished = Arc::clone(&self.finished);
        rayon::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor(&request)))
                .unwrap_or_else(|_| JobOutcome::failed(-1));
            if let Ok(mut table) = finished.lock() {
                table.insert(request.pk, outcome);
            }
        });
        Ok(())
    }

    fn poll(&mut self, pk: Pk) -> Result<JobPoll, SubstrateError> {
        if !self.submitted.contains(&pk) {
            return Err(SubstrateError::UnknownJob(pk));
        }
        let outcome = self
            .finished
            .lock()
            .map_err(|_| SubstrateError::Poisoned)?
            .remove(&pk);
        match outcome {
            Some(outcome) => {
                self.submitted.remove(&pk);
                Ok(JobPoll::Finished(outcome))
            }
            None => Ok(JobPoll::Pending),
        }
    }
}
