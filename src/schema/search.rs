//! Records produced by a search: jobs, generations, accumulated state and
//! the final workflow output.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-global identifier of a stored object (job, matrix, scan, workflow).
pub type Pk = u64;

/// Reference to the matrix a job produced, if any.
///
/// Serialized as the PK or `-1` for a job that produced nothing, which is
/// the layout downstream tooling reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum MatrixSlot {
    Produced(Pk),
    Absent,
}

impl MatrixSlot {
    /// External encoding of [`MatrixSlot::Absent`].
    pub const SENTINEL: i64 = -1;

    pub fn pk(self) -> Option<Pk> {
        match self {
            MatrixSlot::Produced(pk) => Some(pk),
            MatrixSlot::Absent => None,
        }
    }

    pub fn is_absent(self) -> bool {
        matches!(self, MatrixSlot::Absent)
    }
}

impl From<MatrixSlot> for i64 {
    fn from(slot: MatrixSlot) -> Self {
        match slot {
            MatrixSlot::Produced(pk) => pk as i64,
            MatrixSlot::Absent => MatrixSlot::SENTINEL,
        }
    }
}

impl TryFrom<i64> for MatrixSlot {
    type Error = InvalidSlot;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            MatrixSlot::SENTINEL => Ok(MatrixSlot::Absent),
            v if v >= 0 => Ok(MatrixSlot::Produced(v as Pk)),
            v => Err(InvalidSlot(v)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid matrix reference {0}: expected a PK or -1")]
pub struct InvalidSlot(pub i64);

/// Kind of generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    /// Unconstrained AFM bootstrap (generation 0).
    Afm,
    /// Constrained batch driven by proposed matrices.
    Constrained,
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationKind::Afm => write!(f, "afm"),
            GenerationKind::Constrained => write!(f, "constrained"),
        }
    }
}

/// What a job was asked to compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobInput {
    /// Unconstrained run from a collinear starting magnetization.
    Afm {
        starting_magnetization: BTreeMap<String, f64>,
    },
    /// Run constrained towards a stored target matrix.
    Constrained { target_matrix: Pk },
}

impl JobInput {
    pub fn target_matrix(&self) -> Option<Pk> {
        match self {
            JobInput::Afm { .. } => None,
            JobInput::Constrained { target_matrix } => Some(*target_matrix),
        }
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Failure,
}

/// One submitted calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub pk: Pk,
    pub generation: usize,
    pub input: JobInput,
    pub status: JobStatus,
    /// Code exit status; `None` when the job never ran (submission failed).
    pub exit_code: Option<i32>,
    pub output_matrix: MatrixSlot,
}

impl JobRecord {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// One batch of calculations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// PK of the scan that ran this batch.
    pub pk: Pk,
    pub index: usize,
    pub kind: GenerationKind,
    /// Jobs in submission order.
    pub jobs: Vec<JobRecord>,
    /// Matrices the proposal step read to produce this batch.
    #[serde(default)]
    pub consumed: Vec<Pk>,
}

impl Generation {
    pub fn n_calculations(&self) -> usize {
        self.jobs.len()
    }

    pub fn n_successful(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_success()).count()
    }

    pub fn n_failed(&self) -> usize {
        self.n_calculations() - self.n_successful()
    }

    /// Output slots in submission order.
    pub fn matrix_slots(&self) -> Vec<MatrixSlot> {
        self.jobs.iter().map(|j| j.output_matrix).collect()
    }

    /// PKs of the matrices produced by successful jobs.
    pub fn produced(&self) -> Vec<Pk> {
        self.jobs
            .iter()
            .filter_map(|j| j.output_matrix.pk())
            .collect()
    }

    pub fn calculation_pks(&self) -> Vec<Pk> {
        self.jobs.iter().map(|j| j.pk).collect()
    }

    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            kind: self.kind,
            n_calculations: self.n_calculations(),
            n_successful: self.n_successful(),
            n_failed: self.n_failed(),
            matrix_pks: self.matrix_slots(),
            calculation_pks: self.calculation_pks(),
        }
    }
}

/// Per-generation entry of the workflow output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    #[serde(rename = "type")]
    pub kind: GenerationKind,
    pub n_calculations: usize,
    pub n_successful: usize,
    pub n_failed: usize,
    pub matrix_pks: Vec<MatrixSlot>,
    pub calculation_pks: Vec<Pk>,
}

/// Control-loop position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SearchPhase {
    #[default]
    Init,
    AfmBootstrap,
    Proposing,
    Scanning,
    Done,
    Failed,
}

impl SearchPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SearchPhase::Done | SearchPhase::Failed)
    }
}

/// Workflow exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ExitCode {
    Finished,
    AfmSearchFailed,
    ConstrainedScanFailed,
    ProposalFailed,
}

impl ExitCode {
    pub fn code(self) -> u16 {
        match self {
            ExitCode::Finished => 0,
            ExitCode::AfmSearchFailed => 400,
            ExitCode::ConstrainedScanFailed => 401,
            ExitCode::ProposalFailed => 402,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExitCode::Finished => "FINISHED",
            ExitCode::AfmSearchFailed => "ERROR_AFM_SEARCH_FAILED",
            ExitCode::ConstrainedScanFailed => "ERROR_CONSTRAINED_SCAN_FAILED",
            ExitCode::ProposalFailed => "ERROR_PROPOSAL_FAILED",
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Finished
    }
}

impl From<ExitCode> for u16 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

impl TryFrom<u16> for ExitCode {
    type Error = UnknownExitCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExitCode::Finished),
            400 => Ok(ExitCode::AfmSearchFailed),
            401 => Ok(ExitCode::ConstrainedScanFailed),
            402 => Ok(ExitCode::ProposalFailed),
            v => Err(UnknownExitCode(v)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown workflow exit code {0}")]
pub struct UnknownExitCode(pub u16);

/// Terminal result recorded in the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub exit_code: ExitCode,
    pub message: Option<String>,
}

/// Accumulated state of one search, owned by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    /// PK of the search workflow itself.
    pub workflow_pk: Pk,
    pub phase: SearchPhase,
    /// Jobs attempted in constrained generations.
    pub attempted: usize,
    /// Successful constrained jobs.
    pub successful: usize,
    pub generations: Vec<Generation>,
    /// Proposed matrices awaiting the next scan.
    #[serde(default)]
    pub pending: Vec<Pk>,
    pub holistic: bool,
    #[serde(default)]
    pub outcome: Option<SearchOutcome>,
}

impl SearchState {
    pub fn new(workflow_pk: Pk, holistic: bool) -> Self {
        Self {
            workflow_pk,
            phase: SearchPhase::Init,
            attempted: 0,
            successful: 0,
            generations: Vec::new(),
            pending: Vec::new(),
            holistic,
            outcome: None,
        }
    }

    /// Index the next generation will get.
    pub fn next_index(&self) -> usize {
        self.generations.len()
    }

    /// Matrices the next proposal step reads.
    ///
    /// Markovian: the last generation's successes. Holistic: every success
    /// so far, AFM bootstrap included.
    pub fn history_view(&self) -> Vec<Pk> {
        if self.holistic {
            self.generations.iter().flat_map(Generation::produced).collect()
        } else {
            self.generations
                .last()
                .map(Generation::produced)
                .unwrap_or_default()
        }
    }

    /// Record a finished generation and update the counters.
    pub fn record(&mut self, generation: Generation) {
        if generation.kind == GenerationKind::Constrained {
            self.attempted += generation.n_calculations();
            self.successful += generation.n_successful();
        }
        self.generations.push(generation);
    }

    pub fn afm_generation(&self) -> Option<&Generation> {
        self.generations
            .iter()
            .find(|g| g.kind == GenerationKind::Afm)
    }

    /// Assemble the workflow output from what has been recorded so far.
    pub fn output(&self) -> SearchOutput {
        let outcome = self.outcome.clone().unwrap_or(SearchOutcome {
            exit_code: ExitCode::Finished,
            message: None,
        });
        SearchOutput {
            exit_code: outcome.exit_code,
            message: outcome.message,
            n_cumulative: self.attempted,
            all_afm_matrices: self
                .afm_generation()
                .map(Generation::matrix_slots)
                .unwrap_or_default(),
            all_constrained_matrices: self
                .generations
                .iter()
                .filter(|g| g.kind == GenerationKind::Constrained)
                .flat_map(Generation::matrix_slots)
                .collect(),
            all_calculation_pks: self
                .generations
                .iter()
                .flat_map(Generation::calculation_pks)
                .collect(),
            generation_summary: self
                .generations
                .iter()
                .map(|g| (g.index, g.summary()))
                .collect(),
        }
    }
}

/// Workflow output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    pub exit_code: ExitCode,
    pub message: Option<String>,
    /// Constrained calculations attempted.
    pub n_cumulative: usize,
    pub all_afm_matrices: Vec<MatrixSlot>,
    pub all_constrained_matrices: Vec<MatrixSlot>,
    /// Every job, AFM bootstrap included, in submission order.
    pub all_calculation_pks: Vec<Pk>,
    pub generation_summary: BTreeMap<usize, GenerationSummary>,
}
