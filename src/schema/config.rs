//! Configuration types for the occupation matrix search.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OccupationMatrix;

/// Largest site count the AFM bootstrap will enumerate (2^n configurations).
pub const MAX_AFM_SITES: usize = 16;

/// Seed used for `random` proposals when none is configured.
pub const DEFAULT_PROPOSAL_SEED: u64 = 0x0cc5_eed5;

fn default_magnitude() -> f64 {
    0.5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_proposal_seed() -> u64 {
    DEFAULT_PROPOSAL_SEED
}

fn default_randomize_oxidation() -> bool {
    true
}

/// Top-level search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Inputs for the AFM bootstrap scan.
    pub afm: AfmInputs,
    /// Inputs shared by every constrained calculation.
    pub constrained: ConstrainedInputs,
    /// Total calculation budget.
    pub n_max: usize,
    /// Proposals per generation.
    pub batch_size: usize,
    /// Proposal engine settings.
    #[serde(default)]
    pub proposal: ProposalConfig,
    /// Job polling settings.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Where to write a checkpoint after every generation.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let calculation = CalculationInputs::default();
        Self {
            afm: AfmInputs {
                calculation: calculation.clone(),
                magnitude: default_magnitude(),
            },
            constrained: ConstrainedInputs {
                calculation,
                oscdft_card: ConstraintCard::default(),
            },
            n_max: 60,
            batch_size: 20,
            proposal: ProposalConfig::default(),
            runner: RunnerConfig::default(),
            checkpoint: None,
        }
    }
}

/// Parameters common to every DFT+U calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalculationInputs {
    /// Opaque reference to the crystal structure (file path or store key).
    pub structure: String,
    /// DFT parameters as namelist -> key -> value.
    pub parameters: BTreeMap<String, BTreeMap<String, Value>>,
    /// Monkhorst-Pack k-point mesh.
    pub kpoints: [u32; 3],
    /// Executable (or code handle) that runs one calculation.
    pub code: String,
    /// Labels of the Hubbard (transition metal) sites.
    pub tm_atoms: Vec<String>,
}

impl Default for CalculationInputs {
    fn default() -> Self {
        let mut control = BTreeMap::new();
        control.insert("calculation".to_string(), Value::from("scf"));
        control.insert("verbosity".to_string(), Value::from("high"));
        let mut system = BTreeMap::new();
        system.insert("ecutwfc".to_string(), Value::from(80.0));
        system.insert("ecutrho".to_string(), Value::from(640.0));
        system.insert("occupations".to_string(), Value::from("smearing"));
        system.insert("degauss".to_string(), Value::from(0.01));
        system.insert("nspin".to_string(), Value::from(2));
        let mut electrons = BTreeMap::new();
        electrons.insert("conv_thr".to_string(), Value::from(1.0e-8));
        electrons.insert("mixing_beta".to_string(), Value::from(0.3));

        let mut parameters = BTreeMap::new();
        parameters.insert("CONTROL".to_string(), control);
        parameters.insert("SYSTEM".to_string(), system);
        parameters.insert("ELECTRONS".to_string(), electrons);

        Self {
            structure: "structure.in".to_string(),
            parameters,
            kpoints: [8, 8, 8],
            code: "pw.x".to_string(),
            tm_atoms: vec!["Ni1".to_string(), "Ni2".to_string()],
        }
    }
}

/// AFM namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AfmInputs {
    pub calculation: CalculationInputs,
    /// Starting magnetization magnitude applied with +/- sign per site.
    #[serde(default = "default_magnitude")]
    pub magnitude: f64,
}

/// Constrained namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstrainedInputs {
    pub calculation: CalculationInputs,
    /// Occupation constraint parameters.
    #[serde(default)]
    pub oscdft_card: ConstraintCard,
}

/// Parameters of the occupation-matrix constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConstraintCard {
    pub oscdft_type: i32,
    pub n_oscdft: u32,
    pub constraint_strength: f64,
    pub constraint_conv_thr: f64,
    pub constraint_maxstep: u32,
    pub constraint_mixing_beta: f64,
}

impl Default for ConstraintCard {
    fn default() -> Self {
        Self {
            oscdft_type: 2,
            n_oscdft: 100,
            constraint_strength: 1.0,
            constraint_conv_thr: 0.005,
            constraint_maxstep: 200,
            constraint_mixing_beta: 0.4,
        }
    }
}

/// How new candidate matrices are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProposalMode {
    /// Random multiplets, rotated in orbital space.
    #[default]
    Random,
    /// Pre-enumerated candidates read from a file.
    Read,
}

/// Proposal engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProposalConfig {
    #[serde(default)]
    pub mode: ProposalMode,
    /// Use every successful matrix so far instead of only the last generation.
    #[serde(default)]
    pub holistic: bool,
    /// Emit per-proposal debug logging.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub options: ProposalOptions,
}

/// Mode-specific proposal options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposalOptions {
    /// Seed for `random` mode.
    #[serde(default = "default_proposal_seed")]
    pub seed: u64,
    /// Candidate file for `read` mode.
    #[serde(default)]
    pub readfile: Option<PathBuf>,
    /// Electron count per site; overrides the history average.
    #[serde(default)]
    pub target_traces: Option<Vec<f64>>,
    /// Shift each site's electron count by -1, 0 or +1 at random.
    #[serde(default = "default_randomize_oxidation")]
    pub randomize_oxidation: bool,
    /// Reference matrix used when the proposal history is empty.
    #[serde(default)]
    pub basis: Option<OccupationMatrix>,
}

impl Default for ProposalOptions {
    fn default() -> Self {
        Self {
            seed: DEFAULT_PROPOSAL_SEED,
            readfile: None,
            target_traces: None,
            randomize_oxidation: true,
            basis: None,
        }
    }
}

/// Job polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Delay between polls of pending jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CalculationInputs {
    fn validate(&self, namespace: &'static str) -> Result<(), ConfigError> {
        if self.code.trim().is_empty() {
            return Err(ConfigError::MissingField {
                namespace,
                field: "code",
            });
        }
        if self.structure.trim().is_empty() {
            return Err(ConfigError::MissingField {
                namespace,
                field: "structure",
            });
        }
        if self.tm_atoms.is_empty() {
            return Err(ConfigError::NoHubbardSites(namespace));
        }
        if self.kpoints.contains(&0) {
            return Err(ConfigError::InvalidKpoints(self.kpoints));
        }
        Ok(())
    }
}

impl SearchConfig {
    /// Validate configuration before the search starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_max == 0 {
            return Err(ConfigError::InvalidBudget);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        self.afm.calculation.validate("afm")?;
        self.constrained.calculation.validate("constrained")?;

        if !self.afm.magnitude.is_finite() || self.afm.magnitude <= 0.0 {
            return Err(ConfigError::InvalidMagnitude(self.afm.magnitude));
        }
        if self.afm.calculation.tm_atoms.len() > MAX_AFM_SITES {
            return Err(ConfigError::TooManySites {
                found: self.afm.calculation.tm_atoms.len(),
                max: MAX_AFM_SITES,
            });
        }

        let options = &self.proposal.options;
        if self.proposal.mode == ProposalMode::Read && options.readfile.is_none() {
            return Err(ConfigError::MissingReadfile);
        }
        if let Some(basis) = &options.basis {
            let shape = basis.validate()?;
            if let Some(traces) = &options.target_traces
                && traces.len() != shape.n_atoms()
            {
                return Err(ConfigError::TraceCountMismatch {
                    traces: traces.len(),
                    sites: shape.n_atoms(),
                });
            }
        }
        if let Some(traces) = &options.target_traces
            && traces.iter().any(|t| !t.is_finite() || *t < 0.0)
        {
            return Err(ConfigError::InvalidTargetTraces);
        }

        if self.batch_size > self.n_max {
            log::warn!(
                "batch size {} exceeds budget {}; the single generation will overshoot",
                self.batch_size,
                self.n_max
            );
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Calculation budget (n_max) must be positive")]
    InvalidBudget,
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error("Missing required field {namespace}.{field}")]
    MissingField {
        namespace: &'static str,
        field: &'static str,
    },
    #[error("No Hubbard sites listed in {0}.tm_atoms")]
    NoHubbardSites(&'static str),
    #[error("Invalid k-point mesh {0:?}")]
    InvalidKpoints([u32; 3]),
    #[error("Magnetization magnitude must be positive and finite, got {0}")]
    InvalidMagnitude(f64),
    #[error("AFM scan over {found} sites exceeds the limit of {max}")]
    TooManySites { found: usize, max: usize },
    #[error("Read mode requires proposal.options.readfile")]
    MissingReadfile,
    #[error("{traces} target traces given for {sites} sites")]
    TraceCountMismatch { traces: usize, sites: usize },
    #[error("Target traces must be finite and non-negative")]
    InvalidTargetTraces,
    #[error("Invalid basis matrix: {0}")]
    InvalidBasis(#[from] super::ValidationError),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SearchConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
