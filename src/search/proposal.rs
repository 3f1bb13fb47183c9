//! Occupation matrix proposal engine.
//!
//! Two modes are supported:
//!
//! - `random`: for every site, place round(target electrons) (optionally
//!   shifted by -1, 0 or +1) into randomly chosen spin-orbitals, then rotate
//!   both spin blocks by one Haar-random orthogonal matrix. Target electron
//!   counts come from `target_traces` or the mean trace over the history.
//! - `read`: take the next unread entries of a pre-enumerated candidate file.
//!
//! Every candidate gets its own RNG stream derived from the configured seed,
//! the generation index and the candidate index, so a proposal step is
//! reproducible no matter how the work is scheduled across threads.

use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Deserialize;

use crate::schema::{
    AtomOccupation, Block, MatrixShape, OccupationMatrix, ProposalConfig, ProposalMode,
    ProposalOptions, ValidationError,
};

use super::rotation::{diagonal, random_orthogonal, rotate_block, to_block};
use super::store::StoreError;

/// One entry of a `read`-mode candidate file.
#[derive(Debug, Deserialize)]
struct ReadEntry {
    /// `[iatom][ispin]` blocks; spin 0 is up, 1 is down.
    occupation_numbers: Vec<Vec<Block>>,
}

/// Shape and labels every proposal must follow.
#[derive(Debug, Clone)]
struct Reference {
    shape: MatrixShape,
    labels: Vec<String>,
}

/// Produces candidate occupation matrices for the next generation.
pub struct ProposalEngine {
    mode: ProposalMode,
    options: ProposalOptions,
    debug: bool,
    read_entries: Option<Vec<ReadEntry>>,
    read_cursor: usize,
}

impl ProposalEngine {
    pub fn new(config: &ProposalConfig) -> Self {
        Self {
            mode: config.mode,
            options: config.options.clone(),
            debug: config.debug,
            read_entries: None,
            read_cursor: 0,
        }
    }

    /// Skip the first `cursor` entries of the candidate file (resuming).
    pub fn with_read_cursor(mut self, cursor: usize) -> Self {
        self.read_cursor = cursor;
        self
    }

    /// Number of candidate-file entries consumed so far.
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn mode(&self) -> ProposalMode {
        self.mode
    }

    /// Propose `count` new matrices for generation `generation`.
    ///
    /// `history` holds the successful matrices of the configured history
    /// view. Every returned matrix has the same shape as the history (or the
    /// basis / first file entry when the history is empty).
    pub fn propose(
        &mut self,
        history: &[&OccupationMatrix],
        count: usize,
        generation: usize,
    ) -> Result<Vec<OccupationMatrix>, ProposalError> {
        if count == 0 {
            return Err(ProposalError::Configuration(
                "proposal count must be at least 1".to_string(),
            ));
        }

        let reference = self.reference(history)?;

        if self.debug {
            log::debug!(
                "Proposing {} matrices for generation {} ({:?} mode) from {} history matrices",
                count,
                generation,
                self.mode,
                history.len()
            );
        }

        let proposals = match self.mode {
            ProposalMode::Random => {
                let reference = reference.ok_or(ProposalError::EmptyHistory)?;
                self.propose_random(history, &reference, count, generation)?
            }
            ProposalMode::Read => self.propose_read(reference.as_ref(), count)?,
        };

        if self.debug {
            for (i, p) in proposals.iter().enumerate() {
                log::debug!(
                    "  proposal {}/{}: electrons per site {:?}",
                    i + 1,
                    count,
                    p.traces()
                );
            }
        }

        Ok(proposals)
    }

    fn reference(&self, history: &[&OccupationMatrix]) -> Result<Option<Reference>, ProposalError> {
        let Some((first, rest)) = history.split_first() else {
            return match &self.options.basis {
                Some(basis) => {
                    let shape = basis
                        .validate()
                        .map_err(|source| ProposalError::InvalidHistory { index: 0, source })?;
                    Ok(Some(Reference {
                        shape,
                        labels: basis.labels(),
                    }))
                }
                None => Ok(None),
            };
        };

        let shape = first
            .validate()
            .map_err(|source| ProposalError::InvalidHistory { index: 0, source })?;
        for (i, m) in rest.iter().enumerate() {
            m.validate_against(&shape)
                .map_err(|source| ProposalError::InvalidHistory { index: i + 1, source })?;
        }
        Ok(Some(Reference {
            shape,
            labels: first.labels(),
        }))
    }

    fn target_traces(
        &self,
        history: &[&OccupationMatrix],
        reference: &Reference,
    ) -> Result<Vec<f64>, ProposalError> {
        let n_atoms = reference.shape.n_atoms();
        if let Some(traces) = &self.options.target_traces {
            if traces.len() != n_atoms {
                return Err(ProposalError::Configuration(format!(
                    "{} target traces given for {} sites",
                    traces.len(),
                    n_atoms
                )));
            }
            return Ok(traces.clone());
        }

        if history.is_empty() {
            return match &self.options.basis {
                Some(basis) => Ok(basis.traces()),
                None => Err(ProposalError::EmptyHistory),
            };
        }

        let mut totals = vec![0.0; n_atoms];
        for m in history {
            for (total, trace) in totals.iter_mut().zip(m.traces()) {
                *total += trace;
            }
        }
        let n = history.len() as f64;
        Ok(totals.into_iter().map(|t| t / n).collect())
    }

    fn propose_random(
        &self,
        history: &[&OccupationMatrix],
        reference: &Reference,
        count: usize,
        generation: usize,
    ) -> Result<Vec<OccupationMatrix>, ProposalError> {
        let traces = self.target_traces(history, reference)?;
        if self.debug {
            log::debug!("  target electrons per site: {:?}", traces);
        }

        let seed = self.options.seed;
        let randomize = self.options.randomize_oxidation;
        let proposals: Vec<OccupationMatrix> = (0..count)
            .into_par_iter()
            .map(|i| {
                random_candidate(
                    reference,
                    &traces,
                    randomize,
                    candidate_seed(seed, generation, i),
                )
            })
            .collect();

        for (index, p) in proposals.iter().enumerate() {
            p.validate_against(&reference.shape)
                .map_err(|source| ProposalError::Validation { index, source })?;
        }
        Ok(proposals)
    }

    fn propose_read(
        &mut self,
        reference: Option<&Reference>,
        count: usize,
    ) -> Result<Vec<OccupationMatrix>, ProposalError> {
        let path = self.options.readfile.clone().ok_or_else(|| {
            ProposalError::Configuration("read mode requires a readfile".to_string())
        })?;
        if self.read_entries.is_none() {
            self.read_entries = Some(load_read_entries(&path)?);
        }
        let entries = self.read_entries.as_deref().unwrap_or_default();

        let remaining = entries.len().saturating_sub(self.read_cursor);
        if remaining < count {
            return Err(ProposalError::Configuration(format!(
                "{} has {} unread entries, {} requested",
                path.display(),
                remaining,
                count
            )));
        }

        let labels = reference.map(|r| r.labels.clone()).unwrap_or_default();
        let mut expected = reference.map(|r| r.shape.clone());
        let mut proposals = Vec::with_capacity(count);
        for (index, entry) in entries[self.read_cursor..self.read_cursor + count]
            .iter()
            .enumerate()
        {
            let matrix =
                OccupationMatrix::from_spin_blocks(&labels, entry.occupation_numbers.clone())
                    .map_err(|source| ProposalError::Validation { index, source })?;
            let shape = match &expected {
                Some(shape) => shape.clone(),
                None => matrix
                    .shape()
                    .map_err(|source| ProposalError::Validation { index, source })?,
            };
            matrix
                .validate_against(&shape)
                .map_err(|source| ProposalError::Validation { index, source })?;
            expected = Some(shape);
            proposals.push(matrix);
        }

        self.read_cursor += count;
        if self.debug {
            log::debug!(
                "Read {} matrices from {} ({} consumed so far)",
                count,
                path.display(),
                self.read_cursor
            );
        }
        Ok(proposals)
    }
}

fn load_read_entries(path: &Path) -> Result<Vec<ReadEntry>, ProposalError> {
    let content = fs::read_to_string(path).map_err(|source| ProposalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ProposalError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Independent seed per (generation, candidate).
fn candidate_seed(seed: u64, generation: usize, index: usize) -> u64 {
    let mut z = seed
        .wrapping_add((generation as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((index as u64).wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn random_candidate(
    reference: &Reference,
    traces: &[f64],
    randomize_oxidation: bool,
    seed: u64,
) -> OccupationMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let atoms = reference
        .shape
        .orbital_dims
        .iter()
        .zip(traces)
        .enumerate()
        .map(|(i, (&dim, &trace))| {
            let mut electrons = trace.round() as i64;
            if randomize_oxidation {
                electrons += rng.gen_range(-1..=1);
            }
            let electrons = electrons.clamp(0, 2 * dim as i64) as usize;

            // Spin-orbital slots: first `dim` are up, the rest down.
            let mut slots = vec![0.0; 2 * dim];
            slots[..electrons].fill(1.0);
            slots.shuffle(&mut rng);

            let rotation = random_orthogonal(dim, &mut rng);
            let up = rotate_block(&diagonal(&slots[..dim]), &rotation);
            let down = rotate_block(&diagonal(&slots[dim..]), &rotation);

            AtomOccupation {
                label: reference
                    .labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| (i + 1).to_string()),
                up: to_block(&up),
                down: to_block(&down),
            }
        })
        .collect();
    OccupationMatrix::new(atoms)
}

/// Proposal failures.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("Proposal configuration error: {0}")]
    Configuration(String),
    #[error("Random proposals need a non-empty history or a basis matrix")]
    EmptyHistory,
    #[error("History matrix unavailable: {0}")]
    MissingHistory(#[from] StoreError),
    #[error("History matrix {index} is invalid: {source}")]
    InvalidHistory {
        index: usize,
        source: ValidationError,
    },
    #[error("Proposed matrix {index} is invalid: {source}")]
    Validation {
        index: usize,
        source: ValidationError,
    },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
