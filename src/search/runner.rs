//! Generation runner: submit a batch, wait for all of it, classify.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crate::schema::{
    CalculationInputs, ConstrainedInputs, Generation, GenerationKind, JobInput, JobRecord,
    JobStatus, MatrixShape, MatrixSlot, Pk, RunnerConfig,
};

use super::store::{MatrixOrigin, MatrixStore, PkAllocator, StoreError};
use super::substrate::{ConstraintTarget, JobOutcome, JobPoll, JobRequest, JobSubstrate};

/// Starting magnetization given to every Hubbard site of a constrained job.
/// The constraint decides the moments; this only switches on spin polarization.
pub const CONSTRAINED_STARTING_MAGNETIZATION: f64 = 1e-9;

/// A job ready to be submitted, before it has a PK.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub input: JobInput,
    pub calculation: CalculationInputs,
    pub starting_magnetization: BTreeMap<String, f64>,
    pub target: Option<ConstraintTarget>,
}

/// Runs one generation at a time against a substrate.
#[derive(Debug, Clone)]
pub struct GenerationRunner {
    poll_interval: Duration,
    allocator: PkAllocator,
}

impl GenerationRunner {
    pub fn new(config: &RunnerConfig, allocator: PkAllocator) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            allocator,
        }
    }

    /// Submit every job, block until all are terminal, and record outputs.
    ///
    /// Individual failures (submission errors, poll errors, non-zero exit,
    /// missing or invalid output) are recorded on the job, never returned.
    ///
    /// An output must have the shape of the job's constraint target. Jobs
    /// without a target must match the first accepted output of the batch.
    pub fn execute<S: JobSubstrate + ?Sized>(
        &self,
        substrate: &mut S,
        store: &mut MatrixStore,
        index: usize,
        kind: GenerationKind,
        jobs: Vec<PreparedJob>,
    ) -> Generation {
        let scan_pk = self.allocator.next();
        let mut records = Vec::with_capacity(jobs.len());
        let mut pending = Vec::with_capacity(jobs.len());
        let expected: Vec<Option<MatrixShape>> = jobs
            .iter()
            .map(|job| job.target.as_ref().and_then(|t| t.matrix.shape().ok()))
            .collect();

        for (i, job) in jobs.into_iter().enumerate() {
            let pk = self.allocator.next();
            let mut record = JobRecord {
                pk,
                generation: index,
                input: job.input.clone(),
                status: JobStatus::Pending,
                exit_code: None,
                output_matrix: MatrixSlot::Absent,
            };
            let request = JobRequest {
                pk,
                generation: index,
                index: i,
                input: job.input,
                calculation: job.calculation,
                starting_magnetization: job.starting_magnetization,
                target: job.target,
            };
            match substrate.submit(request) {
                Ok(()) => pending.push(i),
                Err(e) => {
                    log::warn!("Generation {}: failed to submit job {}: {}", index, pk, e);
                    record.status = JobStatus::Failure;
                }
            }
            records.push(record);
        }

        log::info!(
            "Generation {} ({}): submitted {} of {} calculations",
            index,
            kind,
            pending.len(),
            records.len()
        );

        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; records.len()];
        while !pending.is_empty() {
            pending.retain(|&i| {
                let pk = records[i].pk;
                match substrate.poll(pk) {
                    Ok(JobPoll::Pending) => true,
                    Ok(JobPoll::Finished(outcome)) => {
                        outcomes[i] = Some(outcome);
                        false
                    }
                    Err(e) => {
                        log::warn!("Generation {}: lost track of job {}: {}", index, pk, e);
                        records[i].status = JobStatus::Failure;
                        false
                    }
                }
            });
            if !pending.is_empty() {
                thread::sleep(self.poll_interval);
            }
        }

        let origin = match kind {
            GenerationKind::Afm => MatrixOrigin::Afm,
            GenerationKind::Constrained => MatrixOrigin::Constrained,
        };
        let mut reference: Option<MatrixShape> = None;
        for (i, (record, outcome)) in records.iter_mut().zip(outcomes).enumerate() {
            let Some(outcome) = outcome else {
                continue;
            };
            record.exit_code = Some(outcome.exit_code);
            record.status = JobStatus::Failure;
            match (outcome.exit_code, outcome.occupations) {
                (0, Some(matrix)) => {
                    let checked = match expected[i].as_ref().or(reference.as_ref()) {
                        Some(want) => matrix.validate_against(want).map(|()| want.clone()),
                        None => matrix.validate(),
                    };
                    match checked {
                        Ok(shape) => {
                            reference.get_or_insert(shape);
                            let pk = store.store(matrix, index, origin, Some(record.pk));
                            record.output_matrix = MatrixSlot::Produced(pk);
                            record.status = JobStatus::Success;
                        }
                        Err(e) => log::warn!(
                            "Job {} returned an invalid occupation matrix: {}",
                            record.pk,
                            e
                        ),
                    }
                }
                (0, None) => log::warn!("Job {} converged without an occupation matrix", record.pk),
                (code, _) => log::debug!("Job {} failed with exit code {}", record.pk, code),
            }
        }

        let generation = Generation {
            pk: scan_pk,
            index,
            kind,
            jobs: records,
            consumed: Vec::new(),
        };
        log::info!(
            "Generation {} ({}): {} successful, {} failed",
            index,
            kind,
            generation.n_successful(),
            generation.n_failed()
        );
        generation
    }

    /// Run one constrained job per candidate matrix.
    ///
    /// Fails only when no job in the batch succeeds; the failed generation is
    /// returned inside the error so it can still be recorded.
    pub fn run_batch<S: JobSubstrate + ?Sized>(
        &self,
        substrate: &mut S,
        store: &mut MatrixStore,
        candidates: &[Pk],
        index: usize,
        template: &ConstrainedInputs,
    ) -> Result<Generation, GenerationFailedError> {
        let magnetization: BTreeMap<String, f64> = template
            .calculation
            .tm_atoms
            .iter()
            .map(|atom| (atom.clone(), CONSTRAINED_STARTING_MAGNETIZATION))
            .collect();

        let jobs = candidates
            .iter()
            .map(|&pk| {
                Ok(PreparedJob {
                    input: JobInput::Constrained { target_matrix: pk },
                    calculation: template.calculation.clone(),
                    starting_magnetization: magnetization.clone(),
                    target: Some(ConstraintTarget {
                        matrix: store.load(pk)?.clone(),
                        card: template.oscdft_card.clone(),
                    }),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let generation = self.execute(substrate, store, index, GenerationKind::Constrained, jobs);
        if generation.n_successful() == 0 {
            return Err(GenerationFailedError::AllFailed {
                generation: Box::new(generation),
            });
        }
        Ok(generation)
    }
}

/// A constrained batch that could not continue the search.
#[derive(Debug, thiserror::Error)]
pub enum GenerationFailedError {
    #[error("All {} calculations of generation {} failed", .generation.n_calculations(), .generation.index)]
    AllFailed { generation: Box<Generation> },
    #[error("Candidate matrix missing from the store: {0}")]
    UnknownCandidate(#[from] StoreError),
}

impl GenerationFailedError {
    /// The failed generation, if the batch ran at all.
    pub fn into_generation(self) -> Option<Generation> {
        match self {
            GenerationFailedError::AllFailed { generation } => Some(*generation),
            GenerationFailedError::UnknownCandidate(_) => None,
        }
    }
}
