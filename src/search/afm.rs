//! AFM bootstrap: one unconstrained calculation per collinear spin pattern.

use std::collections::BTreeMap;

use crate::schema::{AfmInputs, Generation, GenerationKind, JobInput};

use super::runner::{GenerationRunner, PreparedJob};
use super::store::MatrixStore;
use super::substrate::JobSubstrate;

/// Every +/- assignment of `magnitude` over `labels`, 2^n in total.
///
/// Configuration `i` gives site `j` a positive moment when bit `j` of `i`,
/// counted from the most significant of the `n` bits, is set.
pub fn magnetic_configurations(labels: &[String], magnitude: f64) -> Vec<BTreeMap<String, f64>> {
    let n = labels.len();
    (0..1usize << n)
        .map(|i| {
            labels
                .iter()
                .enumerate()
                .map(|(j, label)| {
                    let up = (i >> (n - 1 - j)) & 1 == 1;
                    (label.clone(), if up { magnitude } else { -magnitude })
                })
                .collect()
        })
        .collect()
}

/// Run the bootstrap scan as generation 0.
///
/// Partial failure is tolerated. If no job produces a matrix the generation
/// is returned inside the error.
pub fn run_afm_scan<S: JobSubstrate + ?Sized>(
    runner: &GenerationRunner,
    substrate: &mut S,
    store: &mut MatrixStore,
    inputs: &AfmInputs,
) -> Result<Generation, AfmBootstrapError> {
    let configs = magnetic_configurations(&inputs.calculation.tm_atoms, inputs.magnitude);
    log::info!(
        "AFM bootstrap: {} magnetic configurations over {} sites",
        configs.len(),
        inputs.calculation.tm_atoms.len()
    );

    let jobs = configs
        .into_iter()
        .map(|starting_magnetization| PreparedJob {
            input: JobInput::Afm {
                starting_magnetization: starting_magnetization.clone(),
            },
            calculation: inputs.calculation.clone(),
            starting_magnetization,
            target: None,
        })
        .collect();

    let generation = runner.execute(substrate, store, 0, GenerationKind::Afm, jobs);
    if generation.n_successful() == 0 {
        return Err(AfmBootstrapError {
            generation: Box::new(generation),
        });
    }
    Ok(generation)
}

/// The bootstrap scan produced no matrices.
#[derive(Debug, thiserror::Error)]
#[error("AFM search produced no occupation matrices ({} calculations failed)", .generation.n_calculations())]
pub struct AfmBootstrapError {
    pub generation: Box<Generation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RunnerConfig;
    use crate::schema::matrix::diagonal_matrix;
    use crate::search::store::{MatrixOrigin, PkAllocator};
    use crate::search::substrate::{InProcessSubstrate, JobOutcome, JobRequest};

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_configurations_msb_first() {
        let configs = magnetic_configurations(&labels(&["Ni1", "Ni2"]), 0.5);
        assert_eq!(configs.len(), 4);
        let as_pairs: Vec<(f64, f64)> = configs.iter().map(|c| (c["Ni1"], c["Ni2"])).collect();
        assert_eq!(
            as_pairs,
            vec![(-0.5, -0.5), (-0.5, 0.5), (0.5, -0.5), (0.5, 0.5)]
        );
    }

    #[test]
    fn test_configuration_count() {
        let configs = magnetic_configurations(&labels(&["a", "b", "c", "d"]), 1.0);
        assert_eq!(configs.len(), 16);
        let unique: std::collections::BTreeSet<Vec<i64>> = configs
            .iter()
            .map(|c| c.values().map(|&m| m as i64).collect())
            .collect();
        assert_eq!(unique.len(), 16);
    }

    fn afm_inputs() -> AfmInputs {
        crate::schema::SearchConfig::default().afm
    }

    #[test]
    fn test_scan_records_generation_zero() {
        let allocator = PkAllocator::new();
        let runner = GenerationRunner::new(&RunnerConfig { poll_interval_ms: 1 }, allocator.clone());
        let mut store = MatrixStore::new(allocator);
        // Ferromagnetic patterns fail to converge.
        let mut substrate = InProcessSubstrate::new(|req: &JobRequest| {
            let signs: Vec<bool> = req.starting_magnetization.values().map(|&m| m > 0.0).collect();
            if signs[0] != signs[1] {
                JobOutcome::converged(diagonal_matrix(&[(&[1.0], &[0.0]), (&[0.0], &[1.0])]))
            } else {
                JobOutcome::failed(1)
            }
        });

        let generation = run_afm_scan(&runner, &mut substrate, &mut store, &afm_inputs()).unwrap();
        assert_eq!(generation.index, 0);
        assert_eq!(generation.kind, GenerationKind::Afm);
        assert_eq!(generation.n_calculations(), 4);
        assert_eq!(generation.n_successful(), 2);
        assert!(generation.jobs[0].output_matrix.is_absent());
        assert!(generation.jobs[3].output_matrix.is_absent());
        for pk in generation.produced() {
            assert_eq!(store.get(pk).unwrap().origin, MatrixOrigin::Afm);
        }
    }

    #[test]
    fn test_scan_rejects_outputs_of_another_shape() {
        let allocator = PkAllocator::new();
        let runner = GenerationRunner::new(&RunnerConfig { poll_interval_ms: 1 }, allocator.clone());
        let mut store = MatrixStore::new(allocator);
        let mut substrate = InProcessSubstrate::new(|req: &JobRequest| match req.index {
            1 => JobOutcome::converged(diagonal_matrix(&[(&[1.0], &[0.0]), (&[0.0], &[1.0])])),
            2 => JobOutcome::converged(diagonal_matrix(&[(&[1.0], &[0.0])])),
            _ => JobOutcome::failed(1),
        });

        let generation = run_afm_scan(&runner, &mut substrate, &mut store, &afm_inputs()).unwrap();
        assert_eq!(generation.n_successful(), 1);
        assert!(generation.jobs[1].output_matrix.pk().is_some());
        assert_eq!(generation.jobs[2].exit_code, Some(0));
        assert!(generation.jobs[2].output_matrix.is_absent());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_with_no_output_fails() {
        let allocator = PkAllocator::new();
        let runner = GenerationRunner::new(&RunnerConfig { poll_interval_ms: 1 }, allocator.clone());
        let mut store = MatrixStore::new(allocator);
        let mut substrate = InProcessSubstrate::new(|_: &JobRequest| JobOutcome::failed(3));
        let err = run_afm_scan(&runner, &mut substrate, &mut store, &afm_inputs()).unwrap_err();
        assert_eq!(err.generation.n_failed(), 4);
        assert!(store.is_empty());
    }
}
