//! End-to-end search against an in-process toy calculation.
//!
//! The toy "calculation" converges when every Ni site carries 7 to 9
//! d electrons and returns the target slightly relaxed towards its diagonal.

use std::time::Instant;

use occsearch::{
    schema::{AtomOccupation, OccupationMatrix, RunnerConfig, SearchConfig},
    search::{InProcessSubstrate, JobOutcome, JobRequest, SearchController},
};

const DIM: usize = 5;

fn high_spin_d8(first_up: bool) -> OccupationMatrix {
    let full: Vec<Vec<f64>> = (0..DIM)
        .map(|i| (0..DIM).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let three: Vec<Vec<f64>> = (0..DIM)
        .map(|i| (0..DIM).map(|j| if i == j && i < 3 { 1.0 } else { 0.0 }).collect())
        .collect();
    let (up, down) = if first_up {
        (full.clone(), three.clone())
    } else {
        (three, full)
    };
    OccupationMatrix::new(vec![AtomOccupation {
        label: "Ni1".to_string(),
        up,
        down,
    }])
}

fn relax(target: &OccupationMatrix) -> OccupationMatrix {
    let blend = |block: &Vec<Vec<f64>>| -> Vec<Vec<f64>> {
        block
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, &v)| if i == j { v } else { 0.9 * v })
                    .collect()
            })
            .collect()
    };
    OccupationMatrix::new(
        target
            .atoms
            .iter()
            .map(|a| AtomOccupation {
                label: a.label.clone(),
                up: blend(&a.up),
                down: blend(&a.down),
            })
            .collect(),
    )
}

fn toy_calculation(req: &JobRequest) -> JobOutcome {
    match &req.target {
        None => {
            // AFM bootstrap: antiparallel patterns converge.
            let moments: Vec<f64> = req.starting_magnetization.values().copied().collect();
            if moments.windows(2).all(|w| w[0] * w[1] < 0.0) {
                let mut matrix = high_spin_d8(true);
                let mut second = high_spin_d8(false).atoms.remove(0);
                second.label = "Ni2".to_string();
                matrix.atoms.push(second);
                JobOutcome::converged(matrix)
            } else {
                JobOutcome::failed(410)
            }
        }
        Some(target) => {
            if target.matrix.traces().iter().all(|t| (7.0 - 1e-6..=9.0 + 1e-6).contains(t)) {
                JobOutcome::converged(relax(&target.matrix))
            } else {
                JobOutcome::failed(305)
            }
        }
    }
}

fn main() {
    env_logger::init();

    println!("=== Scripted Search ===\n");

    for holistic in [false, true] {
        let mut config = SearchConfig {
            n_max: 40,
            batch_size: 8,
            runner: RunnerConfig { poll_interval_ms: 1 },
            ..Default::default()
        };
        config.proposal.holistic = holistic;
        config.proposal.options.seed = 7;

        let start = Instant::now();
        let substrate = InProcessSubstrate::new(toy_calculation);
        let mut controller = match SearchController::new(config, substrate) {
            Ok(controller) => controller,
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                return;
            }
        };
        let output = match controller.run() {
            Ok(output) => output,
            Err(failure) => {
                println!("Search failed: {}", failure.error);
                failure.output
            }
        };
        let elapsed = start.elapsed();

        println!("History: {}", if holistic { "holistic" } else { "markovian" });
        println!("  Exit code: {}", output.exit_code.code());
        for (index, summary) in &output.generation_summary {
            println!(
                "  gen {:2} [{:11}] {:2}/{:2} converged",
                index, summary.kind, summary.n_successful, summary.n_calculations
            );
        }
        println!("  Attempted: {}", output.n_cumulative);
        println!("  Time: {:.2}s\n", elapsed.as_secs_f32());
    }
}
