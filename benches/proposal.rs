//! Benchmarks for occupation matrix proposals.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use occsearch::{
    schema::{AtomOccupation, OccupationMatrix, ProposalConfig, ProposalOptions},
    search::ProposalEngine,
};

/// `n_atoms` d-shell sites with alternating high-spin moments.
fn basis(n_atoms: usize, dim: usize) -> OccupationMatrix {
    let full: Vec<Vec<f64>> = (0..dim)
        .map(|i| (0..dim).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let partial: Vec<Vec<f64>> = (0..dim)
        .map(|i| (0..dim).map(|j| if i == j && i < 3 { 1.0 } else { 0.0 }).collect())
        .collect();
    OccupationMatrix::new(
        (0..n_atoms)
            .map(|i| {
                let (up, down) = if i % 2 == 0 {
                    (full.clone(), partial.clone())
                } else {
                    (partial.clone(), full.clone())
                };
                AtomOccupation {
                    label: format!("Ni{}", i + 1),
                    up,
                    down,
                }
            })
            .collect(),
    )
}

fn bench_random_proposals(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_proposals");

    for n_atoms in [2, 4, 8, 16] {
        let history = basis(n_atoms, 5);
        let mut engine = ProposalEngine::new(&ProposalConfig {
            options: ProposalOptions {
                seed: 42,
                ..Default::default()
            },
            ..Default::default()
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_sites", n_atoms)),
            &n_atoms,
            |b, _| {
                b.iter(|| {
                    let proposals = engine
                        .propose(black_box(&[&history]), 20, 1)
                        .unwrap_or_default();
                    black_box(proposals);
                });
            },
        );
    }

    group.finish();
}

fn bench_batch_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("proposal_batch_size");
    let history = basis(4, 7);

    for batch in [1, 10, 50, 200] {
        let mut engine = ProposalEngine::new(&ProposalConfig::default());
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let proposals = engine
                    .propose(black_box(&[&history]), batch, 1)
                    .unwrap_or_default();
                black_box(proposals);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_random_proposals, bench_batch_size);
criterion_main!(benches);
