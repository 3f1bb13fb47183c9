//! Post-hoc extraction of converged calculations from a finished search.
//!
//! A search is viewed as a provenance tree: the workflow calls one scan per
//! generation and every scan calls its calculations. [`gather`] walks that
//! tree and produces an [`ExtractionReport`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{JobInput, OccupationMatrix, Pk};
use crate::search::{Checkpoint, MatrixStore, PkAllocator};

/// Default recursion limit of [`gather`].
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// A node of the provenance tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum ProvenanceNode {
    Workflow {
        pk: Pk,
        label: String,
        called: Vec<ProvenanceNode>,
    },
    Calculation {
        pk: Pk,
        calculation_type: String,
        /// `None` when the job never ran.
        exit_status: Option<i32>,
        input: JobInput,
        /// Constraint target, for constrained calculations.
        target: Option<OccupationMatrix>,
        output: Option<OccupationMatrix>,
    },
}

impl ProvenanceNode {
    pub fn pk(&self) -> Pk {
        match self {
            ProvenanceNode::Workflow { pk, .. } | ProvenanceNode::Calculation { pk, .. } => *pk,
        }
    }

    /// Build the tree of a (possibly unfinished) search.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let store = MatrixStore::from_snapshot(
            checkpoint.matrices.clone(),
            PkAllocator::starting_at(checkpoint.next_pk),
        );
        let lookup = |pk: Option<Pk>| pk.and_then(|pk| store.load(pk).ok().cloned());

        let called = checkpoint
            .state
            .generations
            .iter()
            .map(|generation| ProvenanceNode::Workflow {
                pk: generation.pk,
                label: format!("{}_scan_{}", generation.kind, generation.index),
                called: generation
                    .jobs
                    .iter()
                    .map(|job| ProvenanceNode::Calculation {
                        pk: job.pk,
                        calculation_type: match job.input {
                            JobInput::Afm { .. } => "pw".to_string(),
                            JobInput::Constrained { .. } => "constrained_pw".to_string(),
                        },
                        exit_status: job.exit_code,
                        input: job.input.clone(),
                        target: lookup(job.input.target_matrix()),
                        output: lookup(job.output_matrix.pk()),
                    })
                    .collect(),
            })
            .collect();

        ProvenanceNode::Workflow {
            pk: checkpoint.state.workflow_pk,
            label: "constrained_search".to_string(),
            called,
        }
    }

    fn label(&self) -> &str {
        match self {
            ProvenanceNode::Workflow { label, .. } => label,
            ProvenanceNode::Calculation {
                calculation_type, ..
            } => calculation_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub root_pk: Pk,
    pub root_label: String,
    pub total_calculations_found: usize,
    pub extraction_timestamp: DateTime<Utc>,
    pub max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonConvergedCalculation {
    pub pk: Pk,
    pub exit_status: Option<i32>,
    pub calculation_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub total_calculations: usize,
    pub converged_calculations: usize,
    pub non_converged_calculations: usize,
    /// Keyed by exit status, `"none"` for jobs that never ran.
    pub exit_status_counts: BTreeMap<String, usize>,
    pub calculation_types: BTreeMap<String, usize>,
    pub non_converged_details: Vec<NonConvergedCalculation>,
    pub convergence_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationData {
    pub pk: Pk,
    pub exit_status: i32,
    pub calculation_type: String,
    pub input: JobInput,
    pub target: Option<OccupationMatrix>,
    pub output_occupations: Option<OccupationMatrix>,
}

/// Extraction result, written as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub metadata: ReportMetadata,
    pub statistics: ReportStatistics,
    /// Converged calculations keyed by PK.
    pub calculations: BTreeMap<Pk, CalculationData>,
}

/// Walk the tree under `root` (at most `max_depth` levels below it).
///
/// Every calculation counts towards the statistics; only converged ones
/// (exit status 0) are extracted. Nodes seen twice are visited once.
pub fn gather(root: &ProvenanceNode, max_depth: usize) -> ExtractionReport {
    let mut statistics = ReportStatistics::default();
    let mut calculations = BTreeMap::new();
    let mut visited = HashSet::new();
    walk(root, 0, max_depth, &mut visited, &mut statistics, &mut calculations);

    statistics.non_converged_calculations =
        statistics.total_calculations - statistics.converged_calculations;
    statistics.convergence_rate_percent = if statistics.total_calculations > 0 {
        let rate = statistics.converged_calculations as f64
            / statistics.total_calculations as f64
            * 100.0;
        (rate * 100.0).round() / 100.0
    } else {
        0.0
    };

    log::info!(
        "Found {} calculations ({} converged, {} non-converged), convergence rate {:.1}%",
        statistics.total_calculations,
        statistics.converged_calculations,
        statistics.non_converged_calculations,
        statistics.convergence_rate_percent
    );
    for detail in statistics.non_converged_details.iter().take(5) {
        log::debug!(
            "  non-converged PK {}: exit status {:?}, type {}",
            detail.pk,
            detail.exit_status,
            detail.calculation_type
        );
    }

    ExtractionReport {
        metadata: ReportMetadata {
            root_pk: root.pk(),
            root_label: root.label().to_string(),
            total_calculations_found: calculations.len(),
            extraction_timestamp: Utc::now(),
            max_depth,
        },
        statistics,
        calculations,
    }
}

fn walk(
    node: &ProvenanceNode,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<Pk>,
    statistics: &mut ReportStatistics,
    calculations: &mut BTreeMap<Pk, CalculationData>,
) {
    if depth > max_depth {
        log::warn!("Maximum depth {} reached at PK {}", max_depth, node.pk());
        return;
    }
    if !visited.insert(node.pk()) {
        return;
    }

    match node {
        ProvenanceNode::Workflow { called, .. } => {
            for child in called {
                walk(child, depth + 1, max_depth, visited, statistics, calculations);
            }
        }
        ProvenanceNode::Calculation {
            pk,
            calculation_type,
            exit_status,
            input,
            target,
            output,
        } => {
            statistics.total_calculations += 1;
            *statistics
                .calculation_types
                .entry(calculation_type.clone())
                .or_default() += 1;
            let status_key = exit_status.map_or_else(|| "none".to_string(), |s| s.to_string());
            *statistics.exit_status_counts.entry(status_key).or_default() += 1;

            if *exit_status == Some(0) {
                statistics.converged_calculations += 1;
                calculations.insert(
                    *pk,
                    CalculationData {
                        pk: *pk,
                        exit_status: 0,
                        calculation_type: calculation_type.clone(),
                        input: input.clone(),
                        target: target.clone(),
                        output_occupations: output.clone(),
                    },
                );
            } else {
                statistics.non_converged_details.push(NonConvergedCalculation {
                    pk: *pk,
                    exit_status: *exit_status,
                    calculation_type: calculation_type.clone(),
                });
            }
        }
    }
}

/// Write a report as pretty-printed JSON.
pub fn write_report<P: AsRef<Path>>(report: &ExtractionReport, path: P) -> Result<(), ReportError> {
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::matrix::diagonal_matrix;
    use crate::schema::{RunnerConfig, SearchConfig};
    use crate::search::{InProcessSubstrate, JobOutcome, JobRequest, SearchController};

    fn calc(pk: Pk, exit_status: Option<i32>) -> ProvenanceNode {
        ProvenanceNode::Calculation {
            pk,
            calculation_type: if pk % 2 == 0 { "pw" } else { "constrained_pw" }.to_string(),
            exit_status,
            input: JobInput::Constrained { target_matrix: 0 },
            target: None,
            output: None,
        }
    }

    fn workflow(pk: Pk, called: Vec<ProvenanceNode>) -> ProvenanceNode {
        ProvenanceNode::Workflow {
            pk,
            label: format!("wf{}", pk),
            called,
        }
    }

    #[test]
    fn test_statistics() {
        let root = workflow(
            1,
            vec![
                workflow(2, vec![calc(10, Some(0)), calc(11, Some(0)), calc(12, Some(3))]),
                workflow(3, vec![calc(13, Some(0)), calc(14, None), calc(10, Some(0))]),
            ],
        );
        let report = gather(&root, DEFAULT_MAX_DEPTH);
        let stats = &report.statistics;
        assert_eq!(stats.total_calculations, 5);
        assert_eq!(stats.converged_calculations, 3);
        assert_eq!(stats.non_converged_calculations, 2);
        assert_eq!(stats.exit_status_counts["0"], 3);
        assert_eq!(stats.exit_status_counts["3"], 1);
        assert_eq!(stats.exit_status_counts["none"], 1);
        assert_eq!(stats.calculation_types["pw"], 3);
        assert_eq!(stats.convergence_rate_percent, 60.0);
        assert_eq!(report.calculations.len(), 3);
        assert_eq!(report.metadata.root_pk, 1);
        assert_eq!(report.metadata.total_calculations_found, 3);
    }

    #[test]
    fn test_rate_is_rounded() {
        let root = workflow(1, vec![calc(2, Some(0)), calc(3, Some(1)), calc(4, Some(1))]);
        let report = gather(&root, DEFAULT_MAX_DEPTH);
        assert_eq!(report.statistics.convergence_rate_percent, 33.33);

        let empty = gather(&workflow(1, Vec::new()), DEFAULT_MAX_DEPTH);
        assert_eq!(empty.statistics.convergence_rate_percent, 0.0);
    }

    #[test]
    fn test_depth_limit() {
        let root = workflow(1, vec![calc(2, Some(0)), workflow(3, vec![calc(4, Some(0))])]);
        assert_eq!(gather(&root, 1).statistics.total_calculations, 1);
        assert_eq!(gather(&root, 2).statistics.total_calculations, 2);
        assert_eq!(gather(&root, 0).statistics.total_calculations, 0);
    }

    #[test]
    fn test_from_search() {
        let config = SearchConfig {
            n_max: 4,
            batch_size: 4,
            runner: RunnerConfig { poll_interval_ms: 1 },
            ..Default::default()
        };
        let substrate = InProcessSubstrate::new(|req: &JobRequest| {
            if req.index % 2 == 0 {
                JobOutcome::converged(diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 0.0]), (&[0.0, 0.0], &[1.0, 0.0])]))
            } else {
                JobOutcome::failed(5)
            }
        });
        let mut controller = SearchController::new(config, substrate).unwrap();
        controller.run().unwrap();

        let tree = ProvenanceNode::from_checkpoint(&controller.snapshot());
        let report = gather(&tree, DEFAULT_MAX_DEPTH);
        assert_eq!(report.statistics.total_calculations, 8);
        assert_eq!(report.statistics.converged_calculations, 4);
        assert_eq!(report.statistics.calculation_types["pw"], 4);
        assert_eq!(report.statistics.calculation_types["constrained_pw"], 4);
        for data in report.calculations.values() {
            assert!(data.output_occupations.is_some());
            if data.calculation_type == "constrained_pw" {
                assert!(data.target.is_some());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&report, &path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["statistics"]["convergence_rate_percent"], 50.0);
        assert!(json["metadata"]["extraction_timestamp"].is_string());
    }
}
