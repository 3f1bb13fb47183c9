//! Search controller: AFM bootstrap followed by propose/scan generations
//! until the calculation budget is spent.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schema::{
    ConfigError, ExitCode, OccupationMatrix, Pk, SearchConfig, SearchOutcome, SearchOutput,
    SearchPhase, SearchState,
};

use super::afm::{AfmBootstrapError, run_afm_scan};
use super::proposal::{ProposalEngine, ProposalError};
use super::runner::{GenerationFailedError, GenerationRunner};
use super::store::{MatrixOrigin, MatrixStore, PkAllocator, StoredMatrix};
use super::substrate::JobSubstrate;

/// Progress reported after every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchProgress {
    pub phase: SearchPhase,
    /// Generations recorded so far, AFM bootstrap included.
    pub generations: usize,
    pub attempted: usize,
    pub successful: usize,
    pub n_max: usize,
}

/// Everything needed to continue a search in a new process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: SearchState,
    pub matrices: Vec<StoredMatrix>,
    /// Next PK to hand out.
    pub next_pk: Pk,
    /// Entries of the `read`-mode file consumed so far.
    #[serde(default)]
    pub read_cursor: usize,
}

impl Checkpoint {
    /// Write atomically (temporary file, then rename).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Checkpoint I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid checkpoint: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal search errors. Each maps to one workflow exit code.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    AfmBootstrap(#[from] AfmBootstrapError),
    #[error(transparent)]
    GenerationFailed(#[from] GenerationFailedError),
    #[error("Proposal failed: {0}")]
    Proposal(#[from] ProposalError),
    #[error("Search already terminated with {}", .0.label())]
    AlreadyTerminated(ExitCode),
}

impl SearchError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SearchError::AfmBootstrap(_) => ExitCode::AfmSearchFailed,
            SearchError::GenerationFailed(_) => ExitCode::ConstrainedScanFailed,
            SearchError::Proposal(_) => ExitCode::ProposalFailed,
            SearchError::AlreadyTerminated(code) => *code,
        }
    }
}

/// A failed search, with everything recorded before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SearchFailure {
    pub error: SearchError,
    pub output: SearchOutput,
}

/// Drives one search from bootstrap to a terminal state.
pub struct SearchController<S: JobSubstrate> {
    config: SearchConfig,
    substrate: S,
    store: MatrixStore,
    runner: GenerationRunner,
    engine: ProposalEngine,
    state: SearchState,
}

impl<S: JobSubstrate> SearchController<S> {
    /// Validate the configuration and set up a fresh search.
    pub fn new(config: SearchConfig, substrate: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let allocator = PkAllocator::new();
        let workflow_pk = allocator.next();
        let state = SearchState::new(workflow_pk, config.proposal.holistic);
        let store = MatrixStore::new(allocator.clone());
        let engine = ProposalEngine::new(&config.proposal);
        Ok(Self::assemble(config, substrate, store, allocator, engine, state))
    }

    /// Continue a search from a checkpoint.
    ///
    /// A finished search whose attempted count is below the (possibly raised)
    /// budget continues with a new proposal step.
    pub fn resume(config: SearchConfig, substrate: S, checkpoint: Checkpoint) -> Result<Self, ConfigError> {
        config.validate()?;
        let allocator = PkAllocator::starting_at(checkpoint.next_pk);
        let store = MatrixStore::from_snapshot(checkpoint.matrices, allocator.clone());
        let engine = ProposalEngine::new(&config.proposal).with_read_cursor(checkpoint.read_cursor);

        let mut state = checkpoint.state;
        if state.holistic != config.proposal.holistic {
            log::warn!(
                "Checkpoint was written with holistic = {}; keeping it",
                state.holistic
            );
        }
        if state.phase == SearchPhase::Done && state.attempted < config.n_max {
            log::info!(
                "Budget raised to {} ({} attempted); continuing",
                config.n_max,
                state.attempted
            );
            state.phase = SearchPhase::Proposing;
            state.outcome = None;
        }
        log::info!(
            "Resuming search {} at {:?} after {} generations",
            state.workflow_pk,
            state.phase,
            state.generations.len()
        );

        Ok(Self::assemble(config, substrate, store, allocator, engine, state))
    }

    fn assemble(
        config: SearchConfig,
        substrate: S,
        store: MatrixStore,
        allocator: PkAllocator,
        engine: ProposalEngine,
        state: SearchState,
    ) -> Self {
        Self {
            runner: GenerationRunner::new(&config.runner, allocator),
            config,
            substrate,
            store,
            engine,
            state,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn store(&self) -> &MatrixStore {
        &self.store
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn progress(&self) -> SearchProgress {
        SearchProgress {
            phase: self.state.phase,
            generations: self.state.generations.len(),
            attempted: self.state.attempted,
            successful: self.state.successful,
            n_max: self.config.n_max,
        }
    }

    /// Current state as a checkpoint.
    pub fn snapshot(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.clone(),
            matrices: self.store.snapshot(),
            next_pk: self.store.allocator().position(),
            read_cursor: self.engine.read_cursor(),
        }
    }

    /// Run to a terminal state (blocking).
    pub fn run(&mut self) -> Result<SearchOutput, SearchFailure> {
        self.run_with_callback(|_| {})
    }

    /// Run to a terminal state, reporting progress after every transition.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<SearchOutput, SearchFailure>
    where
        F: Fn(&SearchProgress),
    {
        loop {
            let step = match self.state.phase {
                SearchPhase::Init => {
                    log::info!(
                        "Starting search {}: budget {}, batch size {}, {:?} proposals ({})",
                        self.state.workflow_pk,
                        self.config.n_max,
                        self.config.batch_size,
                        self.engine.mode(),
                        if self.state.holistic { "holistic" } else { "markovian" }
                    );
                    self.state.phase = SearchPhase::AfmBootstrap;
                    Ok(())
                }
                SearchPhase::AfmBootstrap => self.bootstrap(),
                SearchPhase::Proposing => self.propose(),
                SearchPhase::Scanning => self.scan(),
                SearchPhase::Done => {
                    log::info!(
                        "Search {} finished: {} calculations attempted, {} successful",
                        self.state.workflow_pk,
                        self.state.attempted,
                        self.state.successful
                    );
                    return Ok(self.state.output());
                }
                SearchPhase::Failed => {
                    let code = self
                        .state
                        .outcome
                        .as_ref()
                        .map(|o| o.exit_code)
                        .unwrap_or(ExitCode::ConstrainedScanFailed);
                    return Err(SearchFailure {
                        error: SearchError::AlreadyTerminated(code),
                        output: self.state.output(),
                    });
                }
            };

            if let Err(error) = step {
                return Err(self.fail(error));
            }
            callback(&self.progress());
        }
    }

    fn bootstrap(&mut self) -> Result<(), SearchError> {
        match run_afm_scan(&self.runner, &mut self.substrate, &mut self.store, &self.config.afm) {
            Ok(generation) => {
                log::info!(
                    "AFM bootstrap produced {} of {} matrices",
                    generation.n_successful(),
                    generation.n_calculations()
                );
                self.state.record(generation);
                self.state.phase = SearchPhase::Proposing;
                self.checkpoint();
                Ok(())
            }
            Err(e) => {
                self.state.record((*e.generation).clone());
                Err(e.into())
            }
        }
    }

    fn propose(&mut self) -> Result<(), SearchError> {
        let index = self.state.next_index();
        let history_pks = self.state.history_view();
        debug_assert!(
            history_pks
                .iter()
                .all(|pk| self.store.get(*pk).is_some_and(|e| e.generation < index)),
            "proposal history must come from earlier generations"
        );

        let history = history_pks
            .iter()
            .map(|&pk| self.store.load(pk))
            .collect::<Result<Vec<&OccupationMatrix>, _>>()
            .map_err(ProposalError::from)?;
        let proposals = self
            .engine
            .propose(&history, self.config.batch_size, index)?;

        self.state.pending = proposals
            .into_iter()
            .map(|m| self.store.store(m, index, MatrixOrigin::Proposal, None))
            .collect();
        log::info!(
            "Generation {}: proposed {} matrices from {} history matrices",
            index,
            self.state.pending.len(),
            history_pks.len()
        );
        self.state.phase = SearchPhase::Scanning;
        Ok(())
    }

    fn scan(&mut self) -> Result<(), SearchError> {
        let index = self.state.next_index();
        let candidates = std::mem::take(&mut self.state.pending);
        // Unchanged since the proposal step ran.
        let consumed = self.state.history_view();

        let result = self.runner.run_batch(
            &mut self.substrate,
            &mut self.store,
            &candidates,
            index,
            &self.config.constrained,
        );
        let mut generation = match result {
            Ok(generation) => generation,
            Err(GenerationFailedError::AllFailed { mut generation }) => {
                generation.consumed = consumed;
                self.state.record((*generation).clone());
                return Err(GenerationFailedError::AllFailed { generation }.into());
            }
            Err(e) => return Err(e.into()),
        };
        generation.consumed = consumed;
        self.state.record(generation);

        log::info!(
            "Cumulative: {}/{} calculations attempted, {} successful",
            self.state.attempted,
            self.config.n_max,
            self.state.successful
        );
        if self.state.attempted >= self.config.n_max {
            self.state.phase = SearchPhase::Done;
            self.state.outcome = Some(SearchOutcome {
                exit_code: ExitCode::Finished,
                message: None,
            });
        } else {
            self.state.phase = SearchPhase::Proposing;
        }
        self.checkpoint();
        Ok(())
    }

    fn fail(&mut self, error: SearchError) -> SearchFailure {
        let exit_code = error.exit_code();
        log::error!("Search failed with {} ({}): {}", exit_code.code(), exit_code.label(), error);
        self.state.phase = SearchPhase::Failed;
        self.state.outcome = Some(SearchOutcome {
            exit_code,
            message: Some(error.to_string()),
        });
        self.checkpoint();
        SearchFailure {
            error,
            output: self.state.output(),
        }
    }

    fn checkpoint(&self) {
        let Some(path) = &self.config.checkpoint else {
            return;
        };
        match self.snapshot().save(path) {
            Ok(()) => log::debug!("Checkpoint written to {}", path.display()),
            Err(e) => log::warn!("Failed to write checkpoint {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::matrix::diagonal_matrix;
    use crate::schema::{GenerationKind, JobInput, MatrixSlot, ProposalMode, RunnerConfig};
    use crate::search::substrate::{InProcessSubstrate, JobOutcome, JobRequest};
    use proptest::prelude::*;

    fn nio() -> OccupationMatrix {
        diagonal_matrix(&[
            (&[1.0, 1.0, 1.0], &[1.0, 0.0, 0.0]),
            (&[1.0, 0.0, 0.0], &[1.0, 1.0, 1.0]),
        ])
    }

    fn config(n_max: usize, batch_size: usize) -> SearchConfig {
        SearchConfig {
            n_max,
            batch_size,
            runner: RunnerConfig { poll_interval_ms: 1 },
            ..Default::default()
        }
    }

    /// AFM jobs: the first `afm_ok` configurations converge.
    /// Constrained jobs: `ok(generation, index)` decides convergence and the
    /// target matrix is returned as the result.
    fn scripted<F>(afm_ok: usize, ok: F) -> InProcessSubstrate
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        InProcessSubstrate::new(move |req: &JobRequest| match &req.input {
            JobInput::Afm { .. } if req.index < afm_ok => JobOutcome::converged(nio()),
            JobInput::Afm { .. } => JobOutcome::failed(1),
            JobInput::Constrained { .. } if ok(req.generation, req.index) => {
                match &req.target {
                    Some(target) => JobOutcome::converged(target.matrix.clone()),
                    None => JobOutcome::failed(2),
                }
            }
            JobInput::Constrained { .. } => JobOutcome::failed(3),
        })
    }

    fn assert_summaries_consistent(output: &SearchOutput) {
        for summary in output.generation_summary.values() {
            assert_eq!(summary.n_successful + summary.n_failed, summary.n_calculations);
            assert_eq!(summary.matrix_pks.len(), summary.n_calculations);
            assert_eq!(summary.calculation_pks.len(), summary.n_calculations);
        }
    }

    #[test]
    fn test_all_succeed() {
        let mut controller = SearchController::new(config(10, 5), scripted(2, |_, _| true)).unwrap();
        let output = controller.run().unwrap();

        assert_eq!(output.exit_code, ExitCode::Finished);
        assert_eq!(output.n_cumulative, 10);
        assert_eq!(output.generation_summary.len(), 3);
        assert_eq!(output.generation_summary[&0].kind, GenerationKind::Afm);
        assert_eq!(output.generation_summary[&0].n_successful, 2);
        assert_eq!(output.all_afm_matrices.len(), 4);
        assert_eq!(output.all_constrained_matrices.len(), 10);
        assert!(output.all_constrained_matrices.iter().all(|s| !s.is_absent()));
        assert_eq!(output.all_calculation_pks.len(), 14);
        assert_eq!(controller.state().phase, SearchPhase::Done);
        assert_summaries_consistent(&output);
    }

    #[test]
    fn test_all_failed_generation_halts() {
        let mut controller =
            SearchController::new(config(20, 5), scripted(2, |generation, _| generation < 2)).unwrap();
        let failure = controller.run().unwrap_err();

        assert_eq!(failure.error.exit_code(), ExitCode::ConstrainedScanFailed);
        assert_eq!(failure.output.exit_code.code(), 401);
        assert!(failure.output.message.is_some());

        let summaries = &failure.output.generation_summary;
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[&1].n_successful, 5);
        assert_eq!(summaries[&2].n_failed, 5);
        assert!(summaries[&1].matrix_pks.iter().all(|s| !s.is_absent()));
        for slot in &summaries[&1].matrix_pks {
            assert!(controller.store().load(slot.pk().unwrap()).is_ok());
        }
        assert_eq!(failure.output.n_cumulative, 10);
        assert_summaries_consistent(&failure.output);

        // Terminal: running again does not retry.
        let again = controller.run().unwrap_err();
        assert!(matches!(
            again.error,
            SearchError::AlreadyTerminated(ExitCode::ConstrainedScanFailed)
        ));
        assert_eq!(controller.state().generations.len(), 3);
    }

    #[test]
    fn test_malformed_outputs_do_not_reach_history() {
        let one_site = || diagonal_matrix(&[(&[1.0], &[0.0])]);
        let substrate = InProcessSubstrate::new(move |req: &JobRequest| match (&req.input, &req.target) {
            (JobInput::Afm { .. }, _) if req.index == 0 => JobOutcome::converged(nio()),
            (JobInput::Afm { .. }, _) => JobOutcome::converged(one_site()),
            (JobInput::Constrained { .. }, _) if req.generation == 1 && req.index == 0 => {
                JobOutcome::converged(one_site())
            }
            (JobInput::Constrained { .. }, Some(target)) => JobOutcome::converged(target.matrix.clone()),
            (JobInput::Constrained { .. }, None) => JobOutcome::failed(2),
        });
        let mut controller = SearchController::new(config(10, 5), substrate).unwrap();
        let output = controller.run().unwrap();

        assert_eq!(output.exit_code, ExitCode::Finished);
        assert_eq!(output.generation_summary[&0].n_successful, 1);
        let first = &output.generation_summary[&1];
        assert!(first.matrix_pks[0].is_absent());
        assert_eq!(first.n_successful, 4);
        let generations = &controller.state().generations;
        assert_eq!(generations[2].consumed, generations[1].produced());
    }

    #[test]
    fn test_partial_failure_continues_with_successes() {
        let failing = [0usize, 2, 3];
        let mut controller = SearchController::new(
            config(10, 5),
            scripted(2, move |generation, index| generation != 1 || !failing.contains(&index)),
        )
        .unwrap();
        let output = controller.run().unwrap();

        let first = &output.generation_summary[&1];
        assert_eq!(first.n_successful, 2);
        assert_eq!(first.n_failed, 3);
        let sentinel: Vec<usize> = (0..5).filter(|&i| first.matrix_pks[i].is_absent()).collect();
        assert_eq!(sentinel, vec![0, 2, 3]);

        let generations = &controller.state().generations;
        assert_eq!(generations[2].consumed, generations[1].produced());
        assert_eq!(generations[2].consumed.len(), 2);

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["generation_summary"]["1"]["matrix_pks"][0], MatrixSlot::SENTINEL);
    }

    fn holistic_run(holistic: bool) -> SearchController<InProcessSubstrate> {
        let mut cfg = config(15, 5);
        cfg.proposal.holistic = holistic;
        // Successes per generation: AFM 2, then 3, then 1.
        let substrate = scripted(2, |generation, index| match generation {
            1 => index < 3,
            2 => index < 1,
            _ => true,
        });
        let mut controller = SearchController::new(cfg, substrate).unwrap();
        controller.run().unwrap();
        controller
    }

    #[test]
    fn test_holistic_history_is_union() {
        let controller = holistic_run(true);
        let generations = &controller.state().generations;
        assert_eq!(generations.len(), 4);
        assert_eq!(generations[3].consumed.len(), 6);

        let markov = holistic_run(false);
        assert_eq!(markov.state().generations[3].consumed.len(), 1);
    }

    #[test]
    fn test_final_batch_overshoots() {
        let mut controller = SearchController::new(config(12, 5), scripted(1, |_, _| true)).unwrap();
        let output = controller.run().unwrap();
        assert_eq!(output.n_cumulative, 15);
        assert_eq!(output.generation_summary.len(), 4);
    }

    #[test]
    fn test_history_never_references_later_generations() {
        let mut controller =
            SearchController::new(config(20, 4), scripted(3, |g, i| (g + i) % 3 != 0)).unwrap();
        controller.run().unwrap();

        let store = controller.store();
        for generation in controller.state().generations.iter().skip(1) {
            for pk in &generation.consumed {
                assert!(store.get(*pk).unwrap().generation < generation.index);
            }
            for job in &generation.jobs {
                let target = store.get(job.input.target_matrix().unwrap()).unwrap();
                assert_eq!(target.origin, MatrixOrigin::Proposal);
                assert_eq!(target.generation, generation.index);
            }
        }
    }

    #[test]
    fn test_afm_failure() {
        let mut controller = SearchController::new(config(10, 5), scripted(0, |_, _| true)).unwrap();
        let failure = controller.run().unwrap_err();
        assert_eq!(failure.output.exit_code, ExitCode::AfmSearchFailed);
        assert_eq!(failure.output.all_afm_matrices, vec![MatrixSlot::Absent; 4]);
        assert_eq!(failure.output.n_cumulative, 0);
        assert!(controller.store().is_empty());
    }

    #[test]
    fn test_proposal_failure_keeps_bootstrap() {
        let mut cfg = config(10, 5);
        cfg.proposal.mode = ProposalMode::Read;
        cfg.proposal.options.readfile = Some("/nonexistent/candidates.json".into());
        let mut controller = SearchController::new(cfg, scripted(2, |_, _| true)).unwrap();
        let failure = controller.run().unwrap_err();
        assert_eq!(failure.output.exit_code.code(), 402);
        assert_eq!(failure.output.generation_summary.len(), 1);
        assert_eq!(failure.output.generation_summary[&0].n_successful, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SearchController::new(config(0, 5), scripted(2, |_, _| true));
        assert!(matches!(result, Err(ConfigError::InvalidBudget)));
    }

    #[test]
    fn test_progress_callback() {
        let mut controller = SearchController::new(config(10, 5), scripted(2, |_, _| true)).unwrap();
        let seen = std::sync::Mutex::new(Vec::new());
        controller
            .run_with_callback(|p| seen.lock().unwrap().push(p.phase))
            .unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&SearchPhase::AfmBootstrap));
        assert_eq!(seen.last(), Some(&SearchPhase::Done));
        assert_eq!(seen.iter().filter(|p| **p == SearchPhase::Scanning).count(), 2);
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let ok = |g: usize, i: usize| (g * 7 + i) % 4 != 0;

        let mut short = config(10, 5);
        short.checkpoint = Some(path.clone());
        let mut first = SearchController::new(short, scripted(2, ok)).unwrap();
        first.run().unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(&checkpoint.state, first.state());
        assert_eq!(checkpoint.matrices.len(), first.store().len());

        let mut resumed = SearchController::resume(config(15, 5), scripted(2, ok), checkpoint).unwrap();
        let resumed_output = resumed.run().unwrap();

        let mut full = SearchController::new(config(15, 5), scripted(2, ok)).unwrap();
        let full_output = full.run().unwrap();

        assert_eq!(resumed_output, full_output);
        assert_eq!(resumed_output.n_cumulative, 15);
    }

    #[test]
    fn test_checkpoint_failure_is_not_fatal() {
        let mut cfg = config(5, 5);
        cfg.checkpoint = Some("/nonexistent/dir/checkpoint.json".into());
        let mut controller = SearchController::new(cfg, scripted(2, |_, _| true)).unwrap();
        assert_eq!(controller.run().unwrap().exit_code, ExitCode::Finished);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_budget_is_met_without_truncation(n_max in 1usize..25, batch_size in 1usize..8) {
            let mut controller =
                SearchController::new(config(n_max, batch_size), scripted(1, |_, _| true)).unwrap();
            let output = controller.run().unwrap();
            prop_assert!(output.n_cumulative >= n_max);
            prop_assert!(output.n_cumulative < n_max + batch_size);
            prop_assert_eq!(output.n_cumulative % batch_size, 0);
        }
    }
}
