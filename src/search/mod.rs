//! Constrained occupation-matrix search.
//!
//! # Overview
//!
//! - **Store** (`store`): append-only matrix store and PK allocation
//! - **Proposal** (`proposal`, `rotation`): candidate matrices for the next generation
//! - **Substrate** (`substrate`): submit/poll interface to whatever runs calculations
//! - **Runner** (`runner`, `afm`): one batch of jobs per generation, behind a barrier
//! - **Controller** (`controller`): the bootstrap / propose / scan state machine
//!
//! # Example
//!
//! ```rust,no_run
//! use occsearch::schema::SearchConfig;
//! use occsearch::search::{CommandSubstrate, SearchController};
//!
//! let config = SearchConfig::from_file("search.json").unwrap();
//! let substrate = CommandSubstrate::new("runs");
//! let mut controller = SearchController::new(config, substrate).unwrap();
//!
//! match controller.run() {
//!     Ok(output) => println!("{} calculations attempted", output.n_cumulative),
//!     Err(failure) => eprintln!("search failed: {}", failure),
//! }
//! ```

pub mod afm;
pub mod controller;
pub mod proposal;
pub mod rotation;
pub mod runner;
pub mod store;
pub mod substrate;

pub use afm::{AfmBootstrapError, magnetic_configurations, run_afm_scan};
pub use controller::{
    Checkpoint, CheckpointError, SearchController, SearchError, SearchFailure, SearchProgress,
};
pub use proposal::{ProposalEngine, ProposalError};
pub use runner::{GenerationFailedError, GenerationRunner, PreparedJob};
pub use store::{MatrixOrigin, MatrixStore, PkAllocator, StoreError, StoredMatrix};
pub use substrate::{
    CommandSubstrate, ConstraintTarget, InProcessSubstrate, JobOutcome, JobPoll, JobRequest,
    JobSubstrate, SubstrateError,
};
