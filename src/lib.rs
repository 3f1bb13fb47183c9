//! occsearch - Constrained DFT+U occupation matrix search.
//!
//! This crate drives a search over electronic configurations of strongly
//! correlated materials: an AFM bootstrap scan seeds a history of occupation
//! matrices, then generations of proposed matrices are evaluated with
//! occupation-constrained calculations until a calculation budget is spent.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: Configuration, occupation matrices and search records
//! - `search`: Store, proposal engine, job substrate, runner and controller
//! - `report`: Post-hoc extraction of converged calculations
//!
//! # Example
//!
//! ```rust,no_run
//! use occsearch::{
//!     schema::SearchConfig,
//!     search::{InProcessSubstrate, JobOutcome, JobRequest, SearchController},
//! };
//!
//! let config = SearchConfig::default();
//!
//! // Every calculation converges onto its constraint target.
//! let substrate = InProcessSubstrate::new(|req: &JobRequest| match &req.target {
//!     Some(target) => JobOutcome::converged(target.matrix.clone()),
//!     None => JobOutcome::failed(1),
//! });
//!
//! let mut controller = SearchController::new(config, substrate).unwrap();
//! let output = controller.run();
//! ```

pub mod report;
pub mod schema;
pub mod search;

// Re-export commonly used types
pub use schema::{OccupationMatrix, SearchConfig, SearchOutput};
pub use search::{CommandSubstrate, JobSubstrate, SearchController};
