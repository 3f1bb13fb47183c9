//! Append-only occupation matrix store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::schema::{OccupationMatrix, Pk};

/// Hands out process-global PKs. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct PkAllocator {
    next: Arc<AtomicU64>,
}

impl PkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue numbering from `next` (used when resuming).
    pub fn starting_at(next: Pk) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(next)),
        }
    }

    pub fn next(&self) -> Pk {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The PK the next call to [`PkAllocator::next`] will return.
    pub fn position(&self) -> Pk {
        self.next.load(Ordering::Relaxed)
    }
}

/// Where a stored matrix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixOrigin {
    /// Output of an AFM bootstrap job.
    Afm,
    /// Candidate produced by the proposal engine.
    Proposal,
    /// Output of a constrained job.
    Constrained,
}

/// A matrix together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    pub pk: Pk,
    /// Generation that produced it.
    pub generation: usize,
    pub origin: MatrixOrigin,
    /// Job that produced it, if any.
    pub source_job: Option<Pk>,
    pub matrix: OccupationMatrix,
}

/// Store of every matrix produced during a search.
///
/// Entries are never mutated or removed once stored.
#[derive(Debug, Default)]
pub struct MatrixStore {
    entries: BTreeMap<Pk, StoredMatrix>,
    allocator: PkAllocator,
}

impl MatrixStore {
    pub fn new(allocator: PkAllocator) -> Self {
        Self {
            entries: BTreeMap::new(),
            allocator,
        }
    }

    /// Rebuild from a snapshot, continuing PK allocation with `allocator`.
    pub fn from_snapshot(entries: Vec<StoredMatrix>, allocator: PkAllocator) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.pk, e)).collect(),
            allocator,
        }
    }

    /// Store a matrix and return its PK.
    pub fn store(
        &mut self,
        matrix: OccupationMatrix,
        generation: usize,
        origin: MatrixOrigin,
        source_job: Option<Pk>,
    ) -> Pk {
        let pk = self.allocator.next();
        self.entries.insert(
            pk,
            StoredMatrix {
                pk,
                generation,
                origin,
                source_job,
                matrix,
            },
        );
        pk
    }

    /// Load the matrix stored under `pk`.
    pub fn load(&self, pk: Pk) -> Result<&OccupationMatrix, StoreError> {
        self.get(pk)
            .map(|e| &e.matrix)
            .ok_or(StoreError::NotFound(pk))
    }

    /// Full entry, provenance included.
    pub fn get(&self, pk: Pk) -> Option<&StoredMatrix> {
        self.entries.get(&pk)
    }

    /// Entries in PK order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredMatrix> {
        self.entries.values()
    }

    /// Entries produced in a given generation.
    pub fn by_generation(&self, generation: usize) -> impl Iterator<Item = &StoredMatrix> {
        self.entries
            .values()
            .filter(move |e| e.generation == generation)
    }

    /// Owned copy of every entry, for checkpoints.
    pub fn snapshot(&self) -> Vec<StoredMatrix> {
        self.entries.values().cloned().collect()
    }

    pub fn allocator(&self) -> &PkAllocator {
        &self.allocator
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Store lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No matrix stored under PK {0}")]
    NotFound(Pk),
}
