//! Occupation matrix types.
//!
//! An occupation matrix holds, for every Hubbard site, one square block per
//! collinear spin channel. Blocks are stored row-major as nested vectors so
//! they serialize to the same nested-list layout the calculation code reads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum allowed deviation from symmetry before a block is rejected.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Square block of orbital occupations, row-major.
pub type Block = Vec<Vec<f64>>;

/// Collinear spin channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spin {
    Up,
    Down,
}

impl fmt::Display for Spin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spin::Up => write!(f, "up"),
            Spin::Down => write!(f, "down"),
        }
    }
}

/// Occupations of a single site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomOccupation {
    /// Site label (e.g. `Ni1`).
    pub label: String,
    /// Spin-up block.
    pub up: Block,
    /// Spin-down block.
    pub down: Block,
}

impl AtomOccupation {
    /// Orbital dimension of this site.
    pub fn dim(&self) -> usize {
        self.up.len()
    }

    /// Total electron count, tr(up) + tr(down).
    pub fn trace(&self) -> f64 {
        block_trace(&self.up) + block_trace(&self.down)
    }

    fn block(&self, spin: Spin) -> &Block {
        match spin {
            Spin::Up => &self.up,
            Spin::Down => &self.down,
        }
    }
}

/// Structural shape of an occupation matrix: one orbital dimension per site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixShape {
    pub orbital_dims: Vec<usize>,
}

impl MatrixShape {
    pub fn n_atoms(&self) -> usize {
        self.orbital_dims.len()
    }
}

/// Target or resulting electronic configuration for a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupationMatrix {
    pub atoms: Vec<AtomOccupation>,
}

impl OccupationMatrix {
    pub fn new(atoms: Vec<AtomOccupation>) -> Self {
        Self { atoms }
    }

    /// Build from the `[iatom][ispin]` nested layout used by proposal files.
    ///
    /// Spin index 0 is up and 1 is down. Labels are taken from `labels` when
    /// one is available for the site, otherwise the 1-based site index.
    pub fn from_spin_blocks(
        labels: &[String],
        blocks: Vec<Vec<Block>>,
    ) -> Result<Self, ValidationError> {
        let mut atoms = Vec::with_capacity(blocks.len());
        for (i, spins) in blocks.into_iter().enumerate() {
            let [up, down]: [Block; 2] =
                spins
                    .try_into()
                    .map_err(|spins: Vec<Block>| ValidationError::SpinChannels {
                        atom: i,
                        found: spins.len(),
                    })?;
            let label = labels
                .get(i)
                .cloned()
                .unwrap_or_else(|| (i + 1).to_string());
            atoms.push(AtomOccupation { label, up, down });
        }
        Ok(Self { atoms })
    }

    /// Nested `[iatom][ispin]` layout handed to constrained calculations.
    pub fn to_spin_blocks(&self) -> Vec<[Block; 2]> {
        self.atoms
            .iter()
            .map(|a| [a.up.clone(), a.down.clone()])
            .collect()
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.atoms.iter().map(|a| a.label.clone()).collect()
    }

    /// Per-site electron counts.
    pub fn traces(&self) -> Vec<f64> {
        self.atoms.iter().map(AtomOccupation::trace).collect()
    }

    /// Structural shape, checking that every block is square and that both
    /// spin channels of a site agree.
    pub fn shape(&self) -> Result<MatrixShape, ValidationError> {
        if self.atoms.is_empty() {
            return Err(ValidationError::NoAtoms);
        }
        let mut orbital_dims = Vec::with_capacity(self.atoms.len());
        for (i, atom) in self.atoms.iter().enumerate() {
            for spin in [Spin::Up, Spin::Down] {
                let block = atom.block(spin);
                if block.is_empty() {
                    return Err(ValidationError::EmptyBlock { atom: i, spin });
                }
                if block.iter().any(|row| row.len() != block.len()) {
                    return Err(ValidationError::NotSquare { atom: i, spin });
                }
            }
            if atom.up.len() != atom.down.len() {
                return Err(ValidationError::SpinDimensionMismatch {
                    atom: i,
                    up: atom.up.len(),
                    down: atom.down.len(),
                });
            }
            orbital_dims.push(atom.dim());
        }
        Ok(MatrixShape { orbital_dims })
    }

    /// Full structural and numeric validation.
    ///
    /// Blocks must be square, finite and symmetric (the real form of
    /// Hermitian for collinear spins).
    pub fn validate(&self) -> Result<MatrixShape, ValidationError> {
        let shape = self.shape()?;
        for (i, atom) in self.atoms.iter().enumerate() {
            for spin in [Spin::Up, Spin::Down] {
                let block = atom.block(spin);
                if block.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(ValidationError::NonFinite { atom: i, spin });
                }
                let deviation = asymmetry(block);
                if deviation > SYMMETRY_TOLERANCE {
                    return Err(ValidationError::NotHermitian {
                        atom: i,
                        spin,
                        deviation,
                    });
                }
            }
        }
        Ok(shape)
    }

    /// Validate and require the given shape.
    pub fn validate_against(&self, expected: &MatrixShape) -> Result<(), ValidationError> {
        let shape = self.validate()?;
        if shape.n_atoms() != expected.n_atoms() {
            return Err(ValidationError::AtomCountMismatch {
                expected: expected.n_atoms(),
                found: shape.n_atoms(),
            });
        }
        for (i, (&found, &want)) in shape
            .orbital_dims
            .iter()
            .zip(&expected.orbital_dims)
            .enumerate()
        {
            if found != want {
                return Err(ValidationError::DimensionMismatch {
                    atom: i,
                    expected: want,
                    found,
                });
            }
        }
        Ok(())
    }
}

fn block_trace(block: &Block) -> f64 {
    block
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.get(i))
        .sum()
}

/// Largest |a_ij - a_ji| over a square block.
fn asymmetry(block: &Block) -> f64 {
    let n = block.len();
    let mut max = 0.0f64;
    for i in 0..n {
        for j in (i + 1)..n {
            max = max.max((block[i][j] - block[j][i]).abs());
        }
    }
    max
}

/// Structural validation failures for occupation matrices.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Occupation matrix has no sites")]
    NoAtoms,
    #[error("Site {atom} has {found} spin channels, expected 2")]
    SpinChannels { atom: usize, found: usize },
    #[error("Site {atom} {spin} block is empty")]
    EmptyBlock { atom: usize, spin: Spin },
    #[error("Site {atom} {spin} block is not square")]
    NotSquare { atom: usize, spin: Spin },
    #[error("Site {atom} spin blocks disagree: up is {up}x{up}, down is {down}x{down}")]
    SpinDimensionMismatch { atom: usize, up: usize, down: usize },
    #[error("Site {atom} {spin} block contains non-finite values")]
    NonFinite { atom: usize, spin: Spin },
    #[error("Site {atom} {spin} block is not Hermitian (max deviation {deviation:e})")]
    NotHermitian {
        atom: usize,
        spin: Spin,
        deviation: f64,
    },
    #[error("Expected {expected} sites, found {found}")]
    AtomCountMismatch { expected: usize, found: usize },
    #[error("Site {atom} has orbital dimension {found}, expected {expected}")]
    DimensionMismatch {
        atom: usize,
        expected: usize,
        found: usize,
    },
}

#[cfg(test)]
pub(crate) fn diagonal_matrix(diagonals: &[(&[f64], &[f64])]) -> OccupationMatrix {
    let block = |d: &[f64]| -> Block {
        (0..d.len())
            .map(|i| (0..d.len()).map(|j| if i == j { d[i] } else { 0.0 }).collect())
            .collect()
    };
    OccupationMatrix::new(
        diagonals
            .iter()
            .enumerate()
            .map(|(i, (up, down))| AtomOccupation {
                label: format!("Ni{}", i + 1),
                up: block(*up),
                down: block(*down),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_and_traces() {
        let m = diagonal_matrix(&[
            (&[1.0, 1.0, 1.0, 1.0, 1.0], &[1.0, 1.0, 1.0, 0.0, 0.0]),
            (&[1.0, 1.0, 1.0, 0.0, 0.0], &[1.0, 1.0, 1.0, 1.0, 1.0]),
        ]);
        let shape = m.validate().unwrap();
        assert_eq!(shape.orbital_dims, vec![5, 5]);
        assert_eq!(m.traces(), vec![8.0, 8.0]);
    }

    #[test]
    fn test_rejects_asymmetric_block() {
        let mut m = diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 1.0])]);
        m.atoms[0].up[0][1] = 0.3;
        assert!(matches!(
            m.validate(),
            Err(ValidationError::NotHermitian { atom: 0, spin: Spin::Up, .. })
        ));
    }

    #[test]
    fn test_rejects_ragged_and_mismatched_blocks() {
        let mut m = diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 1.0])]);
        m.atoms[0].down[1].push(0.0);
        assert!(matches!(
            m.shape(),
            Err(ValidationError::NotSquare { spin: Spin::Down, .. })
        ));

        let m = diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 1.0, 0.0])]);
        assert!(matches!(
            m.shape(),
            Err(ValidationError::SpinDimensionMismatch { up: 2, down: 3, .. })
        ));
    }

    #[test]
    fn test_rejects_non_finite() {
        let m = diagonal_matrix(&[(&[f64::NAN, 0.0], &[0.0, 1.0])]);
        assert!(matches!(m.validate(), Err(ValidationError::NonFinite { .. })));
    }

    #[test]
    fn test_validate_against_shape() {
        let m = diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 1.0])]);
        let two_sites = MatrixShape {
            orbital_dims: vec![2, 2],
        };
        assert_eq!(
            m.validate_against(&two_sites),
            Err(ValidationError::AtomCountMismatch {
                expected: 2,
                found: 1
            })
        );
        let wider = MatrixShape {
            orbital_dims: vec![3],
        };
        assert!(matches!(
            m.validate_against(&wider),
            Err(ValidationError::DimensionMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn test_spin_block_layout() {
        let m = diagonal_matrix(&[(&[1.0, 0.0], &[0.0, 1.0])]);
        let blocks: Vec<Vec<Block>> = m
            .to_spin_blocks()
            .into_iter()
            .map(|[up, down]| vec![up, down])
            .collect();
        let rebuilt = OccupationMatrix::from_spin_blocks(&m.labels(), blocks).unwrap();
        assert_eq!(rebuilt, m);

        let bad = vec![vec![vec![vec![1.0]]]];
        assert_eq!(
            OccupationMatrix::from_spin_blocks(&[], bad),
            Err(ValidationError::SpinChannels { atom: 0, found: 1 })
        );
    }
}
