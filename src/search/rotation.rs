//! Random orbital-space rotations.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::schema::Block;

/// Draw a Haar-distributed orthogonal matrix of size `dim`.
///
/// QR of a Gaussian matrix, with the columns of Q flipped so that R has a
/// positive diagonal.
pub fn random_orthogonal<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> DMatrix<f64> {
    let gaussian = DMatrix::from_fn(dim, dim, |_, _| rng.sample::<f64, _>(StandardNormal));
    let qr = gaussian.qr();
    let r = qr.r();
    let mut q = qr.q();
    for j in 0..dim {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    q
}

/// O * B * O^T, symmetrized to remove round-off asymmetry.
pub fn rotate_block(block: &DMatrix<f64>, rotation: &DMatrix<f64>) -> DMatrix<f64> {
    let rotated = rotation * block * rotation.transpose();
    (&rotated + rotated.transpose()) * 0.5
}

/// Diagonal matrix from occupations.
pub fn diagonal(occupations: &[f64]) -> DMatrix<f64> {
    DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(occupations))
}

pub fn to_block(matrix: &DMatrix<f64>) -> Block {
    matrix
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}
