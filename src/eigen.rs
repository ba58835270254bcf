//! Eigen cache
//!
//! A rate matrix `Q = U · diag(λ) · U⁻¹` is loaded once per eigen system
//! and reused for every branch-length update, since
//! `exp(Q·t) = U · diag(exp(λ·t)) · U⁻¹`. Rather than keeping `U` and
//! `U⁻¹` separately, the store fuses them into the outer-product tensor
//!
//! ```text
//! c[i·S² + j·S + k] = U[i][k] · U⁻¹[k][j]
//! ```
//!
//! so that for a fixed matrix entry `(i, j)` the reduction
//! `Σₖ c[i,j,k] · exp(λ[k]·t)` reads the tensor with stride 1. The builder
//! in [`crate::transition`] depends on exactly this ordering.
//!
//! Tensors and eigenvalues participate in snapshots: `store` copies into
//! the stored twins, `restore` swaps the two sets wholesale.

use crate::buffers::{try_zeroed, EigenIdx};
use crate::{EngineError, Real};

/// Cached eigen systems for one instance.
pub(crate) struct EigenStore {
    state_count: usize,
    tensors: Vec<Vec<Real>>,
    values: Vec<Vec<Real>>,
    stored_tensors: Vec<Vec<Real>>,
    stored_values: Vec<Vec<Real>>,
}

impl EigenStore {
    pub(crate) fn new(state_count: usize, count: usize) -> Result<Self, EngineError> {
        let tensor_len = state_count * state_count * state_count;
        let alloc = |slot_len: usize| -> Result<Vec<Vec<Real>>, EngineError> {
            let mut arena = Vec::new();
            arena
                .try_reserve_exact(count)
                .map_err(|_| EngineError::OutOfMemory {
                    bytes: count * std::mem::size_of::<Vec<Real>>(),
                })?;
            for _ in 0..count {
                arena.push(try_zeroed::<Real>(slot_len)?);
            }
            Ok(arena)
        };
        Ok(Self {
            state_count,
            tensors: alloc(tensor_len)?,
            values: alloc(state_count)?,
            stored_tensors: alloc(tensor_len)?,
            stored_values: alloc(state_count)?,
        })
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.tensors.len()
    }

    /// Fuse an eigen decomposition into the cached tensor and copy its
    /// eigenvalues. `u` and `u_inv` are row-major `S x S`; `lambda` has
    /// length `S`.
    pub(crate) fn set_decomposition(
        &mut self,
        index: EigenIdx,
        u: &[Real],
        u_inv: &[Real],
        lambda: &[Real],
    ) -> Result<(), EngineError> {
        let e = index.as_usize();
        if e >= self.count() {
            return Err(EngineError::OutOfRange {
                what: "eigen system",
                index: e,
                limit: self.count(),
            });
        }
        let s = self.state_count;
        if u.len() != s * s {
            return Err(EngineError::BadLength {
                what: "eigenvectors",
                got: u.len(),
                expected: s * s,
            });
        }
        if u_inv.len() != s * s {
            return Err(EngineError::BadLength {
                what: "inverse eigenvectors",
                got: u_inv.len(),
                expected: s * s,
            });
        }
        if lambda.len() != s {
            return Err(EngineError::BadLength {
                what: "eigenvalues",
                got: lambda.len(),
                expected: s,
            });
        }

        let tensor = &mut self.tensors[e];
        let mut l = 0;
        for i in 0..s {
            for j in 0..s {
                for k in 0..s {
                    tensor[l] = u[i * s + k] * u_inv[k * s + j];
                    l += 1;
                }
            }
        }
        self.values[e].copy_from_slice(lambda);
        Ok(())
    }

    #[inline]
    pub(crate) fn tensor(&self, index: EigenIdx) -> &[Real] {
        &self.tensors[index.as_usize()]
    }

    #[inline]
    pub(crate) fn values(&self, index: EigenIdx) -> &[Real] {
        &self.values[index.as_usize()]
    }

    pub(crate) fn store(&mut self) {
        for (dst, src) in self.stored_tensors.iter_mut().zip(&self.tensors) {
            dst.copy_from_slice(src);
        }
        for (dst, src) in self.stored_values.iter_mut().zip(&self.values) {
            dst.copy_from_slice(src);
        }
    }

    pub(crate) fn restore(&mut self) {
        std::mem::swap(&mut self.tensors, &mut self.stored_tensors);
        std::mem::swap(&mut self.values, &mut self.stored_values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Jukes-Cantor decomposition over four states.
    const U: [Real; 16] = [
        1.0, 2.0, 0.0, 0.5, //
        1.0, -2.0, 0.5, 0.0, //
        1.0, 2.0, 0.0, -0.5, //
        1.0, -2.0, -0.5, 0.0,
    ];
    const U_INV: [Real; 16] = [
        0.25, 0.25, 0.25, 0.25, //
        0.125, -0.125, 0.125, -0.125, //
        0.0, 1.0, 0.0, -1.0, //
        1.0, 0.0, -1.0, 0.0,
    ];
    const LAMBDA: [Real; 4] = [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];

    #[test]
    fn tensor_layout_matches_reduction_order() {
        let mut store = EigenStore::new(4, 1).unwrap();
        store
            .set_decomposition(EigenIdx(0), &U, &U_INV, &LAMBDA)
            .unwrap();
        let c = store.tensor(EigenIdx(0));
        for i in 0..4 {
            for j in 0..4 {
                for k in 0..4 {
                    let expected = U[i * 4 + k] * U_INV[k * 4 + j];
                    assert_eq!(c[i * 16 + j * 4 + k], expected);
                }
            }
        }
        assert_eq!(store.values(EigenIdx(0)), &LAMBDA);
    }

    #[test]
    fn tensor_k_sums_reproduce_identity() {
        // Σₖ U[i][k]·U⁻¹[k][j] is (U·U⁻¹)[i][j], the identity for a valid
        // decomposition. These entries are dyadic so the sums are exact.
        let mut store = EigenStore::new(4, 1).unwrap();
        store
            .set_decomposition(EigenIdx(0), &U, &U_INV, &LAMBDA)
            .unwrap();
        let c = store.tensor(EigenIdx(0));
        for i in 0..4 {
            for j in 0..4 {
                let sum: Real = (0..4).map(|k| c[i * 16 + j * 4 + k]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(sum, expected);
            }
        }
    }

    #[test]
    fn store_restore_round_trips_the_cache() {
        let mut store = EigenStore::new(4, 1).unwrap();
        store
            .set_decomposition(EigenIdx(0), &U, &U_INV, &LAMBDA)
            .unwrap();
        store.store();
        let zeros = [0.0; 16];
        let flat = [0.0; 4];
        store
            .set_decomposition(EigenIdx(0), &zeros, &zeros, &flat)
            .unwrap();
        assert!(store.tensor(EigenIdx(0)).iter().all(|&x| x == 0.0));

        store.restore();
        assert_eq!(store.values(EigenIdx(0)), &LAMBDA);
        assert!(store.tensor(EigenIdx(0)).iter().any(|&x| x != 0.0));
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut store = EigenStore::new(4, 2).unwrap();
        assert!(matches!(
            store.set_decomposition(EigenIdx(2), &U, &U_INV, &LAMBDA),
            Err(EngineError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.set_decomposition(EigenIdx(0), &U[..12], &U_INV, &LAMBDA),
            Err(EngineError::BadLength { .. })
        ));
        assert!(matches!(
            store.set_decomposition(EigenIdx(0), &U, &U_INV, &LAMBDA[..3]),
            Err(EngineError::BadLength { .. })
        ));
    }
}
