//! Transition-matrix construction
//!
//! A transition matrix `P(t) = exp(Q·t)` is assembled from the fused eigen
//! tensor as `P[i][j] = Σₖ c[i,j,k] · exp(λ[k]·t·r)` with `r` the rate
//! scaler of the current category. One slot holds `C` consecutive
//! `S x (S+1)` row-major blocks; after each row's `S` probability entries
//! the builder writes the constant 1.0 ambiguity entry.
//!
//! Valid rate matrices yield nonnegative probabilities mathematically, but
//! the reduction can produce tiny negative round-off. Those are clamped to
//! zero so the nonnegativity invariant on partials holds downstream.

use crate::buffers::Layout;
use crate::Real;

/// Fill one transition-matrix slot from an eigen system.
///
/// `tensor` is the `S³` fused outer-product tensor, `eigenvalues` has
/// length `S`, `exp_scratch` is a caller-owned buffer of length `S`, and
/// `out` is the full `C·S·(S+1)` slot.
pub(crate) fn build_transition_matrix(
    layout: Layout,
    tensor: &[Real],
    eigenvalues: &[Real],
    category_rates: &[Real],
    edge_length: Real,
    out: &mut [Real],
    exp_scratch: &mut [Real],
) {
    let s = layout.state_count;
    debug_assert_eq!(tensor.len(), s * s * s);
    debug_assert_eq!(exp_scratch.len(), s);
    debug_assert_eq!(out.len(), layout.matrix_len());

    let mut n = 0;
    for &rate in category_rates {
        for k in 0..s {
            exp_scratch[k] = (eigenvalues[k] * edge_length * rate).exp();
        }
        let mut m = 0;
        for _i in 0..s {
            for _j in 0..s {
                let mut sum = 0.0;
                for &e in &exp_scratch[..s] {
                    sum += tensor[m] * e;
                    m += 1;
                }
                out[n] = if sum > 0.0 { sum } else { 0.0 };
                n += 1;
            }
            out[n] = 1.0;
            n += 1;
        }
    }
}

/// Copy externally computed probabilities into a slot, inserting the
/// ambiguity column. `src` is `C` row-major `S x S` blocks.
pub(crate) fn inject_transition_matrix(layout: Layout, src: &[Real], out: &mut [Real]) {
    let s = layout.state_count;
    debug_assert_eq!(src.len(), layout.category_count * s * s);
    debug_assert_eq!(out.len(), layout.matrix_len());

    for (src_row, out_row) in src.chunks_exact(s).zip(out.chunks_exact_mut(s + 1)) {
        out_row[..s].copy_from_slice(src_row);
        out_row[s] = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::EigenIdx;
    use crate::eigen::EigenStore;

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

    fn jc_store() -> EigenStore {
        let mut store = EigenStore::new(4, 1).unwrap();
        store
            .set_decomposition(EigenIdx(0), &U, &U_INV, &LAMBDA)
            .unwrap();
        store
    }

    fn build(layout: Layout, rates: &[Real], t: Real) -> Vec<Real> {
        let store = jc_store();
        let mut out = vec![0.0; layout.matrix_len()];
        let mut scratch = vec![0.0; layout.state_count];
        build_transition_matrix(
            layout,
            store.tensor(EigenIdx(0)),
            store.values(EigenIdx(0)),
            rates,
            t,
            &mut out,
            &mut scratch,
        );
        out
    }

    #[test]
    fn zero_branch_length_yields_extended_identity() {
        let layout = Layout {
            state_count: 4,
            pattern_count: 1,
            category_count: 1,
        };
        let out = build(layout, &[1.0], 0.0);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(out[i * 5 + j], expected);
            }
            assert_eq!(out[i * 5 + 4], 1.0);
        }
    }

    #[test]
    fn rows_sum_to_one_for_a_valid_rate_matrix() {
        let layout = Layout {
            state_count: 4,
            pattern_count: 1,
            category_count: 2,
        };
        let out = build(layout, &[0.5, 2.0], 0.37);
        for block in out.chunks_exact(layout.category_matrix_len()) {
            for row in block.chunks_exact(5) {
                let sum: Real = row[..4].iter().sum();
                assert!((sum - 1.0).abs() < 1e-10, "row sum {sum}");
                assert_eq!(row[4], 1.0);
                assert!(row[..4].iter().all(|&x| (0.0..=1.0).contains(&x)));
            }
        }
    }

    #[test]
    fn closed_form_probabilities_match() {
        // Jukes-Cantor: p_same = 1/4 + 3/4·e^{-4t/3}, p_diff = 1/4 − 1/4·e^{-4t/3}.
        let layout = Layout {
            state_count: 4,
            pattern_count: 1,
            category_count: 1,
        };
        let t = 0.1;
        let out = build(layout, &[1.0], t);
        let decay = (-4.0 * t / 3.0).exp();
        let p_same = 0.25 + 0.75 * decay;
        let p_diff = 0.25 - 0.25 * decay;
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { p_same } else { p_diff };
                assert!((out[i * 5 + j] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn category_rate_scales_the_branch() {
        let layout_two = Layout {
            state_count: 4,
            pattern_count: 1,
            category_count: 2,
        };
        let layout_one = Layout {
            state_count: 4,
            pattern_count: 1,
            category_count: 1,
        };
        let scaled = build(layout_two, &[0.5, 2.0], 0.2);
        let slow = build(layout_one, &[1.0], 0.1);
        let fast = build(layout_one, &[1.0], 0.4);
        assert_eq!(&scaled[..20], slow.as_slice());
        assert_eq!(&scaled[20..], fast.as_slice());
    }

    #[test]
    fn injection_pads_the_ambiguity_column() {
        let layout = Layout {
            state_count: 2,
            pattern_count: 1,
            category_count: 2,
        };
        let src = [0.9, 0.1, 0.2, 0.8, 0.7, 0.3, 0.4, 0.6];
        let mut out = vec![0.0; layout.matrix_len()];
        inject_transition_matrix(layout, &src, &mut out);
        assert_eq!(
            out,
            vec![0.9, 0.1, 1.0, 0.2, 0.8, 1.0, 0.7, 0.3, 1.0, 0.4, 0.6, 1.0]
        );
    }
}
