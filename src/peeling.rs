//! Peeling kernel
//!
//! Combines the conditional likelihoods of two children into their parent:
//! for every category, pattern, and parent state, each child contributes
//! either a direct matrix lookup (compact state tips) or a matrix-row
//! reduction over its partials, and the two contributions multiply.
//!
//! The three fused paths below differ only in which children are compact:
//!
//! - states x states: two lookups per output entry
//! - states x partials: one lookup, one row reduction
//! - partials x partials: two row reductions
//!
//! All paths walk the transition matrix with its `(S+1)` row stride and
//! step over the ambiguity column after the probability entries, so a
//! missing state (`S`) indexes the pinned 1.0 column with no branch.
//! Sums are plain floating point in canonical memory order, category
//! outermost and state innermost.

#![allow(missing_docs)]

use crate::buffers::{BufferIdx, Layout, MatrixIdx, ScaleIdx};
use crate::Real;

/// One peeling step: combine `child1` (through `matrix1`) and `child2`
/// (through `matrix2`) into `destination`.
///
/// Operations in a batch execute in array order; the client must order
/// them leaf-to-root. `scale` names the scale buffer that receives
/// per-pattern rescale factors when rescaling is enabled for the batch;
/// `None` skips the rescale stage for this operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub destination: BufferIdx,
    pub scale: Option<ScaleIdx>,
    pub child1: BufferIdx,
    pub matrix1: MatrixIdx,
    pub child2: BufferIdx,
    pub matrix2: MatrixIdx,
}

// ============================================================================
// Generic kernels
// ============================================================================

pub(crate) fn peel_states_states_generic(
    layout: Layout,
    dest: &mut [Real],
    states1: &[usize],
    m1: &[Real],
    states2: &[usize],
    m2: &[Real],
) {
    let s = layout.state_count;
    let stride = layout.matrix_stride();
    let block = layout.category_matrix_len();

    let mut v = 0;
    for l in 0..layout.category_count {
        for k in 0..layout.pattern_count {
            let s1 = states1[k];
            let s2 = states2[k];
            let mut w = l * block;
            for _i in 0..s {
                dest[v] = m1[w + s1] * m2[w + s2];
                v += 1;
                w += stride;
            }
        }
    }
}

pub(crate) fn peel_states_partials_generic(
    layout: Layout,
    dest: &mut [Real],
    states1: &[usize],
    m1: &[Real],
    partials2: &[Real],
    m2: &[Real],
) {
    let s = layout.state_count;
    let block = layout.category_matrix_len();

    let mut u = 0;
    let mut v = 0;
    for l in 0..layout.category_count {
        for k in 0..layout.pattern_count {
            let s1 = states1[k];
            let mut w = l * block;
            for _i in 0..s {
                let tmp = m1[w + s1];
                let mut sum = 0.0;
                for j in 0..s {
                    sum += m2[w] * partials2[v + j];
                    w += 1;
                }
                // step over the ambiguity column
                w += 1;
                dest[u] = tmp * sum;
                u += 1;
            }
            v += s;
        }
    }
}

pub(crate) fn peel_partials_partials_generic(
    layout: Layout,
    dest: &mut [Real],
    partials1: &[Real],
    m1: &[Real],
    partials2: &[Real],
    m2: &[Real],
) {
    let s = layout.state_count;
    let block = layout.category_matrix_len();

    let mut u = 0;
    let mut v = 0;
    for l in 0..layout.category_count {
        for _k in 0..layout.pattern_count {
            let mut w = l * block;
            for _i in 0..s {
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for j in 0..s {
                    sum1 += m1[w] * partials1[v + j];
                    sum2 += m2[w] * partials2[v + j];
                    w += 1;
                }
                // step over the ambiguity column
                w += 1;
                dest[u] = sum1 * sum2;
                u += 1;
            }
            v += s;
        }
    }
}

// ============================================================================
// Nucleotide fast path (S == 4)
// ============================================================================

#[cfg(feature = "nucleotide")]
mod nucleotide {
    use super::*;

    const S: usize = 4;
    const STRIDE: usize = 5;
    const BLOCK: usize = 20;

    pub(crate) fn peel_states_states(
        layout: Layout,
        dest: &mut [Real],
        states1: &[usize],
        m1: &[Real],
        states2: &[usize],
        m2: &[Real],
    ) {
        debug_assert_eq!(layout.state_count, S);
        let mut v = 0;
        for l in 0..layout.category_count {
            for k in 0..layout.pattern_count {
                let s1 = states1[k];
                let s2 = states2[k];
                let w = l * BLOCK;
                dest[v] = m1[w + s1] * m2[w + s2];
                dest[v + 1] = m1[w + STRIDE + s1] * m2[w + STRIDE + s2];
                dest[v + 2] = m1[w + 2 * STRIDE + s1] * m2[w + 2 * STRIDE + s2];
                dest[v + 3] = m1[w + 3 * STRIDE + s1] * m2[w + 3 * STRIDE + s2];
                v += S;
            }
        }
    }

    pub(crate) fn peel_states_partials(
        layout: Layout,
        dest: &mut [Real],
        states1: &[usize],
        m1: &[Real],
        partials2: &[Real],
        m2: &[Real],
    ) {
        debug_assert_eq!(layout.state_count, S);
        let mut u = 0;
        let mut v = 0;
        for l in 0..layout.category_count {
            for k in 0..layout.pattern_count {
                let s1 = states1[k];
                let mut w = l * BLOCK;
                for _i in 0..S {
                    let tmp = m1[w + s1];
                    let sum = m2[w] * partials2[v]
                        + m2[w + 1] * partials2[v + 1]
                        + m2[w + 2] * partials2[v + 2]
                        + m2[w + 3] * partials2[v + 3];
                    w += STRIDE;
                    dest[u] = tmp * sum;
                    u += 1;
                }
                v += S;
            }
        }
    }

    pub(crate) fn peel_partials_partials(
        layout: Layout,
        dest: &mut [Real],
        partials1: &[Real],
        m1: &[Real],
        partials2: &[Real],
        m2: &[Real],
    ) {
        debug_assert_eq!(layout.state_count, S);
        let mut u = 0;
        let mut v = 0;
        for l in 0..layout.category_count {
            for _k in 0..layout.pattern_count {
                let mut w = l * BLOCK;
                for _i in 0..S {
                    let sum1 = m1[w] * partials1[v]
                        + m1[w + 1] * partials1[v + 1]
                        + m1[w + 2] * partials1[v + 2]
                        + m1[w + 3] * partials1[v + 3];
                    let sum2 = m2[w] * partials2[v]
                        + m2[w + 1] * partials2[v + 1]
                        + m2[w + 2] * partials2[v + 2]
                        + m2[w + 3] * partials2[v + 3];
                    w += STRIDE;
                    dest[u] = sum1 * sum2;
                    u += 1;
                }
                v += S;
            }
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub(crate) fn peel_states_states(
    layout: Layout,
    dest: &mut [Real],
    states1: &[usize],
    m1: &[Real],
    states2: &[usize],
    m2: &[Real],
) {
    #[cfg(feature = "nucleotide")]
    if layout.state_count == 4 {
        return nucleotide::peel_states_states(layout, dest, states1, m1, states2, m2);
    }
    peel_states_states_generic(layout, dest, states1, m1, states2, m2)
}

pub(crate) fn peel_states_partials(
    layout: Layout,
    dest: &mut [Real],
    states1: &[usize],
    m1: &[Real],
    partials2: &[Real],
    m2: &[Real],
) {
    #[cfg(feature = "nucleotide")]
    if layout.state_count == 4 {
        return nucleotide::peel_states_partials(layout, dest, states1, m1, partials2, m2);
    }
    peel_states_partials_generic(layout, dest, states1, m1, partials2, m2)
}

pub(crate) fn peel_partials_partials(
    layout: Layout,
    dest: &mut [Real],
    partials1: &[Real],
    m1: &[Real],
    partials2: &[Real],
    m2: &[Real],
) {
    #[cfg(feature = "nucleotide")]
    if layout.state_count == 4 {
        return nucleotide::peel_partials_partials(layout, dest, partials1, m1, partials2, m2);
    }
    peel_partials_partials_generic(layout, dest, partials1, m1, partials2, m2)
}

// ============================================================================
// Rescaling
// ============================================================================

/// Divide each pattern by its maximum across states and categories and
/// record `ln(max)` per pattern into `scale`. A pattern whose maximum is
/// zero is left untouched and records 0.0.
pub(crate) fn rescale_partials(layout: Layout, dest: &mut [Real], scale: &mut [Real]) {
    let s = layout.state_count;
    let span = layout.pattern_count * s;
    debug_assert_eq!(scale.len(), layout.pattern_count);

    for k in 0..layout.pattern_count {
        let mut max = 0.0;
        for l in 0..layout.category_count {
            let base = l * span + k * s;
            for &x in &dest[base..base + s] {
                if x > max {
                    max = x;
                }
            }
        }
        if max > 0.0 {
            for l in 0..layout.category_count {
                let base = l * span + k * s;
                for x in &mut dest[base..base + s] {
                    *x /= max;
                }
            }
            scale[k] = max.ln();
        } else {
            scale[k] = 0.0;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn layout() -> Layout {
        Layout {
            state_count: 4,
            pattern_count: 7,
            category_count: 3,
        }
    }

    fn random_partials(rng: &mut StdRng, layout: Layout) -> Vec<Real> {
        (0..layout.partials_len()).map(|_| rng.gen::<Real>()).collect()
    }

    fn random_matrix(rng: &mut StdRng, layout: Layout) -> Vec<Real> {
        let mut m = vec![0.0; layout.matrix_len()];
        for row in m.chunks_exact_mut(layout.matrix_stride()) {
            for x in row[..layout.state_count].iter_mut() {
                *x = rng.gen::<Real>();
            }
            row[layout.state_count] = 1.0;
        }
        m
    }

    fn random_states(rng: &mut StdRng, layout: Layout) -> Vec<usize> {
        (0..layout.pattern_count)
            .map(|_| rng.gen_range(0..=layout.state_count))
            .collect()
    }

    fn assert_close(a: &[Real], b: &[Real], tol: Real) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            let scale = x.abs().max(y.abs()).max(1.0);
            assert!((x - y).abs() <= tol * scale, "{x} vs {y}");
        }
    }

    #[cfg(feature = "nucleotide")]
    #[test]
    fn nucleotide_paths_match_generic() {
        let layout = layout();
        let mut rng = StdRng::seed_from_u64(11);
        let p1 = random_partials(&mut rng, layout);
        let p2 = random_partials(&mut rng, layout);
        let m1 = random_matrix(&mut rng, layout);
        let m2 = random_matrix(&mut rng, layout);
        let s1 = random_states(&mut rng, layout);
        let s2 = random_states(&mut rng, layout);

        let mut generic = vec![0.0; layout.partials_len()];
        let mut fast = vec![0.0; layout.partials_len()];

        peel_states_states_generic(layout, &mut generic, &s1, &m1, &s2, &m2);
        nucleotide::peel_states_states(layout, &mut fast, &s1, &m1, &s2, &m2);
        assert_close(&generic, &fast, 1e-12);

        peel_states_partials_generic(layout, &mut generic, &s1, &m1, &p2, &m2);
        nucleotide::peel_states_partials(layout, &mut fast, &s1, &m1, &p2, &m2);
        assert_close(&generic, &fast, 1e-12);

        peel_partials_partials_generic(layout, &mut generic, &p1, &m1, &p2, &m2);
        nucleotide::peel_partials_partials(layout, &mut fast, &p1, &m1, &p2, &m2);
        assert_close(&generic, &fast, 1e-12);
    }

    #[test]
    fn missing_state_uses_the_ambiguity_column() {
        // A missing child contributes exactly 1.0, so the result reduces to
        // the other child's lookup.
        let layout = Layout {
            state_count: 4,
            pattern_count: 2,
            category_count: 1,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let m1 = random_matrix(&mut rng, layout);
        let m2 = random_matrix(&mut rng, layout);
        let s1 = vec![2usize, 0];
        let missing = vec![4usize, 4];

        let mut dest = vec![0.0; layout.partials_len()];
        peel_states_states_generic(layout, &mut dest, &s1, &m1, &missing, &m2);

        for k in 0..2 {
            for i in 0..4 {
                assert_eq!(dest[k * 4 + i], m1[i * 5 + s1[k]]);
            }
        }
    }

    #[test]
    fn one_hot_partials_reduce_to_a_state_lookup() {
        // A one-hot partials child behaves like a compact state child.
        let layout = Layout {
            state_count: 4,
            pattern_count: 3,
            category_count: 2,
        };
        let mut rng = StdRng::seed_from_u64(17);
        let m1 = random_matrix(&mut rng, layout);
        let m2 = random_matrix(&mut rng, layout);
        let s1 = random_states(&mut rng, layout);
        let s2 = vec![1usize, 3, 0];

        let mut one_hot = vec![0.0; layout.partials_len()];
        for l in 0..2 {
            for (k, &state) in s2.iter().enumerate() {
                one_hot[l * 12 + k * 4 + state] = 1.0;
            }
        }

        let mut via_states = vec![0.0; layout.partials_len()];
        let mut via_partials = vec![0.0; layout.partials_len()];
        peel_states_states_generic(layout, &mut via_states, &s1, &m1, &s2, &m2);
        peel_states_partials_generic(layout, &mut via_partials, &s1, &m1, &one_hot, &m2);
        assert_close(&via_states, &via_partials, 1e-15);
        assert!(via_partials.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn rescale_normalizes_each_pattern_and_records_the_log() {
        let layout = Layout {
            state_count: 4,
            pattern_count: 2,
            category_count: 2,
        };
        let mut rng = StdRng::seed_from_u64(23);
        let original: Vec<Real> = (0..layout.partials_len())
            .map(|_| rng.gen::<Real>() * 1e-3)
            .collect();
        let mut dest = original.clone();
        let mut scale = vec![0.0; 2];
        rescale_partials(layout, &mut dest, &mut scale);

        for k in 0..2 {
            let mut max = 0.0;
            for l in 0..2 {
                for i in 0..4 {
                    max = dest[l * 8 + k * 4 + i].max(max);
                }
            }
            assert!((max - 1.0).abs() < 1e-12);
        }

        // Multiplying the factor back reproduces the input.
        let mut reconstructed = dest;
        for k in 0..2 {
            let factor = scale[k].exp();
            for l in 0..2 {
                for i in 0..4 {
                    reconstructed[l * 8 + k * 4 + i] *= factor;
                }
            }
        }
        assert_close(&reconstructed, &original, 1e-12);
    }

    #[test]
    fn rescale_skips_all_zero_patterns() {
        let layout = Layout {
            state_count: 4,
            pattern_count: 2,
            category_count: 1,
        };
        let mut dest = vec![0.0; 8];
        dest[4] = 0.5;
        let mut scale = vec![9.0; 2];
        rescale_partials(layout, &mut dest, &mut scale);
        assert_eq!(scale[0], 0.0);
        assert_eq!(&dest[..4], &[0.0; 4]);
        assert_eq!(dest[4], 1.0);
        assert!((scale[1] - 0.5f64.ln()).abs() < 1e-15);
    }
}
