//! Site log-likelihood integration
//!
//! Reduces root partials to per-pattern log-likelihoods in two stages:
//! category integration collapses the rate mixture into a `P·S` scratch
//! weighted by the category weights, then state integration folds the
//! scratch against a state-frequency vector. Root subsets combine by
//! assigning on the first subset, accumulating on the rest, and taking the
//! log once at the end; rescale factors recorded during peeling are added
//! after the log.
//!
//! The edge variants compute the same quantity across a single branch,
//! pairing the parent's partials with the child pushed through the
//! branch's transition matrix. They integrate the rate mixture with the
//! same weights so that a root placed on the edge at zero distance agrees
//! with the edge form to rounding.

use crate::buffers::Layout;
use crate::Real;

/// Collapse the rate mixture: `scratch[k·S + i] = Σₗ w[l] · partials[l,k,i]`.
pub(crate) fn integrate_categories(
    layout: Layout,
    partials: &[Real],
    category_weights: &[Real],
    scratch: &mut [Real],
) {
    let span = layout.pattern_count * layout.state_count;
    debug_assert_eq!(scratch.len(), span);
    debug_assert_eq!(partials.len(), span * layout.category_count);

    let mut v = 0;
    for (l, &w) in category_weights.iter().enumerate() {
        if l == 0 {
            for dst in scratch.iter_mut() {
                *dst = partials[v] * w;
                v += 1;
            }
        } else {
            for dst in scratch.iter_mut() {
                *dst += partials[v] * w;
                v += 1;
            }
        }
    }
}

/// Fold state frequencies into the category-integrated scratch, combining
/// one root subset into `out`. The first subset assigns, later subsets
/// accumulate.
pub(crate) fn reduce_states(
    layout: Layout,
    scratch: &[Real],
    frequencies: &[Real],
    weight: Real,
    out: &mut [Real],
    first_subset: bool,
) {
    let s = layout.state_count;
    debug_assert_eq!(frequencies.len(), s);
    debug_assert_eq!(out.len(), layout.pattern_count);

    let mut u = 0;
    for dst in out.iter_mut() {
        let mut sum = 0.0;
        for &f in frequencies {
            sum += f * scratch[u];
            u += 1;
        }
        if first_subset {
            *dst = sum * weight;
        } else {
            *dst += sum * weight;
        }
    }
}

/// Final subset: replace accumulated likelihoods with their logs.
pub(crate) fn finish_log(out: &mut [Real]) {
    for x in out.iter_mut() {
        *x = x.ln();
    }
}

/// Add per-pattern rescale factors recorded during peeling back onto the
/// log-likelihoods.
pub(crate) fn add_scale_factors(scale: &[Real], out: &mut [Real]) {
    debug_assert_eq!(scale.len(), out.len());
    for (dst, &f) in out.iter_mut().zip(scale) {
        *dst += f;
    }
}

// ============================================================================
// Edge likelihoods
// ============================================================================

/// Per-pattern edge log-likelihood with an internal (partials) child:
/// `out[k] = ln(w · Σₗ cw[l] · Σᵢ π[i] · parent[l,k,i] · Σⱼ m[l,i,j] · child[l,k,j])`.
pub(crate) fn edge_partials_child(
    layout: Layout,
    parent: &[Real],
    child: &[Real],
    matrix: &[Real],
    category_weights: &[Real],
    frequencies: &[Real],
    weight: Real,
    out: &mut [Real],
) {
    let s = layout.state_count;
    let block = layout.category_matrix_len();
    debug_assert_eq!(out.len(), layout.pattern_count);

    out.fill(0.0);
    let mut v = 0;
    for (l, &cw) in category_weights.iter().enumerate() {
        for dst in out.iter_mut() {
            let mut w = l * block;
            let mut sum_i = 0.0;
            for i in 0..s {
                let mut sum_j = 0.0;
                for j in 0..s {
                    sum_j += matrix[w] * child[v + j];
                    w += 1;
                }
                // step over the ambiguity column
                w += 1;
                sum_i += frequencies[i] * parent[v + i] * sum_j;
            }
            *dst += cw * sum_i;
            v += s;
        }
    }
    for x in out.iter_mut() {
        *x = (weight * *x).ln();
    }
}

/// Per-pattern edge log-likelihood with a compact (states) child; the inner
/// reduction collapses to the matrix entry for the observed state.
pub(crate) fn edge_states_child(
    layout: Layout,
    parent: &[Real],
    states: &[usize],
    matrix: &[Real],
    category_weights: &[Real],
    frequencies: &[Real],
    weight: Real,
    out: &mut [Real],
) {
    let s = layout.state_count;
    let stride = layout.matrix_stride();
    let block = layout.category_matrix_len();
    debug_assert_eq!(out.len(), layout.pattern_count);

    out.fill(0.0);
    let mut v = 0;
    for (l, &cw) in category_weights.iter().enumerate() {
        for (k, dst) in out.iter_mut().enumerate() {
            let state = states[k];
            let mut sum_i = 0.0;
            for i in 0..s {
                sum_i += frequencies[i] * parent[v + i] * matrix[l * block + i * stride + state];
            }
            *dst += cw * sum_i;
            v += s;
        }
    }
    for x in out.iter_mut() {
        *x = (weight * *x).ln();
    }
}

// ============================================================================
// Tests
// ============================================================================
