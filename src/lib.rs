//! Crate root: public surface, core aliases, and engine-wide invariants
//!
//! This crate implements the core of a phylogenetic likelihood engine: given
//! a rooted binary tree with branch lengths and a continuous-time Markov
//! substitution model, it computes per-site log-likelihoods of a pattern
//! dataset by Felsenstein's pruning algorithm. Clients (Bayesian samplers,
//! maximum-likelihood optimizers) drive an [`Instance`] imperatively: load
//! tip data once, then repeatedly rebuild transition matrices and peel
//! partials in leaf-to-root order, and finally integrate at the root.
//!
//! ## Invariants
//!
//! - **Preallocation.** Every buffer is sized at instance creation and never
//!   resized. The update, peeling, and integration paths perform no heap
//!   allocation.
//!
//! - **Double buffering.** Partials, transition matrices, and scale buffers
//!   each keep two generations per slot with a per-slot current index.
//!   Writers flip the index before writing, so [`Instance::restore_state`]
//!   is an index swap, never a bulk copy. This makes accept/reject of
//!   speculative moves O(slots).
//!
//! - **Ambiguity column.** Transition matrices are stored per category as
//!   `S x (S+1)` row-major blocks whose final column is pinned to 1.0. A tip
//!   state equal to `S` (missing data) then resolves with a single load,
//!   `m[row + S]`, with no branch in the kernel.
//!
//! - **Memory order.** Partials are indexed `[category][pattern][state]`
//!   major-to-minor; the fused eigen tensor is laid out so the transition
//!   builder's inner reduction reads it with stride 1.
//!
//! Failures surface as a precise [`EngineError`], never a panic or abort on
//! the release path; each error maps onto a stable numeric [`ReturnCode`]
//! class for foreign dispatch layers.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Buffer store: partials, tip states, transition matrices, scale buffers,
/// and the double-buffer index arrays.
pub mod buffers;
/// Eigen cache: fused eigenvector outer-product tensors and eigenvalues.
pub mod eigen;
/// Orchestrator: instance configuration, the full operation surface, and
/// snapshot/restore.
pub mod instance;
/// Root and edge integration of partials into site log-likelihoods.
pub mod likelihood;
/// Peeling kernel: the fused child-combination loops and rescaling.
pub mod peeling;
/// Transition-matrix construction from a cached eigen decomposition.
pub mod transition;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Floating-point scalar used throughout the engine.
pub type Real = f64;

pub use crate::buffers::{BufferIdx, EigenIdx, Layout, MatrixIdx, ScaleIdx, TipData};
pub use crate::instance::{Instance, InstanceConfig};
pub use crate::peeling::Operation;

// ============================================================================
// Error surface
// ============================================================================

/// Stable status classes exposed to foreign dispatch layers.
///
/// The numeric values are part of the public contract and never change.
/// `UnidentifiedException`, `UninitializedInstance`, and `NoResource` are
/// reserved for the dispatch layer above this crate; the engine itself only
/// produces the other classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    /// Success.
    NoError = 0,
    /// Unspecified failure, including unsupported operations.
    General = -1,
    /// A buffer allocation failed during instance creation.
    OutOfMemory = -2,
    /// An unclassified exception crossed the dispatch boundary.
    UnidentifiedException = -3,
    /// The instance handle does not name a live instance.
    UninitializedInstance = -4,
    /// An index or slice length violated its bound.
    OutOfRange = -5,
    /// The requested back-end is unavailable.
    NoResource = -6,
}

impl ReturnCode {
    /// The raw integer value of this status class.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Errors surfaced by the likelihood engine.
///
/// Every variant maps onto one of the stable [`ReturnCode`] classes via
/// [`EngineError::return_code`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation is declared in the surface but not implemented by this
    /// back-end (derivative outputs, for example).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// An allocation failed while sizing the instance.
    #[error("buffer allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// Size of the allocation that failed.
        bytes: usize,
    },
    /// The instance configuration is inconsistent or overflows.
    #[error("invalid instance parameters: {0}")]
    BadParams(&'static str),
    /// An index exceeded the bound fixed at instance creation.
    #[error("{what} index {index} out of range (limit {limit})")]
    OutOfRange {
        /// Which index family was violated.
        what: &'static str,
        /// The offending index.
        index: usize,
        /// The exclusive upper bound.
        limit: usize,
    },
    /// A slice argument had the wrong length for the instance dimensions.
    #[error("{what} has length {got}, expected {expected}")]
    BadLength {
        /// Which argument was mis-sized.
        what: &'static str,
        /// Observed length.
        got: usize,
        /// Required length.
        expected: usize,
    },
    /// An operation referenced a tip buffer that has no data loaded.
    #[error("tip buffer {0} has no states or partials loaded")]
    MissingTipData(usize),
}

impl EngineError {
    /// Map this error onto its stable status class.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            EngineError::Unsupported(_) | EngineError::MissingTipData(_) => ReturnCode::General,
            EngineError::OutOfMemory { .. } => ReturnCode::OutOfMemory,
            EngineError::BadParams(_)
            | EngineError::OutOfRange { .. }
            | EngineError::BadLength { .. } => ReturnCode::OutOfRange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_are_stable() {
        assert_eq!(ReturnCode::NoError.code(), 0);
        assert_eq!(ReturnCode::General.code(), -1);
        assert_eq!(ReturnCode::OutOfMemory.code(), -2);
        assert_eq!(ReturnCode::UnidentifiedException.code(), -3);
        assert_eq!(ReturnCode::UninitializedInstance.code(), -4);
        assert_eq!(ReturnCode::OutOfRange.code(), -5);
        assert_eq!(ReturnCode::NoResource.code(), -6);
    }

    #[test]
    fn errors_map_onto_status_classes() {
        assert_eq!(
            EngineError::Unsupported("derivatives").return_code(),
            ReturnCode::General
        );
        assert_eq!(
            EngineError::OutOfMemory { bytes: 64 }.return_code(),
            ReturnCode::OutOfMemory
        );
        assert_eq!(
            EngineError::OutOfRange {
                what: "partials buffer",
                index: 9,
                limit: 4
            }
            .return_code(),
            ReturnCode::OutOfRange
        );
        assert_eq!(
            EngineError::BadLength {
                what: "state frequencies",
                got: 3,
                expected: 4
            }
            .return_code(),
            ReturnCode::OutOfRange
        );
        assert_eq!(
            EngineError::MissingTipData(1).return_code(),
            ReturnCode::General
        );
    }
}
