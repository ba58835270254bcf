//! Instance orchestration
//!
//! An [`Instance`] bundles the buffer store, the eigen cache, and the small
//! model tables (state frequencies, category rates and weights, branch
//! lengths) behind the imperative surface clients drive: load tip data
//! once, rebuild transition matrices and peel partials per proposal, then
//! integrate at the root. All methods run synchronously on the caller's
//! thread; distinct instances are independent.
//!
//! Snapshots cover everything mutable: `store_state` copies the scalar
//! tables, eigen caches, and current-generation indices into their stored
//! twins, and `restore_state` swaps them back in O(slots).

use tracing::{debug, trace};

use crate::buffers::{
    BufferIdx, BufferStore, ChildSource, EigenIdx, Layout, MatrixIdx, ScaleIdx, TipData,
};
use crate::eigen::EigenStore;
use crate::peeling::{self, Operation};
use crate::{likelihood, transition, EngineError, Real};

/// Dimensions of an instance, all fixed at creation.
///
/// `partials_buffer_count + compact_buffer_count` is the total buffer count
/// `B`; slots `[0, tip_count)` are tips and the rest are internal nodes, so
/// `B` must exceed `tip_count`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Number of tips `T`.
    pub tip_count: usize,
    /// Buffers allocated for expanded partials.
    pub partials_buffer_count: usize,
    /// Buffers that may hold compact tip states instead.
    pub compact_buffer_count: usize,
    /// States per character `S` (4 for nucleotides, 20 for amino acids).
    pub state_count: usize,
    /// Distinct site patterns `P`.
    pub pattern_count: usize,
    /// Discrete rate categories `C`.
    pub category_count: usize,
    /// Eigen systems available `E`.
    pub eigen_buffer_count: usize,
    /// Transition-matrix slots `M`.
    pub matrix_buffer_count: usize,
}

impl InstanceConfig {
    /// Total buffer count `B`.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.partials_buffer_count + self.compact_buffer_count
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.state_count < 2 {
            return Err(EngineError::BadParams("state count must be at least 2"));
        }
        if self.pattern_count == 0 {
            return Err(EngineError::BadParams("pattern count must be positive"));
        }
        if self.category_count == 0 {
            return Err(EngineError::BadParams("category count must be positive"));
        }
        if self.eigen_buffer_count == 0 {
            return Err(EngineError::BadParams("eigen buffer count must be positive"));
        }
        if self.matrix_buffer_count == 0 {
            return Err(EngineError::BadParams("matrix buffer count must be positive"));
        }
        if self.buffer_count() <= self.tip_count {
            return Err(EngineError::BadParams(
                "buffer count must exceed the tip count",
            ));
        }
        let s = self.state_count;
        let overflow = EngineError::BadParams("buffer dimensions overflow");
        self.pattern_count
            .checked_mul(s)
            .and_then(|x| x.checked_mul(self.category_count))
            .ok_or(overflow)?;
        s.checked_mul(s)
            .and_then(|x| x.checked_mul(s))
            .ok_or(EngineError::BadParams("buffer dimensions overflow"))?;
        self.category_count
            .checked_mul(s)
            .and_then(|x| x.checked_mul(s + 1))
            .ok_or(EngineError::BadParams("buffer dimensions overflow"))?;
        Ok(())
    }
}

/// One likelihood engine: preallocated buffers plus the model tables.
pub struct Instance {
    layout: Layout,
    buffers: BufferStore,
    eigens: EigenStore,

    frequencies: Vec<Real>,
    stored_frequencies: Vec<Real>,
    category_rates: Vec<Real>,
    stored_category_rates: Vec<Real>,
    category_weights: Vec<Real>,
    stored_category_weights: Vec<Real>,
    branch_lengths: Vec<Real>,
    stored_branch_lengths: Vec<Real>,

    // Scratch sized at creation; compute paths never allocate.
    integration_scratch: Vec<Real>,
    exp_scratch: Vec<Real>,
}

impl Instance {
    /// Allocate every buffer for the given dimensions.
    ///
    /// Model tables start from the identity model: uniform frequencies,
    /// unit category rates, and uniform category weights. Fails with
    /// `OutOfMemory` if any allocation fails, leaving nothing behind.
    pub fn create(config: &InstanceConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let layout = Layout {
            state_count: config.state_count,
            pattern_count: config.pattern_count,
            category_count: config.category_count,
        };
        let buffers = BufferStore::new(
            layout,
            config.tip_count,
            config.buffer_count(),
            config.matrix_buffer_count,
        )?;
        let eigens = EigenStore::new(config.state_count, config.eigen_buffer_count)?;

        let mut frequencies = crate::buffers::try_zeroed::<Real>(config.state_count)?;
        frequencies.fill(1.0 / config.state_count as Real);
        let stored_frequencies = frequencies.clone();

        let mut category_rates = crate::buffers::try_zeroed::<Real>(config.category_count)?;
        category_rates.fill(1.0);
        let stored_category_rates = category_rates.clone();

        let mut category_weights = crate::buffers::try_zeroed::<Real>(config.category_count)?;
        category_weights.fill(1.0 / config.category_count as Real);
        let stored_category_weights = category_weights.clone();

        let branch_lengths = crate::buffers::try_zeroed::<Real>(config.matrix_buffer_count)?;
        let stored_branch_lengths = branch_lengths.clone();

        let integration_scratch =
            crate::buffers::try_zeroed::<Real>(config.pattern_count * config.state_count)?;
        let exp_scratch = crate::buffers::try_zeroed::<Real>(config.state_count)?;

        debug!(
            tips = config.tip_count,
            buffers = config.buffer_count(),
            states = config.state_count,
            patterns = config.pattern_count,
            categories = config.category_count,
            "created likelihood instance"
        );

        Ok(Self {
            layout,
            buffers,
            eigens,
            frequencies,
            stored_frequencies,
            category_rates,
            stored_category_rates,
            category_weights,
            stored_category_weights,
            branch_lengths,
            stored_branch_lengths,
            integration_scratch,
            exp_scratch,
        })
    }

    // ------------------------------------------------------------------
    // Dimensions
    // ------------------------------------------------------------------

    /// The dense-buffer dimensions of this instance.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Number of tip slots.
    #[inline]
    pub fn tip_count(&self) -> usize {
        self.buffers.tip_count()
    }

    /// Total number of partials slots, tips included.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.buffer_count()
    }

    /// Number of transition-matrix slots.
    #[inline]
    pub fn matrix_buffer_count(&self) -> usize {
        self.buffers.matrix_count()
    }

    /// Number of eigen systems.
    #[inline]
    pub fn eigen_buffer_count(&self) -> usize {
        self.eigens.count()
    }

    /// Which representation a tip slot currently carries.
    pub fn tip_data(&self, tip: BufferIdx) -> Result<TipData, EngineError> {
        let i = tip.as_usize();
        if i >= self.tip_count() {
            return Err(EngineError::OutOfRange {
                what: "tip buffer",
                index: i,
                limit: self.tip_count(),
            });
        }
        Ok(self.buffers.tip_data(i))
    }

    // ------------------------------------------------------------------
    // Data loading
    // ------------------------------------------------------------------

    /// Load compact per-pattern states for a tip. Values outside `[0, S)`
    /// are clamped to the missing sentinel `S`.
    pub fn set_tip_states(&mut self, tip: BufferIdx, states: &[i32]) -> Result<(), EngineError> {
        self.buffers.set_tip_states(tip, states)
    }

    /// Load expanded partials for a tip: `P·S` reals, replicated across
    /// rate categories.
    pub fn set_tip_partials(
        &mut self,
        tip: BufferIdx,
        partials: &[Real],
    ) -> Result<(), EngineError> {
        self.buffers.set_tip_partials(tip, partials)
    }

    /// Copy a slot's current partials (`P·S·C` reals) into `out`.
    pub fn get_partials(&self, index: BufferIdx, out: &mut [Real]) -> Result<(), EngineError> {
        self.buffers.get_partials(index, out)
    }

    /// Load an eigen decomposition `Q = U · diag(λ) · U⁻¹`. `u` and
    /// `u_inv` are row-major `S x S`; `lambda` has length `S`.
    pub fn set_eigen_decomposition(
        &mut self,
        index: EigenIdx,
        u: &[Real],
        u_inv: &[Real],
        lambda: &[Real],
    ) -> Result<(), EngineError> {
        self.eigens.set_decomposition(index, u, u_inv, lambda)
    }

    /// Set the per-category rate scalers (length `C`).
    pub fn set_category_rates(&mut self, rates: &[Real]) -> Result<(), EngineError> {
        if rates.len() != self.layout.category_count {
            return Err(EngineError::BadLength {
                what: "category rates",
                got: rates.len(),
                expected: self.layout.category_count,
            });
        }
        self.category_rates.copy_from_slice(rates);
        Ok(())
    }

    /// Set the per-category mixture weights (length `C`, nonneg, summing
    /// to 1; not enforced).
    pub fn set_category_weights(&mut self, weights: &[Real]) -> Result<(), EngineError> {
        if weights.len() != self.layout.category_count {
            return Err(EngineError::BadLength {
                what: "category weights",
                got: weights.len(),
                expected: self.layout.category_count,
            });
        }
        self.category_weights.copy_from_slice(weights);
        Ok(())
    }

    /// Record the instance-wide state frequency table (length `S`). The
    /// integration calls take frequencies explicitly; this table is the
    /// snapshotted home for them between calls.
    pub fn set_state_frequencies(&mut self, frequencies: &[Real]) -> Result<(), EngineError> {
        if frequencies.len() != self.layout.state_count {
            return Err(EngineError::BadLength {
                what: "state frequencies",
                got: frequencies.len(),
                expected: self.layout.state_count,
            });
        }
        self.frequencies.copy_from_slice(frequencies);
        Ok(())
    }

    /// The current state frequency table.
    #[inline]
    pub fn state_frequencies(&self) -> &[Real] {
        &self.frequencies
    }

    // ------------------------------------------------------------------
    // Transition matrices
    // ------------------------------------------------------------------

    /// Rebuild the transition matrices for a batch of branches from one
    /// eigen system. `probability_indices` and `edge_lengths` pair up
    /// one-to-one. Derivative slots are reserved and must be `None`.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: EigenIdx,
        probability_indices: &[MatrixIdx],
        first_derivative_indices: Option<&[MatrixIdx]>,
        second_derivative_indices: Option<&[MatrixIdx]>,
        edge_lengths: &[Real],
    ) -> Result<(), EngineError> {
        if first_derivative_indices.is_some() || second_derivative_indices.is_some() {
            return Err(EngineError::Unsupported("transition-matrix derivatives"));
        }
        if eigen_index.as_usize() >= self.eigens.count() {
            return Err(EngineError::OutOfRange {
                what: "eigen system",
                index: eigen_index.as_usize(),
                limit: self.eigens.count(),
            });
        }
        if edge_lengths.len() != probability_indices.len() {
            return Err(EngineError::BadLength {
                what: "edge lengths",
                got: edge_lengths.len(),
                expected: probability_indices.len(),
            });
        }
        for &p in probability_indices {
            self.check_matrix(p)?;
        }
        trace!(
            eigen = eigen_index.as_usize(),
            count = probability_indices.len(),
            "updating transition matrices"
        );

        let layout = self.layout;
        for (&p, &t) in probability_indices.iter().zip(edge_lengths) {
            let out = self.buffers.flip_matrix_mut(p);
            transition::build_transition_matrix(
                layout,
                self.eigens.tensor(eigen_index),
                self.eigens.values(eigen_index),
                &self.category_rates,
                t,
                out,
                &mut self.exp_scratch,
            );
            self.branch_lengths[p.as_usize()] = t;
        }
        Ok(())
    }

    /// Write externally computed transition probabilities into a slot.
    /// `matrix` is `C` row-major `S x S` blocks; the ambiguity column is
    /// inserted on copy.
    pub fn set_transition_matrix(
        &mut self,
        index: MatrixIdx,
        matrix: &[Real],
    ) -> Result<(), EngineError> {
        self.check_matrix(index)?;
        let expected = self.layout.category_count * self.layout.state_count * self.layout.state_count;
        if matrix.len() != expected {
            return Err(EngineError::BadLength {
                what: "transition matrix",
                got: matrix.len(),
                expected,
            });
        }
        let layout = self.layout;
        let out = self.buffers.flip_matrix_mut(index);
        transition::inject_transition_matrix(layout, matrix, out);
        Ok(())
    }

    /// Read a slot's current transition matrix (`C·S·(S+1)` reals).
    pub fn transition_matrix(&self, index: MatrixIdx) -> Result<&[Real], EngineError> {
        self.check_matrix(index)?;
        Ok(self.buffers.matrix(index))
    }

    // ------------------------------------------------------------------
    // Peeling
    // ------------------------------------------------------------------

    /// Execute a batch of peeling operations in array order. The client is
    /// responsible for leaf-to-root ordering. With `rescale` set, each
    /// operation carrying a scale index divides its pattern maxima out and
    /// records them for the integration stage.
    pub fn update_partials(
        &mut self,
        operations: &[Operation],
        rescale: bool,
    ) -> Result<(), EngineError> {
        for op in operations {
            self.validate_operation(op, rescale)?;
        }
        trace!(ops = operations.len(), rescale, "executing peeling batch");
        for op in operations {
            self.execute_operation(op, rescale);
        }
        Ok(())
    }

    /// Partials are computed synchronously; provided for parity with
    /// asynchronous back-ends.
    pub fn wait_for_partials(&self, _destinations: &[BufferIdx]) -> Result<(), EngineError> {
        Ok(())
    }

    fn validate_operation(&self, op: &Operation, rescale: bool) -> Result<(), EngineError> {
        let b = self.buffer_count();
        let t = self.tip_count();
        let d = op.destination.as_usize();
        if d >= b {
            return Err(EngineError::OutOfRange {
                what: "destination buffer",
                index: d,
                limit: b,
            });
        }
        if d < t {
            return Err(EngineError::BadParams(
                "peeling destination must be an internal buffer",
            ));
        }
        for child in [op.child1, op.child2] {
            let c = child.as_usize();
            if c >= b {
                return Err(EngineError::OutOfRange {
                    what: "child buffer",
                    index: c,
                    limit: b,
                });
            }
            if c == d {
                return Err(EngineError::BadParams(
                    "operation children must differ from the destination",
                ));
            }
            if c < t && self.buffers.tip_data(c) == TipData::Empty {
                return Err(EngineError::MissingTipData(c));
            }
        }
        self.check_matrix(op.matrix1)?;
        self.check_matrix(op.matrix2)?;
        if rescale {
            if let Some(scale) = op.scale {
                if scale.as_usize() >= b {
                    return Err(EngineError::OutOfRange {
                        what: "scale buffer",
                        index: scale.as_usize(),
                        limit: b,
                    });
                }
            }
        }
        Ok(())
    }

    fn execute_operation(&mut self, op: &Operation, rescale: bool) {
        let layout = self.layout;
        let gen = self.buffers.flip_partials(op.destination);
        let mut dest = self.buffers.take_partials(gen, op.destination);
        {
            let m1 = self.buffers.matrix(op.matrix1);
            let m2 = self.buffers.matrix(op.matrix2);
            match (
                self.buffers.child_source(op.child1),
                self.buffers.child_source(op.child2),
            ) {
                (ChildSource::States(s1), ChildSource::States(s2)) => {
                    peeling::peel_states_states(layout, &mut dest, s1, m1, s2, m2)
                }
                (ChildSource::States(s1), ChildSource::Partials(p2)) => {
                    peeling::peel_states_partials(layout, &mut dest, s1, m1, p2, m2)
                }
                (ChildSource::Partials(p1), ChildSource::States(s2)) => {
                    peeling::peel_states_partials(layout, &mut dest, s2, m2, p1, m1)
                }
                (ChildSource::Partials(p1), ChildSource::Partials(p2)) => {
                    peeling::peel_partials_partials(layout, &mut dest, p1, m1, p2, m2)
                }
            }
        }
        if rescale {
            if let Some(scale_index) = op.scale {
                let sgen = self.buffers.flip_scale(scale_index);
                let mut scale = self.buffers.take_scale(sgen, scale_index);
                peeling::rescale_partials(layout, &mut dest, &mut scale);
                self.buffers.put_scale(sgen, scale_index, scale);
            }
        }
        self.buffers.put_partials(gen, op.destination, dest);
    }

    // ------------------------------------------------------------------
    // Integration
    // ------------------------------------------------------------------

    /// Integrate root partials into per-pattern log-likelihoods.
    ///
    /// Each root subset pairs a buffer index with a subset weight and an
    /// `S`-long frequency vector packed into `state_frequencies`; weights
    /// are expected to sum to 1 across subsets. After the final log, every
    /// scale buffer named in `scale_indices` is added per pattern.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        root_indices: &[BufferIdx],
        subset_weights: &[Real],
        state_frequencies: &[Real],
        scale_indices: &[ScaleIdx],
        out_log_likelihoods: &mut [Real],
    ) -> Result<(), EngineError> {
        let n = root_indices.len();
        let s = self.layout.state_count;
        if n == 0 {
            return Err(EngineError::BadParams("at least one root subset is required"));
        }
        if subset_weights.len() != n {
            return Err(EngineError::BadLength {
                what: "subset weights",
                got: subset_weights.len(),
                expected: n,
            });
        }
        if state_frequencies.len() != n * s {
            return Err(EngineError::BadLength {
                what: "state frequencies",
                got: state_frequencies.len(),
                expected: n * s,
            });
        }
        if out_log_likelihoods.len() != self.layout.pattern_count {
            return Err(EngineError::BadLength {
                what: "log-likelihood output",
                got: out_log_likelihoods.len(),
                expected: self.layout.pattern_count,
            });
        }
        for &r in root_indices {
            self.check_partials_source(r)?;
        }
        for &sc in scale_indices {
            if sc.as_usize() >= self.buffer_count() {
                return Err(EngineError::OutOfRange {
                    what: "scale buffer",
                    index: sc.as_usize(),
                    limit: self.buffer_count(),
                });
            }
        }
        trace!(subsets = n, "integrating root log-likelihoods");

        let layout = self.layout;
        for (subset, &root) in root_indices.iter().enumerate() {
            likelihood::integrate_categories(
                layout,
                self.buffers.partials_slice(root),
                &self.category_weights,
                &mut self.integration_scratch,
            );
            likelihood::reduce_states(
                layout,
                &self.integration_scratch,
                &state_frequencies[subset * s..(subset + 1) * s],
                subset_weights[subset],
                out_log_likelihoods,
                subset == 0,
            );
        }
        likelihood::finish_log(out_log_likelihoods);
        for &sc in scale_indices {
            likelihood::add_scale_factors(self.buffers.scale(sc), out_log_likelihoods);
        }
        Ok(())
    }

    /// Integrate across a single branch: the parent's partials against the
    /// child pushed through the branch's transition matrix. Derivative
    /// outputs are reserved and must be `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        parent: BufferIdx,
        child: BufferIdx,
        probability_index: MatrixIdx,
        weight: Real,
        state_frequencies: &[Real],
        scale_indices: &[ScaleIdx],
        out_first_derivatives: Option<&mut [Real]>,
        out_second_derivatives: Option<&mut [Real]>,
        out_log_likelihoods: &mut [Real],
    ) -> Result<(), EngineError> {
        if out_first_derivatives.is_some() || out_second_derivatives.is_some() {
            return Err(EngineError::Unsupported("edge-likelihood derivatives"));
        }
        self.check_partials_source(parent)?;
        let c = child.as_usize();
        if c >= self.buffer_count() {
            return Err(EngineError::OutOfRange {
                what: "child buffer",
                index: c,
                limit: self.buffer_count(),
            });
        }
        if c < self.tip_count() && self.buffers.tip_data(c) == TipData::Empty {
            return Err(EngineError::MissingTipData(c));
        }
        self.check_matrix(probability_index)?;
        if state_frequencies.len() != self.layout.state_count {
            return Err(EngineError::BadLength {
                what: "state frequencies",
                got: state_frequencies.len(),
                expected: self.layout.state_count,
            });
        }
        if out_log_likelihoods.len() != self.layout.pattern_count {
            return Err(EngineError::BadLength {
                what: "log-likelihood output",
                got: out_log_likelihoods.len(),
                expected: self.layout.pattern_count,
            });
        }
        for &sc in scale_indices {
            if sc.as_usize() >= self.buffer_count() {
                return Err(EngineError::OutOfRange {
                    what: "scale buffer",
                    index: sc.as_usize(),
                    limit: self.buffer_count(),
                });
            }
        }

        let layout = self.layout;
        let matrix = self.buffers.matrix(probability_index);
        let parent_partials = self.buffers.partials_slice(parent);
        match self.buffers.child_source(child) {
            ChildSource::States(states) => likelihood::edge_states_child(
                layout,
                parent_partials,
                states,
                matrix,
                &self.category_weights,
                state_frequencies,
                weight,
                out_log_likelihoods,
            ),
            ChildSource::Partials(child_partials) => likelihood::edge_partials_child(
                layout,
                parent_partials,
                child_partials,
                matrix,
                &self.category_weights,
                state_frequencies,
                weight,
                out_log_likelihoods,
            ),
        }
        for &sc in scale_indices {
            likelihood::add_scale_factors(self.buffers.scale(sc), out_log_likelihoods);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Snapshot all mutable state into the stored twins.
    pub fn store_state(&mut self) {
        self.eigens.store();
        self.stored_frequencies.copy_from_slice(&self.frequencies);
        self.stored_category_rates.copy_from_slice(&self.category_rates);
        self.stored_category_weights.copy_from_slice(&self.category_weights);
        self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
        self.buffers.store();
        trace!("stored instance state");
    }

    /// Return to the last snapshot by swapping current and stored state.
    /// Partials and matrices are not copied; the previous generation still
    /// lives in each slot's non-current half.
    pub fn restore_state(&mut self) {
        self.eigens.restore();
        std::mem::swap(&mut self.frequencies, &mut self.stored_frequencies);
        std::mem::swap(&mut self.category_rates, &mut self.stored_category_rates);
        std::mem::swap(&mut self.category_weights, &mut self.stored_category_weights);
        std::mem::swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
        self.buffers.restore();
        trace!("restored instance state");
    }

    // ------------------------------------------------------------------
    // Shared checks
    // ------------------------------------------------------------------

    fn check_matrix(&self, index: MatrixIdx) -> Result<(), EngineError> {
        if index.as_usize() >= self.matrix_buffer_count() {
            return Err(EngineError::OutOfRange {
                what: "transition matrix",
                index: index.as_usize(),
                limit: self.matrix_buffer_count(),
            });
        }
        Ok(())
    }

    fn check_partials_source(&self, index: BufferIdx) -> Result<(), EngineError> {
        let i = index.as_usize();
        if i >= self.buffer_count() {
            return Err(EngineError::OutOfRange {
                what: "partials buffer",
                index: i,
                limit: self.buffer_count(),
            });
        }
        if !self.buffers.has_partials(index) {
            return Err(EngineError::BadParams(
                "integration buffers must carry partials",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
