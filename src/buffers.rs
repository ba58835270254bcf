//! Buffer store
//!
//! Owns every numeric buffer in an instance: per-slot conditional
//! probability vectors ("partials"), compact tip-state arrays, per-branch
//! transition matrices, and per-pattern scale buffers. Partials, matrices,
//! and scale buffers are double-buffered: each slot has two generations and
//! a current index, and writers flip the index before writing. Restoring a
//! snapshot therefore swaps index arrays instead of copying data.
//!
//! All sizing happens in [`BufferStore::new`]; the mutation paths reuse the
//! allocations made there. Indexing arithmetic is centralized in [`Layout`]
//! to keep stride and offset computations in one place.

#![allow(missing_docs)]

use crate::{EngineError, Real};

// ============================================================================
// Index newtypes
// ============================================================================

/// Index of a partials or tip buffer slot `b ∈ {0..B-1}`. Slots below the
/// tip count are tips; the rest are internal nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIdx(pub usize);
impl BufferIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Index of a transition-matrix slot `m ∈ {0..M-1}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatrixIdx(pub usize);
impl MatrixIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Index of an eigen system `e ∈ {0..E-1}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EigenIdx(pub usize);
impl EigenIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Index of a scale buffer. Scale buffers are keyed per partials slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScaleIdx(pub usize);
impl ScaleIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

// ============================================================================
// Layout arithmetic
// ============================================================================

/// Dense-buffer dimensions and stride arithmetic.
///
/// `state_count` is `S`, `pattern_count` is `P`, `category_count` is `C`.
/// Partials are `P·S·C` reals ordered `[category][pattern][state]`;
/// transition matrices are `C` row-major `S x (S+1)` blocks whose final
/// column is the ambiguity column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub state_count: usize,
    pub pattern_count: usize,
    pub category_count: usize,
}

impl Layout {
    /// Length of one partials buffer: `P·S·C`.
    #[inline]
    pub fn partials_len(&self) -> usize {
        self.pattern_count * self.state_count * self.category_count
    }

    /// Length of the tip-partials input for one tip: `P·S` (one category).
    #[inline]
    pub fn tip_partials_len(&self) -> usize {
        self.pattern_count * self.state_count
    }

    /// Row stride of a transition matrix: `S + 1`.
    #[inline]
    pub fn matrix_stride(&self) -> usize {
        self.state_count + 1
    }

    /// Length of one per-category matrix block: `S·(S+1)`.
    #[inline]
    pub fn category_matrix_len(&self) -> usize {
        self.state_count * (self.state_count + 1)
    }

    /// Length of one full transition-matrix slot: `C·S·(S+1)`.
    #[inline]
    pub fn matrix_len(&self) -> usize {
        self.category_count * self.category_matrix_len()
    }

    /// The sentinel state code for missing or ambiguous tip data.
    #[inline]
    pub fn missing_state(&self) -> usize {
        self.state_count
    }
}

// ============================================================================
// Tip representation
// ============================================================================

/// Which representation a tip slot carries.
///
/// Exactly one of the compact state array and the expanded partials vector
/// is populated per tip; internal slots always use partials. The peeling
/// kernel dispatches per child on this tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TipData {
    /// No tip data loaded yet.
    Empty,
    /// Compact per-pattern state codes, `S` meaning missing.
    States,
    /// Expanded partials, replicated across categories at load time.
    Partials,
}

/// Read-only view of one peeling child, resolved from its slot's tag.
pub(crate) enum ChildSource<'a> {
    States(&'a [usize]),
    Partials(&'a [Real]),
}

// ============================================================================
// Allocation
// ============================================================================

/// Zero-initialized allocation that reports failure instead of aborting.
pub(crate) fn try_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>, EngineError> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| EngineError::OutOfMemory {
        bytes: len * std::mem::size_of::<T>(),
    })?;
    v.resize(len, T::default());
    Ok(v)
}

// ============================================================================
// Buffer store
// ============================================================================

/// The preallocated buffer substrate of one instance.
pub(crate) struct BufferStore {
    layout: Layout,
    tip_count: usize,
    buffer_count: usize,
    matrix_count: usize,

    tips: Vec<TipData>,
    tip_states: Vec<Vec<usize>>,

    // Two generations per slot; `current_*` selects the live one.
    partials: [Vec<Vec<Real>>; 2],
    matrices: [Vec<Vec<Real>>; 2],
    scales: [Vec<Vec<Real>>; 2],

    current_partials: Vec<u8>,
    stored_partials: Vec<u8>,
    current_matrices: Vec<u8>,
    stored_matrices: Vec<u8>,
    current_scales: Vec<u8>,
    stored_scales: Vec<u8>,
}

impl BufferStore {
    /// Allocate every buffer for the given dimensions.
    ///
    /// Both generations of every slot are allocated up front, tips
    /// included, so that tip loading and the kernels never allocate.
    pub(crate) fn new(
        layout: Layout,
        tip_count: usize,
        buffer_count: usize,
        matrix_count: usize,
    ) -> Result<Self, EngineError> {
        debug_assert!(buffer_count > tip_count);

        let mut tip_states = Vec::new();
        tip_states
            .try_reserve_exact(tip_count)
            .map_err(|_| EngineError::OutOfMemory {
                bytes: tip_count * std::mem::size_of::<Vec<usize>>(),
            })?;
        for _ in 0..tip_count {
            tip_states.push(try_zeroed::<usize>(layout.pattern_count)?);
        }

        let alloc_arena = |slot_len: usize, slots: usize| -> Result<Vec<Vec<Real>>, EngineError> {
            let mut arena = Vec::new();
            arena
                .try_reserve_exact(slots)
                .map_err(|_| EngineError::OutOfMemory {
                    bytes: slots * std::mem::size_of::<Vec<Real>>(),
                })?;
            for _ in 0..slots {
                arena.push(try_zeroed::<Real>(slot_len)?);
            }
            Ok(arena)
        };

        let partials = [
            alloc_arena(layout.partials_len(), buffer_count)?,
            alloc_arena(layout.partials_len(), buffer_count)?,
        ];
        let matrices = [
            alloc_arena(layout.matrix_len(), matrix_count)?,
            alloc_arena(layout.matrix_len(), matrix_count)?,
        ];
        let scales = [
            alloc_arena(layout.pattern_count, buffer_count)?,
            alloc_arena(layout.pattern_count, buffer_count)?,
        ];

        Ok(Self {
            layout,
            tip_count,
            buffer_count,
            matrix_count,
            tips: vec![TipData::Empty; tip_count],
            tip_states,
            partials,
            matrices,
            scales,
            current_partials: try_zeroed::<u8>(buffer_count)?,
            stored_partials: try_zeroed::<u8>(buffer_count)?,
            current_matrices: try_zeroed::<u8>(matrix_count)?,
            stored_matrices: try_zeroed::<u8>(matrix_count)?,
            current_scales: try_zeroed::<u8>(buffer_count)?,
            stored_scales: try_zeroed::<u8>(buffer_count)?,
        })
    }

    #[inline]
    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub(crate) fn tip_count(&self) -> usize {
        self.tip_count
    }

    #[inline]
    pub(crate) fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[inline]
    pub(crate) fn matrix_count(&self) -> usize {
        self.matrix_count
    }

    #[inline]
    pub(crate) fn tip_data(&self, index: usize) -> TipData {
        self.tips[index]
    }

    // ------------------------------------------------------------------
    // Tip loading
    // ------------------------------------------------------------------

    /// Copy per-pattern state codes into a tip slot, clamping anything
    /// outside `[0, S)` to the missing sentinel `S`.
    pub(crate) fn set_tip_states(
        &mut self,
        tip: BufferIdx,
        states: &[i32],
    ) -> Result<(), EngineError> {
        let i = tip.as_usize();
        if i >= self.tip_count {
            return Err(EngineError::OutOfRange {
                what: "tip buffer",
                index: i,
                limit: self.tip_count,
            });
        }
        if states.len() != self.layout.pattern_count {
            return Err(EngineError::BadLength {
                what: "tip states",
                got: states.len(),
                expected: self.layout.pattern_count,
            });
        }
        let missing = self.layout.missing_state();
        let dst = &mut self.tip_states[i];
        for (d, &s) in dst.iter_mut().zip(states) {
            *d = if s >= 0 && (s as usize) < missing {
                s as usize
            } else {
                missing
            };
        }
        self.tips[i] = TipData::States;
        Ok(())
    }

    /// Copy `P·S` reals into a tip slot, replicated across categories so
    /// the kernel loops stay uniform.
    pub(crate) fn set_tip_partials(
        &mut self,
        tip: BufferIdx,
        tip_partials: &[Real],
    ) -> Result<(), EngineError> {
        let i = tip.as_usize();
        if i >= self.tip_count {
            return Err(EngineError::OutOfRange {
                what: "tip buffer",
                index: i,
                limit: self.tip_count,
            });
        }
        let span = self.layout.tip_partials_len();
        if tip_partials.len() != span {
            return Err(EngineError::BadLength {
                what: "tip partials",
                got: tip_partials.len(),
                expected: span,
            });
        }
        let gen = self.current_partials[i] as usize;
        let dst = &mut self.partials[gen][i];
        for chunk in dst.chunks_exact_mut(span) {
            chunk.copy_from_slice(tip_partials);
        }
        self.tips[i] = TipData::Partials;
        Ok(())
    }

    /// Bulk copy out of the currently-current partials generation.
    pub(crate) fn get_partials(
        &self,
        index: BufferIdx,
        out: &mut [Real],
    ) -> Result<(), EngineError> {
        let i = index.as_usize();
        if i >= self.buffer_count {
            return Err(EngineError::OutOfRange {
                what: "partials buffer",
                index: i,
                limit: self.buffer_count,
            });
        }
        if out.len() != self.layout.partials_len() {
            return Err(EngineError::BadLength {
                what: "partials output",
                got: out.len(),
                expected: self.layout.partials_len(),
            });
        }
        out.copy_from_slice(&self.partials[self.current_partials[i] as usize][i]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kernel-facing access
    // ------------------------------------------------------------------

    /// Whether the slot currently carries partials the kernels can read.
    #[inline]
    pub(crate) fn has_partials(&self, index: BufferIdx) -> bool {
        let i = index.as_usize();
        i >= self.tip_count || self.tips[i] == TipData::Partials
    }

    /// Resolve a peeling child. Preconditions (bounds, loaded tip data)
    /// are checked by the caller.
    #[inline]
    pub(crate) fn child_source(&self, index: BufferIdx) -> ChildSource<'_> {
        let i = index.as_usize();
        if i < self.tip_count && self.tips[i] == TipData::States {
            ChildSource::States(&self.tip_states[i])
        } else {
            debug_assert!(self.has_partials(index), "child {i} has no data loaded");
            ChildSource::Partials(self.partials_slice(index))
        }
    }

    #[inline]
    pub(crate) fn partials_slice(&self, index: BufferIdx) -> &[Real] {
        let i = index.as_usize();
        &self.partials[self.current_partials[i] as usize][i]
    }

    #[inline]
    pub(crate) fn matrix(&self, index: MatrixIdx) -> &[Real] {
        let i = index.as_usize();
        &self.matrices[self.current_matrices[i] as usize][i]
    }

    #[inline]
    pub(crate) fn scale(&self, index: ScaleIdx) -> &[Real] {
        let i = index.as_usize();
        &self.scales[self.current_scales[i] as usize][i]
    }

    /// Flip a partials slot to its other generation and return the new
    /// generation index.
    #[inline]
    pub(crate) fn flip_partials(&mut self, index: BufferIdx) -> usize {
        let i = index.as_usize();
        self.current_partials[i] = 1 - self.current_partials[i];
        self.current_partials[i] as usize
    }

    /// Detach a partials vector so it can be written while its siblings are
    /// read. The slot must be re-attached with [`BufferStore::put_partials`]
    /// before the operation completes.
    #[inline]
    pub(crate) fn take_partials(&mut self, gen: usize, index: BufferIdx) -> Vec<Real> {
        std::mem::take(&mut self.partials[gen][index.as_usize()])
    }

    #[inline]
    pub(crate) fn put_partials(&mut self, gen: usize, index: BufferIdx, buf: Vec<Real>) {
        debug_assert_eq!(buf.len(), self.layout.partials_len());
        self.partials[gen][index.as_usize()] = buf;
    }

    /// Flip a matrix slot and hand out its new generation for writing.
    #[inline]
    pub(crate) fn flip_matrix_mut(&mut self, index: MatrixIdx) -> &mut [Real] {
        let i = index.as_usize();
        self.current_matrices[i] = 1 - self.current_matrices[i];
        &mut self.matrices[self.current_matrices[i] as usize][i]
    }

    #[inline]
    pub(crate) fn flip_scale(&mut self, index: ScaleIdx) -> usize {
        let i = index.as_usize();
        self.current_scales[i] = 1 - self.current_scales[i];
        self.current_scales[i] as usize
    }

    #[inline]
    pub(crate) fn take_scale(&mut self, gen: usize, index: ScaleIdx) -> Vec<Real> {
        std::mem::take(&mut self.scales[gen][index.as_usize()])
    }

    #[inline]
    pub(crate) fn put_scale(&mut self, gen: usize, index: ScaleIdx, buf: Vec<Real>) {
        debug_assert_eq!(buf.len(), self.layout.pattern_count);
        self.scales[gen][index.as_usize()] = buf;
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Copy every current-generation index into its stored twin.
    pub(crate) fn store(&mut self) {
        self.stored_partials.copy_from_slice(&self.current_partials);
        self.stored_matrices.copy_from_slice(&self.current_matrices);
        self.stored_scales.copy_from_slice(&self.current_scales);
    }

    /// Swap current and stored index arrays. The previous generation still
    /// resides in the non-current slot, so no data moves.
    pub(crate) fn restore(&mut self) {
        std::mem::swap(&mut self.current_partials, &mut self.stored_partials);
        std::mem::swap(&mut self.current_matrices, &mut self.stored_matrices);
        std::mem::swap(&mut self.current_scales, &mut self.stored_scales);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> BufferStore {
        let layout = Layout {
            state_count: 4,
            pattern_count: 3,
            category_count: 2,
        };
        BufferStore::new(layout, 2, 4, 3).unwrap()
    }

    #[test]
    fn layout_strides() {
        let layout = Layout {
            state_count: 4,
            pattern_count: 5,
            category_count: 3,
        };
        assert_eq!(layout.partials_len(), 60);
        assert_eq!(layout.tip_partials_len(), 20);
        assert_eq!(layout.matrix_stride(), 5);
        assert_eq!(layout.category_matrix_len(), 20);
        assert_eq!(layout.matrix_len(), 60);
        assert_eq!(layout.missing_state(), 4);
    }

    #[test]
    fn tip_states_clamp_to_missing() {
        let mut store = small_store();
        store.set_tip_states(BufferIdx(0), &[0, -1, 9]).unwrap();
        assert_eq!(store.tip_data(0), TipData::States);
        match store.child_source(BufferIdx(0)) {
            ChildSource::States(s) => assert_eq!(s, &[0, 4, 4]),
            ChildSource::Partials(_) => panic!("expected compact states"),
        }
    }

    #[test]
    fn tip_partials_replicate_across_categories() {
        let mut store = small_store();
        let tip: Vec<Real> = (0..12).map(|x| x as Real).collect();
        store.set_tip_partials(BufferIdx(1), &tip).unwrap();
        assert_eq!(store.tip_data(1), TipData::Partials);

        let mut out = vec![0.0; store.layout().partials_len()];
        store.get_partials(BufferIdx(1), &mut out).unwrap();
        assert_eq!(&out[..12], tip.as_slice());
        assert_eq!(&out[12..], tip.as_slice());
    }

    #[test]
    fn flip_preserves_previous_generation() {
        let mut store = small_store();
        let gen = store.flip_partials(BufferIdx(2));
        let mut buf = store.take_partials(gen, BufferIdx(2));
        buf.fill(1.5);
        store.put_partials(gen, BufferIdx(2), buf);

        // The other generation still holds zeros.
        let other = 1 - gen;
        let old = store.take_partials(other, BufferIdx(2));
        assert!(old.iter().all(|&x| x == 0.0));
        store.put_partials(other, BufferIdx(2), old);
        assert!(store.partials_slice(BufferIdx(2)).iter().all(|&x| x == 1.5));
    }

    #[test]
    fn store_then_restore_is_identity_on_indices() {
        let mut store = small_store();
        store.store();
        let gen = store.flip_partials(BufferIdx(3));
        let mut buf = store.take_partials(gen, BufferIdx(3));
        buf.fill(2.0);
        store.put_partials(gen, BufferIdx(3), buf);
        assert!(store.partials_slice(BufferIdx(3)).iter().all(|&x| x == 2.0));

        store.restore();
        assert!(store.partials_slice(BufferIdx(3)).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn out_of_range_and_bad_length_are_reported() {
        let mut store = small_store();
        assert!(matches!(
            store.set_tip_states(BufferIdx(2), &[0, 0, 0]),
            Err(EngineError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.set_tip_partials(BufferIdx(0), &[0.0; 4]),
            Err(EngineError::BadLength { .. })
        ));
        let mut out = vec![0.0; 2];
        assert!(matches!(
            store.get_partials(BufferIdx(0), &mut out),
            Err(EngineError::BadLength { .. })
        ));
    }
}
