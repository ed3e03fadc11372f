//! IO and Idx - Value bundles passed between learning machines.
//!
//! An [`IO`] is an ordered, identity-distinct bundle of forward-pass values
//! (activations or targets). Machines and containers key their caches by the
//! *instance*, not by content: every constructor mints a fresh [`IoId`],
//! while `Clone` produces another handle to the same instance. This is the
//! mechanism behind the framework's staleness rules: a released copy is a
//! different instance than the cached original.
//!
//! An [`Idx`] selects a subset of a batch or feature dimension. The identity
//! index selects everything, and index-of-index composition obeys
//! `identity.sub(i) == i` and `i.sub(identity) == i`.
//!
//! # Examples
//!
//! ```
//! use telos::IO;
//! use ndarray::ArrayD;
//!
//! let io = IO::from_array(ArrayD::zeros(vec![2, 3]));
//! assert!(io.is_singular());
//!
//! // Freshening is idempotent: the flag is sticky.
//! assert!(io.freshen());
//! assert!(!io.freshen());
//!
//! // A released copy is a new instance with detached values.
//! let out = io.out(true);
//! assert_ne!(out.id(), io.id());
//! ```

use crate::error::{Result, TelosError};
use crate::tensor::Tensor;
use itertools::izip;
use ndarray::{ArrayD, Axis};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an IO instance.
///
/// Issued from an atomic counter at construction; containers and state
/// entries key by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoId(u64);

impl IoId {
    fn fresh() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        IoId(NEXT_ID.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Debug)]
struct IoInner {
    values: Vec<Tensor>,
    freshened: bool,
}

/// Ordered bundle of values with instance identity.
///
/// `Clone` is a handle copy: same id, same storage. All other ways of
/// obtaining an IO ([`IO::deep_clone`], [`IO::detached`], [`IO::release`],
/// [`IO::sub`], [`IO::cat`], ...) create a new instance.
#[derive(Debug, Clone)]
pub struct IO {
    id: IoId,
    singular: bool,
    inner: Rc<RefCell<IoInner>>,
}

impl IO {
    /// Create an IO from a value sequence. The length is fixed from here on.
    pub fn new(values: Vec<Tensor>) -> Self {
        Self::build(values, false, false)
    }

    /// Create a single-value IO from a raw array.
    pub fn from_array(data: ArrayD<f32>) -> Self {
        Self::new(vec![Tensor::new(data)])
    }

    /// Create an IO from raw arrays, one value per array.
    pub fn from_arrays(arrays: Vec<ArrayD<f32>>) -> Self {
        Self::new(arrays.into_iter().map(Tensor::new).collect())
    }

    fn build(values: Vec<Tensor>, detach: bool, freshened: bool) -> Self {
        let values = if detach {
            values.iter().map(Tensor::detached).collect()
        } else {
            values
        };
        Self {
            id: IoId::fresh(),
            singular: values.len() == 1,
            inner: Rc::new(RefCell::new(IoInner { values, freshened })),
        }
    }

    /// Instance identity.
    #[inline]
    pub fn id(&self) -> IoId {
        self.id
    }

    /// Number of values in the bundle.
    pub fn len(&self) -> usize {
        self.inner.borrow().values.len()
    }

    /// Whether the bundle holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff the bundle held exactly one value at construction.
    #[inline]
    pub fn is_singular(&self) -> bool {
        self.singular
    }

    /// Whether the values have been turned into fresh leaves.
    pub fn is_freshened(&self) -> bool {
        self.inner.borrow().freshened
    }

    /// Get the value at `index`.
    pub fn value(&self, index: usize) -> Result<Tensor> {
        let inner = self.inner.borrow();
        inner
            .values
            .get(index)
            .cloned()
            .ok_or(TelosError::IndexOutOfRange {
                index,
                length: inner.values.len(),
            })
    }

    /// The first value. Shorthand for the common singular case.
    pub fn f(&self) -> Result<Tensor> {
        self.value(0)
    }

    /// Handles to all values, in order.
    pub fn values(&self) -> Vec<Tensor> {
        self.inner.borrow().values.clone()
    }

    /// Convert the values into fresh gradient-tracking leaves, detached from
    /// any prior computation.
    ///
    /// Idempotent: returns `false` without touching the values when the
    /// bundle has already been freshened.
    pub fn freshen(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.freshened {
            return false;
        }
        let fresh: Vec<Tensor> = inner.values.iter().map(Tensor::freshened).collect();
        inner.values = fresh;
        inner.freshened = true;
        true
    }

    /// Deep copy into a new instance.
    ///
    /// With `detach` the copy strips gradient state and the freshened flag;
    /// otherwise both carry over.
    pub fn deep_clone(&self, detach: bool) -> IO {
        let inner = self.inner.borrow();
        let values = inner.values.iter().map(|v| v.deep_clone(detach)).collect();
        Self::build(values, false, !detach && inner.freshened)
    }

    /// New instance with every value detached.
    pub fn detached(&self) -> IO {
        Self::build(self.values(), true, false)
    }

    /// Detached deep copy, the form in which outputs leave a machine.
    pub fn release(&self) -> IO {
        self.deep_clone(true)
    }

    /// Either a released copy (`release == true`) or a handle to this
    /// instance. Machines call this on their output so the caller decides
    /// whether the value re-enters the producer's computation.
    pub fn out(&self, release: bool) -> IO {
        if release {
            self.release()
        } else {
            self.clone()
        }
    }

    /// Select values by position into a new instance.
    pub fn sub(&self, indices: &[usize], detach: bool) -> Result<IO> {
        let values = indices
            .iter()
            .map(|&i| self.value(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::build(values, detach, false))
    }

    /// Select the half-open value range `[low, high)` into a new instance.
    pub fn range(&self, low: Option<usize>, high: Option<usize>, detach: bool) -> Result<IO> {
        let len = self.len();
        let low = low.unwrap_or(0);
        let high = high.unwrap_or(len);
        if low > high || high > len {
            return Err(TelosError::IndexOutOfRange {
                index: high,
                length: len,
            });
        }
        let values = self.inner.borrow().values[low..high].to_vec();
        Ok(Self::build(values, detach, false))
    }

    /// Concatenate same-length IOs element-wise along the batch axis.
    ///
    /// Value `j` of the result is the batch concatenation of value `j` of
    /// every input. IOs of different lengths are rejected; element shape
    /// mismatches propagate from the substrate.
    pub fn cat(ios: &[IO]) -> Result<IO> {
        let Some(first) = ios.first() else {
            return Ok(Self::new(Vec::new()));
        };
        let len = first.len();
        for io in &ios[1..] {
            if io.len() != len {
                return Err(TelosError::CatLengthMismatch(len, io.len()));
            }
        }
        let mut values = Vec::with_capacity(len);
        for j in 0..len {
            let column = ios
                .iter()
                .map(|io| io.value(j))
                .collect::<Result<Vec<_>>>()?;
            values.push(Tensor::cat(&column, 0)?);
        }
        Ok(Self::new(values))
    }

    /// Concatenate at the value level: the result holds every input's value
    /// handles in order. Used by graph fan-in merges.
    pub fn join(ios: &[IO]) -> IO {
        let values = ios.iter().flat_map(|io| io.values()).collect();
        Self::build(values, false, false)
    }

    /// Element-wise sum of same-length IOs into a new instance.
    ///
    /// Used to combine several consumers' `x_prime` contributions for one
    /// produced output.
    pub fn sum(ios: &[IO]) -> Result<IO> {
        let Some(first) = ios.first() else {
            return Ok(Self::new(Vec::new()));
        };
        let len = first.len();
        let mut values: Vec<ArrayD<f32>> =
            first.values().iter().map(|v| v.to_array()).collect();
        for io in &ios[1..] {
            if io.len() != len {
                return Err(TelosError::CatLengthMismatch(len, io.len()));
            }
            for (acc, v) in values.iter_mut().zip(io.values()) {
                *acc += &*v.data();
            }
        }
        Ok(Self::new(values.into_iter().map(Tensor::new).collect()))
    }
}

/// Index descriptor: an optional position list plus a dimension.
///
/// The identity index selects everything and is the unit of composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Idx {
    idx: Option<Vec<usize>>,
    dim: usize,
}

impl Idx {
    /// The identity index: no selection.
    pub fn identity() -> Self {
        Self { idx: None, dim: 0 }
    }

    /// Select `indices` along `dim`.
    pub fn new(indices: Vec<usize>, dim: usize) -> Self {
        Self {
            idx: Some(indices),
            dim,
        }
    }

    /// Whether this is the identity index.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.idx.is_none()
    }

    /// Number of selected positions, `None` for identity.
    pub fn len(&self) -> Option<usize> {
        self.idx.as_ref().map(Vec::len)
    }

    /// The selected positions, `None` for identity.
    pub fn indices(&self) -> Option<&[usize]> {
        self.idx.as_deref()
    }

    /// The dimension the index applies to.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Select from a single tensor: rows at the indexed positions along
    /// `dim`, or a handle to the input for the identity index.
    pub fn select(&self, tensor: &Tensor) -> Tensor {
        match &self.idx {
            None => tensor.clone(),
            Some(idx) => Tensor::new(tensor.data().select(Axis(self.dim), idx)),
        }
    }

    /// Apply the index to every value of an IO, returning a new instance.
    ///
    /// The freshened flag carries over when not detaching.
    pub fn apply(&self, io: &IO, detach: bool) -> IO {
        let values: Vec<Tensor> = io.values().iter().map(|v| self.select(v)).collect();
        let freshened = io.is_freshened() && !detach;
        IO::build(values, detach, freshened)
    }

    /// Index-of-index composition.
    ///
    /// `identity.sub(i)` is `i`, `i.sub(identity)` is `i`; otherwise the
    /// result gathers this index's positions at `other`'s positions.
    pub fn sub(&self, other: &Idx) -> Result<Idx> {
        let (own, theirs) = match (&self.idx, &other.idx) {
            (_, None) => return Ok(self.clone()),
            (None, Some(_)) => return Ok(other.clone()),
            (Some(own), Some(theirs)) => (own, theirs),
        };
        let gathered = theirs
            .iter()
            .map(|&p| {
                own.get(p).copied().ok_or(TelosError::IndexOutOfRange {
                    index: p,
                    length: own.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Idx::new(gathered, self.dim))
    }

    /// Scatter `source`'s values into `destination` at the selected
    /// positions, or replace wholesale for the identity index.
    ///
    /// With `idx_both` the source is read at the indexed positions as well,
    /// otherwise row `k` of the source lands at position `idx[k]`. The
    /// destination keeps its gradient-requirement flag; only the payload
    /// changes.
    pub fn update(&self, source: &IO, destination: &IO, idx_both: bool) -> Result<()> {
        if source.len() != destination.len() {
            return Err(TelosError::CatLengthMismatch(source.len(), destination.len()));
        }
        for (src, dst) in izip!(source.values(), destination.values()) {
            self.update_tensor(&src, &dst, idx_both)?;
        }
        Ok(())
    }

    /// Scatter a single tensor. See [`Idx::update`].
    pub fn update_tensor(&self, source: &Tensor, destination: &Tensor, idx_both: bool) -> Result<()> {
        // Materialize the source first: source and destination may share a cell.
        let src = source.to_array();
        match &self.idx {
            None => destination.assign(src),
            Some(idx) => {
                let mut dst = destination.data_mut();
                let rows = dst.len_of(Axis(self.dim));
                for (k, &p) in idx.iter().enumerate() {
                    if p >= rows {
                        return Err(TelosError::IndexOutOfRange {
                            index: p,
                            length: rows,
                        });
                    }
                    let row = if idx_both { p } else { k };
                    dst.index_axis_mut(Axis(self.dim), p)
                        .assign(&src.index_axis(Axis(self.dim), row));
                }
            }
        }
        Ok(())
    }
}

/// Apply an optional index to an IO and release the result if requested.
///
/// Convenience for call sites that may or may not have an index in hand.
pub fn idx_io(io: &IO, idx: Option<&Idx>, release: bool) -> IO {
    let io = match idx {
        Some(idx) => idx.apply(io, false),
        None => io.clone(),
    };
    io.out(release)
}
