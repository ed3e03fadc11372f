//! Tensor - Shared handle over the differentiable-value substrate.
//!
//! This module is the boundary to the tensor substrate: an
//! `ndarray::ArrayD<f32>` payload together with a gradient slot and a
//! gradient-requirement flag, behind a cheap shared handle. Machines read the
//! payload during `forward`, accumulate into the gradient slot during
//! `accumulate`, and read it back in `step_x`.
//!
//! The framework never derives gradients itself: each machine carries the
//! backward formulas for its own computation and writes the results through
//! this handle. Detaching and freshening therefore reduce to bookkeeping on
//! the gradient slot and flag.
//!
//! # Examples
//!
//! ```
//! use telos::Tensor;
//! use ndarray::array;
//!
//! let t = Tensor::leaf(array![[1.0_f32, 2.0], [3.0, 4.0]].into_dyn());
//! assert!(t.requires_grad());
//!
//! t.add_grad(&array![[0.5_f32, 0.5], [0.5, 0.5]].into_dyn());
//! assert!(t.grad().is_some());
//!
//! let d = t.detached();
//! assert!(!d.requires_grad());
//! assert!(d.grad().is_none());
//! ```

use crate::error::Result;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

#[derive(Debug)]
struct TensorInner {
    data: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    requires_grad: bool,
}

/// Shared handle to one differentiable value.
///
/// Cloning a `Tensor` clones the handle, not the payload: all clones observe
/// the same data and gradient slot. Use [`Tensor::deep_clone`],
/// [`Tensor::detached`] or [`Tensor::freshened`] to mint an independent value.
#[derive(Debug, Clone)]
pub struct Tensor {
    inner: Rc<RefCell<TensorInner>>,
}

impl Tensor {
    /// Create a tensor that does not track gradients.
    pub fn new(data: ArrayD<f32>) -> Self {
        Self::with_flags(data, false, None)
    }

    /// Create a fresh leaf: gradient tracking on, gradient slot empty.
    pub fn leaf(data: ArrayD<f32>) -> Self {
        Self::with_flags(data, true, None)
    }

    fn with_flags(data: ArrayD<f32>, requires_grad: bool, grad: Option<ArrayD<f32>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TensorInner {
                data,
                grad,
                requires_grad,
            })),
        }
    }

    /// Borrow the payload.
    pub fn data(&self) -> Ref<'_, ArrayD<f32>> {
        Ref::map(self.inner.borrow(), |inner| &inner.data)
    }

    /// Mutably borrow the payload (in-place update path).
    pub fn data_mut(&self) -> RefMut<'_, ArrayD<f32>> {
        RefMut::map(self.inner.borrow_mut(), |inner| &mut inner.data)
    }

    /// Copy the payload out.
    pub fn to_array(&self) -> ArrayD<f32> {
        self.inner.borrow().data.clone()
    }

    /// Shape of the payload.
    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().data.shape().to_vec()
    }

    /// Whether this value participates in gradient accumulation.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.inner.borrow().requires_grad
    }

    /// Turn gradient tracking on or off in place.
    pub fn set_requires_grad(&self, flag: bool) {
        self.inner.borrow_mut().requires_grad = flag;
    }

    /// Copy the accumulated gradient out, if any.
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.inner.borrow().grad.clone()
    }

    /// Accumulate `delta` into the gradient slot, allocating it on first use.
    pub fn add_grad(&self, delta: &ArrayD<f32>) {
        let mut inner = self.inner.borrow_mut();
        match inner.grad.as_mut() {
            Some(g) => *g += delta,
            None => inner.grad = Some(delta.clone()),
        }
    }

    /// Drop any accumulated gradient.
    pub fn zero_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    /// Replace the payload in place, leaving flags untouched.
    pub fn assign(&self, data: ArrayD<f32>) {
        self.inner.borrow_mut().data = data;
    }

    /// Independent copy with gradients stripped and tracking off.
    pub fn detached(&self) -> Tensor {
        Self::with_flags(self.to_array(), false, None)
    }

    /// Independent copy as a fresh gradient-tracking leaf.
    pub fn freshened(&self) -> Tensor {
        Self::with_flags(self.to_array(), true, None)
    }

    /// Independent deep copy.
    ///
    /// With `detach` the copy drops gradient state; otherwise the flag and
    /// any accumulated gradient carry over.
    pub fn deep_clone(&self, detach: bool) -> Tensor {
        if detach {
            self.detached()
        } else {
            let inner = self.inner.borrow();
            Self::with_flags(inner.data.clone(), inner.requires_grad, inner.grad.clone())
        }
    }

    /// Concatenate payloads along `axis` into a new non-tracking tensor.
    ///
    /// Shape mismatches propagate from the substrate unchanged.
    pub fn cat(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        let guards: Vec<Ref<'_, ArrayD<f32>>> = tensors.iter().map(|t| t.data()).collect();
        let views: Vec<ArrayViewD<'_, f32>> = guards.iter().map(|g| g.view()).collect();
        let joined = concatenate(Axis(axis), &views)?;
        Ok(Tensor::new(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_handle_clone_shares_storage() {
        let t = Tensor::new(array![1.0_f32, 2.0].into_dyn());
        let h = t.clone();
        h.assign(array![5.0_f32, 6.0].into_dyn());
        assert_eq!(t.to_array(), array![5.0_f32, 6.0].into_dyn());
    }

    #[test]
    fn test_add_grad_accumulates() {
        let t = Tensor::leaf(array![1.0_f32, 1.0].into_dyn());
        t.add_grad(&array![0.5_f32, 0.5].into_dyn());
        t.add_grad(&array![0.5_f32, 0.5].into_dyn());
        assert_eq!(t.grad().unwrap(), array![1.0_f32, 1.0].into_dyn());

        t.zero_grad();
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_detached_is_independent() {
        let t = Tensor::leaf(array![1.0_f32, 2.0].into_dyn());
        t.add_grad(&array![1.0_f32, 1.0].into_dyn());

        let d = t.detached();
        assert!(!d.requires_grad());
        assert!(d.grad().is_none());

        d.assign(array![9.0_f32, 9.0].into_dyn());
        assert_eq!(t.to_array(), array![1.0_f32, 2.0].into_dyn());
    }

    #[test]
    fn test_deep_clone_keeps_grad_state() {
        let t = Tensor::leaf(array![1.0_f32].into_dyn());
        t.add_grad(&array![2.0_f32].into_dyn());

        let c = t.deep_clone(false);
        assert!(c.requires_grad());
        assert_eq!(c.grad().unwrap(), array![2.0_f32].into_dyn());
    }

    #[test]
    fn test_cat_along_batch_axis() {
        let a = Tensor::new(ArrayD::zeros(vec![4, 3]));
        let b = Tensor::new(ArrayD::zeros(vec![4, 3]));
        let c = Tensor::cat(&[a, b], 0).unwrap();
        assert_eq!(c.shape(), vec![8, 3]);
    }

    #[test]
    fn test_cat_shape_mismatch_errors() {
        let a = Tensor::new(ArrayD::zeros(vec![4, 3]));
        let b = Tensor::new(ArrayD::zeros(vec![4, 2]));
        assert!(Tensor::cat(&[a, b], 0).is_err());
    }
}
