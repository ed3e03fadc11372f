//! Assessment - Loss evaluation for learning machines.
//!
//! An [`Assessment`] is the result of comparing a machine's output against a
//! target. The criterion also exposes the gradient of the loss with respect
//! to the output: the seam through which machines start their own local
//! backward formulas. Parameter state is never touched here.

use crate::error::{Result, TelosError};
use crate::io::IO;
use ndarray::ArrayD;

/// How a criterion reduces per-element losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Average over every element.
    Mean,
    /// Sum over every element.
    Sum,
    /// No reduction; per-element losses are returned as-is.
    None,
}

/// The outcome of assessing an output against a target.
#[derive(Debug, Clone)]
pub struct Assessment {
    /// Reduced (or per-element) loss.
    pub value: ArrayD<f32>,
    /// Whether larger is better for this criterion.
    pub maximize: bool,
}

impl Assessment {
    /// The loss as a scalar, when it is one.
    pub fn item(&self) -> Option<f32> {
        if self.value.len() == 1 {
            self.value.iter().next().copied()
        } else {
            None
        }
    }
}

/// Mean-squared-error criterion.
#[derive(Debug, Clone, Copy)]
pub struct MseLoss {
    reduction: Reduction,
}

impl MseLoss {
    /// Create an MSE criterion with a default reduction.
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn effective(&self, reduction_override: Option<Reduction>) -> Reduction {
        reduction_override.unwrap_or(self.reduction)
    }

    /// Assess `y` against `t`.
    ///
    /// Multi-value IOs are reduced jointly over all value pairs; the `None`
    /// reduction is only defined for single-value IOs.
    pub fn assess(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Assessment> {
        if y.len() != t.len() {
            return Err(TelosError::CatLengthMismatch(y.len(), t.len()));
        }
        let reduction = self.effective(reduction_override);

        let mut total = 0.0_f32;
        let mut count = 0usize;
        let mut elementwise: Option<ArrayD<f32>> = None;
        for (y_i, t_i) in y.values().iter().zip(t.values()) {
            let diff = &*y_i.data() - &*t_i.data();
            let sq = &diff * &diff;
            total += sq.sum();
            count += sq.len();
            elementwise = Some(sq);
        }

        let value = match reduction {
            Reduction::Mean => {
                ArrayD::from_elem(ndarray::IxDyn(&[]), total / count.max(1) as f32)
            }
            Reduction::Sum => ArrayD::from_elem(ndarray::IxDyn(&[]), total),
            Reduction::None => {
                if y.len() != 1 {
                    return Err(TelosError::Unsupported(
                        "unreduced assessment over a multi-value IO",
                    ));
                }
                elementwise.unwrap_or_else(|| ArrayD::zeros(ndarray::IxDyn(&[])))
            }
        };
        Ok(Assessment {
            value,
            maximize: false,
        })
    }

    /// Gradient of the reduced loss with respect to each output value.
    ///
    /// Machines feed this into their own backward formulas in place of a
    /// substrate `backward()` call.
    pub fn grad_y(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Vec<ArrayD<f32>>> {
        if y.len() != t.len() {
            return Err(TelosError::CatLengthMismatch(y.len(), t.len()));
        }
        let reduction = self.effective(reduction_override);

        let count: usize = y.values().iter().map(|v| v.data().len()).sum();
        y.values()
            .iter()
            .zip(t.values())
            .map(|(y_i, t_i)| {
                let diff = &*y_i.data() - &*t_i.data();
                let grad = match reduction {
                    Reduction::Mean => diff * (2.0 / count.max(1) as f32),
                    Reduction::Sum | Reduction::None => diff * 2.0,
                };
                Ok(grad)
            })
            .collect()
    }
}
