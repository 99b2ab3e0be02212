//! Ownership tag for weights that may be aliased across models.
//!
//! A draft model either owns a weight outright or holds a reference to the
//! one value owned by the target model. Two models never hold independent
//! copies that merely look alike.

use std::sync::Arc;

use candle_core::Tensor;

/// A weight tensor owned by this model or shared from another one.
#[derive(Debug, Clone)]
pub enum Weight {
    /// Loaded for (and only reachable from) this model.
    Owned(Tensor),
    /// Reference to a weight owned elsewhere, typically the target model.
    Shared(Arc<Tensor>),
}

impl Weight {
    /// The underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        match self {
            Weight::Owned(t) => t,
            Weight::Shared(t) => t.as_ref(),
        }
    }

    /// Shape of the weight.
    pub fn dims(&self) -> &[usize] {
        self.tensor().dims()
    }

    /// Whether this weight is a reference to another model's weight.
    pub fn is_shared(&self) -> bool {
        matches!(self, Weight::Shared(_))
    }

    /// Whether this weight refers to exactly `other`.
    pub fn aliases(&self, other: &Arc<Tensor>) -> bool {
        match self {
            Weight::Shared(t) => Arc::ptr_eq(t, other),
            Weight::Owned(_) => false,
        }
    }
}
