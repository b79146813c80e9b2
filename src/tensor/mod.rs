//! Tensor payloads: runtime dtype, shape helpers, ref-counted storage and
//! aliasing views.

mod dtype;
mod shape;
mod storage;
#[allow(clippy::module_inception)]
mod tensor;

pub use dtype::{DType, Element};
pub use shape::{numel, size_from_dim, trailing_dims_match};
pub use storage::Storage;
pub use tensor::{Tensor, TENSOR_GROWTH_PCT};
