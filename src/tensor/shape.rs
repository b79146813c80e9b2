/// Logical element count of a shape.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Element count of all dimensions from `dim` onwards. `size_from_dim(1)`
/// is the per-row element count used when slicing along axis 0.
pub fn size_from_dim(shape: &[usize], dim: usize) -> usize {
    shape.iter().skip(dim).product()
}

/// Whether two shapes agree on every dimension after the first.
pub fn trailing_dims_match(a: &[usize], b: &[usize]) -> bool {
    a.len() == b.len() && a.iter().skip(1).eq(b.iter().skip(1))
}
