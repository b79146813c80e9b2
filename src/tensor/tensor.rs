use anyhow::{anyhow, Result};

use crate::types::DeviceOption;

use super::dtype::{DType, Element};
use super::shape::{numel, size_from_dim};
use super::storage::Storage;

/// Percentage used to over-reserve storage when a tensor is extended along
/// axis 0, keeping repeated appends amortized.
pub const TENSOR_GROWTH_PCT: usize = 40;

/// A typed n-dimensional view over ref-counted byte storage.
///
/// Cloning a tensor is cheap and shares storage; `view_dim0` produces
/// aliased slices along axis 0 (the link mechanism of the recurrent
/// executor). The device binding is fixed at allocation.
#[derive(Clone, Debug)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: DeviceOption,
    storage: Storage,
    /// View start, in elements, into `storage`.
    offset: usize,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, device: DeviceOption) -> Self {
        let storage = Storage::with_len(numel(&shape) * dtype.itemsize());
        Self {
            dtype,
            shape,
            device,
            storage,
            offset: 0,
        }
    }

    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        let shape = vec![data.len()];
        Self::from_vec_shaped(data, shape).expect("1-d shape always matches")
    }

    pub fn from_vec_shaped<T: Element>(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        if numel(&shape) != data.len() {
            return Err(anyhow!(
                "shape {:?} does not match data length {}",
                shape,
                data.len()
            ));
        }
        let bytes = bytemuck::cast_slice(&data).to_vec();
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            device: DeviceOption::cpu(),
            storage: Storage::from_bytes(bytes),
            offset: 0,
        })
    }

    pub fn from_bools(data: &[bool]) -> Self {
        let bytes = data.iter().map(|&b| b as u8).collect::<Vec<_>>();
        Self {
            dtype: DType::Bool,
            shape: vec![data.len()],
            device: DeviceOption::cpu(),
            storage: Storage::from_bytes(bytes),
            offset: 0,
        }
    }

    pub fn bool_scalar(value: bool) -> Self {
        Self::from_bools(&[value])
    }

    pub fn with_device(mut self, device: DeviceOption) -> Self {
        self.device = device;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> DeviceOption {
        self.device
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        numel(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn itemsize(&self) -> usize {
        self.dtype.itemsize()
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.itemsize()
    }

    /// Element count of dimensions `dim..`.
    pub fn size_from_dim(&self, dim: usize) -> usize {
        size_from_dim(&self.shape, dim)
    }

    pub fn is_view(&self) -> bool {
        self.offset != 0 || self.storage.len() != self.nbytes()
    }

    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype(T::DTYPE)?;
        bytemuck::try_cast_slice(self.raw_bytes())
            .map_err(|err| anyhow!("tensor cast failed: {}", err))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype(T::DTYPE)?;
        bytemuck::try_cast_slice_mut(self.raw_bytes_mut())
            .map_err(|err| anyhow!("tensor cast failed: {}", err))
    }

    pub fn bool_data(&self) -> Result<&[u8]> {
        self.check_dtype(DType::Bool)?;
        Ok(self.raw_bytes())
    }

    pub fn bool_data_mut(&mut self) -> Result<&mut [u8]> {
        self.check_dtype(DType::Bool)?;
        Ok(self.raw_bytes_mut())
    }

    pub fn scalar_bool(&self) -> Result<bool> {
        let data = self.bool_data()?;
        if data.len() != 1 {
            return Err(anyhow!("expected a scalar boolean, got {:?}", self.shape));
        }
        Ok(data[0] != 0)
    }

    /// The bytes of this view.
    pub fn raw_bytes(&self) -> &[u8] {
        let start = self.offset * self.itemsize();
        &self.storage.as_bytes()[start..start + self.nbytes()]
    }

    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        let start = self.offset * self.itemsize();
        let end = start + self.nbytes();
        &mut self.storage.as_bytes_mut()[start..end]
    }

    fn check_dtype(&self, expected: DType) -> Result<()> {
        if self.dtype != expected {
            return Err(anyhow!(
                "tensor dtype mismatch: have {}, requested {}",
                self.dtype,
                expected
            ));
        }
        Ok(())
    }

    /// Change the shape without touching element count.
    pub fn reshape(&mut self, shape: Vec<usize>) -> Result<()> {
        if numel(&shape) != self.len() {
            return Err(anyhow!(
                "cannot reshape {:?} to {:?}: element count differs",
                self.shape,
                shape
            ));
        }
        self.shape = shape;
        Ok(())
    }

    /// Resize to a new shape, reallocating when the byte count changes.
    /// Views cannot be resized; they alias someone else's storage.
    pub fn resize(&mut self, shape: Vec<usize>) -> Result<()> {
        if self.is_view() {
            return Err(anyhow!("cannot resize a tensor view"));
        }
        let nbytes = numel(&shape) * self.itemsize();
        if nbytes != self.storage.len() {
            self.storage = Storage::with_len(nbytes);
        }
        self.shape = shape;
        Ok(())
    }

    /// Grow axis 0 by `extra_rows`, keeping existing data and zero-filling
    /// the new rows. Storage over-reserves by `growth_pct` on reallocation.
    pub fn extend_dim0(&mut self, extra_rows: usize, growth_pct: usize) -> Result<()> {
        if self.offset != 0 {
            return Err(anyhow!("cannot extend a tensor view"));
        }
        if self.shape.is_empty() {
            return Err(anyhow!("cannot extend a zero-dimensional tensor"));
        }
        self.shape[0] += extra_rows;
        self.storage.grow_to(self.nbytes(), growth_pct);
        Ok(())
    }

    /// Aliased slice `[start, start + rows)` along axis 0. The result shares
    /// bytes with `self`; writes through either side are visible to both.
    pub fn view_dim0(&self, start: usize, rows: usize) -> Result<Tensor> {
        if self.shape.is_empty() {
            return Err(anyhow!("cannot slice a zero-dimensional tensor"));
        }
        if start + rows > self.shape[0] {
            return Err(anyhow!(
                "slice [{}, {}) out of bounds for dim0 {}",
                start,
                start + rows,
                self.shape[0]
            ));
        }
        let row_elems = self.size_from_dim(1);
        let mut shape = self.shape.clone();
        shape[0] = rows;
        Ok(Tensor {
            dtype: self.dtype,
            shape,
            device: self.device,
            storage: self.storage.clone(),
            offset: self.offset + start * row_elems,
        })
    }

    /// Become a copy of `src`: same dtype, shape and bytes, own storage.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        if self.is_view() {
            return Err(anyhow!("cannot overwrite a tensor view"));
        }
        self.dtype = src.dtype;
        self.shape = src.shape.clone();
        self.storage = Storage::from_bytes(src.raw_bytes().to_vec());
        self.offset = 0;
        Ok(())
    }
}
