//! Dataset operator kernels: cursor creation and traversal, batch readers,
//! shuffling and in-place append.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::RunError;
use crate::operator::OpContext;
use crate::tensor::{trailing_dims_match, DType, Tensor, TENSOR_GROWTH_PCT};

use super::tree::{new_cursor_handle, CursorHandle, TLength, TOffset, TreeIterator};

/// Window-shuffle seed when the op's device carries no random seed.
const DEFAULT_SHUFFLE_SEED: u64 = 0x5eed;

/// Shared mutex blob payload giving `atomic_append` cross-field atomicity.
#[derive(Clone, Default)]
pub struct SharedMutex(pub Arc<Mutex<()>>);

pub fn create_mutex(ctx: &OpContext) -> Result<()> {
    ctx.set_output_value(0, SharedMutex::default())
}

pub fn create_tree_cursor(ctx: &OpContext) -> Result<()> {
    let fields = ctx.arg_strs("fields")?;
    let iterator = TreeIterator::new(&fields)?;
    ctx.set_output_value(0, new_cursor_handle(iterator))
}

pub fn reset_cursor(ctx: &OpContext) -> Result<()> {
    let cursor: CursorHandle = ctx.input_value(0)?;
    cursor.lock().expect("cursor lock poisoned").offsets.clear();
    Ok(())
}

fn field_tensors(ctx: &OpContext, base: usize, count: usize) -> Result<Vec<Tensor>> {
    (0..count).map(|i| ctx.input_tensor(base + i)).collect()
}

fn length_slices<'a>(it: &TreeIterator, data: &'a [Tensor]) -> Result<Vec<&'a [TLength]>> {
    (0..it.num_length_fields())
        .map(|j| data[it.length_field(j).id].as_slice::<TLength>())
        .collect()
}

fn field_limits(it: &TreeIterator, data: &[Tensor]) -> Vec<TOffset> {
    let mut limits = vec![TOffset::MAX; it.num_offset_fields()];
    for field in it.fields() {
        let idx = it.offset_field_id_for(field);
        let size = data[field.id].shape().first().copied().unwrap_or(0) as TOffset;
        limits[idx] = limits[idx].min(size);
    }
    limits
}

/// Copy rows `[start, start + rows)` of `src` into a freshly sized tensor.
fn slice_rows_copy(src: &Tensor, start: usize, rows: usize) -> Result<Tensor> {
    if src.ndim() == 0 || start + rows > src.dim(0) {
        return Err(RunError::ShapeMismatch(format!(
            "row slice [{}, {}) out of bounds for {:?}",
            start,
            start + rows,
            src.shape()
        ))
        .into());
    }
    let mut shape = src.shape().to_vec();
    shape[0] = rows;
    let mut out = Tensor::new(src.dtype(), shape, src.device());
    let row_bytes = src.size_from_dim(1) * src.itemsize();
    let bytes = &src.raw_bytes()[start * row_bytes..(start + rows) * row_bytes];
    out.raw_bytes_mut().copy_from_slice(bytes);
    Ok(out)
}

pub fn read_next_batch(ctx: &OpContext) -> Result<()> {
    let cursor: CursorHandle = ctx.input_value(0)?;
    let it = cursor.lock().expect("cursor lock poisoned").it.clone();
    let num_fields = it.fields().len();
    if ctx.num_inputs() != num_fields + 1 {
        return Err(anyhow!(
            "read_next_batch: expected {} field inputs, got {}",
            num_fields,
            ctx.num_inputs() - 1
        ));
    }
    let batch_size = ctx.arg_int("batch_size", 1)?;
    let data = field_tensors(ctx, 1, num_fields)?;
    let lengths = length_slices(&it, &data)?;
    let limits = field_limits(&it, &data);

    let mut sizes = Vec::new();
    let offsets = {
        let mut guard = cursor.lock().expect("cursor lock poisoned");
        if guard.offsets.is_empty() {
            guard.offsets = vec![0; it.num_offset_fields()];
        }
        let before = guard.offsets.clone();
        it.advance(&lengths, &mut guard.offsets, &mut sizes, &limits, batch_size)?;
        before
    };

    // Copies happen outside the cursor lock.
    for (i, field) in it.fields().iter().enumerate() {
        let idx = it.offset_field_id_for(field);
        let out = slice_rows_copy(&data[i], offsets[idx] as usize, sizes[idx] as usize)?;
        ctx.set_output_tensor(i, out)?;
    }
    Ok(())
}

/// Row `k` of the output matrix is the cursor state at top-level position
/// `k`; the extra final row is the end-of-data state.
pub fn compute_offset(ctx: &OpContext) -> Result<()> {
    let cursor: CursorHandle = ctx.input_value(0)?;
    let it = cursor.lock().expect("cursor lock poisoned").it.clone();
    let num_fields = it.fields().len();
    if ctx.num_inputs() != num_fields + 1 {
        return Err(anyhow!("compute_offset: field count mismatch"));
    }
    let data = field_tensors(ctx, 1, num_fields)?;
    let lengths = length_slices(&it, &data)?;
    let limits = field_limits(&it, &data);

    let width = it.num_offset_fields();
    let rows = (limits[0] + 1) as usize;
    let mut out = Tensor::new(
        DType::I64,
        vec![rows, width],
        ctx.device(),
    );
    {
        let mut guard = cursor.lock().expect("cursor lock poisoned");
        guard.offsets = vec![0; width];
        let mut sizes = Vec::new();
        let out_data = out.as_mut_slice::<i64>()?;
        for k in 0..rows {
            out_data[k * width..(k + 1) * width].copy_from_slice(&guard.offsets);
            it.advance(&lengths, &mut guard.offsets, &mut sizes, &limits, 1)?;
        }
        guard.offsets = vec![0; width];
    }
    ctx.set_output_tensor(0, out)
}

pub fn sort_and_shuffle(ctx: &OpContext) -> Result<()> {
    let cursor: CursorHandle = ctx.input_value(0)?;
    let it = cursor.lock().expect("cursor lock poisoned").it.clone();
    let num_fields = it.fields().len();
    if ctx.num_inputs() != num_fields + 1 {
        return Err(anyhow!("sort_and_shuffle: field count mismatch"));
    }
    let sort_by_field_idx = ctx.arg_int("sort_by_field_idx", 1)?;
    let batch_size = ctx.arg_int("batch_size", 1)? as usize;
    let shuffle_size = ctx.arg_int("shuffle_size", 1)? as usize;
    if sort_by_field_idx < -1 || sort_by_field_idx >= num_fields as i64 {
        return Err(anyhow!(
            "sort_and_shuffle: sort_by_field_idx {} out of range",
            sort_by_field_idx
        ));
    }

    let size = if sort_by_field_idx != -1 {
        ctx.input_tensor(sort_by_field_idx as usize + 1)?.dim(0)
    } else {
        ctx.input_tensor(1)?.dim(0)
    };
    let window = batch_size * shuffle_size;
    if batch_size == 0 || shuffle_size == 0 || window > size {
        return Err(anyhow!(
            "sort_and_shuffle: invalid window {}x{} for size {}",
            batch_size,
            shuffle_size,
            size
        ));
    }
    let num_batch = size / batch_size;

    let mut shuffle_idx: Vec<i64> = (0..size as i64).collect();
    if sort_by_field_idx != -1 {
        let field = &it.fields()[sort_by_field_idx as usize];
        if field.length_field_id.is_some() {
            return Err(anyhow!(
                "sort_and_shuffle: must sort by a root-domain field, got {}",
                field.name
            ));
        }
        let sort_tensor = ctx.input_tensor(sort_by_field_idx as usize + 1)?;
        let sort_data = sort_tensor.as_slice::<i32>()?;
        shuffle_idx.sort_by_key(|&i| sort_data[i as usize]);
    }

    let seed = ctx.device().random_seed.unwrap_or(DEFAULT_SHUFFLE_SEED);
    let mut rng = StdRng::seed_from_u64(seed);
    if window > 1 {
        let mut offset = 0;
        while offset + window < size {
            shuffle_idx[offset..offset + window].shuffle(&mut rng);
            offset += window;
        }
    }

    let mut batch_idx: Vec<usize> = (0..num_batch).collect();
    batch_idx.shuffle(&mut rng);

    let mut out_data = Vec::with_capacity(size);
    for &batch in &batch_idx {
        out_data.extend_from_slice(&shuffle_idx[batch * batch_size..(batch + 1) * batch_size]);
    }
    out_data.extend_from_slice(&shuffle_idx[num_batch * batch_size..]);

    ctx.set_output_tensor(0, Tensor::from_vec(out_data).with_device(ctx.device()))
}

pub fn read_random_batch(ctx: &OpContext) -> Result<()> {
    let cursor: CursorHandle = ctx.input_value(0)?;
    let it = cursor.lock().expect("cursor lock poisoned").it.clone();
    let num_fields = it.fields().len();
    if ctx.num_inputs() != num_fields + 3 {
        return Err(anyhow!("read_random_batch: field count mismatch"));
    }
    let batch_size = ctx.arg_int("batch_size", 1)?;
    let idx_tensor = ctx.input_tensor(1)?;
    let offsets_mat = ctx.input_tensor(2)?;
    let idx_vec = idx_tensor.as_slice::<i64>()?;
    let mat = offsets_mat.as_slice::<i64>()?;
    let width = offsets_mat.dim(1);

    // Reserve this call's index range under the cursor mutex; gathering
    // happens outside the lock from the precomputed offset matrix.
    let idx_start = {
        let mut guard = cursor.lock().expect("cursor lock poisoned");
        guard.offsets.resize(1, 0);
        let start = guard.offsets[0];
        guard.offsets[0] += batch_size;
        start
    };

    for (i, field) in it.fields().iter().enumerate() {
        let length_idx = it.offset_field_id_for(field);
        let input = ctx.input_tensor(i + 3)?;
        let row_elems = input.size_from_dim(1);
        let row_bytes = row_elems * input.itemsize();

        let cell = |row: i64| -> Result<(i64, i64)> {
            let base = row as usize * width + length_idx;
            let next = (row as usize + 1) * width + length_idx;
            if next >= mat.len() {
                return Err(anyhow!(
                    "read_random_batch: out of bound when reading offset matrix"
                ));
            }
            Ok((mat[base], mat[next] - mat[base]))
        };

        let mut total_rows = 0usize;
        for j in 0..batch_size {
            let pos = idx_start + j;
            if pos as usize >= idx_vec.len() {
                break;
            }
            let (_, size) = cell(idx_vec[pos as usize])?;
            total_rows += size as usize;
        }

        let mut shape = input.shape().to_vec();
        shape[0] = total_rows;
        let mut out = Tensor::new(input.dtype(), shape, input.device());
        let mut written = 0usize;
        for j in 0..batch_size {
            let pos = idx_start + j;
            if pos as usize >= idx_vec.len() {
                break;
            }
            let (offset, size) = cell(idx_vec[pos as usize])?;
            let src = &input.raw_bytes()
                [offset as usize * row_bytes..(offset + size) as usize * row_bytes];
            out.raw_bytes_mut()[written * row_bytes..written * row_bytes + src.len()]
                .copy_from_slice(src);
            written += size as usize;
        }
        ctx.set_output_tensor(i, out)?;
    }
    Ok(())
}

/// Verify that the field tensors form a consistent dataset under the schema
/// in the `fields` argument: all fields of one domain agree on size and the
/// lengths sum up exactly to the child sizes.
pub fn check_dataset_consistency(ctx: &OpContext) -> Result<()> {
    let fields = ctx.arg_strs("fields")?;
    let it = TreeIterator::new(&fields)?;
    if ctx.num_inputs() != it.fields().len() {
        return Err(anyhow!(
            "check_dataset_consistency: expected {} inputs, got {}",
            it.fields().len(),
            ctx.num_inputs()
        ));
    }
    let data = field_tensors(ctx, 0, it.fields().len())?;
    let lengths = length_slices(&it, &data)?;

    let mut limits = vec![TOffset::MAX; it.num_offset_fields()];
    for (i, field) in it.fields().iter().enumerate() {
        let idx = it.offset_field_id_for(field);
        let size = data[i].shape().first().copied().unwrap_or(0) as TOffset;
        if limits[idx] == TOffset::MAX {
            limits[idx] = size;
        } else if limits[idx] != size {
            return Err(RunError::ShapeMismatch(format!(
                "inconsistent sizes for fields of one domain: field {} ({}) has {}, expected {}",
                i, field.name, size, limits[idx]
            ))
            .into());
        }
    }

    let mut offsets = vec![0; it.num_offset_fields()];
    let mut sizes = Vec::new();
    it.advance(&lengths, &mut offsets, &mut sizes, &limits, limits[0])?;
    for (j, (&offset, &limit)) in offsets.iter().zip(limits.iter()).enumerate() {
        if offset != limit {
            return Err(RunError::ShapeMismatch(format!(
                "dataset field {} does not span its domain: consumed {}, limit {}",
                j, offset, limit
            ))
            .into());
        }
    }
    Ok(())
}

fn append_checks(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dtype() != b.dtype() || !trailing_dims_match(a.shape(), b.shape()) {
        return Err(RunError::ShapeMismatch(format!(
            "append: incompatible tensors {:?}/{} and {:?}/{}",
            a.shape(),
            a.dtype(),
            b.shape(),
            b.dtype()
        ))
        .into());
    }
    Ok(())
}

fn append_into(ctx: &OpContext, a: Tensor, b: &Tensor, out_idx: usize) -> Result<()> {
    if a.is_empty() {
        let mut fresh = Tensor::new(b.dtype(), vec![0], a.device());
        fresh.copy_from(b)?;
        return ctx.set_output_tensor(out_idx, fresh);
    }
    append_checks(&a, b)?;
    let old_bytes = a.nbytes();
    // Copy out first: the source may share storage with the destination.
    let src = b.raw_bytes().to_vec();
    let mut grown = a;
    grown.extend_dim0(b.dim(0), TENSOR_GROWTH_PCT)?;
    grown.raw_bytes_mut()[old_bytes..old_bytes + src.len()].copy_from_slice(&src);
    ctx.set_output_tensor(out_idx, grown)
}

/// In-place extend of input 0 by input 1 along axis 0.
pub fn append(ctx: &OpContext) -> Result<()> {
    let a = ctx.input_tensor(0)?;
    let b = ctx.input_tensor(1)?;
    if b.ndim() < 1 {
        return Err(RunError::ShapeMismatch("append: source must have rank >= 1".into()).into());
    }
    if !a.is_empty() && !Arc::ptr_eq(ctx.input_blob(0)?, ctx.output_blob(0)?) {
        return Err(anyhow!("append: first argument must be in-place"));
    }
    append_into(ctx, a, &b, 0)
}

/// Append across several field tensors under one shared mutex, so readers
/// never observe some fields extended and others not.
pub fn atomic_append(ctx: &OpContext) -> Result<()> {
    let mutex: SharedMutex = ctx.input_value(0)?;
    let num_fields = (ctx.num_inputs() - 1) / 2;
    if ctx.num_outputs() != num_fields {
        return Err(anyhow!(
            "atomic_append: expected {} outputs, got {}",
            num_fields,
            ctx.num_outputs()
        ));
    }
    let _guard = mutex.0.lock().expect("append mutex poisoned");

    // Validate every field before mutating any of them.
    for i in 0..num_fields {
        let a = ctx.input_tensor(1 + i)?;
        let b = ctx.input_tensor(1 + i + num_fields)?;
        if b.ndim() < 1 {
            return Err(
                RunError::ShapeMismatch("atomic_append: source must have rank >= 1".into()).into(),
            );
        }
        if a.is_empty() {
            continue;
        }
        if !Arc::ptr_eq(ctx.input_blob(1 + i)?, ctx.output_blob(i)?) {
            return Err(anyhow!("atomic_append: appended-to arguments must be in-place"));
        }
        append_checks(&a, &b)?;
    }

    for i in 0..num_fields {
        let a = ctx.input_tensor(1 + i)?;
        let b = ctx.input_tensor(1 + i + num_fields)?;
        append_into(ctx, a, &b, i)?;
    }
    Ok(())
}
