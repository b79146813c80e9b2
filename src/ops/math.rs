//! Elementwise and bookkeeping kernels used by nets and plans.

use anyhow::{anyhow, Result};

use crate::error::RunError;
use crate::operator::OpContext;
use crate::tensor::{DType, Tensor};
use crate::types::DeviceOption;

/// Reuse the output blob's tensor when dtype and shape already match; this
/// keeps writes landing in aliased link views instead of detaching them.
pub(crate) fn output_like(
    ctx: &OpContext,
    idx: usize,
    dtype: DType,
    shape: &[usize],
    device: DeviceOption,
) -> Result<Tensor> {
    let blob = ctx.output_blob(idx)?;
    {
        let guard = blob.lock().expect("blob lock poisoned");
        if let Ok(existing) = guard.get::<Tensor>() {
            if existing.dtype() == dtype && existing.shape() == shape {
                return Ok(existing.clone());
            }
        }
    }
    let tensor = Tensor::new(dtype, shape.to_vec(), device);
    blob.lock()
        .expect("blob lock poisoned")
        .set(tensor.clone());
    Ok(tensor)
}

pub fn fill(ctx: &OpContext) -> Result<()> {
    let shape: Vec<usize> = ctx
        .arg_ints("shape")?
        .into_iter()
        .map(|dim| dim as usize)
        .collect();
    let dtype: DType = ctx.arg_str("dtype", "f32")?.parse()?;
    let value = ctx.arg_float("value", 0.0)?;
    let mut out = output_like(ctx, 0, dtype, &shape, ctx.device())?;
    match dtype {
        DType::F32 => out.as_mut_slice::<f32>()?.fill(value),
        DType::F64 => out.as_mut_slice::<f64>()?.fill(value as f64),
        DType::I32 => out.as_mut_slice::<i32>()?.fill(value as i32),
        DType::I64 => out.as_mut_slice::<i64>()?.fill(value as i64),
        DType::U8 => out.as_mut_slice::<u8>()?.fill(value as u8),
        DType::Bool => out.bool_data_mut()?.fill((value != 0.0) as u8),
    }
    Ok(())
}

pub fn copy(ctx: &OpContext) -> Result<()> {
    let input = ctx.input_tensor(0)?;
    let mut out = output_like(ctx, 0, input.dtype(), input.shape(), input.device())?;
    let bytes = input.raw_bytes().to_vec();
    out.raw_bytes_mut().copy_from_slice(&bytes);
    Ok(())
}

macro_rules! binary_elementwise {
    ($ctx:expr, $a:expr, $b:expr, $out:expr, $op:tt, [$($ty:ty => $dt:path),+]) => {
        match $a.dtype() {
            $($dt => {
                let av = $a.as_slice::<$ty>()?.to_vec();
                let bv = $b.as_slice::<$ty>()?.to_vec();
                let ov = $out.as_mut_slice::<$ty>()?;
                for (o, (x, y)) in ov.iter_mut().zip(av.into_iter().zip(bv)) {
                    *o = x $op y;
                }
            })+
            other => {
                return Err(anyhow!("unsupported dtype {} for {}", other, $ctx.def().op_type))
            }
        }
    };
}

fn binary_prologue(ctx: &OpContext) -> Result<(Tensor, Tensor, Tensor)> {
    let a = ctx.input_tensor(0)?;
    let b = ctx.input_tensor(1)?;
    if a.shape() != b.shape() || a.dtype() != b.dtype() {
        return Err(RunError::ShapeMismatch(format!(
            "{}: inputs disagree: {:?}/{} vs {:?}/{}",
            ctx.def().op_type,
            a.shape(),
            a.dtype(),
            b.shape(),
            b.dtype()
        ))
        .into());
    }
    let out = output_like(ctx, 0, a.dtype(), a.shape(), a.device())?;
    Ok((a, b, out))
}

pub fn add(ctx: &OpContext) -> Result<()> {
    let (a, b, mut out) = binary_prologue(ctx)?;
    binary_elementwise!(ctx, a, b, out, +, [
        f32 => DType::F32, f64 => DType::F64, i32 => DType::I32, i64 => DType::I64
    ]);
    Ok(())
}

pub fn mul(ctx: &OpContext) -> Result<()> {
    let (a, b, mut out) = binary_prologue(ctx)?;
    binary_elementwise!(ctx, a, b, out, *, [
        f32 => DType::F32, f64 => DType::F64, i32 => DType::I32, i64 => DType::I64
    ]);
    Ok(())
}

pub fn scale(ctx: &OpContext) -> Result<()> {
    let input = ctx.input_tensor(0)?;
    let factor = ctx.arg_float("scale", 1.0)?;
    let mut out = output_like(ctx, 0, input.dtype(), input.shape(), input.device())?;
    match input.dtype() {
        DType::F32 => {
            let values = input.as_slice::<f32>()?.to_vec();
            let ov = out.as_mut_slice::<f32>()?;
            for (o, v) in ov.iter_mut().zip(values) {
                *o = v * factor;
            }
        }
        DType::F64 => {
            let values = input.as_slice::<f64>()?.to_vec();
            let ov = out.as_mut_slice::<f64>()?;
            for (o, v) in ov.iter_mut().zip(values) {
                *o = v * factor as f64;
            }
        }
        other => return Err(anyhow!("unsupported dtype {} for scale", other)),
    }
    Ok(())
}

/// Monotonic iteration counter: initializes an i64 scalar to zero on first
/// run, increments afterwards. Enforced in-place when it takes an input.
pub fn iter(ctx: &OpContext) -> Result<()> {
    let blob = ctx.output_blob(0)?;
    let mut guard = blob.lock().expect("blob lock poisoned");
    let initialized = guard
        .get::<Tensor>()
        .ok()
        .map(|t| t.dtype() == DType::I64 && t.len() == 1)
        .unwrap_or(false);
    if !initialized {
        guard.set(Tensor::from_vec(vec![0i64]).with_device(ctx.device()));
        return Ok(());
    }
    let mut tensor = guard.get::<Tensor>()?.clone();
    tensor.as_mut_slice::<i64>()?[0] += 1;
    Ok(())
}

/// Elementwise `input >= value` into a boolean tensor of the same shape.
pub fn ge_scalar(ctx: &OpContext) -> Result<()> {
    let input = ctx.input_tensor(0)?;
    let threshold = ctx.arg_int("value", 0)?;
    let values = input.as_slice::<i64>()?.to_vec();
    let mut out = output_like(ctx, 0, DType::Bool, input.shape(), input.device())?;
    let flags = out.bool_data_mut()?;
    for (flag, v) in flags.iter_mut().zip(values) {
        *flag = (v >= threshold) as u8;
    }
    Ok(())
}
