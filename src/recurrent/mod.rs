//! Time-unrolled execution of a step-net: input aliasing via tensor views,
//! per-timestep scratch workspaces and backward gradient accumulation.

pub mod ops;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::RunError;
use crate::tensor::{DType, Tensor};
use crate::types::DeviceOption;
use crate::workspace::Workspace;

pub use ops::StepWorkspaces;

#[derive(Debug, Clone)]
pub struct Param {
    pub param: String,
    pub grad: String,
    pub acc_grad: String,
}

#[derive(Debug, Clone)]
pub struct RecurrentInput {
    pub state: String,
    pub input: String,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct RecurrentGradient {
    pub param: String,
    pub grad: String,
    pub external_grad: Option<String>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct OffsetAlias {
    pub src: String,
    pub dst: String,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct Scratch {
    pub name: String,
    pub size_per_step: usize,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub internal: String,
    pub external: String,
    pub offset: i64,
    pub window: usize,
}

/// Alias `dst` to a suffix of `src` along the time axis. A negative offset
/// counts from the end; the view spans the remaining timesteps.
pub fn apply_offset_alias(alias: &OffsetAlias, ws: &Workspace) -> Result<()> {
    crate::trace!(
        "aliasing {} to {} at offset {}",
        alias.src,
        alias.dst,
        alias.offset
    );
    let src_blob = ws.require_blob(&alias.src)?;
    let src = src_blob
        .lock()
        .expect("blob lock poisoned")
        .get::<Tensor>()?
        .clone();
    if src.is_empty() {
        return Err(RunError::ShapeMismatch(format!(
            "alias source {} is empty",
            alias.src
        ))
        .into());
    }
    let dim0 = src.dim(0) as i64;
    let start = if alias.offset >= 0 {
        alias.offset
    } else {
        dim0 + alias.offset
    };
    let num = dim0 - start;
    if num < 1 {
        return Err(RunError::ShapeMismatch(format!(
            "alias {} -> {}: invalid number of timesteps {}",
            alias.src, alias.dst, num
        ))
        .into());
    }
    let view = src.view_dim0(start as usize, num as usize)?;
    ws.create_blob(&alias.dst)
        .lock()
        .expect("blob lock poisoned")
        .set(view);
    Ok(())
}

/// Size the state tensor to `(T + 1, B, size)` and copy the initial state
/// into the prefix row.
pub fn initialize_recurrent_input(
    ri: &RecurrentInput,
    seq_len: usize,
    batch: usize,
    ws: &Workspace,
) -> Result<()> {
    let input_blob = ws.require_blob(&ri.input)?;
    let input = input_blob
        .lock()
        .expect("blob lock poisoned")
        .get::<Tensor>()?
        .clone();
    if input.ndim() != 3 || input.dim(0) != 1 || input.dim(1) != batch || input.dim(2) != ri.size {
        return Err(RunError::ShapeMismatch(format!(
            "recurrent input {} has shape {:?}, expected (1, {}, {})",
            ri.input,
            input.shape(),
            batch,
            ri.size
        ))
        .into());
    }
    let mut state = Tensor::new(
        input.dtype(),
        vec![seq_len + 1, batch, ri.size],
        input.device(),
    );
    state.raw_bytes_mut()[..input.nbytes()].copy_from_slice(input.raw_bytes());
    ws.create_blob(&ri.state)
        .lock()
        .expect("blob lock poisoned")
        .set(state);
    Ok(())
}

/// Allocate a `(T, B, size_per_step)` scratch tensor in the shared
/// sub-workspace.
pub fn initialize_scratch(scratch: &Scratch, seq_len: usize, batch: usize, ws: &Workspace) {
    crate::trace!("initializing scratch {}", scratch.name);
    let tensor = Tensor::new(
        DType::F32,
        vec![seq_len, batch, scratch.size_per_step],
        DeviceOption::cpu(),
    );
    ws.create_blob(&scratch.name)
        .lock()
        .expect("blob lock poisoned")
        .set(tensor);
}

/// Bind `internal` to the window `[t + offset, t + offset + window)` of
/// `external`. The view aliases the external bytes.
pub fn apply_link(link: &Link, t: usize, ws: &Workspace) -> Result<()> {
    crate::trace!(
        "linking {} to {} at offset {}",
        link.internal,
        link.external,
        link.offset
    );
    let external_blob = ws.require_blob(&link.external)?;
    let external = external_blob
        .lock()
        .expect("blob lock poisoned")
        .get::<Tensor>()?
        .clone();
    if external.is_empty() {
        return Err(RunError::ShapeMismatch(format!(
            "link external {} is empty",
            link.external
        ))
        .into());
    }
    let start = t as i64 + link.offset;
    if start < 0 {
        return Err(RunError::ShapeMismatch(format!(
            "link {}: negative start {}",
            link.internal, start
        ))
        .into());
    }
    let view = external.view_dim0(start as usize, link.window)?;
    ws.create_blob(&link.internal)
        .lock()
        .expect("blob lock poisoned")
        .set(view);
    Ok(())
}

/// Write the current timestep into its scalar blob.
pub fn set_timestep(ws: &Workspace, name: &str, t: usize) {
    ws.create_blob(name)
        .lock()
        .expect("blob lock poisoned")
        .set(Tensor::from_vec(vec![t as i32]));
}

/// dst += src, elementwise f32.
pub fn accumulate(dst: &mut Tensor, src: &Tensor) -> Result<()> {
    if dst.shape() != src.shape() {
        return Err(RunError::ShapeMismatch(format!(
            "accumulate: {:?} vs {:?}",
            dst.shape(),
            src.shape()
        ))
        .into());
    }
    let values = src.as_slice::<f32>()?.to_vec();
    let out = dst.as_mut_slice::<f32>()?;
    for (o, v) in out.iter_mut().zip(values) {
        *o += v;
    }
    Ok(())
}

/// dst[dst_row] += src[src_row] along axis 0, elementwise f32.
pub fn accumulate_rows(
    dst: &mut Tensor,
    dst_row: usize,
    src: &Tensor,
    src_row: usize,
) -> Result<()> {
    let row_elems = dst.size_from_dim(1);
    if src.size_from_dim(1) != row_elems {
        return Err(RunError::ShapeMismatch(format!(
            "accumulate_rows: per-step sizes differ: {:?} vs {:?}",
            dst.shape(),
            src.shape()
        ))
        .into());
    }
    let values = src.view_dim0(src_row, 1)?.as_slice::<f32>()?.to_vec();
    let mut dst_view = dst.view_dim0(dst_row, 1)?;
    let out = dst_view.as_mut_slice::<f32>()?;
    for (o, v) in out.iter_mut().zip(values) {
        *o += v;
    }
    Ok(())
}

/// Fetch a blob's tensor, cloning the handle (shared storage).
pub fn blob_tensor(ws: &Workspace, name: &str) -> Result<Tensor> {
    let blob = ws.require_blob(name)?;
    let guard = blob.lock().expect("blob lock poisoned");
    Ok(guard.get::<Tensor>()?.clone())
}

/// Run or lazily construct the step net inside a step workspace.
pub fn run_step_net(
    ws: &Arc<Workspace>,
    def: &crate::graph::NetDef,
) -> Result<()> {
    let net = match ws.get_net(&def.name) {
        Some(net) => net,
        None => ws.create_net(def)?,
    };
    net.run()
}

pub(crate) fn require_simple_step_net(def: &crate::graph::NetDef) -> Result<()> {
    if def.name.is_empty() {
        return Err(anyhow!(RunError::InvalidNet("step net must have a name".into())));
    }
    if def.net_type != "simple" {
        return Err(anyhow!(RunError::InvalidNet(format!(
            "step net {} must be simple, got {}",
            def.name, def.net_type
        ))));
    }
    Ok(())
}
