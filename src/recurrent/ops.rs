//! The recurrent-network forward and backward kernels.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use crate::graph::{ArgValue, NetDef, OperatorDef};
use crate::operator::{Kernel, OpContext};
use crate::workspace::Workspace;

use super::{
    accumulate, accumulate_rows, apply_link, apply_offset_alias, blob_tensor,
    initialize_recurrent_input, initialize_scratch, require_simple_step_net, run_step_net,
    set_timestep, Link, OffsetAlias, Param, RecurrentGradient, RecurrentInput, Scratch,
};

/// Forward pass stash: the shared sub-workspace plus the per-timestep step
/// workspaces the backward pass replays.
#[derive(Clone)]
pub struct StepWorkspaces {
    pub shared: Arc<Workspace>,
    pub steps: Vec<Arc<Workspace>>,
}

fn def_strs(def: &OperatorDef, name: &str) -> Vec<String> {
    match def.find_arg(name) {
        Some(ArgValue::Strs(values)) => values.clone(),
        _ => Vec::new(),
    }
}

fn def_ints(def: &OperatorDef, name: &str) -> Vec<i64> {
    match def.find_arg(name) {
        Some(ArgValue::Ints(values)) => values.clone(),
        _ => Vec::new(),
    }
}

fn def_int(def: &OperatorDef, name: &str, default: i64) -> i64 {
    match def.find_arg(name) {
        Some(ArgValue::Int(value)) => *value,
        _ => default,
    }
}

fn def_str(def: &OperatorDef, name: &str, default: &str) -> String {
    match def.find_arg(name) {
        Some(ArgValue::Str(value)) => value.clone(),
        _ => default.to_string(),
    }
}

fn def_net(def: &OperatorDef, name: &str) -> Result<NetDef> {
    match def.find_arg(name) {
        Some(ArgValue::Net(net)) => Ok(net.clone()),
        _ => Err(anyhow!(
            "op {}: missing required net argument {}",
            def.op_type,
            name
        )),
    }
}

fn extract_links(
    def: &OperatorDef,
    internal_arg: &str,
    external_arg: &str,
    offset_arg: &str,
    window_arg: &str,
) -> Result<Vec<Link>> {
    let internal = def_strs(def, internal_arg);
    let external = def_strs(def, external_arg);
    let offset = def_ints(def, offset_arg);
    let window = def_ints(def, window_arg);
    if internal.len() != offset.len() || external.len() != offset.len() {
        return Err(anyhow!(
            "link argument lengths mismatch: {}/{}/{}",
            internal_arg,
            external_arg,
            offset_arg
        ));
    }
    Ok(internal
        .into_iter()
        .zip(external)
        .zip(offset.iter().copied())
        .enumerate()
        .map(|(i, ((internal, external), offset))| Link {
            internal,
            external,
            offset,
            window: window.get(i).map(|&w| w as usize).unwrap_or(1),
        })
        .collect())
}

fn extract_aliases(def: &OperatorDef, prefix: &str) -> Result<Vec<OffsetAlias>> {
    let src = def_strs(def, &format!("{}alias_src", prefix));
    let dst = def_strs(def, &format!("{}alias_dst", prefix));
    let offset = def_ints(def, &format!("{}alias_offset", prefix));
    if src.len() != offset.len() || dst.len() != offset.len() {
        return Err(anyhow!("alias argument lengths mismatch"));
    }
    Ok(src
        .into_iter()
        .zip(dst)
        .zip(offset)
        .map(|((src, dst), offset)| OffsetAlias { src, dst, offset })
        .collect())
}

fn extract_scratches(def: &OperatorDef, names_arg: &str) -> Result<Vec<Scratch>> {
    let names = def_strs(def, names_arg);
    let sizes = def_ints(def, "scratch_sizes");
    if names.len() != sizes.len() {
        return Err(anyhow!("{} and scratch_sizes mismatch", names_arg));
    }
    Ok(names
        .into_iter()
        .zip(sizes)
        .map(|(name, size)| Scratch {
            name,
            size_per_step: size as usize,
        })
        .collect())
}

pub struct RecurrentNetworkKernel {
    step_net_def: NetDef,
    timestep: String,
    recurrent_inputs: Vec<RecurrentInput>,
    links: Vec<Link>,
    aliases: Vec<OffsetAlias>,
    scratches: Vec<Scratch>,
    forward_only: bool,
    step_workspaces_name: String,
    shared_ws: Arc<Workspace>,
    /// Bounded ring of step workspaces cycled in forward-only mode; its
    /// size is the achievable time-parallelism.
    ring: Mutex<Vec<Arc<Workspace>>>,
    ring_size: usize,
}

impl RecurrentNetworkKernel {
    pub fn create(def: &OperatorDef, ws: &Arc<Workspace>) -> Result<Box<dyn Kernel>> {
        let step_net_def = def_net(def, "step_net")?;
        require_simple_step_net(&step_net_def)?;

        let states = def_strs(def, "recurrent_states");
        let inputs = def_strs(def, "recurrent_inputs");
        let sizes = def_ints(def, "recurrent_sizes");
        if states.len() != inputs.len() || sizes.len() != inputs.len() {
            return Err(anyhow!("recurrent states/inputs/sizes mismatch"));
        }
        let recurrent_inputs = states
            .into_iter()
            .zip(inputs)
            .zip(sizes)
            .map(|((state, input), size)| {
                // States outlive the unroll; they are created in the op's
                // workspace where aliases and consumers resolve them.
                ws.create_blob(&state);
                RecurrentInput {
                    state,
                    input,
                    size: size as usize,
                }
            })
            .collect();

        let scratches = extract_scratches(def, "scratch")?;
        let shared_ws = Workspace::with_parent(ws);
        for scratch in &scratches {
            shared_ws.create_local_blob(&scratch.name);
        }

        Ok(Box::new(RecurrentNetworkKernel {
            step_net_def,
            timestep: def_str(def, "timestep", "timestep"),
            recurrent_inputs,
            links: extract_links(def, "link_internal", "link_external", "link_offset", "link_window")?,
            aliases: extract_aliases(def, "")?,
            scratches,
            forward_only: def_int(def, "forward_only", 0) != 0,
            step_workspaces_name: def_str(def, "step_workspaces", "step_workspaces"),
            shared_ws,
            ring: Mutex::new(Vec::new()),
            ring_size: def_int(def, "num_step_workspaces", 2).max(1) as usize,
        }))
    }

    fn step_workspaces(&self, seq_len: usize) -> Vec<Arc<Workspace>> {
        if self.forward_only {
            let mut ring = self.ring.lock().expect("ring lock poisoned");
            while ring.len() < self.ring_size.min(seq_len.max(1)) {
                ring.push(Workspace::with_parent(&self.shared_ws));
            }
            (0..seq_len)
                .map(|t| Arc::clone(&ring[t % ring.len().max(1)]))
                .collect()
        } else {
            // The backward pass replays each timestep, so every step gets
            // its own workspace, allocated on demand.
            (0..seq_len)
                .map(|_| Workspace::with_parent(&self.shared_ws))
                .collect()
        }
    }
}

impl Kernel for RecurrentNetworkKernel {
    fn run(&self, ctx: &OpContext) -> Result<()> {
        let sequence = ctx.input_tensor(0)?;
        if sequence.ndim() < 2 {
            return Err(anyhow!(
                "recurrent_network: input sequence must be at least (T, B), got {:?}",
                sequence.shape()
            ));
        }
        let seq_len = sequence.dim(0);
        let batch = sequence.dim(1);
        let op_ws = ctx.workspace()?;

        for ri in &self.recurrent_inputs {
            initialize_recurrent_input(ri, seq_len, batch, &op_ws)?;
        }
        for scratch in &self.scratches {
            initialize_scratch(scratch, seq_len, batch, &self.shared_ws);
        }

        let step_wss = self.step_workspaces(seq_len);
        for (t, sw) in step_wss.iter().enumerate() {
            for link in &self.links {
                apply_link(link, t, sw)?;
            }
            set_timestep(sw, &self.timestep, t);
            run_step_net(sw, &self.step_net_def)
                .with_context(|| format!("recurrent step {} failed", t))?;
        }

        for alias in &self.aliases {
            apply_offset_alias(alias, &op_ws)?;
        }

        if !self.forward_only {
            op_ws
                .create_blob(&self.step_workspaces_name)
                .lock()
                .expect("blob lock poisoned")
                .set(StepWorkspaces {
                    shared: Arc::clone(&self.shared_ws),
                    steps: step_wss,
                });
        }
        Ok(())
    }
}

pub struct RecurrentNetworkGradientKernel {
    backward_step_net_def: NetDef,
    timestep: String,
    links: Vec<Link>,
    params: Vec<Param>,
    recurrent_gradients: Vec<RecurrentGradient>,
    aliases: Vec<OffsetAlias>,
    scratches: Vec<Scratch>,
    step_workspaces_name: String,
}

impl RecurrentNetworkGradientKernel {
    pub fn create(def: &OperatorDef, _ws: &Arc<Workspace>) -> Result<Box<dyn Kernel>> {
        let backward_step_net_def = def_net(def, "backward_step_net")?;
        require_simple_step_net(&backward_step_net_def)?;

        let mut links = extract_links(
            def,
            "link_internal",
            "link_external",
            "link_offset",
            "link_window",
        )?;
        links.extend(extract_links(
            def,
            "backward_link_internal",
            "backward_link_external",
            "backward_link_offset",
            "backward_link_window",
        )?);

        let param = def_strs(def, "param");
        let param_gradient = def_strs(def, "param_gradient");
        if param.len() != param_gradient.len() {
            return Err(anyhow!("param and param_gradient mismatch"));
        }
        let params = param
            .into_iter()
            .zip(param_gradient)
            .map(|(param, grad)| Param {
                acc_grad: format!("{}_acc", grad),
                param,
                grad,
            })
            .collect();

        let recurrent_gradients = def_strs(def, "recurrent_states")
            .into_iter()
            .enumerate()
            .map(|(i, state)| RecurrentGradient {
                grad: format!("{}_grad", state),
                external_grad: if i == 0 {
                    def.input.first().cloned()
                } else {
                    None
                },
                param: state,
                offset: 1,
            })
            .collect();

        Ok(Box::new(RecurrentNetworkGradientKernel {
            backward_step_net_def,
            timestep: def_str(def, "timestep", "timestep"),
            links,
            params,
            recurrent_gradients,
            aliases: extract_aliases(def, "backward_")?,
            scratches: extract_scratches(def, "backward_scratch")?,
            step_workspaces_name: def_str(def, "step_workspaces", "step_workspaces"),
        }))
    }
}

impl Kernel for RecurrentNetworkGradientKernel {
    fn run(&self, ctx: &OpContext) -> Result<()> {
        let outer_grad = ctx.input_tensor(0)?;
        let seq_len = outer_grad.dim(0);
        let batch = outer_grad.dim(1);
        let op_ws = ctx.workspace()?;

        let stash: StepWorkspaces = {
            let blob = op_ws.require_blob(&self.step_workspaces_name)?;
            let guard = blob.lock().expect("blob lock poisoned");
            guard.get::<StepWorkspaces>()?.clone()
        };
        if stash.steps.len() != seq_len {
            return Err(anyhow!(
                "recurrent_network_gradient: {} saved step workspaces for sequence length {}",
                stash.steps.len(),
                seq_len
            ));
        }

        for p in &self.params {
            let param = blob_tensor(&op_ws, &p.param)?;
            // Separate allocations: the accumulator must not alias the
            // per-step gradient it sums.
            op_ws
                .create_blob(&p.grad)
                .lock()
                .expect("blob lock poisoned")
                .set(crate::tensor::Tensor::new(
                    param.dtype(),
                    param.shape().to_vec(),
                    param.device(),
                ));
            op_ws
                .create_blob(&p.acc_grad)
                .lock()
                .expect("blob lock poisoned")
                .set(crate::tensor::Tensor::new(
                    param.dtype(),
                    param.shape().to_vec(),
                    param.device(),
                ));
        }

        for rg in &self.recurrent_gradients {
            let state = blob_tensor(&op_ws, &rg.param)?;
            if state.ndim() != 3 {
                return Err(anyhow!(
                    "recurrent state {} must be rank 3, got {:?}",
                    rg.param,
                    state.shape()
                ));
            }
            let zero = crate::tensor::Tensor::new(
                state.dtype(),
                state.shape().to_vec(),
                state.device(),
            );
            op_ws
                .create_blob(&rg.grad)
                .lock()
                .expect("blob lock poisoned")
                .set(zero);
        }

        for scratch in &self.scratches {
            initialize_scratch(scratch, seq_len, batch, &stash.shared);
        }

        for t in (0..seq_len).rev() {
            crate::trace!("running backward step {}", t);
            for rg in &self.recurrent_gradients {
                let Some(external) = &rg.external_grad else {
                    continue;
                };
                let mut grad = blob_tensor(&op_ws, &rg.grad)?;
                let outer = blob_tensor(&op_ws, external)?;
                accumulate_rows(&mut grad, t + rg.offset, &outer, t)?;
            }

            let sw = &stash.steps[t];
            for link in &self.links {
                apply_link(link, t, sw)?;
            }
            set_timestep(sw, &self.timestep, t);
            run_step_net(sw, &self.backward_step_net_def)
                .with_context(|| format!("recurrent backward step {} failed", t))?;

            for p in &self.params {
                let grad = blob_tensor(&op_ws, &p.grad)?;
                let mut acc = blob_tensor(&op_ws, &p.acc_grad)?;
                accumulate(&mut acc, &grad)?;
            }
        }

        for alias in &self.aliases {
            apply_offset_alias(alias, &op_ws)?;
        }

        // Swap accumulated totals into the gradient blobs so downstream
        // consumers read the sums.
        for p in &self.params {
            let grad_blob = op_ws.require_blob(&p.grad)?;
            let acc_blob = op_ws.require_blob(&p.acc_grad)?;
            let mut grad_guard = grad_blob.lock().expect("blob lock poisoned");
            let mut acc_guard = acc_blob.lock().expect("blob lock poisoned");
            std::mem::swap(&mut *grad_guard, &mut *acc_guard);
        }
        Ok(())
    }
}
