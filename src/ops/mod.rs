//! Builtin CPU kernels and their schemas. Everything funnels through
//! `ensure_builtin_ops`, called lazily by the kernel and schema lookups.

mod load_save;
mod math;

use std::sync::{Arc, Once};

use anyhow::Result;

use crate::dataset::ops as dataset_ops;
use crate::graph::{ArgValue, OperatorDef};
use crate::operator::{register_kernel, register_kernel_fn};
use crate::recurrent::ops::{RecurrentNetworkGradientKernel, RecurrentNetworkKernel};
use crate::schema::{register_schema, OpCost, OpSchema, UNBOUNDED_ARITY};
use crate::types::DeviceKind;

static BUILTIN_OPS: Once = Once::new();

fn fill_shape(def: &OperatorDef, _inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    let shape = match def.find_arg("shape") {
        Some(ArgValue::Ints(dims)) => dims.iter().map(|&d| d as usize).collect(),
        _ => Vec::new(),
    };
    Ok(vec![shape])
}

fn first_input_shape(_def: &OperatorDef, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    Ok(vec![inputs[0].clone()])
}

fn elementwise_cost(_def: &OperatorDef, inputs: &[Vec<usize>]) -> OpCost {
    let elems: usize = inputs.first().map(|s| s.iter().product()).unwrap_or(0);
    OpCost {
        flops: elems as u64,
        bytes_moved: (elems * 3 * 4) as u64,
    }
}

pub fn ensure_builtin_ops() {
    BUILTIN_OPS.call_once(|| {
        register_schemas();
        register_cpu_kernels();
    });
}

fn register_schemas() {
    register_schema(
        "fill",
        OpSchema::new()
            .num_inputs(0)
            .num_outputs(1)
            .shape_inference(fill_shape),
    );
    register_schema(
        "copy",
        OpSchema::new()
            .num_inputs(1)
            .num_outputs(1)
            .shape_inference(first_input_shape),
    );
    register_schema(
        "add",
        OpSchema::new()
            .num_inputs(2)
            .num_outputs(1)
            .allow_inplace(|_, out| out == 0)
            .shape_inference(first_input_shape)
            .cost_inference(elementwise_cost),
    );
    register_schema(
        "mul",
        OpSchema::new()
            .num_inputs(2)
            .num_outputs(1)
            .allow_inplace(|_, out| out == 0)
            .shape_inference(first_input_shape)
            .cost_inference(elementwise_cost),
    );
    register_schema(
        "scale",
        OpSchema::new()
            .num_inputs(1)
            .num_outputs(1)
            .allow_inplace(|input, out| input == 0 && out == 0)
            .shape_inference(first_input_shape)
            .cost_inference(elementwise_cost),
    );
    register_schema(
        "iter",
        OpSchema::new()
            .num_inputs_range(0, 1)
            .num_outputs(1)
            .enforce_inplace(|input, out| input == 0 && out == 0),
    );
    register_schema(
        "ge_scalar",
        OpSchema::new()
            .num_inputs(1)
            .num_outputs(1)
            .shape_inference(first_input_shape),
    );

    register_schema("create_tree_cursor", OpSchema::new().num_inputs(0).num_outputs(1));
    register_schema("reset_cursor", OpSchema::new().num_inputs(1).num_outputs(0));
    register_schema(
        "read_next_batch",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs_range(1, UNBOUNDED_ARITY),
    );
    register_schema(
        "compute_offset",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs(1),
    );
    register_schema(
        "sort_and_shuffle",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs(1),
    );
    register_schema(
        "read_random_batch",
        OpSchema::new()
            .num_inputs_range(3, UNBOUNDED_ARITY)
            .num_outputs_range(1, UNBOUNDED_ARITY),
    );
    register_schema(
        "check_dataset_consistency",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs(0),
    );
    register_schema(
        "append",
        OpSchema::new()
            .num_inputs(2)
            .num_outputs(1)
            .enforce_inplace(|input, out| input == 0 && out == 0),
    );
    register_schema(
        "atomic_append",
        OpSchema::new()
            .num_inputs_range(3, UNBOUNDED_ARITY)
            .num_outputs_range(1, UNBOUNDED_ARITY)
            .allow_inplace(|input, out| input == out + 1),
    );
    register_schema("create_mutex", OpSchema::new().num_inputs(0).num_outputs(1));

    register_schema(
        "save",
        OpSchema::new().num_inputs_range(1, UNBOUNDED_ARITY).num_outputs(0),
    );
    register_schema(
        "load",
        OpSchema::new()
            .num_inputs(0)
            .num_outputs_range(0, UNBOUNDED_ARITY),
    );
    register_schema(
        "checkpoint",
        OpSchema::new().num_inputs_range(1, UNBOUNDED_ARITY).num_outputs(0),
    );

    register_schema(
        "recurrent_network",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs_range(1, UNBOUNDED_ARITY),
    );
    register_schema(
        "recurrent_network_gradient",
        OpSchema::new()
            .num_inputs_range(1, UNBOUNDED_ARITY)
            .num_outputs_range(0, UNBOUNDED_ARITY),
    );
}

fn register_cpu_kernels() {
    let cpu = DeviceKind::Cpu;
    register_kernel_fn("fill", cpu, math::fill);
    register_kernel_fn("copy", cpu, math::copy);
    register_kernel_fn("add", cpu, math::add);
    register_kernel_fn("mul", cpu, math::mul);
    register_kernel_fn("scale", cpu, math::scale);
    register_kernel_fn("iter", cpu, math::iter);
    register_kernel_fn("ge_scalar", cpu, math::ge_scalar);

    register_kernel_fn("create_tree_cursor", cpu, dataset_ops::create_tree_cursor);
    register_kernel_fn("reset_cursor", cpu, dataset_ops::reset_cursor);
    register_kernel_fn("read_next_batch", cpu, dataset_ops::read_next_batch);
    register_kernel_fn("compute_offset", cpu, dataset_ops::compute_offset);
    register_kernel_fn("sort_and_shuffle", cpu, dataset_ops::sort_and_shuffle);
    register_kernel_fn("read_random_batch", cpu, dataset_ops::read_random_batch);
    register_kernel_fn(
        "check_dataset_consistency",
        cpu,
        dataset_ops::check_dataset_consistency,
    );
    register_kernel_fn("append", cpu, dataset_ops::append);
    register_kernel_fn("atomic_append", cpu, dataset_ops::atomic_append);
    register_kernel_fn("create_mutex", cpu, dataset_ops::create_mutex);

    register_kernel_fn("save", cpu, load_save::save);
    register_kernel_fn("load", cpu, load_save::load);
    register_kernel_fn("checkpoint", cpu, load_save::checkpoint);

    register_kernel(
        "recurrent_network",
        cpu,
        Arc::new(RecurrentNetworkKernel::create),
    );
    register_kernel(
        "recurrent_network_gradient",
        cpu,
        Arc::new(RecurrentNetworkGradientKernel::create),
    );
}
