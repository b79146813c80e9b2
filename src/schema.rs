//! Declarative per-op-name metadata consulted at net construction time:
//! arity bounds, in-place pair policy, output-count calculation and the
//! shape / cost / device inference callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::error::RunError;
use crate::graph::{NetDef, OperatorDef};
use crate::registry::Registry;
use crate::types::DeviceOption;

pub const UNBOUNDED_ARITY: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCost {
    pub flops: u64,
    pub bytes_moved: u64,
}

type ArityPred = fn(usize) -> bool;
type PairPred = fn(usize, usize) -> bool;
type OutputCalc = fn(usize) -> Option<usize>;
type ShapeInference = fn(&OperatorDef, &[Vec<usize>]) -> Result<Vec<Vec<usize>>>;
type CostInference = fn(&OperatorDef, &[Vec<usize>]) -> OpCost;
type DeviceInference = fn(&OperatorDef) -> (Vec<DeviceOption>, Vec<DeviceOption>);

/// Schema for one op name.
pub struct OpSchema {
    min_input: usize,
    max_input: usize,
    min_output: usize,
    max_output: usize,
    num_inputs_allowed: Option<ArityPred>,
    num_outputs_allowed: Option<ArityPred>,
    num_inputs_outputs_allowed: Option<PairPred>,
    calculate_output: Option<OutputCalc>,
    inplace_allowed: Option<PairPred>,
    inplace_enforced: Option<PairPred>,
    shape_inference: Option<ShapeInference>,
    cost_inference: Option<CostInference>,
    device_inference: Option<DeviceInference>,
}

impl Default for OpSchema {
    fn default() -> Self {
        Self {
            min_input: 0,
            max_input: UNBOUNDED_ARITY,
            min_output: 0,
            max_output: UNBOUNDED_ARITY,
            num_inputs_allowed: None,
            num_outputs_allowed: None,
            num_inputs_outputs_allowed: None,
            calculate_output: None,
            inplace_allowed: None,
            inplace_enforced: None,
            shape_inference: None,
            cost_inference: None,
            device_inference: None,
        }
    }
}

impl OpSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_inputs(mut self, n: usize) -> Self {
        self.min_input = n;
        self.max_input = n;
        self
    }

    pub fn num_inputs_range(mut self, min: usize, max: usize) -> Self {
        self.min_input = min;
        self.max_input = max;
        self
    }

    pub fn inputs_allowed(mut self, pred: ArityPred) -> Self {
        self.num_inputs_allowed = Some(pred);
        self
    }

    pub fn num_outputs(mut self, n: usize) -> Self {
        self.min_output = n;
        self.max_output = n;
        self
    }

    pub fn num_outputs_range(mut self, min: usize, max: usize) -> Self {
        self.min_output = min;
        self.max_output = max;
        self
    }

    pub fn outputs_allowed(mut self, pred: ArityPred) -> Self {
        self.num_outputs_allowed = Some(pred);
        self
    }

    pub fn inputs_outputs_allowed(mut self, pred: PairPred) -> Self {
        self.num_inputs_outputs_allowed = Some(pred);
        self
    }

    pub fn output_calculator(mut self, calc: OutputCalc) -> Self {
        self.calculate_output = Some(calc);
        self
    }

    pub fn same_number_of_outputs(self) -> Self {
        self.output_calculator(|n| Some(n))
    }

    pub fn allow_inplace(mut self, pred: PairPred) -> Self {
        self.inplace_allowed = Some(pred);
        self
    }

    pub fn enforce_inplace(mut self, pred: PairPred) -> Self {
        self.inplace_enforced = Some(pred);
        self
    }

    pub fn shape_inference(mut self, infer: ShapeInference) -> Self {
        self.shape_inference = Some(infer);
        self
    }

    pub fn cost_inference(mut self, infer: CostInference) -> Self {
        self.cost_inference = Some(infer);
        self
    }

    pub fn device_inference(mut self, infer: DeviceInference) -> Self {
        self.device_inference = Some(infer);
        self
    }

    fn inplace_ok(&self, in_idx: usize, out_idx: usize) -> bool {
        self.inplace_allowed.map(|p| p(in_idx, out_idx)).unwrap_or(false)
            || self.inplace_enforced.map(|p| p(in_idx, out_idx)).unwrap_or(false)
    }

    /// Verify an operator definition against this schema.
    pub fn verify(&self, def: &OperatorDef) -> Result<()> {
        let violation = |msg: String| -> anyhow::Error {
            RunError::SchemaViolation(format!("op {}: {}", def.op_type, msg)).into()
        };

        let num_in = def.input.len();
        let num_out = def.output.len();
        if num_in < self.min_input || num_in > self.max_input {
            return Err(violation(format!(
                "input count {} not in [{}, {}]",
                num_in, self.min_input, self.max_input
            )));
        }
        if let Some(pred) = self.num_inputs_allowed {
            if !pred(num_in) {
                return Err(violation(format!("input count {} not allowed", num_in)));
            }
        }
        if num_out < self.min_output || num_out > self.max_output {
            return Err(violation(format!(
                "output count {} not in [{}, {}]",
                num_out, self.min_output, self.max_output
            )));
        }
        if let Some(pred) = self.num_outputs_allowed {
            if !pred(num_out) {
                return Err(violation(format!("output count {} not allowed", num_out)));
            }
        }
        if let Some(pred) = self.num_inputs_outputs_allowed {
            if !pred(num_in, num_out) {
                return Err(violation(format!(
                    "input/output combination ({}, {}) not allowed",
                    num_in, num_out
                )));
            }
        }
        if let Some(calc) = self.calculate_output {
            if let Some(expected) = calc(num_in) {
                if num_out != expected {
                    return Err(violation(format!(
                        "output count {} does not match computed count {}",
                        num_out, expected
                    )));
                }
            }
        }
        for (in_idx, input) in def.input.iter().enumerate() {
            for (out_idx, output) in def.output.iter().enumerate() {
                if input == output && !self.inplace_ok(in_idx, out_idx) {
                    return Err(violation(format!(
                        "input {} and output {} ({}) are in-place but the op does not opt in",
                        in_idx, out_idx, input
                    )));
                }
                if input != output
                    && self
                        .inplace_enforced
                        .map(|p| p(in_idx, out_idx))
                        .unwrap_or(false)
                {
                    return Err(violation(format!(
                        "input {} ({}) and output {} ({}) must be in-place",
                        in_idx, input, out_idx, output
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `in_idx`/`out_idx` may legitimately share a blob.
    pub fn allows_inplace_pair(&self, in_idx: usize, out_idx: usize) -> bool {
        self.inplace_ok(in_idx, out_idx)
    }

    pub fn infer_shapes(
        &self,
        def: &OperatorDef,
        input_shapes: &[Vec<usize>],
    ) -> Option<Result<Vec<Vec<usize>>>> {
        self.shape_inference.map(|infer| infer(def, input_shapes))
    }

    pub fn infer_cost(&self, def: &OperatorDef, input_shapes: &[Vec<usize>]) -> Option<OpCost> {
        self.cost_inference.map(|infer| infer(def, input_shapes))
    }

    /// Device placement of inputs and outputs; defaults to the op's own
    /// device for every binding.
    pub fn infer_devices(&self, def: &OperatorDef) -> (Vec<DeviceOption>, Vec<DeviceOption>) {
        if let Some(infer) = self.device_inference {
            return infer(def);
        }
        let device = def.effective_device(None);
        (
            vec![device; def.input.len()],
            vec![device; def.output.len()],
        )
    }
}

static SCHEMA_REGISTRY: Lazy<Registry<String, Arc<OpSchema>>> =
    Lazy::new(|| Registry::new("op schema"));

pub fn register_schema(name: impl Into<String>, schema: OpSchema) {
    SCHEMA_REGISTRY.register(name.into(), Arc::new(schema));
}

pub fn schema(name: &str) -> Option<Arc<OpSchema>> {
    crate::ops::ensure_builtin_ops();
    SCHEMA_REGISTRY.get(&name.to_string())
}

/// Fold shape inference over a net in declaration order, seeding with any
/// externally known shapes. Ops without a schema or inference callback are
/// skipped; their outputs simply stay unknown.
pub fn infer_blob_shapes(
    net: &NetDef,
    seed: &HashMap<String, Vec<usize>>,
) -> Result<HashMap<String, Vec<usize>>> {
    let mut shapes = seed.clone();
    for op in &net.op {
        let Some(schema) = schema(&op.op_type) else {
            continue;
        };
        let mut input_shapes = Vec::with_capacity(op.input.len());
        let mut known = true;
        for input in &op.input {
            match shapes.get(input) {
                Some(shape) => input_shapes.push(shape.clone()),
                None => {
                    known = false;
                    break;
                }
            }
        }
        if !known {
            continue;
        }
        let Some(inferred) = schema.infer_shapes(op, &input_shapes) else {
            continue;
        };
        let inferred = inferred?;
        for (name, shape) in op.output.iter().zip(inferred) {
            shapes.insert(name.clone(), shape);
        }
    }
    Ok(shapes)
}
