use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::blob::SharedBlob;
use crate::error::RunError;
use crate::graph::{ArgValue, NetDef, OperatorDef};
use crate::registry::{KernelKey, Registry};
use crate::schema;
use crate::tensor::Tensor;
use crate::types::{DeviceKind, DeviceOption};
use crate::workspace::Workspace;

/// One op kernel bound to a device family. `run` must either complete the
/// work or enqueue it on the op's device stream without blocking; host
/// kernels simply complete inline.
pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &OpContext) -> Result<()>;
}

struct FnKernel(fn(&OpContext) -> Result<()>);

impl Kernel for FnKernel {
    fn run(&self, ctx: &OpContext) -> Result<()> {
        self.0(ctx)
    }
}

pub type KernelFactory =
    Arc<dyn Fn(&OperatorDef, &Arc<Workspace>) -> Result<Box<dyn Kernel>> + Send + Sync>;

static KERNEL_REGISTRY: Lazy<Registry<KernelKey, KernelFactory>> =
    Lazy::new(|| Registry::new("kernel"));

/// Register a kernel factory for `(op name, device kind)`.
pub fn register_kernel(name: impl Into<String>, device: DeviceKind, factory: KernelFactory) {
    KERNEL_REGISTRY.register(KernelKey::new(name, device), factory);
}

/// Register a stateless kernel function.
pub fn register_kernel_fn(
    name: impl Into<String>,
    device: DeviceKind,
    kernel: fn(&OpContext) -> Result<()>,
) {
    register_kernel(
        name,
        device,
        Arc::new(move |_, _| Ok(Box::new(FnKernel(kernel)) as Box<dyn Kernel>)),
    );
}

pub fn has_kernel(name: &str, device: DeviceKind) -> bool {
    crate::ops::ensure_builtin_ops();
    KERNEL_REGISTRY.has(&KernelKey::new(name, device))
}

fn kernel_factory(name: &str, device: DeviceKind) -> Option<KernelFactory> {
    crate::ops::ensure_builtin_ops();
    KERNEL_REGISTRY.get(&KernelKey::new(name, device))
}

/// Execution context handed to a kernel: the definition, the device binding
/// and the resolved input/output blob handles.
pub struct OpContext {
    def: OperatorDef,
    device: DeviceOption,
    inputs: Vec<SharedBlob>,
    outputs: Vec<SharedBlob>,
    ws: Weak<Workspace>,
}

impl OpContext {
    pub fn def(&self) -> &OperatorDef {
        &self.def
    }

    pub fn device(&self) -> DeviceOption {
        self.device
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_blob(&self, idx: usize) -> Result<&SharedBlob> {
        self.inputs
            .get(idx)
            .ok_or_else(|| anyhow!("op {}: no input {}", self.def.op_type, idx))
    }

    pub fn output_blob(&self, idx: usize) -> Result<&SharedBlob> {
        self.outputs
            .get(idx)
            .ok_or_else(|| anyhow!("op {}: no output {}", self.def.op_type, idx))
    }

    /// Clone the tensor held by input `idx`. The clone shares storage.
    pub fn input_tensor(&self, idx: usize) -> Result<Tensor> {
        let blob = self.input_blob(idx)?;
        let guard = blob.lock().expect("blob lock poisoned");
        Ok(guard.get::<Tensor>()?.clone())
    }

    /// Clone a typed non-tensor payload out of input `idx`.
    pub fn input_value<T: Clone + 'static>(&self, idx: usize) -> Result<T> {
        let blob = self.input_blob(idx)?;
        let guard = blob.lock().expect("blob lock poisoned");
        Ok(guard.get::<T>()?.clone())
    }

    pub fn output_tensor(&self, idx: usize) -> Result<Tensor> {
        let blob = self.output_blob(idx)?;
        let guard = blob.lock().expect("blob lock poisoned");
        Ok(guard.get::<Tensor>()?.clone())
    }

    pub fn set_output_tensor(&self, idx: usize, tensor: Tensor) -> Result<()> {
        let blob = self.output_blob(idx)?;
        blob.lock().expect("blob lock poisoned").set(tensor);
        Ok(())
    }

    pub fn set_output_value<T: Send + 'static>(&self, idx: usize, value: T) -> Result<()> {
        let blob = self.output_blob(idx)?;
        blob.lock().expect("blob lock poisoned").set(value);
        Ok(())
    }

    pub fn workspace(&self) -> Result<Arc<Workspace>> {
        self.ws
            .upgrade()
            .ok_or_else(|| anyhow!("op {}: workspace dropped", self.def.op_type))
    }

    pub fn input_name(&self, idx: usize) -> &str {
        &self.def.input[idx]
    }

    pub fn output_name(&self, idx: usize) -> &str {
        &self.def.output[idx]
    }

    pub fn arg_int(&self, name: &str, default: i64) -> Result<i64> {
        match self.def.find_arg(name) {
            None => Ok(default),
            Some(ArgValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.arg_type_error(name, "int", other)),
        }
    }

    pub fn arg_float(&self, name: &str, default: f32) -> Result<f32> {
        match self.def.find_arg(name) {
            None => Ok(default),
            Some(ArgValue::Float(v)) => Ok(*v),
            Some(ArgValue::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.arg_type_error(name, "float", other)),
        }
    }

    pub fn arg_bool(&self, name: &str, default: bool) -> Result<bool> {
        Ok(self.arg_int(name, default as i64)? != 0)
    }

    pub fn arg_str(&self, name: &str, default: &str) -> Result<String> {
        match self.def.find_arg(name) {
            None => Ok(default.to_string()),
            Some(ArgValue::Str(v)) => Ok(v.clone()),
            Some(other) => Err(self.arg_type_error(name, "str", other)),
        }
    }

    pub fn arg_ints(&self, name: &str) -> Result<Vec<i64>> {
        match self.def.find_arg(name) {
            None => Ok(Vec::new()),
            Some(ArgValue::Ints(v)) => Ok(v.clone()),
            Some(other) => Err(self.arg_type_error(name, "ints", other)),
        }
    }

    pub fn arg_strs(&self, name: &str) -> Result<Vec<String>> {
        match self.def.find_arg(name) {
            None => Ok(Vec::new()),
            Some(ArgValue::Strs(v)) => Ok(v.clone()),
            Some(other) => Err(self.arg_type_error(name, "strs", other)),
        }
    }

    pub fn arg_net(&self, name: &str) -> Result<NetDef> {
        match self.def.find_arg(name) {
            Some(ArgValue::Net(v)) => Ok(v.clone()),
            Some(other) => Err(self.arg_type_error(name, "net", other)),
            None => Err(anyhow!(
                "op {}: missing required net argument {}",
                self.def.op_type,
                name
            )),
        }
    }

    fn arg_type_error(&self, name: &str, expected: &str, got: &ArgValue) -> anyhow::Error {
        anyhow!(
            "op {}: argument {} is not a {} (got {:?})",
            self.def.op_type,
            name,
            expected,
            got
        )
    }
}

/// A kernel instance bound to resolved blobs in a workspace.
pub struct Operator {
    ctx: OpContext,
    kernel: Box<dyn Kernel>,
    /// Instance identity for trace lines; two ops of the same type stay
    /// distinguishable in interleaved logs.
    id: Uuid,
}

impl Operator {
    /// Resolve and configure an operator. Inputs must already exist in the
    /// workspace (earlier op outputs or declared external inputs); outputs
    /// are created here. The op's schema, when registered, is verified
    /// before any blob is touched.
    pub fn create(
        def: &OperatorDef,
        ws: &Arc<Workspace>,
        net_device: Option<DeviceOption>,
    ) -> Result<Operator> {
        if let Some(schema) = schema::schema(&def.op_type) {
            schema.verify(def)?;
        }
        let device = def.effective_device(net_device);
        let factory = kernel_factory(&def.op_type, device.kind).ok_or_else(|| {
            anyhow!(RunError::InvalidNet(format!(
                "no kernel registered for op {} on device kind {}",
                def.op_type, device.kind
            )))
        })?;

        let mut inputs = Vec::with_capacity(def.input.len());
        for name in &def.input {
            let blob = ws.get_blob(name).ok_or_else(|| {
                anyhow!(RunError::InvalidNet(format!(
                    "op {}: input {} is not found",
                    def.op_type, name
                )))
            })?;
            inputs.push(blob);
        }
        let mut outputs = Vec::with_capacity(def.output.len());
        for name in &def.output {
            outputs.push(ws.create_blob(name));
        }

        let mut bound = def.clone();
        bound.device_option = Some(device);
        let kernel = factory(&bound, ws)?;
        Ok(Operator {
            ctx: OpContext {
                def: bound,
                device,
                inputs,
                outputs,
                ws: Arc::downgrade(ws),
            },
            kernel,
            id: Uuid::new_v4(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn def(&self) -> &OperatorDef {
        &self.ctx.def
    }

    pub fn device(&self) -> DeviceOption {
        self.ctx.device
    }

    pub fn op_type(&self) -> &str {
        &self.ctx.def.op_type
    }

    /// Synchronous entry point: the work is complete when this returns.
    pub fn run(&self) -> Result<()> {
        self.kernel.run(&self.ctx)
    }

    /// Asynchronous entry point: the kernel enqueues its work on the
    /// current chain's stream. Host kernels complete inline, which keeps
    /// their tail events trivially recordable.
    pub fn run_async(&self) -> Result<()> {
        self.kernel.run(&self.ctx)
    }
}
