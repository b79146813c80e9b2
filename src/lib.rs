//! opennet: the execution core of a dataflow runtime.
//!
//! A workspace holds named, runtime-typed blobs; nets are operator DAGs
//! scheduled as same-device chains with event-closed cross-device edges;
//! plans drive nets through nested, optionally concurrent execution steps.
//! Dataset cursors traverse hierarchical ragged tensors and the recurrent
//! sub-executor unrolls a step-net across time.

pub mod logging;

mod blob;
pub mod dataset;
pub mod db;
mod error;
pub mod event;
pub mod graph;
pub mod net;
pub mod operator;
pub mod ops;
pub mod plan;
pub mod recurrent;
pub mod registry;
pub mod schema;
pub mod serialize;
pub mod tensor;
mod timer;
mod types;
mod workspace;

pub use blob::{new_shared_blob, Blob, SharedBlob, TypeMeta};
pub use error::RunError;
pub use event::{Event, Stream};
pub use graph::{ArgValue, Argument, ExecutionStep, NetDef, OperatorDef, PlanDef};
pub use net::{ChainPlan, Net};
pub use operator::{register_kernel, register_kernel_fn, Kernel, OpContext, Operator};
pub use plan::ShouldContinue;
pub use tensor::{DType, Tensor};
pub use timer::Timer;
pub use types::{DeviceKind, DeviceOption};
pub use workspace::Workspace;
