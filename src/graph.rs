//! Declarative descriptions of operators, nets and plans.
//!
//! These are the wire types: everything derives serde so that nets and
//! plans round-trip through JSON description files.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::DeviceOption;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
    Net(NetDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

/// A configured operator: kernel name, blob bindings and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub arg: Vec<Argument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_option: Option<DeviceOption>,
}

impl OperatorDef {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            input: Vec::new(),
            output: Vec::new(),
            arg: Vec::new(),
            device_option: None,
        }
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.arg.push(Argument {
            name: name.into(),
            value,
        });
        self
    }

    pub fn on_device(mut self, device: DeviceOption) -> Self {
        self.device_option = Some(device);
        self
    }

    pub fn find_arg(&self, name: &str) -> Option<&ArgValue> {
        self.arg
            .iter()
            .find(|arg| arg.name == name)
            .map(|arg| &arg.value)
    }

    /// Device this op runs on, falling back to the net's binding.
    pub fn effective_device(&self, net_device: Option<DeviceOption>) -> DeviceOption {
        self.device_option.or(net_device).unwrap_or_default()
    }
}

/// A named DAG of operators with an execution strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetDef {
    pub name: String,
    #[serde(rename = "type", default = "default_net_type")]
    pub net_type: String,
    #[serde(default)]
    pub op: Vec<OperatorDef>,
    #[serde(default)]
    pub external_input: Vec<String>,
    #[serde(default)]
    pub external_output: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_option: Option<DeviceOption>,
}

fn default_net_type() -> String {
    "simple".to_string()
}

impl NetDef {
    pub fn new(name: impl Into<String>, net_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            net_type: net_type.into(),
            op: Vec::new(),
            external_input: Vec::new(),
            external_output: Vec::new(),
            num_workers: None,
            device_option: None,
        }
    }

    pub fn add_op(mut self, op: OperatorDef) -> Self {
        self.op.push(op);
        self
    }

    pub fn external_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_input = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.num_workers = Some(workers);
        self
    }

    pub fn on_device(mut self, device: DeviceOption) -> Self {
        self.device_option = Some(device);
        self
    }
}

/// One node of the plan tree: either nested substeps or a network list,
/// with iteration control and optional reporter hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub substep: Vec<ExecutionStep>,
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_iter: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_stop_blob: Option<String>,
    #[serde(default)]
    pub only_once: bool,
    #[serde(default)]
    pub concurrent_substeps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_net: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<i64>,
}

impl ExecutionStep {
    pub fn for_nets<I, S>(name: impl Into<String>, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            substep: Vec::new(),
            network: networks.into_iter().map(Into::into).collect(),
            num_iter: None,
            should_stop_blob: None,
            only_once: false,
            concurrent_substeps: false,
            report_net: None,
            report_interval: None,
        }
    }

    pub fn for_substeps<I>(name: impl Into<String>, substeps: I) -> Self
    where
        I: IntoIterator<Item = ExecutionStep>,
    {
        Self {
            name: name.into(),
            substep: substeps.into_iter().collect(),
            network: Vec::new(),
            num_iter: None,
            should_stop_blob: None,
            only_once: false,
            concurrent_substeps: false,
            report_net: None,
            report_interval: None,
        }
    }

    pub fn iterations(mut self, num_iter: i64) -> Self {
        self.num_iter = Some(num_iter);
        self
    }

    pub fn stop_on(mut self, blob: impl Into<String>) -> Self {
        self.should_stop_blob = Some(blob.into());
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_substeps = true;
        self
    }
}

/// A full plan: net definitions plus the step tree that drives them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: Vec<NetDef>,
    #[serde(default)]
    pub execution_step: Vec<ExecutionStep>,
}

impl PlanDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: Vec::new(),
            execution_step: Vec::new(),
        }
    }

    pub fn add_net(mut self, net: NetDef) -> Self {
        self.network.push(net);
        self
    }

    pub fn add_step(mut self, step: ExecutionStep) -> Self {
        self.execution_step.push(step);
        self
    }

    pub fn from_json(raw: &str) -> Result<PlanDef> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid plan description: {}", err))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| anyhow!("cannot encode plan: {}", err))
    }
}

impl NetDef {
    pub fn from_json(raw: &str) -> Result<NetDef> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid net description: {}", err))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| anyhow!("cannot encode net: {}", err))
    }
}
