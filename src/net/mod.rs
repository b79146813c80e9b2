//! Net executors: DAG construction, chain discovery and the registry of
//! execution strategies (`simple`, `async_simple`, `dag`, `async_dag`).

pub mod dag;
mod dag_net;
mod simple;

use std::collections::HashSet;
use std::sync::{Arc, Once, OnceLock};

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::error::RunError;
use crate::graph::NetDef;
use crate::operator::Operator;
use crate::registry::Registry;
use crate::workspace::Workspace;

pub use dag::ChainPlan;
pub use dag_net::DagNet;
pub use simple::{AsyncSimpleNet, SimpleNet};

/// A constructed net, ready to run against the workspace it was built in.
pub trait Net: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Net({})", self.name())
    }
}

pub type NetFactory = Arc<dyn Fn(&NetDef, &Arc<Workspace>) -> Result<Arc<dyn Net>> + Send + Sync>;

static NET_REGISTRY: Lazy<Registry<String, NetFactory>> = Lazy::new(|| Registry::new("net"));
static BUILTIN_NETS: Once = Once::new();

pub fn register_net_type(name: impl Into<String>, factory: NetFactory) {
    NET_REGISTRY.register(name.into(), factory);
}

fn ensure_builtin_nets() {
    BUILTIN_NETS.call_once(|| {
        register_net_type("simple", Arc::new(SimpleNet::create));
        register_net_type("async_simple", Arc::new(AsyncSimpleNet::create));
        register_net_type(
            "dag",
            Arc::new(|def, ws| DagNet::create(def, ws, false)),
        );
        register_net_type(
            "async_dag",
            Arc::new(|def, ws| DagNet::create(def, ws, true)),
        );
    });
}

/// Construct a net of the type named by its definition.
pub fn create_net(def: &NetDef, ws: &Arc<Workspace>) -> Result<Arc<dyn Net>> {
    ensure_builtin_nets();
    validate_net_def(def)?;
    let factory = NET_REGISTRY.get(&def.net_type).ok_or_else(|| {
        anyhow::Error::from(RunError::InvalidNet(format!(
            "unknown net type {}",
            def.net_type
        )))
    })?;
    factory(def, ws)
}

/// Every op input must be produced by an earlier op or declared external.
fn validate_net_def(def: &NetDef) -> Result<()> {
    let mut known: HashSet<&str> = def.external_input.iter().map(String::as_str).collect();
    for op in &def.op {
        for input in &op.input {
            if !known.contains(input.as_str()) {
                return Err(RunError::InvalidNet(format!(
                    "net {}: op {} reads {} which is neither produced earlier nor an external input",
                    def.name, op.op_type, input
                ))
                .into());
            }
        }
        for output in &op.output {
            known.insert(output.as_str());
        }
    }
    Ok(())
}

/// Instantiate the net's operators in declaration order.
fn build_operators(def: &NetDef, ws: &Arc<Workspace>) -> Result<Vec<Operator>> {
    // External inputs must already exist in the workspace; operator
    // creation reports the precise missing blob otherwise.
    let mut operators = Vec::with_capacity(def.op.len());
    for op_def in &def.op {
        operators.push(Operator::create(op_def, ws, def.device_option)?);
    }
    Ok(operators)
}

static NUM_WORKERS_OVERRIDE: OnceLock<Option<usize>> = OnceLock::new();

/// Default worker-pool size: `OPENNET_NUM_WORKERS` when set, otherwise the
/// CPU count.
pub fn default_num_workers() -> usize {
    let overridden = NUM_WORKERS_OVERRIDE.get_or_init(|| {
        std::env::var("OPENNET_NUM_WORKERS")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
    });
    if let Some(n) = overridden {
        return (*n).max(1);
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
