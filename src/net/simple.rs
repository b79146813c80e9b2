use std::sync::Arc;

use anyhow::{Context, Result};

use crate::event::Stream;
use crate::graph::NetDef;
use crate::operator::Operator;
use crate::workspace::Workspace;

use super::{build_operators, Net};

/// Runs every operator in declaration order on the calling thread.
pub struct SimpleNet {
    name: String,
    operators: Vec<Operator>,
}

impl SimpleNet {
    pub fn create(def: &NetDef, ws: &Arc<Workspace>) -> Result<Arc<dyn Net>> {
        let operators = build_operators(def, ws)?;
        Ok(Arc::new(SimpleNet {
            name: def.name.clone(),
            operators,
        }))
    }
}

impl Net for SimpleNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        for op in &self.operators {
            crate::trace!("net {}: running op {}", self.name, op.op_type());
            op.run()
                .with_context(|| format!("net {}: op {} failed", self.name, op.op_type()))?;
        }
        Ok(())
    }
}

/// Sequential submission through the async entry point: each op enqueues on
/// the net's single stream, and the host synchronizes once at the end.
pub struct AsyncSimpleNet {
    name: String,
    operators: Vec<Operator>,
}

impl AsyncSimpleNet {
    pub fn create(def: &NetDef, ws: &Arc<Workspace>) -> Result<Arc<dyn Net>> {
        let operators = build_operators(def, ws)?;
        Ok(Arc::new(AsyncSimpleNet {
            name: def.name.clone(),
            operators,
        }))
    }
}

impl Net for AsyncSimpleNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        let device = self
            .operators
            .first()
            .map(|op| op.device())
            .unwrap_or_default();
        let _stream = Stream::new(device);
        for op in &self.operators {
            crate::trace!("net {}: submitting op {}", self.name, op.op_type());
            op.run_async()
                .with_context(|| format!("net {}: op {} failed", self.name, op.op_type()))?;
        }
        // Host kernels complete inline; a device implementation would
        // synchronize the stream here before reporting success.
        Ok(())
    }
}
