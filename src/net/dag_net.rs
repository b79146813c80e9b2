use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use crate::error::RunError;
use crate::event::{Event, Stream};
use crate::graph::NetDef;
use crate::operator::Operator;
use crate::workspace::Workspace;

use super::dag::ChainPlan;
use super::{build_operators, default_num_workers, Net};

/// Chain-parallel executor. Chains are dispatched to a worker pool as their
/// parent chains finish; in the async variant every cross-domain edge is
/// closed with a record/wait event pair and the host synchronizes all
/// outstanding tail events before `run` returns.
pub struct DagNet {
    name: String,
    operators: Vec<Operator>,
    plan: ChainPlan,
    /// Tail event per chain; populated only where a cross-domain consumer
    /// exists (and only in the async variant).
    events: Vec<Option<Event>>,
    use_events: bool,
    pool: rayon::ThreadPool,
    pending: Vec<AtomicUsize>,
    got_failure: AtomicBool,
    first_error: Mutex<Option<anyhow::Error>>,
    run_lock: Mutex<()>,
}

impl DagNet {
    pub fn create(def: &NetDef, ws: &Arc<Workspace>, use_events: bool) -> Result<Arc<dyn Net>> {
        let operators = build_operators(def, ws)?;
        let plan = ChainPlan::analyze(def);
        let events: Vec<Option<Event>> = (0..plan.chains.len())
            .map(|chain_id| {
                if use_events && plan.event_tails[chain_id] {
                    Some(Event::new(plan.devices[plan.tail_of(chain_id)]))
                } else {
                    None
                }
            })
            .collect();
        let pending = plan
            .chain_parents
            .iter()
            .map(|parents| AtomicUsize::new(parents.len()))
            .collect();

        let num_workers = def.num_workers.unwrap_or_else(default_num_workers).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .map_err(|err| anyhow!("failed to build net worker pool: {}", err))?;
        crate::trace!(
            "net {}: {} ops, {} chains, {} events, {} workers",
            def.name,
            def.op.len(),
            plan.chains.len(),
            events.iter().flatten().count(),
            num_workers
        );

        Ok(Arc::new(DagNet {
            name: def.name.clone(),
            operators,
            plan,
            events,
            use_events,
            pool,
            pending,
            got_failure: AtomicBool::new(false),
            first_error: Mutex::new(None),
            run_lock: Mutex::new(()),
        }))
    }

    fn reset(&self) {
        for (chain_id, parents) in self.plan.chain_parents.iter().enumerate() {
            self.pending[chain_id].store(parents.len(), Ordering::Release);
        }
        for event in self.events.iter().flatten() {
            event.reset();
        }
        self.got_failure.store(false, Ordering::Release);
        *self.first_error.lock().expect("net error lock poisoned") = None;
    }

    fn spawn_chain<'s>(&'s self, scope: &rayon::Scope<'s>, chain_id: usize) {
        scope.spawn(move |scope| self.execute_chain(scope, chain_id));
    }

    fn execute_chain<'s>(&'s self, scope: &rayon::Scope<'s>, chain_id: usize) {
        if let Err(err) = self.run_chain_body(chain_id) {
            self.fail(err);
        }
        // The tail event records even for skipped or failed chains so that
        // waiters and host synchronization stay well-defined.
        if let Some(event) = &self.events[chain_id] {
            if let Err(err) = event.record() {
                self.fail(err);
            }
        }
        for &child in &self.plan.chain_children[chain_id] {
            if self.pending[child].fetch_sub(1, Ordering::AcqRel) == 1 {
                self.spawn_chain(scope, child);
            }
        }
    }

    fn run_chain_body(&self, chain_id: usize) -> Result<()> {
        // A failure drains the remaining chains without issuing new work.
        if self.got_failure.load(Ordering::Acquire) {
            return Ok(());
        }
        let chain = &self.plan.chains[chain_id];
        let stream = Stream::new(self.plan.devices[chain[0]]);

        if self.use_events {
            for &parent in &self.plan.chain_parents[chain_id] {
                match &self.events[parent] {
                    Some(event) => stream.wait_event(event)?,
                    None => {
                        let tail = self.plan.tail_of(parent);
                        if !self.plan.devices[tail].same_domain(&stream.device()) {
                            return Err(RunError::InvalidSync(format!(
                                "net {}: cross-device chain parent without an event",
                                self.name
                            ))
                            .into());
                        }
                    }
                }
            }
        }

        for &op_idx in chain {
            if self.got_failure.load(Ordering::Acquire) {
                return Ok(());
            }
            let op = &self.operators[op_idx];
            crate::trace!(
                "net {}: chain {} running op {} {}",
                self.name,
                chain_id,
                op.op_type(),
                op.id()
            );
            op.run_async().with_context(|| {
                format!("net {}: op {} failed", self.name, op.op_type())
            })?;
        }
        Ok(())
    }

    fn fail(&self, err: anyhow::Error) {
        let mut first = self.first_error.lock().expect("net error lock poisoned");
        if first.is_none() {
            crate::error!("net {}: {:#}", self.name, err);
            *first = Some(err);
        }
        self.got_failure.store(true, Ordering::Release);
    }
}

impl Net for DagNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        let _guard = self.run_lock.lock().expect("net run lock poisoned");
        self.reset();
        if self.plan.chains.is_empty() {
            return Ok(());
        }

        // The scope blocks until every chain task, including the ones
        // spawned transitively as parents finish, has completed.
        self.pool.scope(|scope| {
            for chain_id in 0..self.plan.chains.len() {
                if self.plan.chain_parents[chain_id].is_empty() {
                    self.spawn_chain(scope, chain_id);
                }
            }
        });

        // Synchronize the host against every event still outstanding; this
        // also covers consumers that never issued a wait.
        for event in self.events.iter().flatten() {
            if event.is_outstanding() {
                event.host_wait();
            }
        }

        if self.got_failure.load(Ordering::Acquire) {
            let err = self
                .first_error
                .lock()
                .expect("net error lock poisoned")
                .take()
                .unwrap_or_else(|| {
                    RunError::StepFailure(format!("net {} failed", self.name)).into()
                });
            return Err(err);
        }
        Ok(())
    }
}
