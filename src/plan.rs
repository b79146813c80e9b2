//! Recursive interpreter over a plan's execution-step tree: iteration
//! control, early-stop polling, reporter sub-threads and concurrent sibling
//! steps with failure aggregation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::blob::SharedBlob;
use crate::error::RunError;
use crate::graph::{ExecutionStep, PlanDef};
use crate::net::Net;
use crate::tensor::Tensor;
use crate::timer::Timer;
use crate::workspace::Workspace;

/// External continuation test threaded through every step.
pub type ShouldContinue = Arc<dyn Fn(i64) -> bool + Send + Sync>;

pub fn run_plan(ws: &Workspace, plan: &PlanDef, should_continue: ShouldContinue) -> Result<()> {
    crate::trace!("started executing plan {}", plan.name);
    if plan.execution_step.is_empty() {
        crate::warning!("plan {}: nothing to run - did you define a correct plan?", plan.name);
        return Ok(());
    }

    for net_def in &plan.network {
        ws.create_net(net_def)
            .with_context(|| format!("plan {}: failed initializing networks", plan.name))?;
    }

    let plan_timer = Timer::new();
    for step in &plan.execution_step {
        let step_timer = Timer::new();
        execute_step_recursive(ws, step, &should_continue)
            .with_context(|| format!("plan {}: step {} failed", plan.name, step.name))?;
        crate::trace!("step {} took {:.3} seconds", step.name, step_timer.seconds());
    }
    crate::trace!(
        "plan {} executed successfully in {:.3} seconds",
        plan.name,
        plan_timer.seconds()
    );
    Ok(())
}

/// Background thread that runs the report net every interval until the
/// enclosing step exits. Reporter failures are logged, never fatal.
struct Reporter {
    done: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    fn start(net: Arc<dyn Net>, interval: Duration) -> Reporter {
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_done = Arc::clone(&done);
        let handle = thread::spawn(move || {
            let (lock, cv) = &*thread_done;
            let mut finished = lock.lock().expect("reporter lock poisoned");
            loop {
                let (guard, _timeout) = cv
                    .wait_timeout(finished, interval)
                    .expect("reporter lock poisoned");
                finished = guard;
                if net.run().is_err() {
                    crate::warning!("error running report net {}", net.name());
                }
                if *finished {
                    break;
                }
            }
        });
        Reporter {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        let (lock, cv) = &*self.done;
        *lock.lock().expect("reporter lock poisoned") = true;
        cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Read the early-stop signal: an absent or still-empty blob means "keep
/// going"; anything present must be a scalar boolean.
fn read_should_stop(blob: &SharedBlob) -> Result<bool> {
    let guard = blob.lock().expect("blob lock poisoned");
    if guard.is_empty() {
        return Ok(false);
    }
    let tensor = guard
        .get::<Tensor>()
        .map_err(|_| RunError::StepFailure("should-stop blob expects a scalar boolean".into()))?;
    tensor
        .scalar_bool()
        .map_err(|_| RunError::StepFailure("should-stop blob expects a scalar boolean".into()).into())
}

fn execute_step_recursive(
    ws: &Workspace,
    step: &ExecutionStep,
    external: &ShouldContinue,
) -> Result<()> {
    crate::trace!("running execution step {}", step.name);
    if !step.substep.is_empty() && !step.network.is_empty() {
        return Err(RunError::StepFailure(format!(
            "step {} should have either substeps or networks, not both",
            step.name
        ))
        .into());
    }

    let _reporter = match &step.report_net {
        Some(report_net) => {
            let interval = step.report_interval.ok_or_else(|| {
                RunError::StepFailure(format!(
                    "step {}: a report_interval must be provided if report_net is set",
                    step.name
                ))
            })?;
            match ws.get_net(report_net) {
                Some(net) => Some(Reporter::start(
                    net,
                    Duration::from_secs(interval.max(0) as u64),
                )),
                None => {
                    crate::error!("step {}: report net {} not found", step.name, report_net);
                    None
                }
            }
        }
        None => None,
    };

    let stop_blob = match &step.should_stop_blob {
        Some(name) => Some(ws.get_blob(name).ok_or_else(|| {
            RunError::StepFailure(format!(
                "step {}: should-stop blob {} does not exist",
                step.name, name
            ))
        })?),
        None => None,
    };

    // Iteration predicate: the stop blob governs when present, with
    // only_once capping at a single pass; otherwise num_iter (default 1).
    let num_iter = step.num_iter.unwrap_or(1);
    let only_once = step.only_once;
    if only_once && stop_blob.is_none() {
        return Err(RunError::StepFailure(format!(
            "step {}: only_once requires should_stop_blob",
            step.name
        ))
        .into());
    }
    let step_continue = |iter: i64| -> Result<bool> {
        match &stop_blob {
            Some(blob) => {
                if only_once {
                    Ok(iter == 0)
                } else {
                    Ok(!read_should_stop(blob)?)
                }
            }
            None => Ok(iter < num_iter),
        }
    };
    let should_continue = |iter: i64| -> Result<bool> {
        Ok(external(iter) && step_continue(iter)?)
    };
    let check_should_stop = |stop_blob: &Option<SharedBlob>| -> Result<bool> {
        match stop_blob {
            Some(blob) => {
                let stop = read_should_stop(blob)?;
                if stop {
                    crate::trace!("execution step {} stopped by its stop blob", step.name);
                }
                Ok(stop)
            }
            None => Ok(false),
        }
    };

    if !step.substep.is_empty() {
        let mut iter = 0i64;
        while should_continue(iter)? {
            if !step.concurrent_substeps || step.substep.len() <= 1 {
                crate::trace!("executing step {} iteration {}", step.name, iter);
                for substep in &step.substep {
                    execute_step_recursive(ws, substep, external)?;
                    if check_should_stop(&stop_blob)? {
                        return Ok(());
                    }
                }
            } else {
                run_concurrent_substeps(ws, step, external, iter)?;
                if check_should_stop(&stop_blob)? {
                    return Ok(());
                }
            }
            iter += 1;
        }
        Ok(())
    } else {
        let mut networks = Vec::with_capacity(step.network.len());
        for name in &step.network {
            networks.push(ws.get_net(name).ok_or_else(|| {
                RunError::StepFailure(format!(
                    "step {}: network {} not found",
                    step.name, name
                ))
            })?);
        }
        let mut iter = 0i64;
        while should_continue(iter)? {
            crate::trace!("executing networks of {} iteration {}", step.name, iter);
            for net in &networks {
                net.run()
                    .with_context(|| format!("step {}: network {} failed", step.name, net.name()))?;
                if check_should_stop(&stop_blob)? {
                    return Ok(());
                }
            }
            iter += 1;
        }
        Ok(())
    }
}

/// Run sibling substeps on one thread each, consuming from a shared
/// counter. Workers observing a failure exit without claiming more work;
/// failures are coalesced deterministically into the lowest worker's error.
fn run_concurrent_substeps(
    ws: &Workspace,
    step: &ExecutionStep,
    external: &ShouldContinue,
    iter: i64,
) -> Result<()> {
    crate::trace!(
        "executing step {} iteration {} with {} concurrent substeps",
        step.name,
        iter,
        step.substep.len()
    );
    let next_substep = AtomicUsize::new(0);
    let got_failure = Arc::new(AtomicBool::new(false));
    let first_failure: Mutex<Option<(usize, String)>> = Mutex::new(None);

    let substep_continue: ShouldContinue = {
        let external = Arc::clone(external);
        let got_failure = Arc::clone(&got_failure);
        Arc::new(move |it| !got_failure.load(Ordering::Acquire) && external(it))
    };

    thread::scope(|scope| {
        let mut workers = Vec::with_capacity(step.substep.len());
        for worker_id in 0..step.substep.len() {
            let next_substep = &next_substep;
            let got_failure = &got_failure;
            let first_failure = &first_failure;
            let substep_continue = &substep_continue;
            workers.push(scope.spawn(move || loop {
                let substep_id = next_substep.fetch_add(1, Ordering::AcqRel);
                if got_failure.load(Ordering::Acquire) || substep_id >= step.substep.len() {
                    break;
                }
                if let Err(err) =
                    execute_step_recursive(ws, &step.substep[substep_id], substep_continue)
                {
                    let mut first = first_failure.lock().expect("substep lock poisoned");
                    let description = format!("{:#}", err);
                    crate::error!("parallel worker exception: {}", description);
                    match &*first {
                        Some((existing, _)) if *existing <= worker_id => {}
                        _ => *first = Some((worker_id, description)),
                    }
                    got_failure.store(true, Ordering::Release);
                }
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }
    });

    if got_failure.load(Ordering::Acquire) {
        let first = first_failure
            .lock()
            .expect("substep lock poisoned")
            .take()
            .map(|(_, description)| description)
            .unwrap_or_else(|| format!("step {}: one of the workers failed", step.name));
        return Err(RunError::WorkerException(first).into());
    }
    Ok(())
}
