use std::sync::Arc;

use anyhow::Result;
use opennet::{
    ArgValue, ExecutionStep, NetDef, OperatorDef, PlanDef, RunError, Tensor, Workspace,
};

use crate::common;

fn counter_net(name: &str, counter: &str) -> NetDef {
    NetDef::new(name, "simple").add_op(OperatorDef::new("iter").outputs([counter]))
}

#[test]
fn empty_plan_succeeds_without_work() -> Result<()> {
    let ws = Workspace::new();
    ws.run_plan(&PlanDef::new("empty"))
}

#[test]
fn num_iter_runs_nets_exactly_that_often() -> Result<()> {
    let ws = Workspace::new();
    let plan = PlanDef::new("count")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).iterations(7));
    ws.run_plan(&plan)?;
    // iter initializes to 0 on the first run, then increments.
    assert_eq!(common::fetch_i64(&ws, "ticks")?, vec![6]);
    Ok(())
}

#[test]
fn zero_iterations_run_nothing() -> Result<()> {
    let ws = Workspace::new();
    let plan = PlanDef::new("none")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).iterations(0));
    ws.run_plan(&plan)?;
    // The output blob exists from net construction but was never written.
    assert!(common::blob_is_empty(&ws, "ticks"));
    Ok(())
}

#[test]
fn initially_true_stop_blob_runs_zero_iterations() -> Result<()> {
    let ws = Workspace::new();
    common::feed(&ws, "stop", Tensor::bool_scalar(true));
    let plan = PlanDef::new("stopped")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).stop_on("stop"));
    ws.run_plan(&plan)?;
    assert!(common::blob_is_empty(&ws, "ticks"));
    Ok(())
}

#[test]
fn stop_blob_fires_after_five_iterations() -> Result<()> {
    let ws = Workspace::new();
    common::feed(&ws, "stop", Tensor::bool_scalar(false));
    // Counter reaches 4 on the fifth run, flipping the stop blob.
    let net = NetDef::new("tick", "simple")
        .add_op(OperatorDef::new("iter").outputs(["ticks"]))
        .add_op(
            OperatorDef::new("ge_scalar")
                .inputs(["ticks"])
                .outputs(["stop"])
                .with_arg("value", ArgValue::Int(4)),
        );
    let mut step = ExecutionStep::for_nets("loop", ["tick"]).stop_on("stop");
    step.num_iter = Some(100);
    let plan = PlanDef::new("early_stop").add_net(net).add_step(step);
    ws.run_plan(&plan)?;
    assert_eq!(common::fetch_i64(&ws, "ticks")?, vec![4]);
    Ok(())
}

#[test]
fn missing_stop_blob_is_a_step_failure() {
    let ws = Workspace::new();
    let plan = PlanDef::new("broken")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).stop_on("ghost"));
    let err = ws.run_plan(&plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::StepFailure(_))
    ));
}

#[test]
fn only_once_caps_iteration_at_one() -> Result<()> {
    let ws = Workspace::new();
    common::feed(&ws, "stop", Tensor::bool_scalar(false));
    let mut step = ExecutionStep::for_nets("loop", ["tick"]).stop_on("stop");
    step.only_once = true;
    let plan = PlanDef::new("once")
        .add_net(counter_net("tick", "ticks"))
        .add_step(step);
    ws.run_plan(&plan)?;
    assert_eq!(common::fetch_i64(&ws, "ticks")?, vec![0]);
    Ok(())
}

#[test]
fn sequential_substeps_respect_parent_stop_blob() -> Result<()> {
    let ws = Workspace::new();
    common::feed(&ws, "stop", Tensor::bool_scalar(false));
    // Substep a flips the stop blob on its first run; the blob is polled
    // after each substep, so substep b never runs.
    let net_a = NetDef::new("a", "simple")
        .add_op(OperatorDef::new("iter").outputs(["a_runs"]))
        .add_op(
            OperatorDef::new("fill")
                .outputs(["stop"])
                .with_arg("shape", ArgValue::Ints(vec![1]))
                .with_arg("dtype", ArgValue::Str("bool".into()))
                .with_arg("value", ArgValue::Float(1.0)),
        );
    let net_b = counter_net("b", "b_runs");

    let mut parent = ExecutionStep::for_substeps(
        "parent",
        [
            ExecutionStep::for_nets("sa", ["a"]),
            ExecutionStep::for_nets("sb", ["b"]),
        ],
    );
    parent.should_stop_blob = Some("stop".into());
    let plan = PlanDef::new("seq")
        .add_net(net_a)
        .add_net(net_b)
        .add_step(parent);
    ws.run_plan(&plan)?;
    assert_eq!(common::fetch_i64(&ws, "a_runs")?, vec![0]);
    // The stop fired between substep a and substep b of iteration 0.
    assert!(common::blob_is_empty(&ws, "b_runs"));
    Ok(())
}

#[test]
fn concurrent_substeps_surface_the_first_worker_failure() -> Result<()> {
    common::ensure_test_kernels();
    let ws = Workspace::new();
    let healthy = counter_net("healthy", "h_runs");
    let faulty = NetDef::new("faulty", "simple").add_op(
        OperatorDef::new("fail_after")
            .outputs(["f_runs"])
            .with_arg("after", ArgValue::Int(3)),
    );

    let step = ExecutionStep::for_substeps(
        "parallel",
        [
            ExecutionStep::for_nets("sh", ["healthy"]).iterations(50),
            ExecutionStep::for_nets("sf", ["faulty"]).iterations(50),
        ],
    )
    .concurrent();
    let plan = PlanDef::new("concurrent")
        .add_net(healthy)
        .add_net(faulty)
        .add_step(step);

    let err = ws.run_plan(&plan).unwrap_err();
    let root = format!("{:#}", err);
    assert!(root.contains("injected failure at invocation 3"), "{}", root);
    let has_worker_exception = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<RunError>(), Some(RunError::WorkerException(_))));
    assert!(has_worker_exception, "{}", root);
    // The faulty substep stopped at its third invocation.
    assert_eq!(common::fetch_i64(&ws, "f_runs")?, vec![3]);
    Ok(())
}

#[test]
fn concurrent_substeps_where_all_fail_report_failure() {
    common::ensure_test_kernels();
    let ws = Workspace::new();
    let mk_faulty = |name: &str, out: &str| {
        NetDef::new(name, "simple").add_op(
            OperatorDef::new("fail_after")
                .outputs([out])
                .with_arg("after", ArgValue::Int(1)),
        )
    };
    let step = ExecutionStep::for_substeps(
        "parallel",
        [
            ExecutionStep::for_nets("s1", ["f1"]).iterations(5),
            ExecutionStep::for_nets("s2", ["f2"]).iterations(5),
        ],
    )
    .concurrent();
    let plan = PlanDef::new("all_fail")
        .add_net(mk_faulty("f1", "c1"))
        .add_net(mk_faulty("f2", "c2"))
        .add_step(step);
    let err = ws.run_plan(&plan).unwrap_err();
    assert!(format!("{:#}", err).contains("injected failure"));
}

#[test]
fn reporter_runs_the_report_net() -> Result<()> {
    let ws = Workspace::new();
    let mut step = ExecutionStep::for_nets("loop", ["tick"]).iterations(3);
    step.report_net = Some("report".into());
    step.report_interval = Some(0);
    let plan = PlanDef::new("reported")
        .add_net(counter_net("tick", "ticks"))
        .add_net(counter_net("report", "reports"))
        .add_step(step);
    ws.run_plan(&plan)?;
    // The reporter fires at least once, including the final pass at step
    // exit; its failures would have been non-fatal either way.
    assert!(common::fetch_i64(&ws, "reports").is_ok());
    Ok(())
}

#[test]
fn external_should_continue_gates_everything() -> Result<()> {
    let ws = Workspace::new();
    let plan = PlanDef::new("gated")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).iterations(10));
    ws.run_plan_with(&plan, Arc::new(|iter| iter < 2))?;
    assert_eq!(common::fetch_i64(&ws, "ticks")?, vec![1]);
    Ok(())
}

#[test]
fn stop_blob_must_be_scalar_bool() {
    let ws = Workspace::new();
    common::feed(&ws, "stop", Tensor::from_vec(vec![1i64]));
    let plan = PlanDef::new("badstop")
        .add_net(counter_net("tick", "ticks"))
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).stop_on("stop"));
    let err = ws.run_plan(&plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::StepFailure(_))
    ));
}
