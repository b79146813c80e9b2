use anyhow::Result;
use opennet::{ArgValue, ExecutionStep, NetDef, OperatorDef, PlanDef};

#[test]
fn plan_round_trips_through_json() -> Result<()> {
    let plan = PlanDef::new("train")
        .add_net(
            NetDef::new("tick", "async_dag").with_workers(4).add_op(
                OperatorDef::new("iter")
                    .outputs(["ticks"])
                    .with_arg("unused", ArgValue::Ints(vec![1, 2, 3])),
            ),
        )
        .add_step(ExecutionStep::for_nets("loop", ["tick"]).iterations(5));
    let encoded = plan.to_json()?;
    let decoded = PlanDef::from_json(&encoded)?;
    assert_eq!(decoded, plan);
    Ok(())
}

#[test]
fn sparse_descriptions_fill_in_defaults() -> Result<()> {
    let net = NetDef::from_json(r#"{ "name": "n", "op": [{ "type": "iter", "output": ["i"] }] }"#)?;
    assert_eq!(net.net_type, "simple");
    assert_eq!(net.op.len(), 1);
    assert!(net.op[0].input.is_empty());
    assert!(net.num_workers.is_none());

    let plan = PlanDef::from_json(
        r#"{
            "name": "p",
            "execution_step": [
                { "name": "s", "network": ["n"], "num_iter": 2 }
            ]
        }"#,
    )?;
    assert_eq!(plan.execution_step[0].num_iter, Some(2));
    assert!(!plan.execution_step[0].only_once);
    Ok(())
}

#[test]
fn malformed_plan_is_rejected() {
    assert!(PlanDef::from_json("{ not json").is_err());
}
