use std::collections::HashMap;

use anyhow::Result;
use opennet::registry::Registry;
use opennet::schema::{self, OpSchema};
use opennet::{ArgValue, DeviceOption, NetDef, OperatorDef, RunError};

#[test]
fn registry_register_get_has_keys() {
    let registry: Registry<String, i32> = Registry::new("test");
    registry.register("a".into(), 1);
    registry.register("b".into(), 2);
    assert_eq!(registry.get(&"a".to_string()), Some(1));
    assert_eq!(registry.get(&"c".to_string()), None);
    assert!(registry.has(&"b".to_string()));
    let mut keys = registry.keys();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[test]
#[should_panic(expected = "registered twice")]
fn registry_rejects_duplicate_keys() {
    let registry: Registry<String, i32> = Registry::new("test");
    registry.register("a".into(), 1);
    registry.register("a".into(), 2);
}

#[test]
fn schema_checks_arity() {
    let schema = schema::schema("add").expect("add has a schema");
    let bad = OperatorDef::new("add").inputs(["x"]).outputs(["y"]);
    let err = schema.verify(&bad).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::SchemaViolation(_))
    ));

    let good = OperatorDef::new("add").inputs(["x", "y"]).outputs(["z"]);
    schema.verify(&good).unwrap();
}

#[test]
fn output_calculator_rejects_wrong_output_count() {
    let schema = OpSchema::new()
        .num_inputs_range(1, 8)
        .num_outputs_range(1, 8)
        .same_number_of_outputs();
    let bad = OperatorDef::new("widget")
        .inputs(["a", "b"])
        .outputs(["c"]);
    assert!(schema.verify(&bad).is_err());
    let good = OperatorDef::new("widget")
        .inputs(["a", "b"])
        .outputs(["c", "d"]);
    schema.verify(&good).unwrap();
}

#[test]
fn enforced_inplace_requires_matching_names() {
    let schema = schema::schema("append").expect("append has a schema");
    let bad = OperatorDef::new("append")
        .inputs(["dst", "src"])
        .outputs(["other"]);
    let err = schema.verify(&bad).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::SchemaViolation(_))
    ));
    let good = OperatorDef::new("append")
        .inputs(["dst", "src"])
        .outputs(["dst"]);
    schema.verify(&good).unwrap();
}

#[test]
fn shape_inference_folds_over_a_net() -> Result<()> {
    let net = NetDef::new("shapes", "simple")
        .add_op(
            OperatorDef::new("fill")
                .outputs(["x"])
                .with_arg("shape", ArgValue::Ints(vec![4, 5])),
        )
        .add_op(OperatorDef::new("copy").inputs(["x"]).outputs(["y"]))
        .add_op(OperatorDef::new("add").inputs(["x", "y"]).outputs(["z"]));
    let shapes = schema::infer_blob_shapes(&net, &HashMap::new())?;
    assert_eq!(shapes["x"], vec![4, 5]);
    assert_eq!(shapes["y"], vec![4, 5]);
    assert_eq!(shapes["z"], vec![4, 5]);
    Ok(())
}

#[test]
fn cost_inference_reports_elementwise_flops() {
    let schema = schema::schema("add").expect("add has a schema");
    let def = OperatorDef::new("add").inputs(["a", "b"]).outputs(["c"]);
    let cost = schema
        .infer_cost(&def, &[vec![4, 5], vec![4, 5]])
        .expect("add has cost inference");
    assert_eq!(cost.flops, 20);
}

#[test]
fn device_inference_defaults_to_the_op_device() {
    let schema = schema::schema("add").expect("add has a schema");
    let def = OperatorDef::new("add")
        .inputs(["a", "b"])
        .outputs(["c"])
        .on_device(DeviceOption::gpu(2));
    let (inputs, outputs) = schema.infer_devices(&def);
    assert_eq!(inputs, vec![DeviceOption::gpu(2); 2]);
    assert_eq!(outputs, vec![DeviceOption::gpu(2)]);
}
