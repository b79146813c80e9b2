use anyhow::Result;
use opennet::{
    ArgValue, Blob, DType, NetDef, OperatorDef, RunError, Tensor, Workspace,
};

use crate::common;

#[test]
fn blob_holds_one_typed_value() -> Result<()> {
    let mut blob = Blob::new();
    assert!(blob.is_empty());

    blob.set(Tensor::from_vec(vec![1.0f32, 2.0]));
    assert!(blob.is::<Tensor>());
    assert_eq!(blob.get::<Tensor>()?.shape(), &[2]);

    let err = blob.get::<String>().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::TypeMismatch { .. })
    ));

    blob.reset();
    assert!(blob.is_empty());
    Ok(())
}

#[test]
fn blob_get_mut_replaces_on_type_change() {
    let mut blob = Blob::new();
    blob.set(Tensor::from_vec(vec![3i64]));
    // Different type: the old value is released and a default stored.
    let s: &mut String = blob.get_mut::<String>();
    s.push_str("hello");
    assert!(blob.is::<String>());
    assert_eq!(blob.get::<String>().unwrap(), "hello");
}

#[test]
fn workspace_blob_creation_is_idempotent() {
    let ws = Workspace::new();
    let first = ws.create_blob("x");
    let second = ws.create_blob("x");
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(ws.has_blob("x"));
    assert!(!ws.has_blob("y"));
    assert_eq!(ws.local_blobs(), vec!["x".to_string()]);
}

#[test]
fn child_workspace_reads_through_parent_but_not_back() {
    let parent = Workspace::new();
    common::feed(&parent, "shared", Tensor::from_vec(vec![1i64]));

    let child = Workspace::with_parent(&parent);
    assert!(child.has_blob("shared"));
    common::feed(&child, "local", Tensor::from_vec(vec![2i64]));

    // A parent lookup never traverses into children.
    assert!(!parent.has_blob("local"));
    assert_eq!(
        child.blobs(),
        vec!["local".to_string(), "shared".to_string()]
    );

    // Creation resolves to the parent's blob when the name exists there.
    let via_child = child.create_blob("shared");
    let via_parent = parent.get_blob("shared").unwrap();
    assert!(std::sync::Arc::ptr_eq(&via_child, &via_parent));
}

#[test]
fn run_operator_once_fills_blob() -> Result<()> {
    let ws = Workspace::new();
    let def = OperatorDef::new("fill")
        .outputs(["ones"])
        .with_arg("shape", ArgValue::Ints(vec![2, 3]))
        .with_arg("value", ArgValue::Float(1.0));
    ws.run_operator_once(&def)?;

    let tensor = common::fetch(&ws, "ones")?;
    assert_eq!(tensor.dtype(), DType::F32);
    assert_eq!(tensor.shape(), &[2, 3]);
    assert!(tensor.as_slice::<f32>()?.iter().all(|&v| v == 1.0));
    Ok(())
}

#[test]
fn run_net_reports_missing_net() {
    let ws = Workspace::new();
    let err = ws.run_net("nope").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::NotFound(_))
    ));
}

#[test]
fn create_net_overwrites_previous_instance() -> Result<()> {
    common::ensure_test_kernels();
    let ws = Workspace::new();
    let log = common::CallLog::default();
    common::feed_value(&ws, "log", log.clone());

    let def = |tag: &str| {
        NetDef::new("n", "simple")
            .external_inputs(["log"])
            .add_op(
                OperatorDef::new("track")
                    .inputs(["log"])
                    .outputs(["marker"])
                    .with_arg("tag", ArgValue::Str(tag.to_string())),
            )
    };
    ws.create_net(&def("first"))?;
    ws.create_net(&def("second"))?;
    ws.run_net("n")?;
    assert_eq!(log.entries(), vec!["second".to_string()]);
    Ok(())
}

#[test]
fn run_net_once_does_not_keep_the_net() -> Result<()> {
    common::ensure_test_kernels();
    let ws = Workspace::new();
    let log = common::CallLog::default();
    common::feed_value(&ws, "log", log.clone());

    let def = NetDef::new("transient", "simple")
        .external_inputs(["log"])
        .add_op(
            OperatorDef::new("track")
                .inputs(["log"])
                .outputs(["marker"])
                .with_arg("tag", ArgValue::Str("once".into())),
        );
    ws.run_net_once(&def)?;
    assert_eq!(log.entries(), vec!["once".to_string()]);
    assert!(ws.get_net("transient").is_none());
    Ok(())
}
