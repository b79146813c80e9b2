use anyhow::Result;
use opennet::db::{drop_mem_store, open_db, DbMode};
use opennet::serialize::{CHUNK_ID_SEPARATOR, DEFAULT_CHUNK_ELEMS};
use opennet::{ArgValue, DType, OperatorDef, RunError, Tensor, Workspace};

use crate::common;

fn save_def(db: &str, inputs: &[&str]) -> OperatorDef {
    OperatorDef::new("save")
        .inputs(inputs.to_vec())
        .with_arg("db", ArgValue::Str(db.into()))
        .with_arg("db_type", ArgValue::Str("memdb".into()))
        .with_arg("absolute_path", ArgValue::Int(1))
}

fn load_def(db: &str, outputs: &[&str]) -> OperatorDef {
    OperatorDef::new("load")
        .outputs(outputs.to_vec())
        .with_arg("db", ArgValue::Str(db.into()))
        .with_arg("db_type", ArgValue::Str("memdb".into()))
        .with_arg("absolute_path", ArgValue::Int(1))
}

#[test]
fn save_load_round_trip_preserves_type_shape_and_bytes() -> Result<()> {
    let db = "round_trip";
    drop_mem_store(db);

    let ws = Workspace::new();
    common::feed(
        &ws,
        "t1",
        Tensor::from_vec_shaped(vec![1.5f32, -2.0, 0.25, 8.0, 3.0, 9.5], vec![2, 3])?,
    );
    common::feed(&ws, "t2", Tensor::from_vec(vec![7i64, 8, 9, 10, 11]));
    ws.run_operator_once(&save_def(db, &["t1", "t2"]))?;

    let fresh = Workspace::new();
    fresh.run_operator_once(&load_def(db, &["t1", "t2"]))?;

    for name in ["t1", "t2"] {
        let original = common::fetch(&ws, name)?;
        let loaded = common::fetch(&fresh, name)?;
        assert_eq!(loaded.dtype(), original.dtype());
        assert_eq!(loaded.shape(), original.shape());
        assert_eq!(loaded.raw_bytes(), original.raw_bytes());
    }
    Ok(())
}

#[test]
fn large_tensors_round_trip_through_chunks() -> Result<()> {
    let db = "chunked";
    drop_mem_store(db);

    let elems = DEFAULT_CHUNK_ELEMS + 1_000;
    let data: Vec<f32> = (0..elems).map(|i| (i % 251) as f32).collect();
    let ws = Workspace::new();
    common::feed(&ws, "big", Tensor::from_vec(data));
    ws.run_operator_once(&save_def(db, &["big"]))?;

    // Chunking is visible at the store level as suffixed keys.
    let handle = open_db("memdb", db, DbMode::Read)?;
    let mut cursor = handle.new_cursor()?;
    let mut keys = Vec::new();
    while cursor.valid() {
        keys.push(cursor.key());
        cursor.next();
    }
    assert!(keys.len() >= 2);
    assert!(keys.iter().all(|key| key.contains(CHUNK_ID_SEPARATOR)));

    let fresh = Workspace::new();
    fresh.run_operator_once(&load_def(db, &["big"]))?;
    let loaded = common::fetch(&fresh, "big")?;
    assert_eq!(loaded.len(), elems);
    assert_eq!(loaded.raw_bytes(), common::fetch(&ws, "big")?.raw_bytes());
    Ok(())
}

#[test]
fn missing_chunks_fail_the_size_check() -> Result<()> {
    let db = "chunk_src";
    let partial = "chunk_partial";
    drop_mem_store(db);
    drop_mem_store(partial);

    let elems = DEFAULT_CHUNK_ELEMS + 1_000;
    let ws = Workspace::new();
    common::feed(&ws, "big", Tensor::from_vec(vec![1.0f32; elems]));
    ws.run_operator_once(&save_def(db, &["big"]))?;

    // Copy only the first chunk into a second store.
    let src = open_db("memdb", db, DbMode::Read)?;
    let dst = open_db("memdb", partial, DbMode::New)?;
    let mut cursor = src.new_cursor()?;
    let mut txn = dst.new_transaction()?;
    txn.put(&cursor.key(), cursor.value());
    txn.commit()?;

    let fresh = Workspace::new();
    let err = fresh
        .run_operator_once(&load_def(partial, &["big"]))
        .unwrap_err();
    assert!(err.chain().any(|cause| matches!(
        cause.downcast_ref::<RunError>(),
        Some(RunError::DataSizeMismatch(_))
    )));
    Ok(())
}

#[test]
fn load_all_restores_every_record() -> Result<()> {
    let db = "load_all";
    drop_mem_store(db);

    let ws = Workspace::new();
    common::feed(&ws, "x", Tensor::from_vec(vec![1i32, 2, 3]));
    common::feed(&ws, "y", Tensor::from_vec(vec![4.0f64]));
    ws.run_operator_once(&save_def(db, &["x", "y"]))?;

    let fresh = Workspace::new();
    let mut def = load_def(db, &[]);
    def.arg.push(opennet::Argument {
        name: "load_all".into(),
        value: ArgValue::Int(1),
    });
    fresh.run_operator_once(&def)?;
    assert_eq!(common::fetch_i32(&fresh, "x")?, vec![1, 2, 3]);
    assert_eq!(common::fetch(&fresh, "y")?.dtype(), DType::F64);
    Ok(())
}

#[test]
fn strip_regex_rewrites_saved_keys() -> Result<()> {
    let db = "stripped";
    drop_mem_store(db);

    let ws = Workspace::new();
    common::feed(&ws, "ns/t1", Tensor::from_vec(vec![1i32]));
    let mut def = save_def(db, &["ns/t1"]);
    def.arg.push(opennet::Argument {
        name: "strip_regex".into(),
        value: ArgValue::Str("^ns/".into()),
    });
    ws.run_operator_once(&def)?;

    let fresh = Workspace::new();
    fresh.run_operator_once(&load_def(db, &["t1"]))?;
    assert_eq!(common::fetch_i32(&fresh, "t1")?, vec![1]);
    Ok(())
}

#[test]
fn checkpoint_saves_on_matching_iterations_only() -> Result<()> {
    drop_mem_store("ckpt_6");
    drop_mem_store("ckpt_7");

    let ws = Workspace::new();
    common::feed(&ws, "iters", Tensor::from_vec(vec![6i64]));
    common::feed(&ws, "t", Tensor::from_vec(vec![1.0f32, 2.0]));
    let def = |every: i64| {
        OperatorDef::new("checkpoint")
            .inputs(["iters", "t"])
            .with_arg("db", ArgValue::Str("ckpt_%d".into()))
            .with_arg("db_type", ArgValue::Str("memdb".into()))
            .with_arg("absolute_path", ArgValue::Int(1))
            .with_arg("every", ArgValue::Int(every))
    };
    ws.run_operator_once(&def(3))?;
    assert!(open_db("memdb", "ckpt_6", DbMode::Read).is_ok());

    common::feed(&ws, "iters", Tensor::from_vec(vec![7i64]));
    ws.run_operator_once(&def(3))?;
    assert!(open_db("memdb", "ckpt_7", DbMode::Read).is_err());
    Ok(())
}

#[test]
fn device_rebinding_follows_keep_device() -> Result<()> {
    let db = "devices";
    drop_mem_store(db);

    let ws = Workspace::new();
    common::feed(
        &ws,
        "t",
        Tensor::from_vec(vec![1.0f32]).with_device(opennet::DeviceOption::gpu(1)),
    );
    ws.run_operator_once(&save_def(db, &["t"]))?;

    // Default: rebind to the load op's device.
    let fresh = Workspace::new();
    fresh.run_operator_once(&load_def(db, &["t"]))?;
    assert_eq!(
        common::fetch(&fresh, "t")?.device(),
        opennet::DeviceOption::cpu()
    );

    // keep_device: the recorded binding wins.
    let kept = Workspace::new();
    let mut def = load_def(db, &["t"]);
    def.arg.push(opennet::Argument {
        name: "keep_device".into(),
        value: ArgValue::Int(1),
    });
    kept.run_operator_once(&def)?;
    assert_eq!(
        common::fetch(&kept, "t")?.device(),
        opennet::DeviceOption::gpu(1)
    );
    Ok(())
}
