use std::collections::HashSet;
use std::thread;

use anyhow::Result;
use opennet::{ArgValue, OperatorDef, RunError, Tensor, Workspace};

use crate::common;

const SCHEMA: [&str; 3] = ["a", "b:lengths", "b:values"];

fn feed_ragged(ws: &Workspace) {
    common::feed(ws, "a", Tensor::from_vec(vec![1i32, 2, 3, 4]));
    common::feed(ws, "b:lengths", Tensor::from_vec(vec![2i32, 0, 1, 3]));
    common::feed(
        ws,
        "b:values",
        Tensor::from_vec(vec![10i32, 11, 20, 30, 31, 32]),
    );
}

fn make_cursor(ws: &Workspace, name: &str) -> Result<()> {
    ws.run_operator_once(
        &OperatorDef::new("create_tree_cursor")
            .outputs([name])
            .with_arg(
                "fields",
                ArgValue::Strs(SCHEMA.iter().map(|s| s.to_string()).collect()),
            ),
    )
}

fn read_batch(ws: &Workspace, cursor: &str, outs: [&str; 3], batch: i64) -> Result<()> {
    ws.run_operator_once(
        &OperatorDef::new("read_next_batch")
            .inputs([cursor, "a", "b:lengths", "b:values"])
            .outputs(outs)
            .with_arg("batch_size", ArgValue::Int(batch)),
    )
}

#[test]
fn read_next_batch_walks_the_ragged_schema() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;

    read_batch(&ws, "cursor", ["o_a", "o_bl", "o_bv"], 2)?;
    assert_eq!(common::fetch_i32(&ws, "o_a")?, vec![1, 2]);
    assert_eq!(common::fetch_i32(&ws, "o_bl")?, vec![2, 0]);
    assert_eq!(common::fetch_i32(&ws, "o_bv")?, vec![10, 11]);

    read_batch(&ws, "cursor", ["o_a", "o_bl", "o_bv"], 2)?;
    assert_eq!(common::fetch_i32(&ws, "o_a")?, vec![3, 4]);
    assert_eq!(common::fetch_i32(&ws, "o_bl")?, vec![1, 3]);
    assert_eq!(common::fetch_i32(&ws, "o_bv")?, vec![20, 30, 31, 32]);

    // Past the end: empty batches.
    read_batch(&ws, "cursor", ["o_a", "o_bl", "o_bv"], 2)?;
    assert_eq!(common::fetch_i32(&ws, "o_a")?, Vec::<i32>::new());
    Ok(())
}

#[test]
fn reset_cursor_restarts_traversal() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;
    read_batch(&ws, "cursor", ["o_a", "o_bl", "o_bv"], 3)?;
    ws.run_operator_once(&OperatorDef::new("reset_cursor").inputs(["cursor"]))?;
    read_batch(&ws, "cursor", ["o_a", "o_bl", "o_bv"], 1)?;
    assert_eq!(common::fetch_i32(&ws, "o_a")?, vec![1]);
    Ok(())
}

#[test]
fn concurrent_readers_claim_each_index_exactly_once() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;

    thread::scope(|scope| {
        for i in 0..4 {
            let ws = &ws;
            scope.spawn(move || {
                let outs = [
                    format!("t{}_a", i),
                    format!("t{}_bl", i),
                    format!("t{}_bv", i),
                ];
                ws.run_operator_once(
                    &OperatorDef::new("read_next_batch")
                        .inputs(["cursor", "a", "b:lengths", "b:values"])
                        .outputs(outs)
                        .with_arg("batch_size", ArgValue::Int(1)),
                )
                .expect("batch read failed");
            });
        }
    });

    let mut seen = Vec::new();
    for i in 0..4 {
        seen.extend(common::fetch_i32(&ws, &format!("t{}_a", i))?);
    }
    let unique: HashSet<i32> = seen.iter().copied().collect();
    assert_eq!(unique, HashSet::from([1, 2, 3, 4]));
    Ok(())
}

#[test]
fn compute_offset_matrix_tracks_cursor_states() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;
    ws.run_operator_once(
        &OperatorDef::new("compute_offset")
            .inputs(["cursor", "a", "b:lengths", "b:values"])
            .outputs(["offsets"]),
    )?;
    let matrix = common::fetch(&ws, "offsets")?;
    assert_eq!(matrix.shape(), &[5, 2]);
    assert_eq!(
        matrix.as_slice::<i64>()?,
        &[0, 0, 1, 2, 2, 2, 3, 3, 4, 6]
    );
    Ok(())
}

#[test]
fn sort_and_shuffle_emits_a_permutation() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;
    ws.run_operator_once(
        &OperatorDef::new("sort_and_shuffle")
            .inputs(["cursor", "a", "b:lengths", "b:values"])
            .outputs(["perm"])
            .with_arg("sort_by_field_idx", ArgValue::Int(-1))
            .with_arg("batch_size", ArgValue::Int(2))
            .with_arg("shuffle_size", ArgValue::Int(1)),
    )?;
    let perm = common::fetch_i64(&ws, "perm")?;
    let unique: HashSet<i64> = perm.iter().copied().collect();
    assert_eq!(unique, HashSet::from([0, 1, 2, 3]));
    Ok(())
}

#[test]
fn read_random_batch_gathers_via_offset_matrix() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    make_cursor(&ws, "cursor")?;
    ws.run_operator_once(
        &OperatorDef::new("compute_offset")
            .inputs(["cursor", "a", "b:lengths", "b:values"])
            .outputs(["offsets"]),
    )?;
    // Fixed permutation: walk top-level entries in reverse.
    common::feed(&ws, "perm", Tensor::from_vec(vec![3i64, 2, 1, 0]));

    let read = |outs: [&str; 3]| {
        ws.run_operator_once(
            &OperatorDef::new("read_random_batch")
                .inputs(["cursor", "perm", "offsets", "a", "b:lengths", "b:values"])
                .outputs(outs)
                .with_arg("batch_size", ArgValue::Int(1)),
        )
    };
    read(["r_a", "r_bl", "r_bv"])?;
    assert_eq!(common::fetch_i32(&ws, "r_a")?, vec![4]);
    assert_eq!(common::fetch_i32(&ws, "r_bl")?, vec![3]);
    assert_eq!(common::fetch_i32(&ws, "r_bv")?, vec![30, 31, 32]);

    read(["r_a", "r_bl", "r_bv"])?;
    assert_eq!(common::fetch_i32(&ws, "r_a")?, vec![3]);
    assert_eq!(common::fetch_i32(&ws, "r_bl")?, vec![1]);
    assert_eq!(common::fetch_i32(&ws, "r_bv")?, vec![20]);
    Ok(())
}

#[test]
fn consistency_check_accepts_and_rejects() -> Result<()> {
    let ws = Workspace::new();
    feed_ragged(&ws);
    let check = OperatorDef::new("check_dataset_consistency")
        .inputs(["a", "b:lengths", "b:values"])
        .with_arg(
            "fields",
            ArgValue::Strs(SCHEMA.iter().map(|s| s.to_string()).collect()),
        );
    ws.run_operator_once(&check)?;

    // Lengths that no longer sum to the values size must be rejected.
    common::feed(&ws, "b:lengths", Tensor::from_vec(vec![2i32, 0, 1, 9]));
    let err = ws.run_operator_once(&check).unwrap_err();
    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<RunError>(), Some(RunError::ShapeMismatch(_)))));
    Ok(())
}

#[test]
fn append_extends_in_place_and_keeps_trailing_dims() -> Result<()> {
    let ws = Workspace::new();
    common::feed(
        &ws,
        "dst",
        Tensor::from_vec_shaped(vec![1.0f32, 2.0, 3.0, 4.0], vec![2, 2])?,
    );
    common::feed(
        &ws,
        "src",
        Tensor::from_vec_shaped(vec![5.0f32, 6.0], vec![1, 2])?,
    );
    ws.run_operator_once(
        &OperatorDef::new("append")
            .inputs(["dst", "src"])
            .outputs(["dst"]),
    )?;
    let dst = common::fetch(&ws, "dst")?;
    assert_eq!(dst.shape(), &[3, 2]);
    assert_eq!(dst.as_slice::<f32>()?, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn append_rejects_trailing_dim_mismatch() {
    let ws = Workspace::new();
    common::feed(
        &ws,
        "dst",
        Tensor::from_vec_shaped(vec![1.0f32, 2.0], vec![1, 2]).unwrap(),
    );
    common::feed(
        &ws,
        "src",
        Tensor::from_vec_shaped(vec![5.0f32, 6.0, 7.0], vec![1, 3]).unwrap(),
    );
    let err = ws
        .run_operator_once(
            &OperatorDef::new("append")
                .inputs(["dst", "src"])
                .outputs(["dst"]),
        )
        .unwrap_err();
    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<RunError>(), Some(RunError::ShapeMismatch(_)))));
}

#[test]
fn atomic_append_extends_all_fields_together() -> Result<()> {
    let ws = Workspace::new();
    ws.run_operator_once(&OperatorDef::new("create_mutex").outputs(["mtx"]))?;
    common::feed(&ws, "f0", Tensor::from_vec(vec![1i32, 2]));
    common::feed(&ws, "f1", Tensor::from_vec(vec![10i32]));
    common::feed(&ws, "s0", Tensor::from_vec(vec![3i32]));
    common::feed(&ws, "s1", Tensor::from_vec(vec![20i32, 30]));
    ws.run_operator_once(
        &OperatorDef::new("atomic_append")
            .inputs(["mtx", "f0", "f1", "s0", "s1"])
            .outputs(["f0", "f1"]),
    )?;
    assert_eq!(common::fetch_i32(&ws, "f0")?, vec![1, 2, 3]);
    assert_eq!(common::fetch_i32(&ws, "f1")?, vec![10, 20, 30]);
    Ok(())
}
