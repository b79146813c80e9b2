use anyhow::Result;
use opennet::{ArgValue, NetDef, OperatorDef, Tensor, Workspace};

use crate::common;

const T: usize = 3;
const B: usize = 2;
const D: usize = 4;

fn step_net() -> NetDef {
    // hidden[t+1] = hidden[t] + input[t], written through the link views.
    NetDef::new("rnn_step", "simple")
        .external_inputs(["h_prev", "x_t"])
        .add_op(
            OperatorDef::new("add")
                .inputs(["h_prev", "x_t"])
                .outputs(["h_t"]),
        )
}

fn forward_def(forward_only: bool) -> OperatorDef {
    OperatorDef::new("recurrent_network")
        .inputs(["seq_input", "h0"])
        .outputs(["h_out", "h"])
        .with_arg("step_net", ArgValue::Net(step_net()))
        .with_arg("recurrent_states", ArgValue::Strs(vec!["h".into()]))
        .with_arg("recurrent_inputs", ArgValue::Strs(vec!["h0".into()]))
        .with_arg("recurrent_sizes", ArgValue::Ints(vec![D as i64]))
        .with_arg(
            "link_internal",
            ArgValue::Strs(vec!["h_prev".into(), "x_t".into(), "h_t".into()]),
        )
        .with_arg(
            "link_external",
            ArgValue::Strs(vec!["h".into(), "seq_input".into(), "h".into()]),
        )
        .with_arg("link_offset", ArgValue::Ints(vec![0, 0, 1]))
        .with_arg("alias_src", ArgValue::Strs(vec!["h".into()]))
        .with_arg("alias_dst", ArgValue::Strs(vec!["h_out".into()]))
        .with_arg("alias_offset", ArgValue::Ints(vec![1]))
        .with_arg("forward_only", ArgValue::Int(forward_only as i64))
}

/// seq_input[t] is the constant t + 1 across the batch.
fn feed_forward_inputs(ws: &Workspace) {
    let mut seq = Vec::with_capacity(T * B * D);
    for t in 0..T {
        seq.extend(std::iter::repeat((t + 1) as f32).take(B * D));
    }
    common::feed(
        ws,
        "seq_input",
        Tensor::from_vec_shaped(seq, vec![T, B, D]).unwrap(),
    );
    common::feed(
        ws,
        "h0",
        Tensor::from_vec_shaped(vec![1.0f32; B * D], vec![1, B, D]).unwrap(),
    );
}

#[test]
fn unroll_runs_one_step_per_timestep() -> Result<()> {
    let ws = Workspace::new();
    feed_forward_inputs(&ws);
    ws.run_operator_once(&forward_def(false))?;

    // One prefix row plus T timesteps.
    let state = common::fetch(&ws, "h")?;
    assert_eq!(state.shape(), &[T + 1, B, D]);
    let data = state.as_slice::<f32>()?;
    // h[0] = 1, h[1] = 2, h[2] = 4, h[3] = 7.
    for (row, expected) in [1.0f32, 2.0, 4.0, 7.0].iter().enumerate() {
        for i in 0..B * D {
            assert_eq!(data[row * B * D + i], *expected, "row {}", row);
        }
    }

    // The output alias covers state[1..T+1].
    let out = common::fetch(&ws, "h_out")?;
    assert_eq!(out.shape(), &[T, B, D]);
    assert_eq!(out.as_slice::<f32>()?[0], 2.0);
    assert!(out.shares_storage_with(&state));
    Ok(())
}

#[test]
fn link_views_alias_the_state_bytes() -> Result<()> {
    let ws = Workspace::new();
    feed_forward_inputs(&ws);
    ws.run_operator_once(&forward_def(false))?;

    let mut state = common::fetch(&ws, "h")?;
    state.as_mut_slice::<f32>()?[B * D] = 42.0;
    let out = common::fetch(&ws, "h_out")?;
    assert_eq!(out.as_slice::<f32>()?[0], 42.0);
    Ok(())
}

#[test]
fn forward_only_mode_skips_the_workspace_stash() -> Result<()> {
    let ws = Workspace::new();
    feed_forward_inputs(&ws);
    ws.run_operator_once(&forward_def(true))?;
    assert_eq!(common::fetch(&ws, "h")?.shape(), &[T + 1, B, D]);
    assert!(!ws.has_blob("step_workspaces"));
    Ok(())
}

#[test]
fn backward_accumulates_state_and_param_gradients() -> Result<()> {
    let ws = Workspace::new();
    feed_forward_inputs(&ws);
    common::feed(
        &ws,
        "w",
        Tensor::from_vec_shaped(vec![0.5f32; B * D], vec![B, D])?,
    );
    ws.run_operator_once(&forward_def(false))?;

    // Outer gradient: row t is the constant 10 * (t + 1).
    let mut outer = Vec::with_capacity(T * B * D);
    for t in 0..T {
        outer.extend(std::iter::repeat(10.0 * (t + 1) as f32).take(B * D));
    }
    common::feed(
        &ws,
        "h_out_grad",
        Tensor::from_vec_shaped(outer, vec![T, B, D])?,
    );

    // The backward step-net overwrites w_grad with ones each timestep;
    // accumulation across T steps must sum them.
    let backward_step = NetDef::new("rnn_backward_step", "simple").add_op(
        OperatorDef::new("fill")
            .outputs(["w_grad"])
            .with_arg("shape", ArgValue::Ints(vec![B as i64, D as i64]))
            .with_arg("value", ArgValue::Float(1.0)),
    );
    let grad_def = OperatorDef::new("recurrent_network_gradient")
        .inputs(["h_out_grad"])
        .outputs(["w_grad"])
        .with_arg("backward_step_net", ArgValue::Net(backward_step))
        .with_arg("recurrent_states", ArgValue::Strs(vec!["h".into()]))
        .with_arg("param", ArgValue::Strs(vec!["w".into()]))
        .with_arg("param_gradient", ArgValue::Strs(vec!["w_grad".into()]));
    ws.run_operator_once(&grad_def)?;

    // Accumulated totals were swapped into the gradient blob.
    let w_grad = common::fetch_f32(&ws, "w_grad")?;
    assert_eq!(w_grad, vec![T as f32; B * D]);

    // h_grad[t + 1] accumulated the outer gradient at row t.
    let h_grad = common::fetch(&ws, "h_grad")?;
    assert_eq!(h_grad.shape(), &[T + 1, B, D]);
    let data = h_grad.as_slice::<f32>()?;
    for t in 0..T {
        let expected = 10.0 * (t + 1) as f32;
        assert_eq!(data[(t + 1) * B * D], expected, "timestep {}", t);
    }
    assert_eq!(data[0], 0.0);
    Ok(())
}
