//! Save, load and checkpoint kernels streaming blobs through the key-value
//! store boundary.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use regex::Regex;

use crate::db::{open_db, DbMode};
use crate::error::RunError;
use crate::graph::ArgValue;
use crate::operator::OpContext;
use crate::serialize::{base_key, deserialize_blob, serialize_blob};
use crate::tensor::Tensor;
use crate::types::DeviceOption;
use crate::workspace::Workspace;

fn full_db_name(ctx: &OpContext, ws: &Workspace, db_name: &str) -> Result<String> {
    if ctx.arg_bool("absolute_path", false)? {
        Ok(db_name.to_string())
    } else {
        Ok(format!("{}/{}", ws.root_folder(), db_name))
    }
}

/// Stream every input blob into the store, one transaction per record, with
/// an optional regex strip applied to the emitted key names.
pub fn save(ctx: &OpContext) -> Result<()> {
    let db_name = ctx.arg_str("db", "")?;
    let db_type = ctx.arg_str("db_type", "")?;
    if db_name.is_empty() || db_type.is_empty() {
        return Err(anyhow!("save: must specify a db name and a db type"));
    }
    let ws = ctx.workspace()?;
    let db = open_db(&db_type, &full_db_name(ctx, &ws, &db_name)?, DbMode::New)?;

    let strip_raw = ctx.arg_str("strip_regex", "")?;
    let strip = if strip_raw.is_empty() {
        None
    } else {
        Some(Regex::new(&strip_raw).map_err(|err| anyhow!("save: bad strip_regex: {}", err))?)
    };
    let stripped = |name: &str| -> String {
        match &strip {
            Some(re) => re.replace_all(name, "").into_owned(),
            None => name.to_string(),
        }
    };

    let mut names = HashSet::new();
    for i in 0..ctx.num_inputs() {
        let name = stripped(ctx.input_name(i));
        if !names.insert(name.clone()) {
            return Err(anyhow!("save: duplicated feature {}", name));
        }
    }

    for i in 0..ctx.num_inputs() {
        let mut records = Vec::new();
        {
            let guard = ctx.input_blob(i)?.lock().expect("blob lock poisoned");
            serialize_blob(&guard, ctx.input_name(i), &mut |key, bytes| {
                records.push((key, bytes));
            })?;
        }
        for (key, bytes) in records {
            let key = stripped(&key);
            crate::trace!("save: sending {} ({} bytes)", key, bytes.len());
            let mut txn = db.new_transaction()?;
            txn.put(&key, bytes);
            txn.commit()?;
        }
    }
    Ok(())
}

pub fn load(ctx: &OpContext) -> Result<()> {
    let db_name = ctx.arg_str("db", "")?;
    let db_type = ctx.arg_str("db_type", "")?;
    if db_name.is_empty() || db_type.is_empty() {
        return Err(anyhow!("load: must specify a db name and a db type"));
    }
    let keep_device = ctx.arg_bool("keep_device", false)?;
    let load_all = ctx.arg_bool("load_all", false)?;
    let ws = ctx.workspace()?;
    let db = open_db(&db_type, &full_db_name(ctx, &ws, &db_name)?, DbMode::Read)?;
    let mut cursor = db.new_cursor()?;

    let device_override = if keep_device {
        None
    } else {
        Some(ctx.device())
    };

    if load_all {
        extract_all(&ws, cursor.as_mut(), device_override)
    } else {
        extract_from(ctx, cursor.as_mut(), device_override)
    }
}

fn extract_all(
    ws: &Workspace,
    cursor: &mut dyn crate::db::DbCursor,
    device_override: Option<DeviceOption>,
) -> Result<()> {
    let mut seen: HashSet<String> = HashSet::new();
    while cursor.valid() {
        let db_key = cursor.key();
        let key = base_key(&db_key).to_string();
        // Reset before the first chunk so stale payloads (possibly bound
        // to another device) are dropped rather than overwritten.
        if !seen.contains(&key) {
            if let Some(blob) = ws.get_blob(&key) {
                blob.lock().expect("blob lock poisoned").reset();
            }
        }
        let blob = ws.create_blob(&key);
        let info = {
            let mut guard = blob.lock().expect("blob lock poisoned");
            deserialize_blob(&cursor.value(), &mut guard, device_override)?
        };
        if !info.is_tensor && seen.contains(&key) {
            return Err(anyhow!("load: blob {} duplicated in the store", key));
        }
        seen.insert(key);
        cursor.next();
    }
    crate::trace!("load: fully loaded {} blobs", seen.len());
    Ok(())
}

fn extract_from(
    ctx: &OpContext,
    cursor: &mut dyn crate::db::DbCursor,
    device_override: Option<DeviceOption>,
) -> Result<()> {
    let output_indices: HashMap<&str, usize> = ctx
        .def()
        .output
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    let mut loaded: HashSet<usize> = HashSet::new();
    let mut blob_elems: HashMap<usize, usize> = HashMap::new();

    while cursor.valid() {
        let db_key = cursor.key();
        let key = base_key(&db_key).to_string();
        let Some(&idx) = output_indices.get(key.as_str()) else {
            crate::trace!("load: key {} not used, skipping", key);
            cursor.next();
            continue;
        };
        if loaded.contains(&idx) {
            return Err(anyhow!("load: multiple copies of blob {} found", key));
        }
        let blob = ctx.output_blob(idx)?;
        let first_chunk = !blob_elems.contains_key(&idx);
        let info = {
            let mut guard = blob.lock().expect("blob lock poisoned");
            if first_chunk {
                guard.reset();
            }
            deserialize_blob(&cursor.value(), &mut guard, device_override)?
        };
        if info.is_tensor {
            let acc = blob_elems.entry(idx).or_insert(0);
            *acc += info.chunk_elems;
            if *acc >= info.total_elems {
                loaded.insert(idx);
            }
        } else {
            blob_elems.entry(idx).or_insert(0);
            loaded.insert(idx);
        }
        if loaded.len() >= ctx.num_outputs() {
            crate::trace!("load: read all required blobs");
            break;
        }
        cursor.next();
    }

    for (&idx, &acc) in &blob_elems {
        let blob = ctx.output_blob(idx)?;
        let guard = blob.lock().expect("blob lock poisoned");
        if let Ok(tensor) = guard.get::<Tensor>() {
            if tensor.len() != acc {
                return Err(RunError::DataSizeMismatch(format!(
                    "blob {}: expected {} elements, read {}",
                    ctx.output_name(idx),
                    tensor.len(),
                    acc
                ))
                .into());
            }
        }
    }

    if loaded.len() != ctx.num_outputs() {
        for (idx, name) in ctx.def().output.iter().enumerate() {
            if !loaded.contains(&idx) {
                crate::error!("load: failed to load blob {}", name);
            }
        }
        return Err(anyhow!(
            "load: expected to load {} blobs, got {}",
            ctx.num_outputs(),
            loaded.len()
        ));
    }
    Ok(())
}

/// Wraps `save` with an iteration-parameterized name pattern; input 0 is
/// the iteration counter.
pub fn checkpoint(ctx: &OpContext) -> Result<()> {
    let pattern = ctx.arg_str("db", "")?;
    if pattern.is_empty() {
        return Err(anyhow!("checkpoint: must specify a db file pattern"));
    }
    let every = ctx.arg_int("every", 1)?;
    if every <= 0 {
        return Err(anyhow!("checkpoint: interval should be positive"));
    }
    if every == 1 {
        crate::warning!("checkpoint: checkpointing every iteration, is that intended?");
    }
    let iteration = ctx.input_tensor(0)?.as_slice::<i64>()?[0];
    if iteration % every != 0 {
        return Ok(());
    }
    let mut save_def = ctx.def().clone();
    save_def.op_type = "save".to_string();
    save_def.arg.retain(|arg| arg.name != "db" && arg.name != "every");
    save_def.arg.push(crate::graph::Argument {
        name: "db".to_string(),
        value: ArgValue::Str(pattern.replacen("%d", &iteration.to_string(), 1)),
    });
    ctx.workspace()?.run_operator_once(&save_def)
}
