//! Reference runner: load a plan description from a file and execute it.

use std::env;
use std::fs;
use std::process::ExitCode;

use anyhow::{anyhow, Result};

use opennet::{PlanDef, Workspace};

const USAGE: &str = "usage: run_plan --plan <path> [--root-folder <dir>]";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("run_plan: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let mut plan_path = None;
    let mut root_folder = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--plan" => {
                plan_path = Some(args.next().ok_or_else(|| anyhow!("--plan requires a path"))?)
            }
            "--root-folder" => {
                root_folder =
                    Some(args.next().ok_or_else(|| anyhow!("--root-folder requires a dir"))?)
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                return Ok(());
            }
            other => return Err(anyhow!("unknown argument {}\n{}", other, USAGE)),
        }
    }
    let plan_path = plan_path.ok_or_else(|| anyhow!("{}", USAGE))?;

    let raw = fs::read_to_string(&plan_path)
        .map_err(|err| anyhow!("cannot read plan {}: {}", plan_path, err))?;
    let plan = PlanDef::from_json(&raw)?;

    let ws = Workspace::new();
    if let Some(root) = root_folder {
        ws.set_root_folder(root);
    }
    ws.run_plan(&plan)
}
