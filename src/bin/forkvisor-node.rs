//! Scripted preloaded node.
//!
//! Speaks the node protocol with behavior taken from JSON passed as the first
//! argument or, failing that, in `FORKVISOR_PLAN`:
//!
//! ```json
//! {
//!   "actions":  { "boot": { "features": ["/app/boot.rb"], "fail": null, "delay_ms": 0 } },
//!   "commands": { "rake": { "output": "done\n", "exit": 0, "echo_args": true } }
//! }
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use forkvisor::agent::{self, FeatureReporter, Plan};
use serde::Deserialize;

const PLAN_ENV: &str = "FORKVISOR_PLAN";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScriptedPlan {
    actions: HashMap<String, Action>,
    commands: HashMap<String, CommandSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Action {
    features: Vec<String>,
    fail: Option<String>,
    delay_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandSpec {
    output: String,
    exit: i32,
    echo_args: bool,
    sleep_ms: u64,
}

impl Plan for ScriptedPlan {
    fn action(&mut self, name: &str, features: &mut FeatureReporter) -> Result<(), String> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| format!("unknown action {name:?}"))?;
        for path in &action.features {
            features.report(path);
        }
        if action.delay_ms > 0 {
            thread::sleep(Duration::from_millis(action.delay_ms));
        }
        match &action.fail {
            Some(text) => Err(text.clone()),
            None => Ok(()),
        }
    }

    fn command(&mut self, name: &str, args: &[String]) -> i32 {
        let mut out = std::io::stdout();
        let Some(spec) = self.commands.get(name) else {
            let _ = writeln!(out, "no such command: {name}");
            return 1;
        };
        let _ = out.write_all(spec.output.as_bytes());
        if spec.echo_args {
            let _ = writeln!(out, "{}", args.join(" "));
        }
        let _ = out.flush();
        if spec.sleep_ms > 0 {
            thread::sleep(Duration::from_millis(spec.sleep_ms));
        }
        spec.exit
    }
}

fn main() -> ExitCode {
    forkvisor::logging::init();

    let raw = std::env::args().nth(1).or_else(|| std::env::var(PLAN_ENV).ok());
    let mut plan = match raw {
        Some(raw) => match serde_json::from_str::<ScriptedPlan>(&raw) {
            Ok(plan) => plan,
            Err(err) => {
                eprintln!("invalid plan: {err}");
                return ExitCode::from(2);
            }
        },
        None => ScriptedPlan::default(),
    };

    match agent::run(&mut plan) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            tracing::error!(error = %err, label = err.as_label(), "node failed");
            ExitCode::FAILURE
        }
    }
}
