//! Out-of-process sources: run a program and read its stdout as JSON.

use std::process::Stdio;

use async_trait::async_trait;
use oppscout_shared::{Result, ScoutError};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{FetchCapability, FetchPayload, SourceParams};

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
}

/// Runs an external program whose stdout is a JSON array of records.
///
/// The child is killed when the fetch future is dropped, so an abandoned
/// task does not leave a process behind.
pub struct CommandCapability;

fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[async_trait]
impl FetchCapability for CommandCapability {
    fn id(&self) -> &'static str {
        "command"
    }

    fn accepted_params(&self) -> &'static [&'static str] {
        &["program", "args", "working_dir"]
    }

    fn validate(&self, params: &SourceParams) -> Result<()> {
        let p: CommandParams = params.parse()?;
        if p.program.trim().is_empty() {
            return Err(ScoutError::validation("program must not be empty"));
        }
        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<FetchPayload> {
        let p: CommandParams = params.parse()?;
        debug!(program = %p.program, args = ?p.args, "spawning source command");

        let mut cmd = Command::new(&p.program);
        cmd.args(&p.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &p.working_dir {
            cmd.current_dir(oppscout_shared::expand_home(dir));
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| ScoutError::io(&p.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScoutError::parse(format!(
                "{} exited with {}: {}",
                p.program,
                output.status,
                tail(stderr.trim(), STDERR_TAIL_CHARS)
            )));
        }

        let value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ScoutError::parse(format!("{} printed invalid JSON: {e}", p.program)))?;
        Ok(FetchPayload::Json(value))
    }
}
