use std::path::PathBuf;

use async_trait::async_trait;
use vigil_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use super::resolve_path;

/// Read-only glob search. Safe to run without review.
pub struct FindFilesTool;

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        "find_files"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern (e.g. '**/*.rs', 'src/*.toml')"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (defaults to working directory)"
                }
            }
        })
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("pattern is required".into()))?;

        let base_dir = match args["path"].as_str() {
            Some(p) => resolve_path(p, &ctx.working_directory),
            None => ctx.working_directory.clone(),
        };
        let full_pattern = base_dir.join(pattern).to_string_lossy().to_string();

        let mut matches = tokio::task::spawn_blocking(move || glob_paths(&full_pattern))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("glob task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolOutput::text("No files matched the pattern."));
        }

        matches.sort();
        let listing = matches
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::text(format!("{} file(s) matched:\n{listing}", matches.len())))
    }
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let entries = glob::glob(pattern)
        .map_err(|e| ToolError::InvalidArguments(format!("bad pattern: {e}")))?;
    Ok(entries.flatten().filter(|p| p.is_file()).collect())
}
