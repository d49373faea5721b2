use async_trait::async_trait;
use vigil_core::tools::{Tool, ToolClassification, ToolContext, ToolError, ToolOutput};

use super::resolve_path;

/// Writes a file. Every call needs a reviewer's approval before it runs.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            }
        })
    }

    fn classification(&self) -> ToolClassification {
        ToolClassification::Dangerous
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let raw_path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;

        let path = resolve_path(raw_path, &ctx.working_directory);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to create directory: {e}")))?;
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {}: {e}", path.display())))?;

        Ok(ToolOutput::text(format!(
            "Wrote {} bytes ({} lines) to {}",
            content.len(),
            content.lines().count(),
            path.display()
        )))
    }
}
