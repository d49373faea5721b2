pub mod delegate;
pub mod find_files;
pub mod write_file;

use std::path::{Path, PathBuf};

/// Resolve a tool path argument against the run's working directory.
pub(crate) fn resolve_path(raw: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(dir: &Path) -> vigil_core::tools::ToolContext {
    use vigil_core::ids::{RunId, ToolCallId};

    vigil_core::tools::ToolContext {
        run_id: RunId::new(),
        agent_kind: "worker".into(),
        tool_call_id: ToolCallId::new(),
        step: 0,
        working_directory: dir.to_path_buf(),
        cancel: tokio_util::sync::CancellationToken::new(),
        delegator: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_working_dir() {
        let base = Path::new("/work");
        assert_eq!(resolve_path("a/b.txt", base), PathBuf::from("/work/a/b.txt"));
        assert_eq!(resolve_path("/etc/hosts", base), PathBuf::from("/etc/hosts"));
    }
}
