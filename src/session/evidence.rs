//! Evidence gathered when a session ends, for completion verification.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::util::truncate_chars;

const GIT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_SUMMARY_CHARS: usize = 8_000;
const NO_CHANGES: &str = "(no change summary available: working directory is not a git repository)";

/// What the agent left behind.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    /// `git status` plus `git diff --stat`, or a placeholder.
    pub change_summary: String,
    /// Recent agent output, which usually includes test runs.
    pub test_output: String,
}

/// Summarise the working directory state and attach the output tail.
pub async fn collect(working_dir: &Path, tail: &[String]) -> Evidence {
    let change_summary = match change_summary(working_dir).await {
        Ok(summary) => summary,
        Err(e) => {
            debug!(dir = %working_dir.display(), "No git evidence: {}", e);
            NO_CHANGES.to_string()
        }
    };

    Evidence {
        change_summary,
        test_output: tail.join("\n"),
    }
}

async fn change_summary(working_dir: &Path) -> anyhow::Result<String> {
    let status = run_git_command(&["status", "--porcelain"], working_dir).await?;
    let diff = run_git_command(&["diff", "--stat", "HEAD"], working_dir)
        .await
        .unwrap_or_default();

    let mut summary = String::new();
    if status.trim().is_empty() {
        summary.push_str("git status: clean (no uncommitted changes)\n");
    } else {
        summary.push_str("git status --porcelain:\n");
        summary.push_str(status.trim_end());
        summary.push('\n');
    }
    if !diff.trim().is_empty() {
        summary.push_str("\ngit diff --stat HEAD:\n");
        summary.push_str(diff.trim_end());
        summary.push('\n');
    }

    Ok(truncate_chars(&summary, MAX_SUMMARY_CHARS))
}

async fn run_git_command(args: &[&str], repo_path: &Path) -> anyhow::Result<String> {
    let child = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(GIT_TIMEOUT, child)
        .await
        .map_err(|_| anyhow::anyhow!("git {} timed out", args.join(" ")))?
        .map_err(|e| anyhow::anyhow!("Failed to run git: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        if stderr.is_empty() {
            return Err(anyhow::anyhow!("Git command failed: {}", stdout.trim()));
        }
        return Err(anyhow::anyhow!("Git error: {}", stderr.trim()));
    }

    Ok(stdout.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_git_directory_gets_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = collect(dir.path(), &["ran tests".to_string()]).await;
        assert_eq!(evidence.change_summary, NO_CHANGES);
        assert_eq!(evidence.test_output, "ran tests");
    }

    #[tokio::test]
    async fn missing_directory_gets_placeholder() {
        let evidence = collect(Path::new("/nonexistent/foreman-evidence"), &[]).await;
        assert_eq!(evidence.change_summary, NO_CHANGES);
        assert!(evidence.test_output.is_empty());
    }
}
