use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper around the `git` binary for one repository.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.exec(&self.repo_path, &["rev-parse", "--verify", branch])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    /// True when the checkout at `dir` has no uncommitted or staged changes.
    pub fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    pub fn current_branch(&self, dir: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse --abbrev-ref HEAD failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn add_worktree(&self, worktree_path: &str, branch: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", worktree_path, branch],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for {worktree_path} ({branch}): {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn add_worktree_new_branch(
        &self,
        worktree_path: &str,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", worktree_path, "-b", branch, base],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add -b {branch} failed for {worktree_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Add a detached disposable worktree at `worktree_path` for `refname`.
    pub fn add_detached_worktree(&self, worktree_path: &str, refname: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", "--detach", worktree_path, refname],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add --detach failed for {worktree_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn remove_worktree(&self, worktree_path: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "remove", "--force", worktree_path],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree remove failed for {worktree_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) {
        let _ = self.exec(&self.repo_path, &["worktree", "prune"]);
    }

    pub fn rebase_onto(&self, worktree_path: &str, target: &str) -> Result<ExecResult> {
        self.exec(worktree_path, &["rebase", target])
    }

    pub fn abort_rebase(&self, worktree_path: &str) {
        let _ = self.exec(worktree_path, &["rebase", "--abort"]);
    }

    /// Hard-reset the checkout at `dir` to `refname`.  Untracked files are
    /// left in place.
    pub fn reset_hard(&self, dir: &str, refname: &str) -> Result<()> {
        let result = self.exec(dir, &["reset", "--hard", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git reset --hard {refname} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Move the branch checked out at `dir` forward to `refname`,
    /// fast-forward only.
    pub fn fast_forward(&self, dir: &str, refname: &str) -> Result<ExecResult> {
        self.exec(dir, &["merge", "--ff-only", refname])
    }

    pub fn update_branch_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["branch", "-f", branch, sha])?;
        if !result.success() {
            return Err(anyhow!(
                "git branch -f {branch} {sha} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }
}
