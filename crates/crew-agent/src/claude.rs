//! Runs the Claude Code CLI as a subprocess turn executor.
//!
//! The per-tool [`PermissionGuard`](crew_core::session::PermissionGuard)
//! is an in-process contract; across the subprocess boundary the closest
//! equivalents are the permission mode and the disallowed-tool list, which
//! are forwarded as CLI flags.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crew_core::agent::{TurnExecutor, TurnOutcome, TurnRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

pub struct ClaudeExecutor {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    /// Kill the subprocess and fail the turn after this many seconds
    /// (0 = no limit).
    pub timeout_s: u64,
}

impl ClaudeExecutor {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            timeout_s: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

#[async_trait]
impl TurnExecutor for ClaudeExecutor {
    async fn execute(&self, req: TurnRequest) -> Result<TurnOutcome> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            req.permission_mode.clone(),
        ];
        if let Some(model) = &req.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(resume) = &req.resume {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        for dir in &req.add_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        if !req.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(req.disallowed_tools.join(","));
        }
        args.push("--print".to_string());
        args.push(req.prompt.clone());

        info!(
            cwd = %req.cwd.display(),
            resume = req.resume.is_some(),
            "spawning claude subprocess"
        );

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .kill_on_drop(true)
            .current_dir(&req.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!("claude stderr: {}", l);
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!("claude stderr: {}", l);
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status.success()))
        };

        let (raw_stream, success) = if self.timeout_s > 0 {
            match tokio::time::timeout(
                std::time::Duration::from_secs(self.timeout_s),
                io_future,
            )
            .await
            {
                Ok(result) => result?,
                Err(_elapsed) => {
                    anyhow::bail!("claude subprocess timed out after {}s", self.timeout_s);
                }
            }
        } else {
            io_future.await?
        };

        if !success {
            anyhow::bail!("claude subprocess exited with failure");
        }

        let parsed = crate::event::parse_stream(&raw_stream);
        info!(
            session_id = ?parsed.session_id,
            output_len = parsed.text.len(),
            "claude subprocess finished"
        );

        Ok(TurnOutcome {
            text: parsed.text,
            session_id: parsed.session_id,
            usage: parsed.usage,
        })
    }
}
