//! tmux-backed session backend.
//!
//! Every operation shells out to the `tmux` binary with a bounded timeout.
//! Sessions are addressed by their `#{session_id}` handle (`$N`), which tmux
//! never reuses within a server lifetime, so a restarted session is never
//! confused with its predecessor.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{BackendFuture, BackendSession, LaunchSpec, SessionBackend};
use crate::config::BackendConfig;
use crate::models::session::SessionKind;
use crate::{AppError, Result};

/// Session-identity variable exported into every session.
pub const SESSION_ID_ENV: &str = "AGENT_POOL_SESSION_ID";

/// Captured result of one tmux invocation.
struct TmuxOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl TmuxOutput {
    /// Whether tmux reported that the target or the whole server is gone.
    fn target_missing(&self) -> bool {
        let err = self.stderr.to_ascii_lowercase();
        err.contains("can't find")
            || err.contains("no server running")
            || err.contains("no such")
            || err.contains("error connecting")
    }
}

/// [`SessionBackend`] that drives a local tmux server.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    binary: String,
    timeout: Duration,
}

impl TmuxBackend {
    /// Build a backend from the `[backend]` configuration section.
    #[must_use]
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            binary: config.tmux_binary.clone(),
            timeout: Duration::from_secs(config.command_timeout_seconds),
        }
    }

    async fn run(&self, args: &[String]) -> Result<TmuxOutput> {
        debug!(binary = %self.binary, ?args, "invoking tmux");
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::BackendUnavailable(format!("failed to spawn {}: {err}", self.binary))
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AppError::BackendUnavailable(format!(
                    "{} did not answer within {}s",
                    self.binary,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|err| AppError::BackendUnavailable(format!("tmux wait failed: {err}")))?;

        Ok(TmuxOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    async fn create_inner(&self, spec: &LaunchSpec) -> Result<BackendSession> {
        let out = self.run(&new_session_args(spec)).await?;
        if !out.success {
            if out.stderr.contains("duplicate session") {
                return Err(AppError::DuplicateSession(spec.name.clone()));
            }
            return Err(AppError::BackendUnavailable(format!(
                "tmux new-session {} failed: {}",
                spec.name, out.stderr
            )));
        }
        let handle = out.stdout.trim().to_owned();
        if handle.is_empty() {
            return Err(AppError::BackendUnavailable(format!(
                "tmux new-session {} returned no session id",
                spec.name
            )));
        }

        let pipe = vec![
            "pipe-pane".to_owned(),
            "-o".to_owned(),
            "-t".to_owned(),
            handle.clone(),
            format!("cat >> {}", shell_quote(&spec.log_path.to_string_lossy())),
        ];
        // The session is usable without a log; the registry still owns it.
        match self.run(&pipe).await {
            Ok(piped) if piped.success => {}
            Ok(piped) => warn!(session = %spec.name, stderr = %piped.stderr, "pipe-pane failed"),
            Err(err) => warn!(session = %spec.name, %err, "pipe-pane failed"),
        }

        Ok(BackendSession {
            name: spec.name.clone(),
            handle,
        })
    }

    async fn destroy_inner(&self, handle: &str) -> Result<()> {
        let out = self
            .run(&["kill-session".to_owned(), "-t".to_owned(), kill_target(handle)])
            .await?;
        if out.success || out.target_missing() {
            return Ok(());
        }
        Err(AppError::BackendUnavailable(format!(
            "tmux kill-session {handle} failed: {}",
            out.stderr
        )))
    }

    async fn list_inner(&self) -> Result<Vec<BackendSession>> {
        let out = self
            .run(&[
                "list-sessions".to_owned(),
                "-F".to_owned(),
                "#{session_id} #{session_name}".to_owned(),
            ])
            .await?;
        if !out.success {
            if out.target_missing() {
                return Ok(Vec::new());
            }
            return Err(AppError::BackendUnavailable(format!(
                "tmux list-sessions failed: {}",
                out.stderr
            )));
        }
        Ok(parse_session_list(&out.stdout))
    }

    async fn send_inner(&self, handle: &str, text: &str, submit: bool) -> Result<()> {
        if !text.is_empty() {
            let out = self
                .run(&[
                    "send-keys".to_owned(),
                    "-t".to_owned(),
                    handle.to_owned(),
                    "-l".to_owned(),
                    text.to_owned(),
                ])
                .await?;
            check_target(&out, handle)?;
        }
        if submit {
            let out = self
                .run(&[
                    "send-keys".to_owned(),
                    "-t".to_owned(),
                    handle.to_owned(),
                    "Enter".to_owned(),
                ])
                .await?;
            check_target(&out, handle)?;
        }
        Ok(())
    }

    async fn read_inner(&self, handle: &str, max_lines: usize) -> Result<Vec<String>> {
        let out = self
            .run(&[
                "capture-pane".to_owned(),
                "-p".to_owned(),
                "-J".to_owned(),
                "-t".to_owned(),
                handle.to_owned(),
                "-S".to_owned(),
                format!("-{max_lines}"),
            ])
            .await?;
        check_target(&out, handle)?;
        Ok(tail_lines(&out.stdout, max_lines))
    }
}

impl SessionBackend for TmuxBackend {
    fn create<'a>(&'a self, spec: &'a LaunchSpec) -> BackendFuture<'a, BackendSession> {
        Box::pin(self.create_inner(spec))
    }

    fn destroy<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.destroy_inner(handle))
    }

    fn list(&self) -> BackendFuture<'_, Vec<BackendSession>> {
        Box::pin(self.list_inner())
    }

    fn send_input<'a>(
        &'a self,
        handle: &'a str,
        text: &'a str,
        submit: bool,
    ) -> BackendFuture<'a, ()> {
        Box::pin(self.send_inner(handle, text, submit))
    }

    fn read_output<'a>(
        &'a self,
        handle: &'a str,
        max_lines: usize,
    ) -> BackendFuture<'a, Vec<String>> {
        Box::pin(self.read_inner(handle, max_lines))
    }
}

fn check_target(out: &TmuxOutput, handle: &str) -> Result<()> {
    if out.success {
        Ok(())
    } else if out.target_missing() {
        Err(AppError::SessionNotFound(handle.to_owned()))
    } else {
        Err(AppError::BackendUnavailable(out.stderr.clone()))
    }
}

/// Argument vector for `tmux new-session`.
#[must_use]
pub fn new_session_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "new-session".to_owned(),
        "-d".to_owned(),
        "-P".to_owned(),
        "-F".to_owned(),
        "#{session_id}".to_owned(),
        "-s".to_owned(),
        spec.name.clone(),
        "-c".to_owned(),
        spec.working_dir.to_string_lossy().into_owned(),
        "-e".to_owned(),
        format!("{SESSION_ID_ENV}={}", spec.session_id),
    ];
    if let SessionKind::Scripted { command, args: argv, env } = &spec.kind {
        for (key, value) in env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push(command.clone());
        args.extend(argv.iter().cloned());
    }
    args
}

/// `kill-session` target for a session id (`$N`) or a session name. Names
/// are matched exactly so a missing session never resolves to a prefix.
#[must_use]
pub fn kill_target(handle: &str) -> String {
    if handle.starts_with('$') {
        handle.to_owned()
    } else {
        format!("={handle}")
    }
}

/// Parse `list-sessions -F '#{session_id} #{session_name}'` output.
#[must_use]
pub fn parse_session_list(stdout: &str) -> Vec<BackendSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let (handle, name) = line.trim().split_once(' ')?;
            Some(BackendSession {
                name: name.to_owned(),
                handle: handle.to_owned(),
            })
        })
        .collect()
}

/// Last `max_lines` lines of captured pane text, without trailing blanks.
#[must_use]
pub fn tail_lines(captured: &str, max_lines: usize) -> Vec<String> {
    let mut lines: Vec<&str> = captured.lines().collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].iter().map(|line| (*line).to_owned()).collect()
}

/// Single-quote `raw` for `/bin/sh`.
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
