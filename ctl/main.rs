#![forbid(unsafe_code)]

//! `agent-pool-ctl` — command-line companion for the `agent-pool` daemon.
//!
//! Most commands send one JSON request over the daemon's IPC socket and
//! print the JSON answer. Claim commands also work without a daemon when
//! `--claims-dir` points at the shared lock directory.
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage error.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

use agent_pool::claims::{ClaimCoordinator, ClaimStatus};
use agent_pool::config::GlobalConfig;
use agent_pool::ipc::protocol::{IpcRequest, IpcResponse, DEFAULT_OUTPUT_LINES};
use agent_pool::models::progress::{AgentStatus, MilestoneKind};
use agent_pool::models::session::ExistingSession;
use agent_pool::persistence::pidfile::{process_alive, read_pid, signal_stop};
use agent_pool::pool::ClaimView;
use agent_pool::AppError;

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "agent-pool-ctl",
    about = "Control the agent-pool daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Daemon configuration file; supplies the IPC name and state dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// IPC socket name; overrides the configuration.
    #[arg(long, global = true)]
    ipc_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch the daemon in the background and wait until it is up.
    Start {
        /// Daemon binary; defaults to `agent-pool` next to this binary.
        #[arg(long)]
        daemon_bin: Option<PathBuf>,
        /// Seconds to wait for the pidfile.
        #[arg(long, default_value_t = 10)]
        wait_seconds: u64,
    },

    /// Stop the daemon: graceful by default, immediate with `--force`.
    Stop {
        /// Send SIGKILL instead of SIGTERM. State is left for recovery.
        #[arg(long)]
        force: bool,
        /// Seconds to wait for a graceful exit.
        #[arg(long, default_value_t = 30)]
        wait_seconds: u64,
    },

    /// Daemon status, counters, and warnings.
    Status,

    /// List sessions.
    Sessions,

    /// Create a session.
    Create {
        /// Display name.
        name: String,
        /// Working directory.
        #[arg(long)]
        dir: PathBuf,
        /// Role id.
        #[arg(long, default_value = "agent")]
        role: String,
        /// What to do when a session with this name is running.
        #[arg(long, value_enum)]
        on_existing: OnExisting,
    },

    /// Destroy a session.
    Destroy {
        /// Logical session id.
        id: String,
    },

    /// Kill and re-create a session, keeping its id.
    Restart {
        /// Logical session id.
        id: String,
    },

    /// Type into a session.
    Send {
        /// Logical session id.
        id: String,
        /// Text to type.
        text: String,
        /// Do not press Enter afterwards.
        #[arg(long)]
        no_submit: bool,
    },

    /// Print a session's recent output.
    Read {
        /// Logical session id.
        id: String,
        /// Number of trailing lines.
        #[arg(long, default_value_t = DEFAULT_OUTPUT_LINES)]
        lines: usize,
    },

    /// Claim a work item.
    Claim {
        /// Work item id.
        item_id: String,
        /// Claimant identity.
        #[arg(long)]
        holder: String,
        /// Lease length in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Operate on this lock directory directly, without the daemon.
        #[arg(long)]
        claims_dir: Option<PathBuf>,
    },

    /// Extend a held claim.
    Renew {
        /// Work item id.
        item_id: String,
        /// Current holder.
        #[arg(long)]
        holder: String,
        /// New lease length in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Operate on this lock directory directly, without the daemon.
        #[arg(long)]
        claims_dir: Option<PathBuf>,
    },

    /// Release a held claim.
    Release {
        /// Work item id.
        item_id: String,
        /// Current holder.
        #[arg(long)]
        holder: String,
        /// Operate on this lock directory directly, without the daemon.
        #[arg(long)]
        claims_dir: Option<PathBuf>,
    },

    /// Show who holds a work item.
    Check {
        /// Work item id.
        item_id: String,
        /// Operate on this lock directory directly, without the daemon.
        #[arg(long)]
        claims_dir: Option<PathBuf>,
    },

    /// List live claims.
    Claims {
        /// Operate on this lock directory directly, without the daemon.
        #[arg(long)]
        claims_dir: Option<PathBuf>,
    },

    /// Report an agent heartbeat.
    Heartbeat {
        /// Agent identity.
        #[arg(long)]
        holder: String,
        /// Item being worked on.
        #[arg(long)]
        item: Option<String>,
        /// Reported status.
        #[arg(long, value_enum)]
        status: Option<Status>,
    },

    /// Record an agent milestone.
    Milestone {
        /// Agent identity.
        #[arg(long)]
        holder: String,
        /// Milestone kind.
        #[arg(value_enum)]
        kind: Kind,
        /// Milestone text.
        message: String,
    },

    /// Return a paused agent to work.
    Resume {
        /// Agent identity.
        #[arg(long)]
        holder: String,
    },

    /// Find orphaned work; reset it with `--commit`.
    Recover {
        /// Perform the recovery instead of a dry run.
        #[arg(long)]
        commit: bool,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
enum OnExisting {
    Reject,
    Reuse,
    Replace,
}

impl From<OnExisting> for ExistingSession {
    fn from(value: OnExisting) -> Self {
        match value {
            OnExisting::Reject => Self::Reject,
            OnExisting::Reuse => Self::Reuse,
            OnExisting::Replace => Self::Replace,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
enum Status {
    Working,
    Idle,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
enum Kind {
    Note,
    Error,
    Completed,
}

/// Failure reported to the operator.
struct Failure {
    message: String,
    kind: String,
    holder: Option<String>,
}

impl Failure {
    fn exit_code(&self) -> u8 {
        if self.kind == "protocol_error" {
            EXIT_USAGE
        } else {
            EXIT_FAILURE
        }
    }
}

impl From<AppError> for Failure {
    fn from(err: AppError) -> Self {
        let response = IpcResponse::failure(&err);
        Self {
            message: err.to_string(),
            kind: err.kind().to_owned(),
            holder: response.holder,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(data) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("Error [{}]: {}", failure.kind, failure.message);
            if let Some(holder) = &failure.holder {
                eprintln!("held by: {holder}");
            }
            ExitCode::from(failure.exit_code())
        }
    }
}

fn load_config(cli: &Cli) -> Result<GlobalConfig, Failure> {
    match &cli.config {
        Some(path) => Ok(GlobalConfig::load_from_path(path)?),
        None => Ok(GlobalConfig::default()),
    }
}

fn run(cli: &Cli) -> Result<serde_json::Value, Failure> {
    let request = match &cli.command {
        Command::Start {
            daemon_bin,
            wait_seconds,
        } => return start_daemon(cli, daemon_bin.as_deref(), *wait_seconds),
        Command::Stop {
            force,
            wait_seconds,
        } => return stop_daemon(cli, *force, *wait_seconds),
        Command::Status => IpcRequest::Status,
        Command::Sessions => IpcRequest::ListSessions,
        Command::Create {
            name,
            dir,
            role,
            on_existing,
        } => IpcRequest::CreateSession {
            name: name.clone(),
            role: role.clone(),
            working_dir: absolute(dir)?,
            on_existing: (*on_existing).into(),
        },
        Command::Destroy { id } => IpcRequest::DestroySession { id: id.clone() },
        Command::Restart { id } => IpcRequest::RestartSession { id: id.clone() },
        Command::Send {
            id,
            text,
            no_submit,
        } => IpcRequest::SendInput {
            id: id.clone(),
            text: text.clone(),
            submit: !no_submit,
        },
        Command::Read { id, lines } => IpcRequest::ReadOutput {
            id: id.clone(),
            max_lines: *lines,
        },
        Command::Claim {
            item_id,
            holder,
            ttl,
            claims_dir,
        } => {
            if let Some(dir) = claims_dir {
                return direct_claim(cli, dir, item_id, holder, *ttl);
            }
            IpcRequest::Claim {
                item_id: item_id.clone(),
                holder: holder.clone(),
                ttl_seconds: *ttl,
            }
        }
        Command::Renew {
            item_id,
            holder,
            ttl,
            claims_dir,
        } => {
            if let Some(dir) = claims_dir {
                let ttl = resolve_ttl(cli, *ttl)?;
                let claim = ClaimCoordinator::open(dir)?.renew(item_id, holder, ttl)?;
                return to_json(&claim);
            }
            IpcRequest::Renew {
                item_id: item_id.clone(),
                holder: holder.clone(),
                ttl_seconds: *ttl,
            }
        }
        Command::Release {
            item_id,
            holder,
            claims_dir,
        } => {
            if let Some(dir) = claims_dir {
                let released = ClaimCoordinator::open(dir)?.release(item_id, holder)?;
                return Ok(serde_json::json!({ "item_id": item_id, "released": released }));
            }
            IpcRequest::Release {
                item_id: item_id.clone(),
                holder: holder.clone(),
            }
        }
        Command::Check {
            item_id,
            claims_dir,
        } => {
            if let Some(dir) = claims_dir {
                return Ok(match ClaimCoordinator::open(dir)?.check(item_id)? {
                    ClaimStatus::Unclaimed => {
                        serde_json::json!({ "item_id": item_id, "claimed": false })
                    }
                    ClaimStatus::Held(claim) => {
                        serde_json::json!({ "item_id": item_id, "claimed": true, "claim": claim })
                    }
                });
            }
            IpcRequest::Check {
                item_id: item_id.clone(),
            }
        }
        Command::Claims { claims_dir } => {
            if let Some(dir) = claims_dir {
                let now = chrono::Utc::now();
                let claims: Vec<ClaimView> = ClaimCoordinator::open(dir)?
                    .list()?
                    .into_iter()
                    .map(|c| ClaimView::at(c, now))
                    .collect();
                return Ok(serde_json::json!({ "claims": claims }));
            }
            IpcRequest::ListClaims
        }
        Command::Heartbeat {
            holder,
            item,
            status,
        } => IpcRequest::Heartbeat {
            holder: holder.clone(),
            item_id: item.clone(),
            status: status.map(|s| match s {
                Status::Working => AgentStatus::Working,
                Status::Idle => AgentStatus::Idle,
            }),
        },
        Command::Milestone {
            holder,
            kind,
            message,
        } => IpcRequest::Milestone {
            holder: holder.clone(),
            kind: match kind {
                Kind::Note => MilestoneKind::Note,
                Kind::Error => MilestoneKind::Error,
                Kind::Completed => MilestoneKind::Completed,
            },
            message: message.clone(),
        },
        Command::Resume { holder } => IpcRequest::Resume {
            holder: holder.clone(),
        },
        Command::Recover { commit } => IpcRequest::Recover { commit: *commit },
    };

    let ipc_name = match &cli.ipc_name {
        Some(name) => name.clone(),
        None => load_config(cli)?.ipc_name,
    };
    let response = send_ipc_request(&ipc_name, &request).map_err(|err| Failure {
        message: format!("cannot reach daemon at ipc name '{ipc_name}': {err}"),
        kind: "ipc".into(),
        holder: None,
    })?;
    if response.ok {
        Ok(response.data.unwrap_or(serde_json::Value::Null))
    } else {
        Err(Failure {
            message: response.error.unwrap_or_else(|| "unknown error".into()),
            kind: response.kind.unwrap_or_else(|| "io".into()),
            holder: response.holder,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, Failure> {
    Ok(serde_json::to_value(value).map_err(AppError::from)?)
}

fn absolute(dir: &Path) -> Result<PathBuf, Failure> {
    Ok(std::path::absolute(dir).map_err(AppError::from)?)
}

fn resolve_ttl(cli: &Cli, ttl: Option<u64>) -> Result<Duration, Failure> {
    let seconds = match ttl {
        Some(seconds) => seconds,
        None => load_config(cli)?.claims.default_ttl_seconds,
    };
    Ok(Duration::from_secs(seconds))
}

fn direct_claim(
    cli: &Cli,
    dir: &Path,
    item_id: &str,
    holder: &str,
    ttl: Option<u64>,
) -> Result<serde_json::Value, Failure> {
    let ttl = resolve_ttl(cli, ttl)?;
    let claim = ClaimCoordinator::open(dir)?.claim(item_id, holder, ttl)?;
    to_json(&claim)
}

fn start_daemon(
    cli: &Cli,
    daemon_bin: Option<&Path>,
    wait_seconds: u64,
) -> Result<serde_json::Value, Failure> {
    let Some(config_path) = &cli.config else {
        return Err(AppError::Protocol("start requires --config".into()).into());
    };
    let config = load_config(cli)?;
    let pid_path = config.pid_path();
    if let Some(pid) = read_pid(&pid_path)?.filter(|pid| process_alive(*pid)) {
        return Err(AppError::Config(format!("daemon already running with pid {pid}")).into());
    }

    let binary = match daemon_bin {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe()
            .map_err(AppError::from)?
            .with_file_name(format!("agent-pool{}", std::env::consts::EXE_SUFFIX)),
    };
    std::fs::create_dir_all(&config.state_dir).map_err(AppError::from)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.state_dir.join("daemon.log"))
        .map_err(AppError::from)?;

    let mut command = std::process::Command::new(&binary);
    command
        .arg("--config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }
    let mut child = command.spawn().map_err(|err| {
        AppError::Io(format!("failed to launch {}: {err}", binary.display()))
    })?;

    let deadline = Instant::now() + Duration::from_secs(wait_seconds);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().map_err(AppError::from)? {
            return Err(AppError::Io(format!(
                "daemon exited during startup ({status}); see {}",
                config.state_dir.join("daemon.log").display()
            ))
            .into());
        }
        if let Some(pid) = read_pid(&pid_path)?.filter(|pid| *pid == child.id()) {
            return Ok(serde_json::json!({ "started": true, "pid": pid }));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(AppError::Io(format!("daemon did not write {} in time", pid_path.display())).into())
}

fn stop_daemon(cli: &Cli, force: bool, wait_seconds: u64) -> Result<serde_json::Value, Failure> {
    let pid_path = load_config(cli)?.pid_path();
    let Some(pid) = read_pid(&pid_path)?.filter(|pid| process_alive(*pid)) else {
        return Err(AppError::Io("daemon is not running".into()).into());
    };
    signal_stop(pid, force)?;
    if force {
        return Ok(serde_json::json!({ "pid": pid, "stopped": true, "forced": true }));
    }

    let deadline = Instant::now() + Duration::from_secs(wait_seconds);
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(serde_json::json!({ "pid": pid, "stopped": true, "forced": false }));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(AppError::Io(format!("daemon {pid} still running after {wait_seconds}s")).into())
}

/// Connect to the IPC socket, send one request, and read the response.
fn send_ipc_request(
    ipc_name: &str,
    request: &IpcRequest,
) -> std::result::Result<IpcResponse, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    Ok(serde_json::from_str(response_line.trim())?)
}
