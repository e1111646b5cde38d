//! Local IPC server.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Each connection reads line-delimited
//! JSON requests (see [`protocol`](super::protocol)) and answers each with
//! one JSON line. A malformed line gets a `protocol_error` response and the
//! connection stays open.
//!
//! Connections run on a [`TaskTracker`] so shutdown can stop accepting,
//! let in-flight requests finish, and wait for them.

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{IpcRequest, IpcResponse};
use crate::claims::ClaimStatus;
use crate::orchestrator::orphan_recovery;
use crate::pool::AppState;
use crate::{AppError, Result};

/// Spawn the IPC server task. Connection tasks are registered on `tracker`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
    tracker: TaskTracker,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server no longer accepting connections");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tracker.spawn(handle_connection(
                                    stream,
                                    Arc::clone(&state),
                                    ct.clone(),
                                ));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(info_span!("ipc_server", name = %name)),
    );

    Ok(handle)
}

/// Serve one client until EOF, a write failure, or shutdown. A request that
/// has been read is always answered.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<AppState>,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = ct.cancelled() => break,
                read = buf_reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch(request, &state).await,
                        Err(err) => {
                            debug!(%err, "malformed ipc request");
                            IpcResponse::failure(&AppError::Protocol(format!(
                                "invalid request: {err}"
                            )))
                        }
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed","kind":"io"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        debug!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route a request and turn its outcome into a response.
pub async fn dispatch(request: IpcRequest, state: &AppState) -> IpcResponse {
    let span = info_span!("ipc_command", command = request.command());
    match execute(request, state).instrument(span).await {
        Ok(data) => IpcResponse::success(data),
        Err(err) => {
            debug!(kind = err.kind(), %err, "ipc command failed");
            IpcResponse::failure(&err)
        }
    }
}

async fn execute(request: IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    let data = match request {
        IpcRequest::Status => serde_json::to_value(state.status().await?)?,
        IpcRequest::ListSessions => {
            json!({ "sessions": state.registry.list_active().await })
        }
        IpcRequest::CreateSession {
            name,
            role,
            working_dir,
            on_existing,
        } => {
            let session = state
                .create_session(&name, &role, &working_dir, on_existing)
                .await?;
            serde_json::to_value(session)?
        }
        IpcRequest::DestroySession { id } => {
            let removed = state.destroy_session(&id).await?;
            json!({ "id": id, "destroyed": removed.is_some() })
        }
        IpcRequest::RestartSession { id } => serde_json::to_value(state.restart_session(&id).await?)?,
        IpcRequest::SendInput { id, text, submit } => {
            state.registry.send_input(&id, &text, submit).await?;
            json!({ "id": id, "sent": text.len() })
        }
        IpcRequest::ReadOutput { id, max_lines } => {
            let lines = state.registry.read_output(&id, max_lines).await?;
            json!({ "id": id, "lines": lines })
        }
        IpcRequest::Claim {
            item_id,
            holder,
            ttl_seconds,
        } => serde_json::to_value(state.claim(&item_id, &holder, ttl_seconds).await?)?,
        IpcRequest::Renew {
            item_id,
            holder,
            ttl_seconds,
        } => serde_json::to_value(state.renew(&item_id, &holder, ttl_seconds).await?)?,
        IpcRequest::Release { item_id, holder } => {
            let released = state.release(&item_id, &holder).await?;
            json!({ "item_id": item_id, "released": released })
        }
        IpcRequest::Check { item_id } => match state.check(&item_id).await? {
            ClaimStatus::Unclaimed => json!({ "item_id": item_id, "claimed": false }),
            ClaimStatus::Held(claim) => json!({ "item_id": item_id, "claimed": true, "claim": claim }),
        },
        IpcRequest::ListClaims => json!({ "claims": state.list_claims().await? }),
        IpcRequest::Heartbeat {
            holder,
            item_id,
            status,
        } => serde_json::to_value(state.heartbeat(&holder, item_id, status).await)?,
        IpcRequest::Milestone {
            holder,
            kind,
            message,
        } => serde_json::to_value(state.milestone(&holder, kind, message).await)?,
        IpcRequest::Resume { holder } => serde_json::to_value(state.resume(&holder).await?)?,
        IpcRequest::Recover { commit } => {
            serde_json::to_value(orphan_recovery::run(state, commit).await?)?
        }
    };
    Ok(data)
}
