//! Membership HTTP control plane.
//!
//! A small axum server bound to the node's `manager.addr`, running on its
//! own thread with a single-threaded tokio runtime so the rest of the
//! server stays plain threads. Wire quirk preserved for compatibility:
//! authentication and validation failures all answer 400, never 401.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use super::{ClusterError, ControlPlane};

#[derive(Clone)]
struct ControlState {
    handler: Arc<dyn ControlPlane>,
    user: String,
    pass: String,
}

pub(crate) struct MembershipServer {
    local_addr: SocketAddr,
    shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipServer {
    /// Bind and serve. Returns once the listener is bound so the caller
    /// knows the advertised address (port zero is resolved).
    pub(crate) fn start(
        addr: &str,
        handler: Arc<dyn ControlPlane>,
        user: &str,
        pass: &str,
    ) -> Result<MembershipServer, ClusterError> {
        let state = ControlState {
            handler,
            user: user.to_string(),
            pass: pass.to_string(),
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let (ready_tx, ready_rx) = crossbeam::channel::bounded::<Result<SocketAddr, String>>(1);
        let bind_addr = addr.to_string();

        let thread = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!("tokio runtime: {err}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("bind {bind_addr}: {err}")));
                        return;
                    }
                };
                let local_addr = match listener.local_addr() {
                    Ok(local_addr) => local_addr,
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("local addr: {err}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(local_addr));

                let app = router(state);
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.await;
                    })
                    .await;
                if let Err(err) = served {
                    tracing::error!(error = %err, "membership server terminated");
                }
            });
        });

        let local_addr = match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(local_addr)) => local_addr,
            Ok(Err(reason)) => return Err(ClusterError::MembershipStart(reason)),
            Err(_) => {
                return Err(ClusterError::MembershipStart(
                    "timed out waiting for listener".to_string(),
                ))
            }
        };

        tracing::info!(addr = %local_addr, "membership server listening");
        Ok(MembershipServer {
            local_addr,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().expect("membership lock poisoned").take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().expect("membership lock poisoned").take() {
            let _ = thread.join();
        }
    }
}

fn router(state: ControlState) -> Router {
    Router::new()
        .route("/join", post(handle_join))
        .route("/remove", post(handle_remove))
        .route("/election", post(handle_election))
        .route("/coordinator", post(handle_coordinator))
        .route("/heartbeat", get(handle_heartbeat))
        .with_state(state)
}

fn authorized(headers: &HeaderMap, state: &ControlState) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = credentials.split_once(':') else {
        return false;
    };
    user == state.user && pass == state.pass
}

#[derive(Debug, Deserialize)]
struct JoinBody {
    id: Option<String>,
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeBody {
    id: Option<String>,
}

async fn handle_join(
    State(state): State<ControlState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    tracing::info!("received request to join cluster");
    if !authorized(&headers, &state) {
        tracing::warn!("request to join with wrong username/password");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let Ok(request) = serde_json::from_str::<JoinBody>(&body) else {
        tracing::debug!("join request cannot be decoded");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (Some(id), Some(addr)) = (request.id, request.addr) else {
        tracing::debug!("join request is missing id or addr");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.handler.join(&id, &addr) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "peers": outcome.peers, "leader": outcome.leader })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "error joining cluster");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_remove(
    State(state): State<ControlState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    tracing::info!("received request to remove node from cluster");
    if !state.handler.is_leader() {
        tracing::warn!("remove must be sent to the leader");
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !authorized(&headers, &state) {
        tracing::warn!("request to remove with wrong username/password");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let Ok(request) = serde_json::from_str::<NodeBody>(&body) else {
        tracing::debug!("remove request cannot be decoded");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(id) = request.id else {
        tracing::debug!("remove request is missing the node id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.handler.remove(&id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "error removing node from cluster");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_election(
    State(state): State<ControlState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&headers, &state) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Ok(request) = serde_json::from_str::<NodeBody>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(id) = request.id else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    tracing::info!(from = %id, "election challenge received");
    state.handler.clone().election_challenge(&id);
    StatusCode::OK.into_response()
}

async fn handle_coordinator(
    State(state): State<ControlState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&headers, &state) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Ok(request) = serde_json::from_str::<NodeBody>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(id) = request.id else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    tracing::info!(leader = %id, "coordinator announcement received");
    state.handler.coordinator(&id);
    StatusCode::OK.into_response()
}

async fn handle_heartbeat(State(state): State<ControlState>) -> Response {
    if state.handler.is_up() {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}
