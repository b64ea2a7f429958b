//! Lobby-wrapper HTTP server (§6: "An additional HTTP port serves the
//! lobby-wrapper JSON"). Grounded in the teacher's health-check server: a bare
//! hyper/1 service spawned per accepted connection, no framework.

use crate::server_state::ServerState;
use crate::session::SessionManager;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpServerState {
    pub state: Arc<ServerState>,
    pub session: Arc<SessionManager>,
    pub server_name: String,
    pub track: String,
}

#[derive(Serialize)]
struct LobbyInfo {
    name: String,
    track: String,
    clients: usize,
    max_clients: usize,
    session_name: String,
    session_index: usize,
}

async fn handle(req: Request<Incoming>, state: HttpServerState) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/info" | "/INFO" => {
            let info = LobbyInfo {
                name: state.server_name.clone(),
                track: state.track.clone(),
                clients: state.state.connected_count(),
                max_clients: state.state.entry_list.len(),
                session_name: state.session.current_name().await,
                session_index: state.session.current_index().await,
            };
            let body = serde_json::to_vec(&info).unwrap_or_default();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("not found"))).unwrap()),
    }
}

/// Serves the lobby-wrapper JSON until the listener itself fails. Each
/// connection is handled on its own task, mirroring the teacher's health server.
pub async fn run(bind_addr: String, state: HttpServerState) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(bind_addr, "lobby-wrapper http server listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to accept http connection");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "error serving http connection");
            }
        });
    }
}
