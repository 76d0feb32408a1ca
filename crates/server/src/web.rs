//! Acceptor: the HTTP surface that turns a query-string-addressed WebSocket
//! request into a joined session user and a running Signaling Worker.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use tower_http::services::ServeDir;

use rivulet_protocol::Config;

use crate::session::{JoinError, SessionRegistry};
use crate::signaling;
use crate::track::CodecError;
use crate::user::{User, UserTiming};

pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    sid: Option<String>,
    uid: Option<String>,
}

impl WsQuery {
    /// Both `sid` and `uid` must be present and non-blank; `?sid=&uid=alice`
    /// is rejected the same as a missing `sid` entirely.
    fn present(value: &Option<String>) -> Option<&str> {
        match value.as_deref() {
            Some(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    fn sid_and_uid(&self) -> Option<(&str, &str)> {
        Some((Self::present(&self.sid)?, Self::present(&self.uid)?))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/ws", get(accept));

    if state.config.http.local_htmlserver_enabled {
        router = router.fallback_service(ServeDir::new("demos/static"));
    }

    router.with_state(state)
}

/// `GET /ws?sid=<session id>&uid=<user id>`. Missing `sid`/`uid` is a 401;
/// an `sid` that doesn't parse as a `u32` or a failure building a fresh
/// track group is a 500; a `uid` already present in the session is a 400.
/// On success, upgrades to a WebSocket and hands it to the Signaling Worker.
async fn accept(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let Some((sid, uid)) = query.sid_and_uid() else {
        tracing::debug!("connection attempted with missing or blank sid/uid, declining");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let uid = uid.to_string();

    let Ok(session_id) = sid.parse::<u32>() else {
        tracing::warn!(uid, "invalid sid '{sid}', declining connection");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let session = match state.registry.get_or_create(session_id) {
        Ok(session) => session,
        Err(CodecError::InvalidMimeType(mime)) => {
            tracing::error!(session_id, uid, "could not create track group: {mime}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let timing = UserTiming {
        disconnect_timeout: std::time::Duration::from_secs(
            state.config.rtc.disconnect_timeout_seconds,
        ),
        failed_timeout: std::time::Duration::from_secs(state.config.rtc.failed_timeout_seconds),
        keepalive_interval: std::time::Duration::from_secs(
            state.config.rtc.keepalive_interval_seconds,
        ),
    };
    let handles = User::new(session_id, uid.clone(), timing);

    if let Err(JoinError::DuplicateUser(uid)) = session.add_user(Arc::clone(&handles.user)) {
        tracing::warn!(session_id, uid, "user already exists in session");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let config = Arc::clone(&state.config);
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| signaling::run(socket, config, registry, handles))
}
