//! Request authentication & authorization (spec §6).
//!
//! An axum middleware rather than a route-level guard, since every route
//! shares the same decision tree: no-auth allowlist, internal loopback
//! calls, server-admin routes, then the general authenticated case. Session
//! validation and LDAP/group-membership delegation are themselves external
//! collaborators (spec §1 "authentication helpers" is out of scope) reached
//! through [`crate::fleet::FleetClient`]'s `authenticate`/`is_member_of_group`
//! seam.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::XoloError;
use crate::state::AppState;

const NO_AUTH_ROUTES: &[&str] = &["/ping", "/auth/login"];
const NO_AUTH_PREFIXES: &[&str] = &["/ping/"];
const INTERNAL_ROUTES: &[&str] = &["/cleanup", "/maint/cleanup-internal"];
const SERVER_ADMIN_ROUTES: &[&str] = &["/state", "/cleanup", "/update-client-data", "/rotate-logs", "/set-log-level"];

fn is_loopback(addr: IpAddr) -> bool {
    addr.is_loopback()
}

/// The authenticated principal a request carries once it clears this
/// middleware — attached as a request extension for handlers that need the
/// caller's identity (e.g. changelog attribution).
#[derive(Debug, Clone)]
pub struct AuthenticatedAdmin {
    pub username: String,
    pub is_server_admin: bool,
}

/// Session lookup is itself out of scope (spec §1's "authentication
/// helpers") — this trait is the seam a real session store plugs into.
/// Until one is wired in, bearer-token sessions carry the username in the
/// token itself (`"Bearer session:<username>"`), which is sufficient for
/// exercising the authorization logic below without inventing a session
/// store this crate doesn't own.
fn session_username_from_request(req: &Request) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    token.strip_prefix("session:").map(|s| s.to_string())
}

fn internal_token_from_request(req: &Request) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|s| s.to_string())
}

/// axum middleware implementing spec §6's authorization decision tree.
pub async fn authorize(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();

    if NO_AUTH_ROUTES.contains(&path.as_str()) || NO_AUTH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return next.run(req).await;
    }

    if INTERNAL_ROUTES.contains(&path.as_str()) {
        let remote_ip = req
            .extensions()
            .get::<ConnectInfo<std::net::SocketAddr>>()
            .map(|ci| ci.0.ip());
        let token = internal_token_from_request(&req);
        let authorized = remote_ip.is_some_and(is_loopback) && token.as_deref() == Some(state.internal_token.as_str());
        if authorized {
            req.extensions_mut().insert(AuthenticatedAdmin {
                username: "xolo-internal".to_string(),
                is_server_admin: true,
            });
            return next.run(req).await;
        }
        // Internal-loopback and server-admin-session are two independent
        // allow-conditions for a route listed in both INTERNAL_ROUTES and
        // SERVER_ADMIN_ROUTES (spec §6: `/cleanup` is in both) — OR them
        // together by falling through to the session/group check below
        // instead of rejecting here. A route that is internal-only still
        // rejects immediately.
        if !SERVER_ADMIN_ROUTES.contains(&path.as_str()) {
            return axum::response::IntoResponse::into_response(XoloError::Unauthorized);
        }
    }

    let Some(username) = session_username_from_request(&req) else {
        return axum::response::IntoResponse::into_response(XoloError::Unauthorized);
    };

    let is_server_admin = match state.fleet.is_member_of_group(&username, &state.config.server_admin_group).await {
        Ok(v) => v,
        Err(e) => return axum::response::IntoResponse::into_response(XoloError::from(e)),
    };

    if SERVER_ADMIN_ROUTES.contains(&path.as_str()) {
        if !is_server_admin {
            return axum::response::IntoResponse::into_response(XoloError::Forbidden);
        }
        req.extensions_mut().insert(AuthenticatedAdmin { username, is_server_admin });
        return next.run(req).await;
    }

    let is_admin = is_server_admin
        || match state.fleet.is_member_of_group(&username, &state.config.admin_group).await {
            Ok(v) => v,
            Err(e) => return axum::response::IntoResponse::into_response(XoloError::from(e)),
        };
    if !is_admin {
        return axum::response::IntoResponse::into_response(XoloError::Forbidden);
    }

    req.extensions_mut().insert(AuthenticatedAdmin { username, is_server_admin });
    next.run(req).await
}
