/// Bearer-token authentication.
///
/// Unlike a dashboard server with open static assets, dray is API-only and
/// protects every route by default once a token is configured (via
/// --api-token / DRAY_API_TOKEN). The single exception is the /healthz
/// liveness probe, which orchestration must be able to reach without
/// credentials. With no token configured the middleware is a pass-through.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Shared token state — None means auth is disabled (open access).
#[derive(Clone)]
pub struct ApiToken(pub Option<String>);

/// Routes reachable without credentials.
const OPEN_PATHS: &[&str] = &["/healthz"];

pub async fn require_auth(
    token: axum::extract::Extension<ApiToken>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = token.0.0.as_deref() else {
        return Ok(next.run(req).await);
    };

    if OPEN_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(candidate) if token_matches(candidate, expected) => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Timing-safe token comparison: OR-folds the XOR of every byte pair so
/// the duration does not depend on where a mismatch occurs. Length is
/// checked up front — leaking the token's length is acceptable, leaking
/// how much of a guess matched is not.
fn token_matches(candidate: &str, expected: &str) -> bool {
    let (a, b) = (candidate.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_matches_exact_only() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secreT", "secret"));
        assert!(!token_matches("secre", "secret"));
        assert!(!token_matches("secrets", "secret"));
        assert!(token_matches("", ""));
    }

    #[test]
    fn liveness_probe_is_open() {
        assert!(OPEN_PATHS.contains(&"/healthz"));
        assert!(!OPEN_PATHS.contains(&"/scheduler/status"));
    }
}
