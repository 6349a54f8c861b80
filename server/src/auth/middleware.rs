//! Bearer token extraction.
//!
//! Terminals send the shared `AUTH_SECRET` as a bearer token. A server
//! without a secret accepts every request.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

/// Caller that passed the token check.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, or `anonymous` on an open server
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let Some(ref secret) = state.config.auth_secret else {
            return Ok(AuthUser {
                token: bearer(auth_header).unwrap_or("anonymous").to_string(),
            });
        };

        match auth_header {
            None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
            Some(header) => match bearer(Some(header)) {
                None => Err((
                    StatusCode::UNAUTHORIZED,
                    "Invalid authorization header format",
                )),
                Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
                    Ok(AuthUser {
                        token: token.to_string(),
                    })
                }
                Some(_) => {
                    tracing::warn!("Rejected request with wrong bearer token");
                    Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"))
                }
            },
        }
    }
}

/// The token of a `Bearer` header, if non-empty.
fn bearer(header: Option<&str>) -> Option<&str> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer(Some("Bearer ")), None);
        assert_eq!(bearer(Some("Basic abc")), None);
        assert_eq!(bearer(None), None);
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"x3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret-and-more"));
        assert!(!constant_time_eq(b"", b"s3cret"));
        assert!(constant_time_eq(b"", b""));
    }
}
