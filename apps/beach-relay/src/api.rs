//! Read-only JSON view of live sessions.

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use signal_proto::SessionsResponse;
use thiserror::Error;
use tracing::warn;

use crate::server::AppState;

/// Credentials guarding the sessions API.
///
/// A password enables basic auth; otherwise a token enables bearer auth;
/// with neither the API is open.
#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    pub username: String,
    pub password: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,
    #[error("malformed authorization header")]
    Malformed,
    #[error("invalid credentials")]
    Invalid,
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed => "malformed",
            AuthError::Invalid => "invalid",
        }
    }
}

impl ApiAuth {
    pub fn is_enabled(&self) -> bool {
        self.password.is_some() || self.token.is_some()
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if let Some(password) = &self.password {
            let encoded = authorization(headers, "Basic")?;
            let decoded = STANDARD.decode(encoded).map_err(|_| AuthError::Malformed)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
            let (user, pass) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
            if user == self.username && pass == password.as_str() {
                return Ok(());
            }
            return Err(AuthError::Invalid);
        }
        if let Some(token) = &self.token {
            let presented = authorization(headers, "Bearer")?;
            if presented == token.as_str() {
                return Ok(());
            }
            return Err(AuthError::Invalid);
        }
        Ok(())
    }

    fn challenge(&self) -> HeaderValue {
        if self.password.is_some() {
            HeaderValue::from_static("Basic realm=\"restricted\", charset=\"UTF-8\"")
        } else {
            HeaderValue::from_static("Bearer realm=\"restricted\"")
        }
    }
}

fn authorization<'a>(headers: &'a HeaderMap, scheme: &str) -> Result<&'a str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    let (presented_scheme, credentials) = value.split_once(' ').ok_or(AuthError::Malformed)?;
    if !presented_scheme.eq_ignore_ascii_case(scheme) {
        return Err(AuthError::Malformed);
    }
    Ok(credentials.trim())
}

pub async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(err) = state.auth.authorize(&headers) {
        metrics::counter!("signaling_api_auth_failures_total", 1, "reason" => err.metric_label());
        warn!(error = %err, "rejected sessions api request");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, state.auth.challenge())],
            "unauthorized",
        )
            .into_response();
    }
    Json(SessionsResponse {
        sessions: state.registry.snapshot(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test_timeout::timeout]
    fn open_when_no_credentials_configured() {
        let auth = ApiAuth::default();
        assert!(!auth.is_enabled());
        assert_eq!(auth.authorize(&HeaderMap::new()), Ok(()));
    }

    #[test_timeout::timeout]
    fn basic_auth_checks_username_and_password() {
        let auth = ApiAuth {
            username: "admin".into(),
            password: Some("secret".into()),
            token: Some("ignored".into()),
        };
        assert_eq!(auth.authorize(&headers(&basic("admin", "secret"))), Ok(()));
        assert_eq!(
            auth.authorize(&headers(&basic("admin", "nope"))),
            Err(AuthError::Invalid)
        );
        assert_eq!(
            auth.authorize(&headers("Bearer ignored")),
            Err(AuthError::Malformed)
        );
        assert_eq!(auth.authorize(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[test_timeout::timeout]
    fn bearer_token_used_without_password() {
        let auth = ApiAuth {
            username: "admin".into(),
            password: None,
            token: Some("t0ken".into()),
        };
        assert_eq!(auth.authorize(&headers("Bearer t0ken")), Ok(()));
        assert_eq!(auth.authorize(&headers("bearer t0ken")), Ok(()));
        assert_eq!(
            auth.authorize(&headers("Bearer other")),
            Err(AuthError::Invalid)
        );
    }
}
