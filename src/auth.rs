//! `Authorization: Bearer <key>` / `Basic <base64(user:key)>` check.
//!
//! Ported from the original gateway's API-key middleware (see
//! `examples/original_source/tests/unit/test_auth_middleware.py` for the
//! exact status/detail matrix this reproduces).

use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct AuthFailureBody {
    pub detail: String,
}

#[derive(Debug)]
pub struct AuthFailure {
    pub status: StatusCode,
    pub detail: String,
}

impl AuthFailure {
    fn new(status: StatusCode, detail: &str) -> Self {
        Self {
            status,
            detail: detail.to_string(),
        }
    }
}

/// Checks `header` (the raw `Authorization` header value, if present)
/// against `config`. `Ok(())` means the request may proceed.
pub fn check(config: &AuthConfig, header: Option<&str>) -> Result<(), AuthFailure> {
    let Some(header) = header else {
        return Err(AuthFailure::new(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        ));
    };

    if let Some(token) = header.strip_prefix("Bearer ") {
        return if token == config.api_key {
            Ok(())
        } else {
            Err(AuthFailure::new(StatusCode::FORBIDDEN, "Invalid API key"))
        };
    }

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = BASE64
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| {
                AuthFailure::new(
                    StatusCode::UNAUTHORIZED,
                    "Invalid Basic Authentication format",
                )
            })?;

        let Some((_user, key)) = decoded.split_once(':') else {
            return Err(AuthFailure::new(
                StatusCode::UNAUTHORIZED,
                "Invalid Basic Authentication format",
            ));
        };

        return if key == config.api_key {
            Ok(())
        } else {
            Err(AuthFailure::new(
                StatusCode::FORBIDDEN,
                "Invalid credentials",
            ))
        };
    }

    Err(AuthFailure::new(
        StatusCode::UNAUTHORIZED,
        "Unsupported authorization method",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            api_key: "mykey".to_string(),
        }
    }

    fn basic(user: &str, key: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{key}")))
    }

    #[test]
    fn missing_header_is_401() {
        let err = check(&config(), None).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.detail, "Missing or invalid Authorization header");
    }

    #[test]
    fn unsupported_scheme_is_401() {
        let err = check(&config(), Some("Digest something")).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.detail, "Unsupported authorization method");
    }

    #[test]
    fn valid_bearer_is_ok() {
        assert!(check(&config(), Some("Bearer mykey")).is_ok());
    }

    #[test]
    fn invalid_bearer_is_403() {
        let err = check(&config(), Some("Bearer wrong")).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.detail, "Invalid API key");
    }

    #[test]
    fn valid_basic_is_ok() {
        assert!(check(&config(), Some(&basic("u", "mykey"))).is_ok());
    }

    #[test]
    fn invalid_basic_password_is_403() {
        let err = check(&config(), Some(&basic("u", "wrong"))).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.detail, "Invalid credentials");
    }

    #[test]
    fn invalid_base64_is_401() {
        let err = check(&config(), Some("Basic !!!notbase64!!!")).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.detail, "Invalid Basic Authentication format");
    }

    #[test]
    fn basic_without_colon_is_401() {
        let encoded = BASE64.encode("no_colon");
        let err = check(&config(), Some(&format!("Basic {encoded}"))).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.detail, "Invalid Basic Authentication format");
    }
}
