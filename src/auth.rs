//! The optional external authentication interceptor: before a session is
//! allowed to open a vhost, amqpprox may ask an HTTP auth service whether
//! the presented credentials are acceptable.
//!
//! Grounded on spec.md §6's auth service HTTP contract and the teacher's
//! use of `reqwest` for outbound HTTP calls (e.g.
//! `crates/agentgateway/src/client/hyperrustls/mod.rs` builds a client
//! once and reuses it); we do the same rather than constructing a new
//! client per request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("auth service returned an unexpected status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    vhost: &'a str,
    auth_mechanism: &'a str,
    #[serde(with = "serde_bytes_as_hex")]
    credentials: &'a [u8],
    client_host: &'a str,
}

/// `{result: ALLOW|DENY, reason, optional {auth_mechanism, credentials}}`,
/// per spec.md §6's auth service contract.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    result: AuthResult,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    auth_mechanism: Option<String>,
    #[serde(default, with = "serde_bytes_as_hex::opt")]
    credentials: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
enum AuthResult {
    Allow,
    Deny,
}

/// New credentials an auth service may hand back on `ALLOW`, to be spliced
/// into the StartOk forwarded to the broker in place of what the client
/// originally sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredentials {
    pub mechanism: String,
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed {
        reason: Option<String>,
        new_credentials: Option<NewCredentials>,
    },
    Denied {
        reason: Option<String>,
    },
}

/// Default timeout for the auth service HTTP call, per spec.md §6.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// `AUTH SERVICE host port target` builds an [`AuthInterceptor::Service`];
/// `AUTH ALWAYS_ALLOW` installs [`AuthInterceptor::AlwaysAllow`], which
/// admits every connection without a network round trip (useful for a proxy
/// deployment that wants the auth hook wired up but never denies).
pub enum AuthInterceptor {
    Service(HttpAuthService),
    AlwaysAllow,
}

impl AuthInterceptor {
    pub fn service(host: &str, port: u16, target: &str) -> Result<Self, AuthError> {
        Ok(Self::Service(HttpAuthService::new(host, port, target, DEFAULT_AUTH_TIMEOUT)?))
    }

    pub async fn authenticate(
        &self,
        vhost: &str,
        mechanism: &str,
        credentials: &[u8],
        client_host: &str,
    ) -> Result<AuthDecision, AuthError> {
        match self {
            Self::AlwaysAllow => Ok(AuthDecision::Allowed {
                reason: None,
                new_credentials: None,
            }),
            Self::Service(service) => service.authenticate(vhost, mechanism, credentials, client_host).await,
        }
    }
}

/// HTTP client wrapper that asks an auth service whether to admit a
/// connection. Constructed once per proxy instance and shared across
/// sessions.
pub struct HttpAuthService {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthService {
    pub fn new(host: &str, port: u16, target: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{host}:{port}{target}"),
        })
    }

    pub async fn authenticate(
        &self,
        vhost: &str,
        mechanism: &str,
        credentials: &[u8],
        client_host: &str,
    ) -> Result<AuthDecision, AuthError> {
        let body = AuthRequest {
            vhost,
            auth_mechanism: mechanism,
            credentials,
            client_host,
        };
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::UnexpectedStatus(response.status()));
        }
        let parsed: AuthResponse = response.json().await?;
        Ok(match parsed.result {
            AuthResult::Deny => AuthDecision::Denied { reason: parsed.reason },
            AuthResult::Allow => AuthDecision::Allowed {
                reason: parsed.reason,
                new_credentials: parsed.auth_mechanism.map(|mechanism| NewCredentials {
                    mechanism,
                    response: parsed.credentials.unwrap_or_default(),
                }),
            },
        })
    }
}

mod serde_bytes_as_hex {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &&[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&BytesAsHex(bytes))
    }

    struct BytesAsHex<'a>(&'a [u8]);

    impl std::fmt::Display for BytesAsHex<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
    }

    fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string".to_string());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }

    pub mod opt {
        use super::decode_hex;
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|s| decode_hex(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_response_parses_denied_with_reason() {
        let json = r#"{"result": "DENY", "reason": "bad credentials"}"#;
        let parsed: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result, AuthResult::Deny);
        assert_eq!(parsed.reason.as_deref(), Some("bad credentials"));
    }

    #[test]
    fn auth_response_defaults_reason_and_credentials_to_none() {
        let json = r#"{"result": "ALLOW"}"#;
        let parsed: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result, AuthResult::Allow);
        assert!(parsed.reason.is_none());
        assert!(parsed.auth_mechanism.is_none());
        assert!(parsed.credentials.is_none());
    }

    #[test]
    fn auth_response_parses_allow_with_new_credentials() {
        let json = r#"{"result": "ALLOW", "auth_mechanism": "PLAIN", "credentials": "00677565737400677565737432"}"#;
        let parsed: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result, AuthResult::Allow);
        assert_eq!(parsed.auth_mechanism.as_deref(), Some("PLAIN"));
        assert_eq!(parsed.credentials, Some(b"\0guest\0guest2".to_vec()));
    }
}
