//! Session verification at join.
//!
//! The join payload carries an opaque session token and, separately, a CSRF
//! token in its params. A verifier turns the session token back into a
//! [`Session`]; the join only proceeds when the session's CSRF token equals
//! the one presented in the params.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Server-held session data recovered at join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_csrf_token")]
    pub csrf_token: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Session {
    pub fn new(csrf_token: impl Into<String>) -> Self {
        Self {
            csrf_token: csrf_token.into(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Constant-shape comparison against the token presented by the client.
    pub fn matches_csrf(&self, presented: &str) -> bool {
        let expected = self.csrf_token.as_bytes();
        let presented = presented.as_bytes();
        !expected.is_empty()
            && expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token is empty")]
    Empty,

    #[error("session token is malformed: {0}")]
    Malformed(String),
}

/// Recovers session data from the token sent at join.
pub trait SessionVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Session, SessionError>;
}

/// Unsigned development verifier: the token is the session serialized as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSessionVerifier;

impl JsonSessionVerifier {
    /// Produce the token a page would embed for `session`.
    pub fn token(session: &Session) -> Result<String, SessionError> {
        serde_json::to_string(session).map_err(|e| SessionError::Malformed(e.to_string()))
    }
}

impl SessionVerifier for JsonSessionVerifier {
    fn verify(&self, token: &str) -> Result<Session, SessionError> {
        if token.trim().is_empty() {
            return Err(SessionError::Empty);
        }
        serde_json::from_str(token).map_err(|e| SessionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_session_roundtrip() {
        let session = Session::new("abc").with("user_id", 7);
        let token = JsonSessionVerifier::token(&session).unwrap();
        let verified = JsonSessionVerifier.verify(&token).unwrap();
        assert_eq!(verified, session);
        assert_eq!(verified.get("user_id"), Some(&Value::from(7)));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(matches!(JsonSessionVerifier.verify(""), Err(SessionError::Empty)));
        assert!(matches!(
            JsonSessionVerifier.verify("not json"),
            Err(SessionError::Malformed(_))
        ));
        assert!(JsonSessionVerifier.verify("{}").is_err());
    }

    #[test]
    fn test_csrf_match() {
        let session = Session::new("token-1");
        assert!(session.matches_csrf("token-1"));
        assert!(!session.matches_csrf("token-2"));
        assert!(!session.matches_csrf("token"));
        assert!(!Session::new("").matches_csrf(""));
    }
}
