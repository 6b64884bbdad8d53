//! API key authentication.
//!
//! # Responsibilities
//! - Extract the key from the configured header, falling back to a query
//!   parameter on the request target
//! - Forward known keys to the default backend
//! - Deny missing or unknown keys with a JSON error body

use std::collections::HashSet;

use bytes::Bytes;
use hyper::StatusCode;
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::proxy::decision::{PolicyDecision, PolicyError, PolicyEvaluator};
use crate::proxy::scanner::RequestHead;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

/// Forwards requests carrying a known API key.
#[derive(Debug, Clone)]
pub struct ApiKeyPolicy {
    header: String,
    query_param: String,
    keys: HashSet<String>,
    allow_anonymous: bool,
}

impl ApiKeyPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            header: config.header.clone(),
            query_param: config.query_param.clone(),
            keys: config.keys.iter().cloned().collect(),
            allow_anonymous: config.allow_anonymous,
        }
    }

    fn extract_key(&self, head: &RequestHead) -> Option<String> {
        if let Some(value) = head.headers.get_ignore_case(&self.header) {
            return Some(value.trim().to_string());
        }
        let (_, query) = head.request_line.target.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == self.query_param.as_str())
            .map(|(_, value)| value.into_owned())
    }

    fn deny(code: &str, message: &str) -> Result<PolicyDecision, PolicyError> {
        let body = serde_json::to_vec(&ErrorBody {
            error: ErrorDetail { code, message },
        })
        .map_err(|e| PolicyError::Evaluation(e.to_string()))?;

        Ok(PolicyDecision::reject(StatusCode::FORBIDDEN)
            .with_header("Content-Type", "application/json")
            .with_fragment(Bytes::from(body))
            .with_fragment("\n"))
    }
}

impl PolicyEvaluator for ApiKeyPolicy {
    fn evaluate(&self, head: &RequestHead) -> Result<PolicyDecision, PolicyError> {
        match self.extract_key(head) {
            Some(key) if self.keys.contains(&key) => Ok(PolicyDecision::forward(None)),
            Some(_) => Self::deny(
                "API_KEY_INVALID",
                "An invalid api_key was supplied. Get one at the developer portal.",
            ),
            None if self.allow_anonymous => Ok(PolicyDecision::forward(None)),
            None => Self::deny(
                "API_KEY_MISSING",
                "No api_key was supplied. Get one at the developer portal.",
            ),
        }
    }
}
