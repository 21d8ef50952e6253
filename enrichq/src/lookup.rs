//! External lookup API boundary
//!
//! The engine talks to the lookup service only through [`LookupApi`]. The
//! bundled [`HttpLookupClient`] issues bearer-authenticated GET requests against
//! a URL template; tests substitute in-process fakes.
//!
//! Response payloads are turned into a [`ProfileRecord`] by a [`ProfileDecoder`].
//! The default [`JsonPointerDecoder`] reads four configurable JSON pointers.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use std::time::Duration;
use thiserror::Error;
use url::form_urlencoded::byte_serialize;

use crate::credentials::Credential;

/// Placeholder substituted with the url-encoded identifier in lookup URL templates
pub const IDENTIFIER_PLACEHOLDER: &str = "{identifier}";

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LookupError::Timeout
        } else {
            LookupError::Transport(e.to_string())
        }
    }
}

/// Raw response from the lookup service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResponse {
    pub status: u16,
    pub body: String,
}

impl LookupResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn classify(&self) -> ResponseClass {
        ResponseClass::from_status(self.status)
    }
}

/// How a response status is treated by the dispatch engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 200: terminal for this identifier
    Success,
    /// 401/403: the credential is no longer accepted
    AuthRejected,
    /// anything else: retry
    Transient,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => Self::Success,
            401 | 403 => Self::AuthRejected,
            _ => Self::Transient,
        }
    }
}

/// Result of probing a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    Invalid,
    /// The probe itself failed; validity unknown
    Inconclusive,
}

#[async_trait]
pub trait LookupApi: Send + Sync {
    /// Query one identifier with one credential
    async fn lookup(&self, identifier: &str, credential: &Credential) -> Result<LookupResponse, LookupError>;

    /// Lightweight call that only checks whether a credential is accepted
    async fn probe(&self, credential: &Credential) -> Result<ProbeOutcome, LookupError>;
}

/// HTTP implementation of [`LookupApi`]
#[derive(Debug, Clone)]
pub struct HttpLookupClient {
    client: reqwest::Client,
    lookup_url: String,
    probe_url: String,
    user_agent: String,
}

impl HttpLookupClient {
    pub fn new(
        lookup_url: impl Into<String>,
        probe_url: impl Into<String>,
        user_agent: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LookupError> {
        let lookup_url = lookup_url.into();
        if !lookup_url.contains(IDENTIFIER_PLACEHOLDER) {
            return Err(LookupError::InvalidUrl(format!(
                "lookup URL must contain {}: {}",
                IDENTIFIER_PLACEHOLDER, lookup_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            lookup_url,
            probe_url: probe_url.into(),
            user_agent: user_agent.into(),
        })
    }

    /// Expand the URL template for one identifier
    pub fn lookup_url_for(&self, identifier: &str) -> String {
        let encoded: String = byte_serialize(identifier.as_bytes()).collect();
        self.lookup_url.replace(IDENTIFIER_PLACEHOLDER, &encoded)
    }

    async fn get(&self, url: &str, credential: &Credential) -> Result<LookupResponse, LookupError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, credential.authorization_header())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(LookupResponse { status, body })
    }
}

#[async_trait]
impl LookupApi for HttpLookupClient {
    async fn lookup(&self, identifier: &str, credential: &Credential) -> Result<LookupResponse, LookupError> {
        let url = self.lookup_url_for(identifier);
        self.get(&url, credential).await
    }

    async fn probe(&self, credential: &Credential) -> Result<ProbeOutcome, LookupError> {
        let response = self.get(&self.probe_url, credential).await?;
        Ok(match response.classify() {
            ResponseClass::Success => ProbeOutcome::Valid,
            ResponseClass::AuthRejected => ProbeOutcome::Invalid,
            ResponseClass::Transient => ProbeOutcome::Inconclusive,
        })
    }
}

/// Decoded profile for an identifier with usable data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileRecord {
    pub identifier: String,
    pub name: String,
    pub url: String,
    pub location: String,
    pub extra: String,
}

impl ProfileRecord {
    /// Pipe-delimited result sink line; field separators and newlines are flattened
    pub fn to_line(&self) -> String {
        [&self.identifier, &self.name, &self.url, &self.location, &self.extra]
            .iter()
            .map(|field| sanitize_field(field))
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\n' | '\r' | '\t' => ' ',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Turns a 200 payload into a profile, or `None` when it holds no usable data
pub trait ProfileDecoder: Send + Sync {
    fn decode(&self, identifier: &str, body: &str) -> Option<ProfileRecord>;
}

/// Decoder reading fields from fixed JSON pointers (RFC 6901)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPointerDecoder {
    pub name: String,
    pub url: String,
    pub location: String,
    pub extra: String,
}

impl Default for JsonPointerDecoder {
    fn default() -> Self {
        Self {
            name: "/name".to_string(),
            url: "/url".to_string(),
            location: "/location".to_string(),
            extra: "/headline".to_string(),
        }
    }
}

impl JsonPointerDecoder {
    fn field(value: &serde_json::Value, pointer: &str) -> String {
        if pointer.is_empty() {
            return String::new();
        }
        match value.pointer(pointer) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

impl ProfileDecoder for JsonPointerDecoder {
    fn decode(&self, identifier: &str, body: &str) -> Option<ProfileRecord> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let record = ProfileRecord {
            identifier: identifier.to_string(),
            name: Self::field(&value, &self.name),
            url: Self::field(&value, &self.url),
            location: Self::field(&value, &self.location),
            extra: Self::field(&value, &self.extra),
        };
        // usable means at least a name or a profile URL
        if record.name.is_empty() && record.url.is_empty() {
            None
        } else {
            Some(record)
        }
    }
}
