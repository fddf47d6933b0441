//! Best-effort call-record persistence
//!
//! The marketplace backend keeps a record per call for billing and history.
//! Status writes are advisory: a failed write is logged and never blocks a
//! state transition.

use crate::types::{CallId, CallStatus, MediaKind, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call-record persistence errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// The backend returned something unexpected
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// A persisted call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Record id shared by both endpoints
    pub id: CallId,
    /// Opaque correlation token shared by both endpoints
    pub room_name: String,
}

/// Persists call records and their lifecycle status
#[async_trait]
pub trait CallDirectory: Send + Sync + 'static {
    /// Create the record for a new call attempt
    async fn create_record(
        &self,
        caller: &UserId,
        receiver: &UserId,
        kind: MediaKind,
    ) -> Result<CallRecord, DirectoryError>;

    /// Update the record status; callers treat failures as advisory
    async fn update_status(&self, call: CallId, status: CallStatus)
        -> Result<(), DirectoryError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecordRequest<'a> {
    caller_id: &'a UserId,
    receiver_id: &'a UserId,
    #[serde(rename = "type")]
    kind: MediaKind,
}

#[derive(Serialize)]
struct UpdateStatusRequest {
    status: CallStatus,
}

/// REST-backed call directory
pub struct HttpCallDirectory {
    base_url: String,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl HttpCallDirectory {
    /// Create a client against the given API base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    /// Set or clear the bearer token attached to every request
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.lock().as_deref() {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait]
impl CallDirectory for HttpCallDirectory {
    async fn create_record(
        &self,
        caller: &UserId,
        receiver: &UserId,
        kind: MediaKind,
    ) -> Result<CallRecord, DirectoryError> {
        let url = format!("{}/api/calls", self.base_url);
        let body = CreateRecordRequest {
            caller_id: caller,
            receiver_id: receiver,
            kind,
        };

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| DirectoryError::UnexpectedResponse(e.to_string()))?;

        response
            .json::<CallRecord>()
            .await
            .map_err(|e| DirectoryError::UnexpectedResponse(e.to_string()))
    }

    async fn update_status(
        &self,
        call: CallId,
        status: CallStatus,
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/api/calls/{}/status", self.base_url, call);
        let response = self
            .authorize(self.client.put(&url).json(&UpdateStatusRequest { status }))
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| DirectoryError::UnexpectedResponse(e.to_string()))
    }
}

/// In-memory directory for tests and demos
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    records: Mutex<Vec<(CallRecord, Option<CallStatus>)>>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// All records created so far
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    /// The last status written for a call, if any
    pub fn status_of(&self, call: CallId) -> Option<CallStatus> {
        self.records
            .lock()
            .iter()
            .find(|(r, _)| r.id == call)
            .and_then(|(_, s)| *s)
    }
}

#[async_trait]
impl CallDirectory for InMemoryDirectory {
    async fn create_record(
        &self,
        _caller: &UserId,
        _receiver: &UserId,
        _kind: MediaKind,
    ) -> Result<CallRecord, DirectoryError> {
        let id = CallId::new();
        let record = CallRecord {
            id,
            room_name: format!("room-{id}"),
        };
        self.records.lock().push((record.clone(), None));
        Ok(record)
    }

    async fn update_status(
        &self,
        call: CallId,
        status: CallStatus,
    ) -> Result<(), DirectoryError> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|(r, _)| r.id == call) {
            Some((_, slot)) => {
                *slot = Some(status);
                Ok(())
            }
            None => Err(DirectoryError::UnexpectedResponse(format!(
                "unknown call record {call}"
            ))),
        }
    }
}
