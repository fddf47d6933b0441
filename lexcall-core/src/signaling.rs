//! Signaling wire protocol and the channel seam
//!
//! The relay transports loosely-typed JSON; every event is modelled here as
//! a tagged variant with a fixed schema, and malformed payloads are rejected
//! at the parsing boundary instead of trusted downstream.

use crate::types::{CallerInfo, CandidatePayload, MediaKind, SessionDescription, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Payload did not match any known event schema
    #[error("malformed signaling payload: {0}")]
    Malformed(String),

    /// Transport error
    #[error("signaling transport error: {0}")]
    Transport(String),
}

/// Events delivered by the relay to this user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// A peer is calling us
    IncomingCall {
        /// Caller's user id
        from: UserId,
        /// The caller's offer
        offer: SessionDescription,
        /// Audio or video call
        #[serde(rename = "type")]
        kind: MediaKind,
        /// Caller display details plus call id and room name
        #[serde(rename = "callerInfo")]
        caller_info: CallerInfo,
    },

    /// The callee answered our offer
    CallAnswered {
        /// The callee's answer
        answer: SessionDescription,
    },

    /// The relay reached the callee and their device is ringing
    Ringing {},

    /// The callee is not connected to the relay
    UserOffline {},

    /// A connectivity candidate from the peer
    IceCandidate {
        /// The candidate
        candidate: CandidatePayload,
    },

    /// The peer hung up
    Hangup {},
}

impl InboundEvent {
    /// Validate a raw relay payload against the event schema
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Malformed`] when the payload does not match
    /// any known event; callers log and drop such payloads.
    pub fn from_value(value: Value) -> Result<Self, SignalingError> {
        serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Event name for tracing
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAnswered { .. } => "call-answered",
            Self::Ringing {} => "ringing",
            Self::UserOffline {} => "user-offline",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup {} => "hangup",
        }
    }
}

/// Events emitted by the controller, addressed to a target user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OutboundEvent {
    /// Place a call: deliver our offer to the target
    CallUser {
        /// Target user
        to: UserId,
        /// Our offer
        offer: SessionDescription,
        /// Our user id
        from: UserId,
        /// Audio or video call
        #[serde(rename = "type")]
        kind: MediaKind,
        /// Our display details plus call id and room name
        #[serde(rename = "callerInfo")]
        caller_info: CallerInfo,
    },

    /// Answer a call: deliver our answer to the caller
    AnswerCall {
        /// Target user
        to: UserId,
        /// Our answer
        answer: SessionDescription,
    },

    /// Forward a locally discovered connectivity candidate
    IceCandidate {
        /// Target user
        to: UserId,
        /// The candidate
        candidate: CandidatePayload,
    },

    /// Hang up on the target
    Hangup {
        /// Target user
        to: UserId,
    },
}

impl OutboundEvent {
    /// Event name for tracing
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup { .. } => "hangup",
        }
    }

    /// Target user this event is addressed to
    #[must_use]
    pub fn target(&self) -> &UserId {
        match self {
            Self::CallUser { to, .. }
            | Self::AnswerCall { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::Hangup { to } => to,
        }
    }
}

/// Bidirectional signaling channel keyed by user identity
///
/// Implement this for your specific relay transport. `recv` yields raw JSON
/// payloads; the controller validates them against [`InboundEvent`] and
/// drops whatever does not parse. A `recv` error is treated as the channel
/// having closed.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Emit an event addressed to a peer
    async fn send(&self, event: OutboundEvent) -> Result<(), Self::Error>;

    /// Receive the next raw event addressed to this user
    async fn recv(&self) -> Result<Value, Self::Error>;
}
