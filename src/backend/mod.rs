//! Messaging backend surface
//!
//! The tunnel talks to the messaging service through the [`Backend`]
//! trait: fire-and-forget requests tagged with a caller-chosen query id,
//! and a polled inbound stream of replies and push events. The real
//! implementation ([`remote::RemoteBackend`]) speaks newline-delimited
//! JSON to a local bridge process; [`mock::MockBackend`] scripts the
//! whole surface in memory for tests.

pub mod mock;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::AuthPhase;

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Session parameters handed to the messaging service on first contact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub database_directory: String,
    pub api_id: i32,
    pub api_hash: String,
    pub database_encryption_key: String,
    pub device_model: String,
    pub application_version: String,
}

/// Request sent to the messaging service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetOption {
        name: String,
    },
    SendTextMessage {
        chat_id: i64,
        text: String,
    },
    GetChatHistory {
        chat_id: i64,
        from_message_id: i64,
        offset: i32,
        limit: i32,
        only_local: bool,
    },
    DeleteMessages {
        chat_id: i64,
        message_ids: Vec<i64>,
        revoke: bool,
    },
    GetMe,
    LogOut,
    Close,
    SetSessionParameters(SessionParameters),
    SetPhoneNumber {
        phone_number: String,
    },
    CheckCode {
        code: String,
    },
    SetEmailAddress {
        email_address: String,
    },
    CheckEmailCode {
        code: String,
    },
    CheckPassword {
        password: String,
    },
    RegisterUser {
        first_name: String,
        last_name: String,
    },
}

/// One message from a chat history page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub text: Option<String>,
}

/// Reply to a single request, correlated by query id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { code: i32, message: String },
    Message { id: i64, outgoing: bool },
    Messages { messages: Vec<MessageSummary> },
    User { id: i64 },
    OptionValue { value: String },
}

/// Unsolicited event pushed by the messaging service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// Authorization state changed
    AuthState { phase: AuthPhase },
    /// A message arrived in some chat
    NewMessage {
        chat_id: i64,
        sender_id: i64,
        text: String,
    },
    /// An outbound message reached the service
    SendAcknowledged,
    /// An outbound message reached the peer
    SendSucceeded,
    /// Anything the tunnel does not care about
    Other { kind: String },
}

/// One inbound item from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to the request sent with this query id
    Reply { query_id: u64, response: Response },
    /// Push event, not tied to any request
    Push(PushEvent),
}

/// Connection to the messaging service
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit a request tagged with `query_id`. Never blocks; the reply,
    /// if any, arrives later through [`Backend::receive`].
    fn send(&self, query_id: u64, request: Request);

    /// Wait up to `timeout` for one inbound item.
    async fn receive(&self, timeout: Duration) -> Option<Inbound>;
}
