// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the Bumper library.
//!
//! This module provides the error hierarchy used across the MQTT broker,
//! XMPP server, HelperBot/ProxyClient, and identity store: protocol
//! violations, authentication failures, timeouts, and storage faults.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred in the identity store.
    #[error("identity store error: {0}")]
    Identity(#[from] IdentityError),

    /// Error occurred in the MQTT broker, HelperBot, or ProxyClient.
    #[error("mqtt error: {0}")]
    Mqtt(#[from] MqttError),

    /// Error occurred in the XMPP-like server.
    #[error("xmpp error: {0}")]
    Xmpp(#[from] XmppError),

    /// Error occurred in the command router.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// Error occurred while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The requested session is not known to the server.
    #[error("session not found")]
    SessionNotFound,

    /// The operation timed out waiting for a peer.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Authentication was attempted and rejected.
    #[error("authentication failed")]
    AuthFailure,

    /// A condition that should stop the process entirely (bad TLS material,
    /// missing required configuration).
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Errors related to the identity store (users, clients, bots, tokens, OAuth).
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Underlying storage engine failure.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Failed to (de)serialize a stored record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No record exists for the given key.
    #[error("no such record: {0}")]
    NotFound(String),

    /// A bot record was rejected as malformed (empty class, missing `@`, or
    /// missing the literal `tmp` marker used by the vendor's serial format).
    #[error("malformed bot identity: {0}")]
    MalformedBot(String),
}

/// Errors related to MQTT broker, HelperBot, and ProxyClient operation.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Underlying I/O failure (listener, socket, TLS handshake).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `rumqttc` client error (HelperBot / ProxyClient outbound connections).
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// A received frame did not conform to the subset of MQTT 3.1.1 this
    /// broker speaks.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A topic did not match any of the known grammars (P2P, broadcast).
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// The client id did not match any recognized shape
    /// (HelperBot / bot / app).
    #[error("unrecognized client id: {0}")]
    UnrecognizedClientId(String),

    /// Authentication was rejected for the given client id.
    #[error("authentication rejected for {0}")]
    AuthRejected(String),

    /// A HelperBot command timed out waiting for a response.
    #[error("command timed out")]
    CommandTimeout,

    /// The proxy connection to the upstream vendor broker failed.
    #[error("proxy connection failed: {0}")]
    ProxyConnectionFailed(String),
}

/// Errors related to the XMPP-like server.
#[derive(Debug, Error)]
pub enum XmppError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed XML was received on the stream.
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// A stanza was received out of order for the connection's current
    /// state (e.g. `<iq>` before `<bind>`).
    #[error("stanza out of sequence: expected {expected}, got {actual}")]
    OutOfSequence {
        /// The state the connection expected next.
        expected: String,
        /// What was actually received.
        actual: String,
    },

    /// SASL PLAIN authentication failed.
    #[error("authentication failed for {0}")]
    AuthFailed(String),

    /// No live session exists for the given JID.
    #[error("no live session for jid {0}")]
    NoSuchJid(String),
}

/// Errors related to the command router (HelperBot bridge).
#[derive(Debug, Error)]
pub enum RouterError {
    /// The target device has no live MQTT session.
    #[error("device {0} is not connected")]
    DeviceNotConnected(String),

    /// The underlying HelperBot call failed.
    #[error("mqtt error: {0}")]
    Mqtt(#[from] MqttError),
}

/// Errors related to loading configuration from the environment or CLI.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable or flag was not set.
    #[error("missing required setting: {0}")]
    Missing(String),

    /// A setting was present but could not be parsed.
    #[error("invalid value for {field}: {message}")]
    Invalid {
        /// The setting name.
        field: String,
        /// Description of why it was rejected.
        message: String,
    },

    /// A referenced file (TLS cert/key, password file) does not exist or is
    /// unreadable.
    #[error("cannot read {path}: {source}")]
    UnreadableFile {
        /// The path that could not be read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
