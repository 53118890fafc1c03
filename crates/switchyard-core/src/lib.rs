//! Core types and error definitions for the Switchyard broker.
//!
//! This crate provides the pieces shared by every Switchyard crate: the wire
//! envelope and its codec, typed payloads, capability tags, the error
//! taxonomy, and broker configuration.
//!
//! # Main types
//!
//! - [`Message`] — The wire envelope, with [`Message::encode`] / [`Message::decode`].
//! - [`MessageType`] — Envelope kind (REGISTER, SUBMIT_TASK, ASSIGN, ...).
//! - [`payload`] — One typed payload per message kind.
//! - [`Capability`] — Skill tag declared by agents and required by tasks.
//! - [`SwitchyardError`] — Unified error enum; [`ErrorReason`] is its wire form.
//! - [`BrokerConfig`] — TOML-backed broker configuration.

/// Capability tags.
pub mod capability;
/// Broker configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Envelope and codec.
pub mod message;
/// Typed payloads.
pub mod payload;

pub use capability::Capability;
pub use config::BrokerConfig;
pub use error::{ErrorReason, SwitchyardError, SwitchyardResult};
pub use message::{Message, MessageType, WirePayload, BROKER_SENDER, SCHEMA_VERSION};
