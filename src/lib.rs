#![doc(html_root_url = "https://docs.rs/mqttot/latest")]
//! Public API for the `mqttot` library.
//!
//! This crate provides a realtime direct-message client speaking the
//! MQTT-over-TLS dialect used by the messaging edge: packet codec and
//! compression, thrift connect payloads, per-topic decoders, a delta
//! synchronisation engine with gap recovery, reconnect backoff, session
//! persistence and outbound command encoding, composed behind
//! [`RealtimeClient`].

pub mod byte_order;
pub mod client;
pub mod codec;
pub mod commands;
pub mod connect;
pub mod decode;
pub mod delta;
pub mod error;
pub mod events;
pub mod gap;
pub mod metrics;
pub mod persistence;
pub mod reconnect;
pub mod rest;
pub mod thrift;
pub mod topic;
pub mod transport;

pub use client::{RealtimeClient, RealtimeClientBuilder, UserResolver};
pub use commands::{Command, CommandEncoder, Envelope};
pub use connect::{AuthSession, ConnectDescriptor, ConnectionBuilder};
pub use delta::{DeltaBatch, DeltaItem, DeltaRecord, DeltaSyncEngine, Operation, SyncState};
/// Result type alias re-exported for convenience.
pub use error::{RealtimeError, Result};
pub use events::RealtimeEvent;
pub use metrics::{CONNECTIONS_ACTIVE, Direction, FRAMES_PROCESSED};
pub use rest::{InboxSnapshot, RestCollaborator, RestError, UserInfo};
pub use topic::{Qos, TopicDescriptor};
pub use transport::{SubscriptionGroup, TransportConfig, TransportError, TransportState};
