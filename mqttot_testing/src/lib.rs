//! Utilities for driving an `mqttot` client against in-memory brokers in
//! tests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqttot::{RealtimeClient, connect::AuthSession};
//! use mqttot_testing::{MockConnector, StubRest};
//!
//! # async fn example() -> mqttot::Result<()> {
//! let connector = MockConnector::new();
//! let mut broker = connector.accepting();
//! let client = RealtimeClient::builder(AuthSession::new("42"), Arc::new(StubRest::default()))
//!     .connector(connector.clone())
//!     .build()
//!     .await?;
//! client.connect().await?;
//! let _subscription = broker.next_publish().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod frames;
pub mod logging;
pub mod rest;

pub use broker::{Handshake, MockBroker, MockConnector, publish_json};
pub use logging::{LoggerHandle, logger};
pub use rest::StubRest;
