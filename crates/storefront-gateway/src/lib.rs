//! # Storefront Gateway
//!
//! Real-time notification and chat gateway for the storefront backend.
//!
//! Authenticated HTTP callers obtain a short-lived one-time pass (OTP) and
//! present it when upgrading to a WebSocket. Connections with a valid OTP and
//! a resolved user identity may send and receive chat events; every other
//! connection is a read-only guest that only receives broadcasts such as
//! stock updates.
//!
//! ## Components
//!
//! - **Manager** (`manager`): owns everything below, built once per process
//! - **OTP store** (`otp`): single-use passes with a background sweep
//! - **Registry** (`registry`): live connections indexed by id and by user
//! - **Connection** (`connection`): read loop, write loop and heartbeat
//! - **Router and handlers** (`router`, `handlers`): inbound chat events
//! - **Broadcaster** (`broadcaster`): fan-out of server events
//! - **HTTP** (`http`): axum routes for upgrade, OTP issuance and stats

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod http;
pub mod identity;
pub mod manager;
pub mod model;
pub mod otp;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;

// Re-export main types for public API
pub use config::{ConfigError, GatewayConfig, GatewayConfigBuilder};
pub use connection::{Classification, ConnectionState};
pub use error::{GatewayError, GatewayResult, StoreError};
pub use http::gateway_routes;
pub use identity::{AuthenticatedUser, ExtensionIdentity, IdentityResolver};
pub use manager::{GatewayManager, GatewayStats};
pub use model::{Message, MessageId, MessageStatus, ProductStockDelta, UserId};
pub use otp::OtpError;
pub use protocol::{Event, EventType};
pub use registry::{BroadcastOutcome, ConnectionId};
pub use store::{InMemoryMessageStore, MessageStore};
