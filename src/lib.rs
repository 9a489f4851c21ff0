//! Broker-agnostic pipes over NATS, Kafka, RabbitMQ and AMQP 1.0.
//!
//! A router sends and receives structured payloads on named pipes through
//! one interface, whatever broker is behind it. The backend is chosen at
//! runtime by [`BrokerKind`]; payload shapes are registered once with
//! [`enable`] and travel as tagged JSON envelopes.
//!
//! ```
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//! use mom_pipe::{deploy_router_with, BrokerKind, RouterExt, Settings};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Order {
//!     id: u64,
//! }
//!
//! # async fn example() -> mom_pipe::Result<()> {
//! mom_pipe::enable::<Order>("example.order")?;
//!
//! let router = deploy_router_with(BrokerKind::Memory, &Settings::default()).await?;
//! router
//!     .accept_as("orders", |payload| {
//!         if let Some(order) = payload.downcast_ref::<Order>() {
//!             println!("order {}", order.id);
//!         }
//!     })
//!     .await?;
//!
//! router.distribute_as("orders", &Order { id: 7 }).await?;
//! tokio::time::sleep(Duration::from_millis(10)).await;
//! router.close().await
//! # }
//! ```
//!
//! Broker-backed routers are behind feature flags (`transport_nats`,
//! `transport_rdkafka`, `transport_lapin`, `transport_fe2o3`); the in-process
//! `Memory` router and the placeholder kinds are always available.

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod broker_kind;
pub mod codec;
mod domain;
mod error;
mod registry;
mod responder;
mod retry;
mod router;
mod router_builder;
mod settings;

// Re-export main types
pub use broker_kind::BrokerKind;
pub use codec::{decode, decode_payload, enable, encode, is_enabled, tag_of, Payload};
pub use error::{PipeError, Result};
pub use registry::{deploy_router, deploy_router_with};
pub use responder::{Responder, Service};
pub use router_builder::RouterBuilder;

pub use settings::{
    //
    AmqpSettings,
    KafkaSettings,
    NatsSettings,
    RabbitSettings,
    ReconnectPolicy,
    Settings,
    TlsFiles,
    DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SEND_TIMEOUT,
};

// --- public re-exports
pub use domain::{
    //
    Connect,
    DeliveryFn,
    Router,
    RouterBase,
    RouterExt,
    RouterPtr,
};
