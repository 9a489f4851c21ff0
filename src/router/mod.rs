//! Router implementations.
//!
//! One module per backend family, each implementing the domain-level
//! `Router` trait. Broker-backed routers are hidden behind feature flags and
//! reached only through their `connect_*` functions; with the feature off
//! the function fails with `UnsupportedBroker`.
//!
//! Domain code must not depend on backend-specific types.

pub(crate) mod delivery;
pub(crate) mod pipe_cache;

mod amqp;
mod kafka;
mod memory;
mod nats;
mod rabbit;
mod stub;

pub(crate) use amqp::connect_amqp;
pub(crate) use kafka::connect_kafka;
pub(crate) use memory::MemoryRouter;
pub(crate) use nats::connect_nats;
pub(crate) use rabbit::connect_rabbitmq;
pub(crate) use stub::StubRouter;

