//! Broker kind enumeration.
//!
//! Selects the backend family a router is built for. The set is closed: the
//! registry matches on it exhaustively, so adding a backend is a compile
//! error at every place that has to learn about it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PipeError;

/// Backend family of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// NATS subjects: fire-and-forget publish, queue-group subscriptions,
    /// request/reply.
    Nats,

    /// Kafka topics: one producer and one consumer group per pipe.
    Kafka,

    /// RabbitMQ queues through the default exchange, auto-acknowledged.
    RabbitMq,

    /// AMQP 1.0 addresses: one session and link per pipe, explicit accepts.
    Amqp,

    /// In-process hub with the same semantics as `Nats`.
    Memory,

    /// Placeholder; every operation is a no-op.
    Mqtt,

    /// Placeholder; every operation is a no-op.
    ZeroMq,

    /// Placeholder; every operation is a no-op.
    Tcp,
}

impl BrokerKind {
    // ---
    /// Every kind, in declaration order.
    pub const ALL: [BrokerKind; 8] = [
        BrokerKind::Nats,
        BrokerKind::Kafka,
        BrokerKind::RabbitMq,
        BrokerKind::Amqp,
        BrokerKind::Memory,
        BrokerKind::Mqtt,
        BrokerKind::ZeroMq,
        BrokerKind::Tcp,
    ];

    /// Canonical lowercase name, accepted back by `FromStr`.
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerKind::Nats => "nats",
            BrokerKind::Kafka => "kafka",
            BrokerKind::RabbitMq => "rabbitmq",
            BrokerKind::Amqp => "amqp",
            BrokerKind::Memory => "memory",
            BrokerKind::Mqtt => "mqtt",
            BrokerKind::ZeroMq => "zeromq",
            BrokerKind::Tcp => "tcp",
        }
    }

    /// True for the placeholder backends.
    pub fn is_stub(self) -> bool {
        matches!(self, BrokerKind::Mqtt | BrokerKind::ZeroMq | BrokerKind::Tcp)
    }

    /// True when `get()` performs a real request/response exchange.
    pub fn supports_request(self) -> bool {
        matches!(self, BrokerKind::Nats | BrokerKind::Memory)
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = PipeError;

    /// Parse a broker name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(BrokerKind::Nats),
            "kafka" => Ok(BrokerKind::Kafka),
            "rabbitmq" | "rabbit" => Ok(BrokerKind::RabbitMq),
            "amqp" | "amqp1" => Ok(BrokerKind::Amqp),
            "memory" => Ok(BrokerKind::Memory),
            "mqtt" => Ok(BrokerKind::Mqtt),
            "zeromq" | "zmq" => Ok(BrokerKind::ZeroMq),
            "tcp" => Ok(BrokerKind::Tcp),
            _ => Err(PipeError::UnsupportedBroker(s.to_string())),
        }
    }
}
