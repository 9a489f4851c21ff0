//! Kafka router.
//!
//! Backed by `rdkafka` when the `transport_rdkafka` feature is enabled.

#[cfg(feature = "transport_rdkafka")]
mod rdkafka;

#[cfg(feature = "transport_rdkafka")]
pub(crate) use self::rdkafka::KafkaRouter;

use crate::{Result, RouterPtr, Service, Settings};

#[cfg(feature = "transport_rdkafka")]
pub(crate) async fn connect_kafka(
    settings: &Settings,
    service: Option<Service>,
) -> Result<RouterPtr> {
    // ---
    use crate::Connect;

    let router = KafkaRouter::connect(settings, service).await?;
    Ok(std::sync::Arc::new(router))
}

#[cfg(not(feature = "transport_rdkafka"))]
pub(crate) async fn connect_kafka(
    _settings: &Settings,
    _service: Option<Service>,
) -> Result<RouterPtr> {
    Err(crate::PipeError::UnsupportedBroker(
        "transport_rdkafka feature is not enabled".into(),
    ))
}
