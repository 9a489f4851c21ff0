//! RabbitMQ router.
//!
//! Backed by `lapin` (AMQP 0-9-1) when the `transport_lapin` feature is
//! enabled.

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub(crate) use self::lapin::RabbitRouter;

use crate::{Result, RouterPtr, Service, Settings};

#[cfg(feature = "transport_lapin")]
pub(crate) async fn connect_rabbitmq(
    settings: &Settings,
    service: Option<Service>,
) -> Result<RouterPtr> {
    // ---
    use crate::Connect;

    let router = RabbitRouter::connect(settings, service).await?;
    Ok(std::sync::Arc::new(router))
}

#[cfg(not(feature = "transport_lapin"))]
pub(crate) async fn connect_rabbitmq(
    _settings: &Settings,
    _service: Option<Service>,
) -> Result<RouterPtr> {
    Err(crate::PipeError::UnsupportedBroker(
        "transport_lapin feature is not enabled".into(),
    ))
}
