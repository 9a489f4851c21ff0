//! AMQP 1.0 router.
//!
//! Backed by `fe2o3-amqp` when the `transport_fe2o3` feature is enabled.

#[cfg(feature = "transport_fe2o3")]
mod fe2o3;

#[cfg(feature = "transport_fe2o3")]
pub(crate) use self::fe2o3::AmqpRouter;

use crate::{Result, RouterPtr, Service, Settings};

#[cfg(feature = "transport_fe2o3")]
pub(crate) async fn connect_amqp(
    settings: &Settings,
    service: Option<Service>,
) -> Result<RouterPtr> {
    // ---
    use crate::Connect;

    let router = AmqpRouter::connect(settings, service).await?;
    Ok(std::sync::Arc::new(router))
}

#[cfg(not(feature = "transport_fe2o3"))]
pub(crate) async fn connect_amqp(
    _settings: &Settings,
    _service: Option<Service>,
) -> Result<RouterPtr> {
    Err(crate::PipeError::UnsupportedBroker(
        "transport_fe2o3 feature is not enabled".into(),
    ))
}
