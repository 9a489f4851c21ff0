//! NATS router.
//!
//! Backed by `async-nats` when the `transport_nats` feature is enabled.

#[cfg(feature = "transport_nats")]
#[allow(clippy::module_inception)]
mod nats;

#[cfg(feature = "transport_nats")]
pub(crate) use self::nats::NatsRouter;

use crate::{Result, RouterPtr, Service, Settings};

#[cfg(feature = "transport_nats")]
pub(crate) async fn connect_nats(
    settings: &Settings,
    service: Option<Service>,
) -> Result<RouterPtr> {
    // ---
    use crate::Connect;

    let router = NatsRouter::connect(settings, service).await?;
    Ok(std::sync::Arc::new(router))
}

#[cfg(not(feature = "transport_nats"))]
pub(crate) async fn connect_nats(
    _settings: &Settings,
    _service: Option<Service>,
) -> Result<RouterPtr> {
    Err(crate::PipeError::UnsupportedBroker(
        "transport_nats feature is not enabled".into(),
    ))
}
