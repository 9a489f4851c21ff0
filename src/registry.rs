//! Backend registry.
//!
//! Maps a [`BrokerKind`] to a connected router. The match is exhaustive, so
//! a new kind does not compile until it is wired in here. Callers only ever
//! see [`RouterPtr`].

use std::sync::Arc;

use crate::router::{
    //
    connect_amqp,
    connect_kafka,
    connect_nats,
    connect_rabbitmq,
    MemoryRouter,
    StubRouter,
};
use crate::{
    //
    log_info,
    log_warn,
    BrokerKind,
    Connect,
    Result,
    RouterPtr,
    Service,
    Settings,
};

/// Connect a router for `kind` using the process-wide settings.
///
/// See [`Settings::install`] for providing them; defaults apply otherwise.
///
/// # Errors
///
/// [`PipeError::UnsupportedBroker`](crate::PipeError::UnsupportedBroker) if
/// the backend is not compiled in, or the backend's connect error.
pub async fn deploy_router(kind: BrokerKind) -> Result<RouterPtr> {
    deploy_router_with(kind, &Settings::global()).await
}

/// Connect a router for `kind` using `settings`.
///
/// ```
/// # async fn example() -> mom_pipe::Result<()> {
/// use mom_pipe::{deploy_router_with, BrokerKind, Settings};
///
/// let router = deploy_router_with(BrokerKind::Memory, &Settings::default()).await?;
/// router.close().await?;
/// # Ok(())
/// # }
/// ```
pub async fn deploy_router_with(kind: BrokerKind, settings: &Settings) -> Result<RouterPtr> {
    connect_kind(kind, settings, None).await
}

pub(crate) async fn connect_kind(
    kind: BrokerKind,
    settings: &Settings,
    service: Option<Service>,
) -> Result<RouterPtr> {
    // ---
    let service = match service {
        Some(service) if !kind.supports_request() => {
            log_warn!(
                "service {} ignored: {kind} has no request/response",
                service.name
            );
            None
        }
        service => service,
    };

    let router: RouterPtr = match kind {
        BrokerKind::Nats => connect_nats(settings, service).await?,
        BrokerKind::Kafka => connect_kafka(settings, service).await?,
        BrokerKind::RabbitMq => connect_rabbitmq(settings, service).await?,
        BrokerKind::Amqp => connect_amqp(settings, service).await?,
        BrokerKind::Memory => Arc::new(MemoryRouter::connect(settings, service).await?),
        BrokerKind::Mqtt | BrokerKind::ZeroMq | BrokerKind::Tcp => {
            Arc::new(StubRouter::new(kind, settings))
        }
    };

    log_info!("{}: deployed", router.router_id());
    Ok(router)
}
