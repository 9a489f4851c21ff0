//! Router builder.
//!
//! Fluent form of [`deploy_router_with`](crate::deploy_router_with), and the
//! only way to attach a responder to a router.

use crate::registry::connect_kind;
use crate::{
    //
    BrokerKind,
    PipeError,
    Responder,
    Result,
    RouterPtr,
    Service,
    Settings,
};

/// Builder for connected routers.
///
/// # Examples
///
/// ## Publishing router with process-wide settings
/// ```no_run
/// use mom_pipe::{BrokerKind, RouterBuilder};
///
/// # async fn example() -> mom_pipe::Result<()> {
/// let router = RouterBuilder::new(BrokerKind::Kafka).build().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Answering requests under a service name
/// ```
/// use mom_pipe::{BrokerKind, Responder, RouterBuilder, Settings};
///
/// # async fn example() -> mom_pipe::Result<()> {
/// mom_pipe::enable::<u64>("doc.u64")?;
///
/// let router = RouterBuilder::new(BrokerKind::Memory)
///     .settings(Settings::default().with_node_id("doubler"))
///     .service("math.double", Responder::new(|n: u64| async move { Ok(n * 2) }))
///     .build()
///     .await?;
/// # router.close().await
/// # }
/// ```
pub struct RouterBuilder {
    kind: BrokerKind,
    settings: Option<Settings>,
    service: Option<Service>,
}

impl RouterBuilder {
    // ---
    pub fn new(kind: BrokerKind) -> Self {
        Self {
            kind,
            settings: None,
            service: None,
        }
    }

    /// Use `settings` instead of the process-wide settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Answer `get()` requests addressed to `name` with `responder`.
    ///
    /// Ignored, with a warning, by backends without request/response.
    pub fn service(mut self, name: impl Into<String>, responder: Responder) -> Self {
        self.service = Some(Service::new(name, responder));
        self
    }

    /// Connect the router (consumes self).
    ///
    /// # Errors
    ///
    /// [`PipeError::Config`] for an empty service name,
    /// [`PipeError::UnsupportedBroker`] for a backend that is not compiled
    /// in, or the backend's connect error.
    pub async fn build(self) -> Result<RouterPtr> {
        // ---
        if let Some(service) = &self.service {
            if service.name.trim().is_empty() {
                return Err(PipeError::Config("service name must not be empty".into()));
            }
        }

        let settings = self.settings.unwrap_or_else(Settings::global);
        connect_kind(self.kind, &settings, self.service).await
    }
}
