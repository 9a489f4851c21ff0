//! Placeholder routers for MQTT, ZeroMQ and raw TCP.
//!
//! These kinds are reserved: the registry hands out a connected router, but
//! nothing is ever sent or received. Only the closed state is tracked, so a
//! stub fails with [`PipeError::Closed`](crate::PipeError::Closed) after
//! `close()` like every other router.

use bytes::Bytes;

use crate::{
    //
    log_warn,
    BrokerKind,
    DeliveryFn,
    Result,
    Router,
    RouterBase,
    Settings,
};

pub(crate) struct StubRouter {
    base: RouterBase,
}

impl StubRouter {
    // ---
    pub fn new(broker: BrokerKind, settings: &Settings) -> Self {
        let base = RouterBase::new(broker, settings);
        log_warn!(
            "{}: {broker} has no implementation; every operation is a no-op",
            base.router_id
        );
        Self { base }
    }
}

#[async_trait::async_trait]
impl Router for StubRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, _pipe: &str, _bytes: Bytes) -> Result<()> {
        self.base.ensure_open()
    }

    async fn accept(&self, _pipe: &str, _callback: DeliveryFn) -> Result<()> {
        self.base.ensure_open()
    }

    async fn remove(&self, _pipe: &str) -> Result<()> {
        self.base.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.base.mark_closed();
        Ok(())
    }
}
