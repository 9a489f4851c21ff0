// src/domain/router.rs

//! Router domain abstractions.
//!
//! A router is one connected backend adapter. It moves already-encoded
//! envelopes between the caller and named pipes and knows nothing about the
//! payload shapes inside them; the typed layer on top ([`RouterExt`]) runs
//! the codec.
//!
//! Concrete routers live under `src/router/` and are only obtainable in the
//! connected state, through the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::{
    //
    codec,
    BrokerKind,
    Payload,
    PipeError,
    Result,
    Service,
    Settings,
};

/// Callback invoked once per decoded inbound message of an accepted pipe.
///
/// Calls for one pipe are strictly sequential; calls for different pipes may
/// run concurrently. The router shares the callback, it never owns the only
/// reference.
pub type DeliveryFn = Arc<dyn Fn(Payload) + Send + Sync>;

/// Shared router pointer.
///
/// Cloning is cheap and every clone drives the same connection.
pub type RouterPtr = Arc<dyn Router>;

/// State every router carries.
pub struct RouterBase {
    /// `<node_id>-<kind>-<uuid>`, prefixed to every log line.
    pub router_id: String,
    pub broker: BrokerKind,

    /// Default `get()` timeout for the typed helpers.
    pub request_timeout: Duration,
    closed: AtomicBool,
}

impl RouterBase {
    // ---
    pub fn new(broker: BrokerKind, settings: &Settings) -> Self {
        Self {
            router_id: format!("{}-{broker}-{}", settings.node_id, uuid::Uuid::new_v4()),
            broker,
            request_timeout: settings.request_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail with [`PipeError::Closed`] once the router is closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }
        Ok(())
    }

    /// Mark the router closed. Returns true only for the call that closed it.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Capability set shared by every backend.
///
/// Operations a backend has no implementation for are no-ops: `Ok(())`, or
/// `Ok(None)` for [`get`](Router::get). Every operation fails with
/// [`PipeError::Closed`] after [`close`](Router::close).
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation shows explicit
/// lifetimes and a boxed `Future`. Treat the methods as plain `async fn`s.
#[async_trait::async_trait]
pub trait Router: Send + Sync {
    // ---
    /// Shared base state; each router returns `&self.base`.
    fn base(&self) -> &RouterBase;

    fn router_id(&self) -> &str {
        &self.base().router_id
    }

    fn broker(&self) -> BrokerKind {
        self.base().broker
    }

    /// Send one envelope to `pipe`.
    ///
    /// Same as [`distribute`](Router::distribute) unless the backend
    /// distinguishes the two.
    async fn dispatch(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        self.distribute(pipe, bytes).await
    }

    /// Send one envelope to `pipe`.
    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()>;

    /// Start a delivery task for `pipe`.
    ///
    /// Returns once the subscription is in place; messages sent afterwards
    /// are deliverable. Failures inside the task are logged, not returned.
    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()>;

    /// Send a request envelope to `pipe` and wait up to `timeout` for the
    /// reply.
    ///
    /// `Ok(None)` means the backend has no request/response exchange.
    async fn get(&self, pipe: &str, bytes: Bytes, timeout: Duration) -> Result<Option<Payload>> {
        // ---
        let _ = (pipe, bytes, timeout);
        self.base().ensure_open()?;
        Ok(None)
    }

    /// Stop the delivery task of `pipe` and release its receive resource.
    ///
    /// # Errors
    ///
    /// [`PipeError::Unsubscribed`] when `pipe` has no active `accept()`.
    async fn remove(&self, pipe: &str) -> Result<()>;

    /// Stop every delivery task, release every pipe resource, then the
    /// connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Construction of a connected router.
///
/// Only the registry calls this; callers go through
/// [`deploy_router`](crate::deploy_router) or
/// [`RouterBuilder`](crate::RouterBuilder).
#[async_trait::async_trait]
pub trait Connect: Router + Sized + 'static {
    /// Open the backend connection.
    ///
    /// `service` is the responder of this process, if any; backends without
    /// request/response ignore it.
    async fn connect(settings: &Settings, service: Option<Service>) -> Result<Self>;
}

/// Typed helpers over any [`Router`], including `dyn Router`.
#[async_trait::async_trait]
pub trait RouterExt: Router {
    // ---
    /// Encode `value` and [`distribute`](Router::distribute) it.
    async fn distribute_as<T>(&self, pipe: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + 'static,
    {
        let bytes = codec::encode(value)?;
        self.distribute(pipe, bytes).await
    }

    /// Encode `value` and [`dispatch`](Router::dispatch) it.
    async fn dispatch_as<T>(&self, pipe: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + 'static,
    {
        let bytes = codec::encode(value)?;
        self.dispatch(pipe, bytes).await
    }

    /// [`accept`](Router::accept) with a plain closure.
    async fn accept_as<F>(&self, pipe: &str, callback: F) -> Result<()>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.accept(pipe, Arc::new(callback)).await
    }

    /// Request/response with the router's default timeout.
    async fn get_as<Req, Resp>(&self, pipe: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync + 'static,
        Resp: Send + 'static,
    {
        let timeout = self.base().request_timeout;
        self.get_within(pipe, request, timeout).await
    }

    /// Request/response with an explicit timeout.
    ///
    /// # Errors
    ///
    /// [`PipeError::UnsupportedOperation`] on backends without
    /// request/response, [`PipeError::Timeout`] when no reply arrives in
    /// time, [`PipeError::Decoding`] when the reply is not a `Resp`.
    async fn get_within<Req, Resp>(
        &self,
        pipe: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + 'static,
        Resp: Send + 'static,
    {
        // ---
        let bytes = codec::encode(request)?;
        match self.get(pipe, bytes, timeout).await? {
            Some(payload) => payload.into_inner::<Resp>(),
            None => Err(PipeError::UnsupportedOperation {
                broker: self.broker(),
                operation: "get",
            }),
        }
    }
}

impl<R: Router + ?Sized> RouterExt for R {}
