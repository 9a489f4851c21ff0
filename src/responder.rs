//! Request handlers for `get()`.
//!
//! A process answers requests through at most one [`Responder`], attached to
//! the router under an explicit service name. The responder decodes the
//! request envelope, runs the async handler and encodes the reply; both
//! shapes must be enabled in the codec.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::{
    //
    codec,
    Result,
};

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Type-erased async handler: request envelope in, reply envelope out.
trait HandlerFn: Send + Sync {
    fn call(&self, request: &[u8]) -> BoxFuture<'static, Result<Bytes>>;
}

struct Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp>> + Send,
{
    func: F,
    _phantom: PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> HandlerFn for Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, request: &[u8]) -> BoxFuture<'static, Result<Bytes>> {
        // ---
        let req = match codec::decode_payload(request).and_then(|p| p.into_inner::<TReq>()) {
            Ok(req) => req,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        let fut = (self.func)(req);

        Box::pin(async move {
            let resp = fut.await?;
            codec::encode(&resp)
        })
    }
}

/// Async request handler typed on its request and reply shapes.
///
/// ```
/// use mom_pipe::Responder;
///
/// let responder = Responder::new(|n: u64| async move { Ok(n * 2) });
/// ```
#[derive(Clone)]
pub struct Responder {
    handler: Arc<dyn HandlerFn>,
}

impl Responder {
    // ---
    pub fn new<F, Fut, TReq, TResp>(handler: F) -> Self
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
        TReq: Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        Self {
            handler: Arc::new(Handler {
                func: handler,
                _phantom: PhantomData,
            }),
        }
    }

    /// Answer one request envelope with a reply envelope.
    pub(crate) async fn respond(&self, request: &[u8]) -> Result<Bytes> {
        self.handler.call(request).await
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// A responder together with the service name it listens on.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub responder: Responder,
}

impl Service {
    pub fn new(name: impl Into<String>, responder: Responder) -> Self {
        Self {
            name: name.into(),
            responder,
        }
    }
}
