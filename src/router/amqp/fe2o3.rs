//! AMQP 1.0 router using `fe2o3-amqp`.
//!
//! ## Semantics
//!
//! - Every pipe gets its own session. The sender link (target address = pipe)
//!   is opened on first `dispatch()`/`distribute()` and kept until `close()`;
//!   the receiver link (source address = pipe) lives from `accept()` to
//!   `remove()`.
//! - Each send waits for the broker's outcome for at most `send_timeout`. An
//!   elapsed send, or any outcome other than accepted, is a
//!   [`PipeError::Link`]; nothing is resent. A link whose send failed or
//!   timed out is closed and reopened on the next send.
//! - Incoming bodies may be a binary value or one or more data sections;
//!   data sections are joined in order.
//! - Receivers grant a fixed credit window (`link_credit`), refilled as
//!   deliveries are processed. Every delivery is accepted at the broker, then
//!   decoded; an undecodable message is dropped and the link stays open.
//! - No request/response; `get()` is a no-op.
//!
//! fe2o3-amqp does not reconnect; only the initial connect is retried,
//! according to the configured `ReconnectPolicy`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{AmqpValue, Body, Data, Message, Outcome};
use fe2o3_amqp::types::primitives::Binary;
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use tokio::sync::Mutex;

use crate::retry::connect_with_retry;
use crate::router::delivery::{self, DecodeFailure, DeliveryTask, Inbox};
use crate::router::pipe_cache::PipeCache;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerKind,
    Connect,
    DeliveryFn,
    PipeError,
    Result,
    Router,
    RouterBase,
    Service,
    Settings,
};

struct AmqpInbox {
    receiver: Receiver,
}

#[async_trait::async_trait]
impl Inbox for AmqpInbox {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        // ---
        let delivery = match self.receiver.recv::<Binary>().await {
            Ok(delivery) => delivery,
            Err(err) => return Some(Err(PipeError::Link(format!("receive failed: {err}")))),
        };

        if let Err(err) = self.receiver.accept(&delivery).await {
            return Some(Err(PipeError::Link(format!("accept failed: {err}"))));
        }

        Some(Ok(body_bytes(delivery.body())))
    }

    async fn shutdown(self) {
        let _ = self.receiver.close().await;
    }
}

/// Raw bytes of a received body.
///
/// Anything but a binary value or data sections yields empty bytes, which fail
/// to decode and are dropped by the delivery loop.
fn body_bytes(body: &Body<Binary>) -> Bytes {
    match body {
        Body::Value(AmqpValue(binary)) => Bytes::copy_from_slice(binary),
        Body::Data(sections) => join_sections(sections.iter()),
        _ => Bytes::new(),
    }
}

fn join_sections<'a>(sections: impl IntoIterator<Item = &'a Data>) -> Bytes {
    sections
        .into_iter()
        .flat_map(|section| section.0.iter().copied())
        .collect()
}

struct LinkSender {
    session: SessionHandle<()>,
    sender: Sender,
}

struct LinkReceiver {
    session: SessionHandle<()>,
    task: DeliveryTask,
}

/// Router over one AMQP 1.0 connection.
pub(crate) struct AmqpRouter {
    base: RouterBase,
    connection: Mutex<ConnectionHandle<()>>,
    send_timeout: Duration,
    link_credit: u32,
    senders: PipeCache<Arc<Mutex<LinkSender>>>,
    receivers: PipeCache<LinkReceiver>,
}

impl AmqpRouter {
    // ---
    async fn begin_session(&self, pipe: &str) -> Result<SessionHandle<()>> {
        // ---
        let mut connection = self.connection.lock().await;
        Session::begin(&mut *connection).await.map_err(|err| {
            let msg = format!("{}: session for {pipe} failed: {err}", self.base.router_id);
            log_error!("{msg}");
            PipeError::Link(msg)
        })
    }

    async fn open_sender(&self, pipe: &str) -> Result<Arc<Mutex<LinkSender>>> {
        // ---
        let router_id = &self.base.router_id;
        let mut session = self.begin_session(pipe).await?;

        let sender = Sender::attach(&mut session, format!("{router_id}-{pipe}-sender"), pipe)
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: sender link to {pipe} failed: {err}");
                log_error!("{msg}");
                PipeError::Link(msg)
            })?;

        log_debug!("{router_id}: sender link open for {pipe}");
        Ok(Arc::new(Mutex::new(LinkSender { session, sender })))
    }

    /// Drop the cached sender of `pipe` if it is still `link`, then close it.
    async fn evict_sender(&self, pipe: &str, link: Arc<Mutex<LinkSender>>) {
        // ---
        let router_id = &self.base.router_id;
        let evicted = self
            .senders
            .evict(pipe, |cached| Arc::ptr_eq(cached, &link))
            .await;
        if evicted.is_none() {
            return;
        }
        drop(evicted);

        // A broker that let the send time out may not answer the detach either.
        let closing = close_sender(router_id, pipe, link);
        if tokio::time::timeout(self.send_timeout, closing).await.is_err() {
            log_warn!("{router_id}: failed sender link for {pipe} did not close in time");
        }
    }

    async fn open_receiver(&self, pipe: &str) -> Result<(SessionHandle<()>, Receiver)> {
        // ---
        let router_id = &self.base.router_id;
        let mut session = self.begin_session(pipe).await?;

        let receiver = Receiver::builder()
            .name(format!("{router_id}-{pipe}-receiver"))
            .source(pipe)
            .credit_mode(CreditMode::Auto(self.link_credit))
            .attach(&mut session)
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: receiver link from {pipe} failed: {err}");
                log_error!("{msg}");
                PipeError::Link(msg)
            })?;

        Ok((session, receiver))
    }
}

async fn end_session(router_id: &str, pipe: &str, mut session: SessionHandle<()>) {
    if let Err(err) = session.end().await {
        log_warn!("{router_id}: session end for {pipe} failed: {err}");
    }
}

async fn close_sender(router_id: &str, pipe: &str, link: Arc<Mutex<LinkSender>>) {
    // ---
    let LinkSender { sender, session } = match Arc::try_unwrap(link) {
        Ok(link) => link.into_inner(),
        Err(_) => {
            // A send is still in flight; its link goes down with the connection.
            log_warn!("{router_id}: sender link for {pipe} still in use at close");
            return;
        }
    };

    if let Err(err) = sender.close().await {
        log_warn!("{router_id}: sender close for {pipe} failed: {err}");
    }
    end_session(router_id, pipe, session).await;
}

#[async_trait::async_trait]
impl Router for AmqpRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;

        let link = self
            .senders
            .get_or_try_insert_with(pipe, || self.open_sender(pipe))
            .await?;

        let message = Message::builder()
            .value(Binary::from(bytes.to_vec()))
            .build();

        let sent = tokio::time::timeout(self.send_timeout, async {
            link.lock().await.sender.send(message).await
        })
        .await;

        let outcome = match sent {
            Ok(Ok(outcome)) => outcome,
            failed => {
                let msg = match failed {
                    Ok(Err(err)) => format!("{router_id}: send to {pipe} failed: {err}"),
                    _ => {
                        let limit = self.send_timeout;
                        format!("{router_id}: send to {pipe} timed out after {limit:?}")
                    }
                };
                log_error!("{msg}");
                self.evict_sender(pipe, link).await;
                return Err(PipeError::Link(msg));
            }
        };

        match outcome {
            Outcome::Accepted(_) => Ok(()),
            other => {
                let msg = format!("{router_id}: send to {pipe} not accepted: {other:?}");
                log_error!("{msg}");
                Err(PipeError::Link(msg))
            }
        }
    }

    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        self.receivers
            .insert_with(pipe, || async {
                let (session, receiver) = self.open_receiver(pipe).await?;
                let task = delivery::spawn(
                    &self.base.router_id,
                    pipe,
                    AmqpInbox { receiver },
                    DecodeFailure::Skip,
                    callback,
                );
                Ok(LinkReceiver { session, task })
            })
            .await?;

        log_info!("{}: accepted {pipe}", self.base.router_id);
        Ok(())
    }

    async fn remove(&self, pipe: &str) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let link = self
            .receivers
            .remove(pipe)
            .await
            .ok_or_else(|| PipeError::Unsubscribed(pipe.to_string()))?;

        // Stopping the task detaches the receiver link.
        link.task.stop().await;
        end_session(&self.base.router_id, pipe, link.session).await;

        log_info!("{}: removed {pipe}", self.base.router_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.base.mark_closed() {
            return Ok(());
        }
        let router_id = &self.base.router_id;

        for (pipe, link) in self.receivers.drain().await {
            link.task.stop().await;
            end_session(router_id, &pipe, link.session).await;
        }

        for (pipe, link) in self.senders.drain().await {
            close_sender(router_id, &pipe, link).await;
        }

        self.connection.lock().await.close().await.map_err(|err| {
            let msg = format!("{router_id}: connection close failed: {err}");
            log_error!("{msg}");
            PipeError::Connection(msg)
        })?;

        log_info!("{router_id}: AMQP router closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connect for AmqpRouter {
    async fn connect(settings: &Settings, _service: Option<Service>) -> Result<Self> {
        // ---
        let base = RouterBase::new(BrokerKind::Amqp, settings);
        let router_id = base.router_id.clone();
        let amqp = settings.amqp.clone();
        let container_id = amqp.container_id.clone().unwrap_or_else(|| router_id.clone());

        log_info!("{router_id}: connecting to AMQP broker at {}", amqp.uri);

        let connection = connect_with_retry(settings, &router_id, || {
            let container_id = container_id.clone();
            let uri = amqp.uri.clone();
            let router_id = router_id.clone();
            async move {
                Connection::open(container_id, uri.as_str())
                    .await
                    .map_err(|err| {
                        let msg = format!("{router_id}: AMQP connect to {uri} failed: {err}");
                        log_error!("{msg}");
                        PipeError::Connection(msg)
                    })
            }
        })
        .await?;

        log_info!("{router_id}: connected to AMQP broker");

        Ok(Self {
            base,
            connection: Mutex::new(connection),
            send_timeout: amqp.send_timeout(),
            link_credit: amqp.link_credit,
            senders: PipeCache::new(),
            receivers: PipeCache::new(),
        })
    }
}
