//! NATS router using `async-nats`.
//!
//! ## Semantics
//!
//! - `distribute()` publishes to the subject named after the pipe and flushes;
//!   at-most-once, a message nobody subscribes to is lost.
//! - `accept()` joins a queue group on the pipe subject, so processes sharing
//!   the group split the messages between them. The group is the configured
//!   `queue_group`, else the service name, else the pipe name.
//! - An undecodable message is logged and dropped; the subscription stays.
//! - `get()` is a NATS request to the subject named after the pipe. With a
//!   service configured, the router answers requests on the service name
//!   through one queue subscription. Without one no subscription is made and
//!   requests addressed to this process time out at the requester.
//!
//! - `close()` drains the connection: subscriptions end, pending publishes
//!   are flushed, and the socket is closed.
//!
//! Reconnects are handled by the client using the configured
//! `ReconnectPolicy`.

use std::time::Duration;

use async_nats::{Client, ConnectOptions, Request, RequestErrorKind, Subscriber};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::router::delivery::{self, DecodeFailure, DeliveryTask, Inbox};
use crate::router::pipe_cache::PipeCache;
use crate::{
    //
    codec,
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerKind,
    Connect,
    DeliveryFn,
    Payload,
    PipeError,
    Responder,
    Result,
    Router,
    RouterBase,
    Service,
    Settings,
};

struct NatsInbox {
    subscriber: Subscriber,
}

#[async_trait::async_trait]
impl Inbox for NatsInbox {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        self.subscriber.next().await.map(|message| Ok(message.payload))
    }

    async fn shutdown(mut self) {
        let _ = self.subscriber.unsubscribe().await;
    }
}

/// Router over one NATS connection.
pub(crate) struct NatsRouter {
    base: RouterBase,
    client: Client,
    queue_group: Option<String>,
    subscriptions: PipeCache<DeliveryTask>,
    responder: Mutex<Option<DeliveryTask>>,
}

impl NatsRouter {
    // ---
    fn group_for(&self, pipe: &str) -> String {
        self.queue_group.clone().unwrap_or_else(|| pipe.to_string())
    }
}

fn connect_options(router_id: &str, settings: &Settings) -> ConnectOptions {
    // ---
    let policy = settings.reconnect.clone();
    let max_reconnects = if policy.allow {
        Some(policy.max_attempts as usize)
    } else {
        Some(0)
    };

    let mut options = ConnectOptions::new()
        .name(router_id)
        .connection_timeout(settings.connect_timeout())
        .max_reconnects(max_reconnects)
        .reconnect_delay_callback(move |attempts| policy.delay_for(attempts));

    if let Some(tls) = &settings.nats.tls {
        options = options
            .require_tls(true)
            .add_root_certificates(tls.ca_file.clone())
            .add_client_certificate(tls.cert_file.clone(), tls.key_file.clone());
    }

    options
}

/// Answer requests for `service` until cancelled.
async fn serve(router_id: &str, client: &Client, service: Service) -> Result<DeliveryTask> {
    // ---
    let Service { name, responder } = service;

    let subscriber = client
        .queue_subscribe(name.clone(), name.clone())
        .await
        .map_err(|err| {
            let msg = format!("{router_id}: cannot subscribe service {name}: {err}");
            log_error!("{msg}");
            PipeError::Link(msg)
        })?;

    log_info!("{router_id}: answering requests for {name}");

    let label = format!("{router_id}: service {name}");
    let cancel = CancellationToken::new();
    let join = tokio::spawn(answer_requests(
        router_id.to_string(),
        client.clone(),
        subscriber,
        responder,
        cancel.clone(),
    ));

    Ok(DeliveryTask::from_parts(label, cancel, join))
}

async fn answer_requests(
    router_id: String,
    client: Client,
    mut subscriber: Subscriber,
    responder: Responder,
    cancel: CancellationToken,
) {
    // ---
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscriber.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(reply_to) = message.reply.clone() else {
            log_warn!("{router_id}: request on {} without reply subject", message.subject);
            continue;
        };

        let client = client.clone();
        let responder = responder.clone();
        let router_id = router_id.clone();

        tokio::spawn(async move {
            match responder.respond(&message.payload).await {
                Ok(reply) => {
                    if let Err(err) = client.publish(reply_to, reply).await {
                        log_error!("{router_id}: reply publish failed: {err}");
                    }
                }
                Err(err) => {
                    log_warn!("{router_id}: request on {} not answered: {err}", message.subject);
                }
            }
        });
    }

    let _ = subscriber.unsubscribe().await;
}

#[async_trait::async_trait]
impl Router for NatsRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;

        self.client
            .publish(pipe.to_string(), bytes)
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: publish to {pipe} failed: {err}");
                log_error!("{msg}");
                PipeError::Link(msg)
            })?;

        self.client.flush().await.map_err(|err| {
            let msg = format!("{router_id}: flush after {pipe} failed: {err}");
            log_error!("{msg}");
            PipeError::Connection(msg)
        })
    }

    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;
        let group = self.group_for(pipe);

        self.subscriptions
            .insert_with(pipe, || async {
                let subscriber = self
                    .client
                    .queue_subscribe(pipe.to_string(), group.clone())
                    .await
                    .map_err(|err| {
                        let msg = format!("{router_id}: subscribe to {pipe} failed: {err}");
                        log_error!("{msg}");
                        PipeError::Link(msg)
                    })?;

                Ok(delivery::spawn(
                    router_id,
                    pipe,
                    NatsInbox { subscriber },
                    DecodeFailure::Skip,
                    callback,
                ))
            })
            .await?;

        log_info!("{router_id}: accepted {pipe} in group {group}");
        Ok(())
    }

    async fn get(&self, pipe: &str, bytes: Bytes, timeout: Duration) -> Result<Option<Payload>> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;

        // The client's own default request timeout would cut longer waits short.
        let request = Request::new().payload(bytes).timeout(Some(timeout));

        let reply = self
            .client
            .send_request(pipe.to_string(), request)
            .await
            .map_err(|err| match err.kind() {
                RequestErrorKind::TimedOut | RequestErrorKind::NoResponders => {
                    log_debug!("{router_id}: request to {pipe}: {err}");
                    PipeError::Timeout
                }
                _ => {
                    let msg = format!("{router_id}: request to {pipe} failed: {err}");
                    log_error!("{msg}");
                    PipeError::Link(msg)
                }
            })?;

        codec::decode_payload(&reply.payload).map(Some)
    }

    async fn remove(&self, pipe: &str) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let task = self
            .subscriptions
            .remove(pipe)
            .await
            .ok_or_else(|| PipeError::Unsubscribed(pipe.to_string()))?;

        // The inbox unsubscribes on the way out.
        task.stop().await;

        log_info!("{}: removed {pipe}", self.base.router_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.base.mark_closed() {
            return Ok(());
        }

        for (_, task) in self.subscriptions.drain().await {
            task.stop().await;
        }

        if let Some(task) = self.responder.lock().await.take() {
            task.stop().await;
        }

        let router_id = &self.base.router_id;
        self.client.drain().await.map_err(|err| {
            let msg = format!("{router_id}: NATS drain failed: {err}");
            log_error!("{msg}");
            PipeError::Connection(msg)
        })?;

        log_info!("{router_id}: NATS router closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connect for NatsRouter {
    async fn connect(settings: &Settings, service: Option<Service>) -> Result<Self> {
        // ---
        let base = RouterBase::new(BrokerKind::Nats, settings);
        let router_id = base.router_id.clone();
        let server = &settings.nats.server;

        log_info!("{router_id}: connecting to NATS at {server}");

        let client = connect_options(&router_id, settings)
            .connect(server.as_str())
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: NATS connect to {server} failed: {err}");
                log_error!("{msg}");
                PipeError::Connection(msg)
            })?;

        let queue_group = settings
            .nats
            .queue_group
            .clone()
            .or_else(|| service.as_ref().map(|service| service.name.clone()));

        let responder = match service {
            Some(service) => Some(serve(&router_id, &client, service).await?),
            None => {
                log_debug!("{router_id}: no service configured, requests are not answered");
                None
            }
        };

        Ok(Self {
            base,
            client,
            queue_group,
            subscriptions: PipeCache::new(),
            responder: Mutex::new(responder),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::RouterExt;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick(u32);

    /// Settings for the server named by `NATS_URL`; the tests skip without one.
    fn live_settings() -> Option<Settings> {
        // ---
        codec::enable::<Tick>("nats.unit.tick").unwrap();
        std::env::var("NATS_URL")
            .ok()
            .map(|url| Settings::default().with_nats_server(url))
    }

    #[tokio::test]
    async fn test_close_drains_the_connection() {
        // ---
        let Some(settings) = live_settings() else {
            return;
        };
        let router = NatsRouter::connect(&settings, None).await.unwrap();
        router.accept_as("nats.unit.drain", |_| {}).await.unwrap();

        router.close().await.unwrap();
        router.close().await.unwrap();

        let disconnected = tokio::time::timeout(Duration::from_secs(2), async {
            while router.client.publish("nats.unit.drain", Bytes::new()).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(disconnected.is_ok());
    }

    #[tokio::test]
    async fn test_request_waits_past_client_default_timeout() {
        // ---
        let Some(settings) = live_settings() else {
            return;
        };
        let responder = Responder::new(|tick: Tick| async move {
            tokio::time::sleep(Duration::from_secs(11)).await;
            Ok(Tick(tick.0 + 1))
        });
        let server = NatsRouter::connect(&settings, Some(Service::new("nats.unit.slow", responder)))
            .await
            .unwrap();
        let client = NatsRouter::connect(&settings, None).await.unwrap();

        let reply = client
            .get_within::<_, Tick>("nats.unit.slow", &Tick(1), Duration::from_secs(15))
            .await;
        assert_eq!(reply.unwrap(), Tick(2));

        server.close().await.unwrap();
        client.close().await.unwrap();
    }
}
