// src/router/memory/router.rs

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::hub::{MemoryHub, Request};
use crate::router::delivery::{self, DecodeFailure, DeliveryTask, Inbox};
use crate::router::pipe_cache::PipeCache;
use crate::{
    //
    codec,
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

struct MemorySubscription {
    member_id: u64,
    task: DeliveryTask,
}

struct ServiceMember {
    name: String,
    member_id: u64,
    task: DeliveryTask,
}

struct MemoryInbox {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait::async_trait]
impl Inbox for MemoryInbox {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Router over the in-process [`MemoryHub`].
pub(crate) struct MemoryRouter {
    base: RouterBase,
    hub: Arc<MemoryHub>,
    subscriptions: PipeCache<MemorySubscription>,
    service: Mutex<Option<ServiceMember>>,
}

impl MemoryRouter {
    // ---
    /// Router attached to `hub`, answering requests for `service` if given.
    pub async fn with_hub(
        hub: Arc<MemoryHub>,
        settings: &Settings,
        service: Option<Service>,
    ) -> Self {
        // ---
        let base = RouterBase::new(BrokerKind::Memory, settings);

        let service = match service {
            Some(service) => Some(serve(&base.router_id, &hub, service).await),
            None => None,
        };

        log_info!("{}: memory router ready", base.router_id);

        Self {
            base,
            hub,
            subscriptions: PipeCache::new(),
            service: Mutex::new(service),
        }
    }
}

/// Register `service` on the hub and spawn its responder loop.
async fn serve(router_id: &str, hub: &MemoryHub, service: Service) -> ServiceMember {
    // ---
    let Service { name, responder } = service;
    let (member_id, requests) = hub.provide(&name).await;

    let label = format!("{router_id}: service {name}");
    let cancel = CancellationToken::new();
    let join = tokio::spawn(answer_requests(
        router_id.to_string(),
        name.clone(),
        requests,
        responder,
        cancel.clone(),
    ));

    log_info!("{router_id}: answering requests for {name}");

    ServiceMember {
        name,
        member_id,
        task: DeliveryTask::from_parts(label, cancel, join),
    }
}

async fn answer_requests(
    router_id: String,
    service: String,
    mut requests: mpsc::Receiver<Request>,
    responder: Responder,
    cancel: CancellationToken,
) {
    // ---
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let responder = responder.clone();
        let router_id = router_id.clone();
        let service = service.clone();

        // Requests are independent; a slow handler must not hold up the next.
        tokio::spawn(async move {
            match responder.respond(&request.data).await {
                Ok(reply) => {
                    let _ = request.reply.send(reply);
                }
                Err(err) => {
                    log_warn!("{router_id}: request to {service} not answered: {err}");
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Router for MemoryRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        self.base.ensure_open()?;
        self.hub.publish(pipe, bytes).await
    }

    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        self.subscriptions
            .insert_with(pipe, || async {
                let (member_id, rx) = self.hub.subscribe(pipe).await;
                let task = delivery::spawn(
                    &self.base.router_id,
                    pipe,
                    MemoryInbox { rx },
                    DecodeFailure::Skip,
                    callback,
                );
                Ok(MemorySubscription { member_id, task })
            })
            .await?;

        log_info!("{}: accepted {pipe}", self.base.router_id);
        Ok(())
    }

    async fn get(&self, pipe: &str, bytes: Bytes, timeout: Duration) -> Result<Option<Payload>> {
        // ---
        self.base.ensure_open()?;

        let reply = tokio::time::timeout(timeout, self.hub.request(pipe, bytes))
            .await
            .map_err(|_| PipeError::Timeout)??;

        codec::decode_payload(&reply).map(Some)
    }

    async fn remove(&self, pipe: &str) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let subscription = self
            .subscriptions
            .remove(pipe)
            .await
            .ok_or_else(|| PipeError::Unsubscribed(pipe.to_string()))?;

        self.hub.unsubscribe(pipe, subscription.member_id).await;
        subscription.task.stop().await;

        log_info!("{}: removed {pipe}", self.base.router_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.base.mark_closed() {
            return Ok(());
        }

        for (pipe, subscription) in self.subscriptions.drain().await {
            self.hub.unsubscribe(&pipe, subscription.member_id).await;
            subscription.task.stop().await;
        }

        if let Some(service) = self.service.lock().await.take() {
            self.hub.withdraw(&service.name, service.member_id).await;
            service.task.stop().await;
        }

        log_info!("{}: memory router closed", self.base.router_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connect for MemoryRouter {
    async fn connect(settings: &Settings, service: Option<Service>) -> Result<Self> {
        Ok(Self::with_hub(MemoryHub::global(), settings, service).await)
    }
}
