// src/router/memory/hub.rs

//! Process-wide message hub shared by memory routers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::{
    //
    log_debug,
    Result,
};

/// Capacity of each subscriber and responder queue.
const MEMBER_QUEUE: usize = 64;

static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

/// One request waiting for a responder.
pub(crate) struct Request {
    pub data: Bytes,
    pub reply: oneshot::Sender<Bytes>,
}

/// Members of one pipe or service, served round-robin.
struct Members<T> {
    entries: Vec<(u64, T)>,
    cursor: AtomicUsize,
}

impl<T: Clone> Members<T> {
    // ---
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Members in the order they should be tried for the next message.
    fn rotation(&self) -> Vec<T> {
        // ---
        let len = self.entries.len();
        if len == 0 {
            return Vec::new();
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        (0..len)
            .map(|offset| self.entries[(start + offset) % len].1.clone())
            .collect()
    }
}

type Registry<T> = RwLock<HashMap<String, Members<T>>>;

/// Routing table of every pipe subscriber and service responder.
pub(crate) struct MemoryHub {
    pipes: Registry<mpsc::Sender<Bytes>>,
    services: Registry<mpsc::Sender<Request>>,
    next_member: AtomicU64,
}

impl MemoryHub {
    // ---
    pub fn new() -> Self {
        Self {
            pipes: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            next_member: AtomicU64::new(1),
        }
    }

    /// Hub shared by every memory router of the process.
    pub fn global() -> Arc<MemoryHub> {
        GLOBAL_HUB.get_or_init(|| Arc::new(MemoryHub::new())).clone()
    }

    fn member_id(&self) -> u64 {
        self.next_member.fetch_add(1, Ordering::Relaxed)
    }

    /// Join the queue group of `pipe`.
    pub async fn subscribe(&self, pipe: &str) -> (u64, mpsc::Receiver<Bytes>) {
        // ---
        let (tx, rx) = mpsc::channel(MEMBER_QUEUE);
        let id = self.member_id();
        join(&self.pipes, pipe, id, tx).await;
        (id, rx)
    }

    pub async fn unsubscribe(&self, pipe: &str, id: u64) {
        leave(&self.pipes, pipe, id).await;
    }

    /// Hand `data` to one subscriber of `pipe`; dropped when there is none.
    pub async fn publish(&self, pipe: &str, data: Bytes) -> Result<()> {
        // ---
        let candidates = rotation(&self.pipes, pipe).await;

        for sender in candidates {
            match sender.send(data.clone()).await {
                Ok(()) => return Ok(()),
                // Receiver gone between lookup and send; try the next member.
                Err(_) => continue,
            }
        }

        log_debug!("memory hub: no subscriber on {pipe}, message dropped");
        Ok(())
    }

    /// Register a responder under `service`.
    pub async fn provide(&self, service: &str) -> (u64, mpsc::Receiver<Request>) {
        // ---
        let (tx, rx) = mpsc::channel(MEMBER_QUEUE);
        let id = self.member_id();
        join(&self.services, service, id, tx).await;
        (id, rx)
    }

    pub async fn withdraw(&self, service: &str, id: u64) {
        leave(&self.services, service, id).await;
    }

    /// Send a request to one responder of `service` and wait for its reply.
    ///
    /// The caller bounds the wait; a missing responder or a handler that
    /// never replies leaves the returned future pending.
    pub async fn request(&self, service: &str, data: Bytes) -> Result<Bytes> {
        // ---
        for responder in rotation(&self.services, service).await {
            let (reply, response) = oneshot::channel();
            let request = Request {
                data: data.clone(),
                reply,
            };

            if responder.send(request).await.is_err() {
                continue;
            }

            return match response.await {
                Ok(bytes) => Ok(bytes),
                // Handler failed; the requester sees a timeout.
                Err(_) => std::future::pending().await,
            };
        }

        log_debug!("memory hub: no responder for {service}");
        std::future::pending().await
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, pipe: &str) -> usize {
        self.pipes
            .read()
            .await
            .get(pipe)
            .map_or(0, |members| members.entries.len())
    }
}

async fn join<T: Clone>(registry: &Registry<T>, name: &str, id: u64, member: T) {
    let mut registry = registry.write().await;
    registry
        .entry(name.to_string())
        .or_insert_with(Members::new)
        .entries
        .push((id, member));
}

async fn leave<T>(registry: &Registry<T>, name: &str, id: u64) {
    // ---
    let mut registry = registry.write().await;
    if let Some(members) = registry.get_mut(name) {
        members.entries.retain(|(member, _)| *member != id);
        if members.entries.is_empty() {
            registry.remove(name);
        }
    }
}

// Chosen members are cloned out so no lock is held across a send.
async fn rotation<T: Clone>(registry: &Registry<T>, name: &str) -> Vec<T> {
    registry
        .read()
        .await
        .get(name)
        .map(Members::rotation)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_round_robins_between_members() {
        // ---
        let hub = MemoryHub::new();
        let (_, mut first) = hub.subscribe("jobs").await;
        let (_, mut second) = hub.subscribe("jobs").await;

        for n in 0..4u8 {
            hub.publish("jobs", Bytes::from(vec![n])).await.unwrap();
        }

        let mut got_first = Vec::new();
        while let Ok(bytes) = first.try_recv() {
            got_first.push(bytes[0]);
        }
        let mut got_second = Vec::new();
        while let Ok(bytes) = second.try_recv() {
            got_second.push(bytes[0]);
        }

        assert_eq!(got_first.len(), 2);
        assert_eq!(got_second.len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_member_queue() {
        // ---
        let hub = MemoryHub::new();
        let (id, mut inbox) = hub.subscribe("news").await;
        assert_eq!(hub.subscriber_count("news").await, 1);

        hub.unsubscribe("news", id).await;

        assert_eq!(hub.subscriber_count("news").await, 0);
        assert!(inbox.recv().await.is_none());
        hub.publish("news", Bytes::from_static(b"late")).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reaches_responder() {
        // ---
        let hub = Arc::new(MemoryHub::new());
        let (_, mut requests) = hub.provide("echo").await;

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let _ = request.reply.send(request.data);
            }
        });

        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            hub.request("echo", Bytes::from_static(b"hi")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&reply[..], b"hi");
    }

    #[tokio::test]
    async fn test_request_without_responder_stays_pending() {
        // ---
        let hub = MemoryHub::new();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            hub.request("nobody", Bytes::new()),
        )
        .await;

        assert!(result.is_err());
    }
}
