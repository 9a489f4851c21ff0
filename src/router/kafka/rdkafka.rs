//! Kafka router using `rdkafka`.
//!
//! ## Semantics
//!
//! - One producer per pipe, created on first `distribute()` and kept until
//!   `close()`. Each message is keyed by the pipe name. Batches and the
//!   producer queue are tiny; when the queue is full `distribute()` waits for
//!   a free slot, up to the configured Kafka timeout, instead of failing.
//!   Only enqueueing is awaited, not the broker's delivery report.
//! - One consumer per accepted pipe, in a consumer group named after the
//!   pipe, committing offsets automatically.
//! - A receive error or an undecodable message ends the delivery loop; the
//!   pipe stays accepted until `remove()`.
//! - No request/response; `get()` is a no-op.
//!
//! librdkafka reconnects on its own; the connect step only checks that the
//! bootstrap servers answer a metadata request.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, FutureProducer, FutureRecord, Producer};
use tokio::time::{sleep, Instant};

use crate::router::delivery::{self, DecodeFailure, DeliveryTask, Inbox};
use crate::router::pipe_cache::PipeCache;
use crate::{
    //
    log_error,
    log_info,
    log_warn,
    BrokerKind,
    Connect,
    DeliveryFn,
    KafkaSettings,
    PipeError,
    Result,
    Router,
    RouterBase,
    Service,
    Settings,
};

struct KafkaInbox {
    consumer: StreamConsumer,
}

#[async_trait::async_trait]
impl Inbox for KafkaInbox {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        // ---
        let result = match self.consumer.recv().await {
            Ok(message) => Ok(Bytes::copy_from_slice(message.payload().unwrap_or_default())),
            Err(err) => Err(PipeError::Link(format!("consumer receive failed: {err}"))),
        };
        Some(result)
    }

    async fn shutdown(self) {
        self.consumer.unsubscribe();
    }
}

/// Router over one Kafka cluster.
pub(crate) struct KafkaRouter {
    base: RouterBase,
    settings: KafkaSettings,
    writers: PipeCache<Arc<FutureProducer>>,
    readers: PipeCache<DeliveryTask>,
}

/// Options shared by producers and consumers.
fn client_config(router_id: &str, settings: &KafkaSettings) -> ClientConfig {
    // ---
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.servers)
        .set("client.id", router_id)
        .set("socket.timeout.ms", settings.timeout_ms.to_string());

    if let Some(tls) = &settings.tls {
        config
            .set("security.protocol", "ssl")
            .set("ssl.certificate.location", tls.cert_file.to_string_lossy())
            .set("ssl.key.location", tls.key_file.to_string_lossy())
            .set("ssl.ca.location", tls.ca_file.to_string_lossy());
    }

    config
}

/// Pause between enqueue attempts while the producer queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(5);

/// Enqueue `record` with `send`, waiting out a full producer queue until
/// `deadline`. Any other error is returned at once.
async fn enqueue<R, T, F>(
    mut record: R,
    deadline: Instant,
    mut send: F,
) -> std::result::Result<T, KafkaError>
where
    F: FnMut(R) -> std::result::Result<T, (KafkaError, R)>,
{
    // ---
    loop {
        match send(record) {
            Ok(queued) => return Ok(queued),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned))
                if Instant::now() < deadline =>
            {
                record = returned;
                sleep(QUEUE_FULL_BACKOFF).await;
            }
            Err((err, _)) => return Err(err),
        }
    }
}

fn link_error(router_id: &str, what: &str, pipe: &str, err: KafkaError) -> PipeError {
    let msg = format!("{router_id}: {what} for {pipe} failed: {err}");
    log_error!("{msg}");
    PipeError::Link(msg)
}

impl KafkaRouter {
    // ---
    fn create_writer(&self, pipe: &str) -> Result<Arc<FutureProducer>> {
        // ---
        let producer: FutureProducer = client_config(&self.base.router_id, &self.settings)
            .set("batch.num.messages", self.settings.batch_size.to_string())
            .set(
                "queue.buffering.max.messages",
                self.settings.queue_capacity.to_string(),
            )
            .set("linger.ms", "0")
            .create()
            .map_err(|err| link_error(&self.base.router_id, "producer", pipe, err))?;

        log_info!("{}: producer ready for {pipe}", self.base.router_id);
        Ok(Arc::new(producer))
    }

    fn create_reader(&self, pipe: &str) -> Result<StreamConsumer> {
        // ---
        let consumer: StreamConsumer = client_config(&self.base.router_id, &self.settings)
            .set("group.id", pipe)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.settings.commit_interval_ms.to_string(),
            )
            .set("fetch.min.bytes", self.settings.min_fetch_bytes.to_string())
            .set("fetch.max.bytes", self.settings.max_fetch_bytes.to_string())
            .create()
            .map_err(|err| link_error(&self.base.router_id, "consumer", pipe, err))?;

        consumer
            .subscribe(&[pipe])
            .map_err(|err| link_error(&self.base.router_id, "subscription", pipe, err))?;

        Ok(consumer)
    }
}

#[async_trait::async_trait]
impl Router for KafkaRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let writer = self
            .writers
            .get_or_try_insert_with(pipe, || async { self.create_writer(pipe) })
            .await?;

        let record = FutureRecord::to(pipe).key(pipe).payload(bytes.as_ref());
        let deadline = Instant::now() + self.settings.timeout();

        enqueue(record, deadline, |record| writer.send_result(record))
            .await
            .map(drop)
            .map_err(|err| link_error(&self.base.router_id, "send", pipe, err))
    }

    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        self.readers
            .insert_with(pipe, || async {
                let consumer = self.create_reader(pipe)?;
                Ok(delivery::spawn(
                    &self.base.router_id,
                    pipe,
                    KafkaInbox { consumer },
                    DecodeFailure::Stop,
                    callback,
                ))
            })
            .await?;

        log_info!("{}: accepted {pipe}", self.base.router_id);
        Ok(())
    }

    async fn remove(&self, pipe: &str) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let task = self
            .readers
            .remove(pipe)
            .await
            .ok_or_else(|| PipeError::Unsubscribed(pipe.to_string()))?;
        task.stop().await;

        log_info!("{}: removed {pipe}", self.base.router_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.base.mark_closed() {
            return Ok(());
        }

        for (_, task) in self.readers.drain().await {
            task.stop().await;
        }

        let timeout = self.settings.timeout();
        for (pipe, writer) in self.writers.drain().await {
            let router_id = self.base.router_id.clone();
            let flushed = tokio::task::spawn_blocking(move || writer.flush(timeout)).await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_warn!("{router_id}: flush of {pipe} failed: {err}"),
                Err(err) => log_warn!("{router_id}: flush of {pipe} aborted: {err}"),
            }
        }

        log_info!("{}: Kafka router closed", self.base.router_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connect for KafkaRouter {
    async fn connect(settings: &Settings, _service: Option<Service>) -> Result<Self> {
        // ---
        let base = RouterBase::new(BrokerKind::Kafka, settings);
        let router_id = base.router_id.clone();
        let kafka = settings.kafka.clone();

        log_info!("{router_id}: connecting to Kafka at {}", kafka.servers);

        let checker: BaseProducer = client_config(&router_id, &kafka).create().map_err(|err| {
            let msg = format!("{router_id}: Kafka client setup failed: {err}");
            log_error!("{msg}");
            PipeError::Connection(msg)
        })?;

        let limit = settings.connect_timeout();
        let checked = tokio::task::spawn_blocking(move || {
            checker.client().fetch_metadata(None, limit).map(drop)
        })
        .await
        .map_err(|err| {
            PipeError::Connection(format!("{router_id}: metadata check aborted: {err}"))
        })?;

        checked.map_err(|err| {
            let msg = format!("{router_id}: Kafka at {} unreachable: {err}", kafka.servers);
            log_error!("{msg}");
            PipeError::Connection(msg)
        })?;

        Ok(Self {
            base,
            settings: kafka,
            writers: PipeCache::new(),
            readers: PipeCache::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn queue_full() -> KafkaError {
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_is_waited_out() {
        // ---
        let mut attempts = 0;
        let deadline = Instant::now() + Duration::from_secs(1);

        let result = enqueue("second", deadline, |record| {
            attempts += 1;
            if attempts < 4 {
                Err((queue_full(), record))
            } else {
                Ok(record)
            }
        })
        .await;

        assert_eq!(result.unwrap(), "second");
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_fails_after_deadline() {
        // ---
        let deadline = Instant::now() + Duration::from_millis(50);

        let result: std::result::Result<(), _> =
            enqueue((), deadline, |record| Err((queue_full(), record))).await;

        assert!(matches!(
            result,
            Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull))
        ));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        // ---
        let mut attempts = 0;
        let deadline = Instant::now() + Duration::from_secs(1);

        let result: std::result::Result<(), _> = enqueue((), deadline, |record| {
            attempts += 1;
            Err((
                KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge),
                record,
            ))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
