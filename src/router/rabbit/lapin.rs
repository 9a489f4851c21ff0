//! RabbitMQ router using `lapin`.
//!
//! ## Semantics
//!
//! - Every pipe is a queue of the same name, reached through the default
//!   exchange. Both sides declare it (non-durable, shared, kept after the
//!   last consumer leaves), so whichever side comes first creates it.
//! - `distribute()` publishes on a channel opened for the pipe on first use
//!   and kept until `close()`. A failed publish closes that channel; the
//!   next `distribute()` opens a new one.
//! - `accept()` opens its own channel and consumes with automatic
//!   acknowledgement: a message counts as delivered once the broker hands it
//!   over, before it is decoded.
//! - An undecodable message, or the end of the consumer stream, ends the
//!   delivery loop.
//! - No request/response; `get()` is a no-op.
//!
//! lapin does not reconnect; only the initial connect is retried, according
//! to the configured `ReconnectPolicy`.

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::{
    //
    options::{
        //
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};

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

struct RabbitInbox {
    consumer: Consumer,
}

#[async_trait::async_trait]
impl Inbox for RabbitInbox {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        // ---
        self.consumer.next().await.map(|delivery| {
            delivery
                .map(|delivery| Bytes::from(delivery.data))
                .map_err(|err| PipeError::Link(format!("consumer stream failed: {err}")))
        })
    }
}

struct RabbitConsumer {
    channel: Channel,
    consumer_tag: String,
    task: DeliveryTask,
}

/// Router over one RabbitMQ connection.
pub(crate) struct RabbitRouter {
    base: RouterBase,
    connection: Connection,
    publishers: PipeCache<Channel>,
    consumers: PipeCache<RabbitConsumer>,
}

impl RabbitRouter {
    // ---
    /// Open a channel and declare the queue of `pipe` on it.
    async fn open_channel(&self, pipe: &str) -> Result<Channel> {
        // ---
        let router_id = &self.base.router_id;

        let channel = self.connection.create_channel().await.map_err(|err| {
            let msg = format!("{router_id}: channel for {pipe} failed: {err}");
            log_error!("{msg}");
            PipeError::Link(msg)
        })?;

        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };

        channel
            .queue_declare(pipe.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: declare of queue {pipe} failed: {err}");
                log_error!("{msg}");
                PipeError::Link(msg)
            })?;

        log_debug!("{router_id}: declared queue {pipe}");
        Ok(channel)
    }

    async fn release(&self, pipe: &str, consumer: RabbitConsumer) {
        // ---
        let router_id = &self.base.router_id;
        let RabbitConsumer {
            channel,
            consumer_tag,
            task,
        } = consumer;

        task.stop().await;

        if let Err(err) = channel
            .basic_cancel(consumer_tag.as_str().into(), BasicCancelOptions::default())
            .await
        {
            log_warn!("{router_id}: cancel of consumer on {pipe} failed: {err}");
        }
        if let Err(err) = channel.close(200, "Pipe removed".into()).await {
            log_warn!("{router_id}: close of channel for {pipe} failed: {err}");
        }
    }
}

#[async_trait::async_trait]
impl Router for RabbitRouter {
    // ---
    fn base(&self) -> &RouterBase {
        &self.base
    }

    async fn distribute(&self, pipe: &str, bytes: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;

        let channel = self
            .publishers
            .get_or_try_insert_with(pipe, || self.open_channel(pipe))
            .await?;

        let published = channel
            .basic_publish(
                "".into(),   // default exchange
                pipe.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default(),
            )
            .await;

        if let Err(err) = published {
            let msg = format!("{router_id}: publish to {pipe} failed: {err}");
            log_error!("{msg}");

            // The next distribute() opens a new channel.
            let evicted = self
                .publishers
                .evict(pipe, |cached| cached.id() == channel.id())
                .await;
            if let Some(channel) = evicted {
                if let Err(err) = channel.close(200, "Publish failed".into()).await {
                    log_debug!("{router_id}: close of failed channel for {pipe}: {err}");
                }
            }
            return Err(PipeError::Link(msg));
        }

        Ok(())
    }

    async fn accept(&self, pipe: &str, callback: DeliveryFn) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        let router_id = &self.base.router_id;

        self.consumers
            .insert_with(pipe, || async {
                let channel = self.open_channel(pipe).await?;
                let consumer_tag = format!("{router_id}-{pipe}");

                let consumer = channel
                    .basic_consume(
                        pipe.into(),
                        consumer_tag.as_str().into(),
                        BasicConsumeOptions {
                            no_ack: true,
                            ..BasicConsumeOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        let msg = format!("{router_id}: consume on {pipe} failed: {err}");
                        log_error!("{msg}");
                        PipeError::Link(msg)
                    })?;

                let task = delivery::spawn(
                    router_id,
                    pipe,
                    RabbitInbox { consumer },
                    DecodeFailure::Stop,
                    callback,
                );

                Ok(RabbitConsumer {
                    channel,
                    consumer_tag,
                    task,
                })
            })
            .await?;

        log_info!("{router_id}: accepted {pipe}");
        Ok(())
    }

    async fn remove(&self, pipe: &str) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        let consumer = self
            .consumers
            .remove(pipe)
            .await
            .ok_or_else(|| PipeError::Unsubscribed(pipe.to_string()))?;
        self.release(pipe, consumer).await;

        log_info!("{}: removed {pipe}", self.base.router_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.base.mark_closed() {
            return Ok(());
        }
        let router_id = &self.base.router_id;

        for (pipe, consumer) in self.consumers.drain().await {
            self.release(&pipe, consumer).await;
        }

        for (pipe, channel) in self.publishers.drain().await {
            if let Err(err) = channel.close(200, "Normal shutdown".into()).await {
                log_warn!("{router_id}: close of channel for {pipe} failed: {err}");
            }
        }

        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|err| {
                let msg = format!("{router_id}: connection close failed: {err}");
                log_error!("{msg}");
                PipeError::Connection(msg)
            })?;

        log_info!("{router_id}: RabbitMQ router closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connect for RabbitRouter {
    async fn connect(settings: &Settings, _service: Option<Service>) -> Result<Self> {
        // ---
        let base = RouterBase::new(BrokerKind::RabbitMq, settings);
        let router_id = base.router_id.clone();
        let uri = settings.rabbitmq.uri.clone();

        log_info!("{router_id}: connecting to RabbitMQ");

        let connection = connect_with_retry(settings, &router_id, || {
            let uri = uri.clone();
            let router_id = router_id.clone();
            async move {
                Connection::connect(&uri, ConnectionProperties::default())
                    .await
                    .map_err(|err| {
                        let msg = format!("{router_id}: RabbitMQ connect failed: {err}");
                        log_error!("{msg}");
                        PipeError::Connection(msg)
                    })
            }
        })
        .await?;

        log_info!("{router_id}: connected to RabbitMQ");

        Ok(Self {
            base,
            connection,
            publishers: PipeCache::new(),
            consumers: PipeCache::new(),
        })
    }
}
