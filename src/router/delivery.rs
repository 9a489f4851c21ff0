//! Delivery tasks.
//!
//! Every accepted pipe runs one background task that waits for the next
//! inbound envelope, decodes it with the codec and hands the payload to the
//! caller's callback. The callback returns before the next message is
//! received, so deliveries on one pipe never overlap.
//!
//! Backends differ only in where messages come from ([`Inbox`]) and in what
//! an undecodable message does to the loop ([`DecodeFailure`]). A receive
//! error always ends the loop; nothing is retried.
//!
//! The loop owns a cancellation token. [`DeliveryTask::stop`] cancels it and
//! waits for the task to exit, so once `remove()` or `close()` returns no
//! further callback runs for the pipe. A callback that panicked has already
//! ended the task; `stop` logs the panic instead of passing it on.

use bytes::Bytes;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    //
    codec,
    log_debug,
    log_error,
    log_info,
    DeliveryFn,
    Result,
};

/// Source of inbound envelopes for one pipe.
#[async_trait::async_trait]
pub(crate) trait Inbox: Send + 'static {
    /// Next raw envelope; `None` once the source is exhausted.
    async fn next(&mut self) -> Option<Result<Bytes>>;

    /// Release the native receive resource after the loop ends.
    async fn shutdown(self)
    where
        Self: Sized,
    {
    }
}

/// What a decode error does to the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeFailure {
    /// Log, drop the message, keep receiving.
    Skip,

    /// Log and end the loop.
    Stop,
}

/// Handle of a running delivery loop.
pub(crate) struct DeliveryTask {
    label: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DeliveryTask {
    // ---
    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        let label = self.label.clone();
        if let Err(err) = self.finish().await {
            log_error!("{label}: delivery task panicked: {err}");
        }
    }

    /// Cancel and wait; the error is the task's panic, if it had one.
    async fn finish(self) -> std::result::Result<(), JoinError> {
        self.cancel.cancel();
        match self.join.await {
            Err(err) if err.is_panic() => Err(err),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wrap a task that watches `cancel` itself; `label` names it in logs.
    pub fn from_parts(label: String, cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            label,
            cancel,
            join,
        }
    }
}

/// Spawn the delivery loop of `pipe`.
pub(crate) fn spawn<I>(
    router_id: &str,
    pipe: &str,
    mut inbox: I,
    on_decode_failure: DecodeFailure,
    callback: DeliveryFn,
) -> DeliveryTask
where
    I: Inbox,
{
    // ---
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let label = format!("{router_id}: {pipe}");
    let router_id = router_id.to_string();
    let pipe = pipe.to_string();

    let join = tokio::spawn(async move {
        // ---
        log_debug!("{router_id}: delivery started for {pipe}");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = inbox.next() => next,
            };

            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    log_error!("{router_id}: receive failed on {pipe}: {err}");
                    break;
                }
                None => {
                    log_debug!("{router_id}: inbox of {pipe} closed");
                    break;
                }
            };

            match codec::decode_payload(&bytes) {
                Ok(payload) => callback(payload),
                Err(err) => {
                    log_error!("{router_id}: dropped undecodable message on {pipe}: {err}");
                    if on_decode_failure == DecodeFailure::Stop {
                        break;
                    }
                }
            }
        }

        inbox.shutdown().await;
        log_info!("{router_id}: delivery ended for {pipe}");
    });

    DeliveryTask::from_parts(label, cancel, join)
}
