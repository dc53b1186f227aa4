//! Blocking stream consumer loops.
//!
//! One reader is attached to each of the three streams. A reader owns a
//! dedicated store connection, reads a batch with XREADGROUP BLOCK, decodes
//! each record, dispatches it to the local subscribers, and acks it whatever
//! the dispatch outcome. The 1-second block timeout bounds how long shutdown
//! waits for the loop to observe its stop flag.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use redis::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::Result;
use crate::store::{StreamRecord, StreamStore};
use crate::subscription::SubscriberTable;
use crate::topology::{StreamKind, StreamLayout};

/// XREADGROUP BLOCK timeout.
pub(crate) const BLOCK_MS: usize = 1000;

/// Handle to a running reader loop.
pub(crate) struct ReaderHandle {
    stream: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    /// Signal the loop to stop and wait for it to finish its current batch.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(stream = %self.stream, error = %e, "Reader task panicked");
        }
    }
}

/// A single-stream blocking consumer loop.
pub(crate) struct StreamReader {
    kind: StreamKind,
    stream: String,
    group: String,
    consumer: String,
    store: StreamStore,
    subscribers: Arc<SubscriberTable>,
    debug: bool,
}

impl StreamReader {
    /// Open a dedicated connection and start the consumer loop for `kind`.
    ///
    /// Resolves once the loop is running; group creation and the initial
    /// stream TTL are handled by the caller before any reader starts.
    pub async fn spawn(
        client: &Client,
        layout: &StreamLayout,
        kind: StreamKind,
        subscribers: Arc<SubscriberTable>,
        debug: bool,
    ) -> Result<ReaderHandle> {
        let store = StreamStore::connect(client).await?;
        let reader = StreamReader {
            kind,
            stream: layout.stream(kind),
            group: layout.group(kind),
            consumer: layout.instance().to_string(),
            store,
            subscribers,
            debug,
        };

        let stream = reader.stream.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        info!(stream = %stream, group = %reader.group, "Stream reader started");
        let task = tokio::spawn(reader.run(stop_rx));

        Ok(ReaderHandle {
            stream,
            stop: stop_tx,
            task,
        })
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        // Backoff only stretches the retry gap while the store is down; the
        // block timeout is the baseline pacing.
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff = backoff_builder.build();

        loop {
            if *stop.borrow() {
                break;
            }

            match self
                .store
                .read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.kind.batch_size(),
                    BLOCK_MS,
                )
                .await
            {
                Ok(records) => {
                    backoff = backoff_builder.build();
                    for record in records {
                        self.deliver(record).await;
                    }
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        stream = %self.stream,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Stream read failed, retrying after backoff"
                    );
                    // The stop signal cuts the backoff short; shutdown stays
                    // bounded by the block timeout.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }

        debug!(stream = %self.stream, "Stream reader stopped");
    }

    /// Decode, dispatch, and ack one record. The ack happens whatever the
    /// dispatch outcome; a record that cannot be decoded must not stall the
    /// group.
    async fn deliver(&self, record: StreamRecord) {
        match record.payload.as_deref().map(codec::decode) {
            Some(Ok(envelope)) => {
                if self.debug {
                    debug!(
                        stream = %self.stream,
                        id = %record.id,
                        event = %envelope.event,
                        source = %envelope.source,
                        "Delivering record"
                    );
                }
                self.subscribers.dispatch(Arc::new(envelope)).await;
            }
            Some(Err(e)) => {
                if self.debug {
                    debug!(
                        stream = %self.stream,
                        id = %record.id,
                        error = %e,
                        "Discarding undecodable record"
                    );
                }
            }
            None => {
                if self.debug {
                    debug!(
                        stream = %self.stream,
                        id = %record.id,
                        "Discarding record without message field"
                    );
                }
            }
        }

        if let Err(e) = self.store.ack(&self.stream, &self.group, &record.id).await {
            warn!(stream = %self.stream, id = %record.id, error = %e, "Ack failed");
        }
    }
}
