//! Background stream maintenance.
//!
//! Every 30 seconds, for each of the three streams this instance owns a view
//! of: trim to the configured length, renew the TTL, and prune consumers
//! idle for longer than a full TTL window. On the broadcast stream, also
//! destroy consumer groups whose owning instance has died. The owner's
//! unicast stream is the liveness witness, because only its owner renews its
//! TTL. There is no other membership protocol.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::store::StreamStore;
use crate::topology::{StreamKind, StreamLayout};

/// Time between maintenance passes. The first pass runs immediately.
pub(crate) const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period before a missing witness stream condemns a broadcast group.
/// A peer mid-`init` may have created its broadcast group before its unicast
/// stream exists.
pub(crate) const GC_RECHECK_DELAY: Duration = Duration::from_secs(2);

/// Handle to the running maintenance worker.
pub(crate) struct MaintenanceHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Cancel the worker and wait for it to exit. No new pass starts after
    /// the signal; an in-flight pass runs to completion first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Maintenance task panicked");
        }
    }
}

/// Periodic maintenance over this instance's streams.
pub(crate) struct MaintenanceWorker {
    store: StreamStore,
    layout: StreamLayout,
    stream_ttl_secs: u64,
    max_message_count: usize,
}

impl MaintenanceWorker {
    /// Start the worker on the shared control connection.
    pub fn spawn(
        store: StreamStore,
        layout: StreamLayout,
        stream_ttl_secs: u64,
        max_message_count: usize,
    ) -> MaintenanceHandle {
        let worker = Self {
            store,
            layout,
            stream_ttl_secs,
            max_message_count,
        };

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = MAINTENANCE_INTERVAL.as_secs(),
                stream_ttl_secs = worker.stream_ttl_secs,
                "Maintenance worker started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.run_pass().await;
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Maintenance worker stopped");
        });

        MaintenanceHandle {
            cancel: cancel_tx,
            task,
        }
    }

    /// One full maintenance pass. Individual op failures are logged and
    /// dropped; the next pass retries.
    async fn run_pass(&self) {
        for kind in StreamKind::ALL {
            let stream = self.layout.stream(kind);
            let group = self.layout.group(kind);

            match self.store.trim(&stream, self.max_message_count).await {
                Ok(trimmed) if trimmed > 0 => {
                    debug!(stream = %stream, trimmed = trimmed, "Trimmed stream")
                }
                Ok(_) => {}
                Err(e) => debug!(stream = %stream, error = %e, "Stream trim failed"),
            }

            if let Err(e) = self
                .store
                .expire(&stream, self.stream_ttl_secs as i64)
                .await
            {
                debug!(stream = %stream, error = %e, "TTL renewal failed");
            }

            self.prune_idle_consumers(&stream, &group).await;
        }

        self.collect_dead_broadcast_groups().await;
    }

    /// Delete consumers that have not read for a full TTL window. The reader
    /// loop touches its consumer at least once per block timeout, so an idle
    /// time that long means the owning instance is gone.
    async fn prune_idle_consumers(&self, stream: &str, group: &str) {
        let consumers = match self.store.consumers(stream, group).await {
            Ok(consumers) => consumers,
            Err(e) => {
                debug!(stream = %stream, group = %group, error = %e, "Consumer listing failed");
                return;
            }
        };

        let idle_limit_ms = self.stream_ttl_secs.saturating_mul(1000);
        for consumer in consumers {
            if consumer.idle_ms <= idle_limit_ms {
                continue;
            }
            match self
                .store
                .delete_consumer(stream, group, &consumer.name)
                .await
            {
                Ok(pending) => {
                    info!(
                        stream = %stream,
                        group = %group,
                        consumer = %consumer.name,
                        idle_ms = consumer.idle_ms,
                        pending = pending,
                        "Pruned idle consumer"
                    );
                }
                Err(e) => {
                    debug!(
                        stream = %stream,
                        consumer = %consumer.name,
                        error = %e,
                        "Consumer prune failed"
                    );
                }
            }
        }
    }

    /// Destroy broadcast groups owned by instances whose unicast witness
    /// stream has expired. The probe is repeated once after a grace period
    /// before the group is condemned.
    async fn collect_dead_broadcast_groups(&self) {
        let stream = self.layout.broadcast_stream();
        let groups = match self.store.groups(&stream).await {
            Ok(groups) => groups,
            Err(e) => {
                debug!(stream = %stream, error = %e, "Group listing failed");
                return;
            }
        };

        let mut suspects = Vec::new();
        for group in groups {
            let Some(instance) = self.layout.group_instance(&group.name) else {
                continue;
            };
            if instance == self.layout.instance() {
                continue;
            }
            let witness = self.layout.unicast_stream_for(instance);
            match self.store.exists(&witness).await {
                Ok(false) => suspects.push((group.name, witness)),
                Ok(true) => {}
                Err(e) => debug!(witness = %witness, error = %e, "Witness probe failed"),
            }
        }

        if suspects.is_empty() {
            return;
        }

        tokio::time::sleep(GC_RECHECK_DELAY).await;

        for (group, witness) in suspects {
            match self.store.exists(&witness).await {
                Ok(false) => match self.store.destroy_group(&stream, &group).await {
                    Ok(destroyed) => {
                        if destroyed {
                            info!(group = %group, "Destroyed broadcast group of dead instance");
                        }
                    }
                    Err(e) => debug!(group = %group, error = %e, "Group destroy failed"),
                },
                Ok(true) => {}
                Err(e) => debug!(witness = %witness, error = %e, "Witness probe failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use testcontainers::{
        core::{IntoContainerPort, WaitFor},
        runners::AsyncRunner,
        GenericImage, ImageExt,
    };

    use super::*;

    async fn start_redis() -> (testcontainers::ContainerAsync<GenericImage>, StreamStore) {
        let image = GenericImage::new("redis", "7")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));

        let container = image
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get mapped port");
        let host = container
            .get_host()
            .await
            .expect("Failed to get container host");

        let client = redis::Client::open(format!("redis://{}:{}", host, host_port))
            .expect("Failed to open client");
        let store = StreamStore::connect(&client)
            .await
            .expect("Failed to connect to Redis");
        (container, store)
    }

    fn worker(store: StreamStore, layout: StreamLayout, stream_ttl_secs: u64) -> MaintenanceWorker {
        MaintenanceWorker {
            store,
            layout,
            stream_ttl_secs,
            max_message_count: 5000,
        }
    }

    async fn group_names(store: &StreamStore, stream: &str) -> Vec<String> {
        store
            .groups(stream)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect()
    }

    #[tokio::test]
    async fn test_run_pass_keeps_own_streams_and_groups() {
        let (_container, store) = start_redis().await;
        let layout = StreamLayout::new("pass", "me");
        for kind in StreamKind::ALL {
            store
                .create_group(&layout.stream(kind), &layout.group(kind), "0")
                .await
                .unwrap();
        }

        let worker = worker(store.clone(), layout.clone(), 100);
        worker.run_pass().await;

        for kind in StreamKind::ALL {
            assert!(store.exists(&layout.stream(kind)).await.unwrap());
            assert!(
                group_names(&store, &layout.stream(kind))
                    .await
                    .contains(&layout.group(kind)),
                "a pass over healthy streams must not touch their groups"
            );
        }
    }

    #[tokio::test]
    async fn test_prune_removes_only_consumers_idle_beyond_ttl() {
        let (_container, store) = start_redis().await;
        let layout = StreamLayout::new("prune", "me");
        let stream = layout.anycast_stream();
        let group = layout.shared_group();
        store.create_group(&stream, &group, "0").await.unwrap();

        // A read registers the consumer and resets its idle clock.
        store.read_group(&stream, &group, "gone", 1, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        store.read_group(&stream, &group, "me", 1, 1).await.unwrap();

        let worker = worker(store.clone(), layout, 1);
        worker.prune_idle_consumers(&stream, &group).await;

        let names: Vec<String> = store
            .consumers(&stream, &group)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["me".to_string()]);
    }

    #[tokio::test]
    async fn test_gc_destroys_broadcast_groups_of_dead_instances() {
        let (_container, store) = start_redis().await;
        let mine = StreamLayout::new("gc", "me");
        let live = StreamLayout::new("gc", "livepeer");
        let dead = StreamLayout::new("gc", "deadpeer");
        let broadcast = mine.broadcast_stream();

        store
            .create_group(&broadcast, &mine.instance_group(), "0")
            .await
            .unwrap();
        store
            .create_group(&broadcast, &live.instance_group(), "0")
            .await
            .unwrap();
        store
            .create_group(&live.unicast_stream(), &live.instance_group(), "0")
            .await
            .unwrap();
        // The dead peer left its broadcast group behind; its witness stream
        // is gone.
        store
            .create_group(&broadcast, &dead.instance_group(), "0")
            .await
            .unwrap();

        let worker = worker(store.clone(), mine.clone(), 1);
        worker.collect_dead_broadcast_groups().await;

        let names = group_names(&store, &broadcast).await;
        assert!(names.contains(&mine.instance_group()));
        assert!(names.contains(&live.instance_group()));
        assert!(
            !names.contains(&dead.instance_group()),
            "the group without a witness must be destroyed"
        );
    }

    #[tokio::test]
    async fn test_gc_spares_peer_whose_witness_appears_during_grace() {
        let (_container, store) = start_redis().await;
        let mine = StreamLayout::new("gc2", "me");
        let late = StreamLayout::new("gc2", "latepeer");
        let broadcast = mine.broadcast_stream();

        store
            .create_group(&broadcast, &mine.instance_group(), "0")
            .await
            .unwrap();
        store
            .create_group(&broadcast, &late.instance_group(), "0")
            .await
            .unwrap();

        // The peer finishes its startup while the grace period runs.
        let racing_store = store.clone();
        let witness_stream = late.unicast_stream();
        let witness_group = late.instance_group();
        let racer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            racing_store
                .create_group(&witness_stream, &witness_group, "0")
                .await
                .unwrap();
        });

        let worker = worker(store.clone(), mine, 1);
        worker.collect_dead_broadcast_groups().await;
        racer.await.unwrap();

        assert!(
            group_names(&store, &broadcast)
                .await
                .contains(&late.instance_group()),
            "a witness that appears before the second probe spares the group"
        );
    }
}
