//! Fixed-interval publisher attached to a running connection.

use std::time::Duration;

use mqttgate_core::PeriodicPublish;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a spawned periodic publish task.
pub struct PeriodicPublisher {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<u64>,
}

impl PeriodicPublisher {
    /// Start publishing `job.message` to `job.topic` every `job.period_secs`.
    ///
    /// The first message goes out immediately. The task ends on its own if
    /// the client's request channel closes.
    pub fn spawn(instance: String, client: AsyncClient, job: PeriodicPublish, qos: QoS, retain: bool) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = Duration::from_secs(job.period_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent = 0u64;
            tracing::info!(instance = %instance, topic = %job.topic, period_secs = period.as_secs(), "Periodic publishing started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match client.publish(job.topic.as_str(), qos, retain, job.message.clone().into_bytes()).await {
                            Ok(()) => sent += 1,
                            Err(e) => {
                                tracing::warn!(instance = %instance, topic = %job.topic, "Periodic publish failed, stopping: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            tracing::info!(instance = %instance, sent, "Periodic publishing stopped");
            sent
        });

        Self { stop_tx, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to exit. Returns the number of
    /// messages it published.
    pub async fn stop(self) -> u64 {
        let _ = self.stop_tx.send(());
        self.handle.await.unwrap_or(0)
    }
}
