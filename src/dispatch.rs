//! Task dispatch and reply correlation.
//!
//! Every outstanding task is a one-shot waiter keyed by its task id in a
//! single map; a reply from the session layer and the task's timeout race
//! to delete-then-resolve that entry, so a caller resolves exactly once and
//! anything arriving later is dropped as a late reply.

use crate::session::ProbeRegistry;
use crate::status::{Protocol, TaskFrame, TaskKind, TaskResult};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a probe gets to answer a task before the dispatcher synthesizes
/// a timeout result. Independent of the per-codec socket timeouts the probe
/// applies on its end.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Clone, Default)]
pub struct Dispatcher {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<TaskResult>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<TaskResult>>> {
        self.waiters.lock().expect("waiter map lock poisoned")
    }

    /// Send one ping task to one probe and wait for its result, a timeout,
    /// or a synthesized dispatch failure. Never returns an `Err`; every
    /// failure mode is folded into the [`TaskResult`].
    pub async fn send_task(
        &self,
        registry: &ProbeRegistry,
        probe_id: &str,
        target: &str,
        port: u16,
        protocol: Protocol,
        timeout: Duration,
    ) -> TaskResult {
        let Some(outbound) = registry.outbound(probe_id) else {
            return TaskResult::failure("", format!("Probe {probe_id} not found"));
        };

        let id = Uuid::new_v4().to_string();
        let frame = TaskFrame {
            id: id.clone(),
            kind: TaskKind::Ping,
            target: target.to_owned(),
            port,
            protocol,
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(error) => return TaskResult::failure(id, format!("Task encoding failed: {error}")),
        };

        let (waiter_tx, mut waiter_rx) = oneshot::channel();
        self.locked().insert(id.clone(), waiter_tx);
        debug!("task {id} -> probe {probe_id} ({target}:{port} {protocol})");

        if outbound.send(payload).is_err() {
            self.locked().remove(&id);
            return TaskResult::failure(id, format!("Probe {probe_id} disconnected"));
        }

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            reply = &mut waiter_rx => match reply {
                Ok(result) => result,
                // waiter dropped without a send; treat like a timeout
                Err(_) => TaskResult::timeout(id),
            },
            _ = &mut sleep => {
                if self.locked().remove(&id).is_some() {
                    debug!("task {id} timed out after {timeout:?}");
                    TaskResult::timeout(id)
                } else {
                    // the reply won the map race as the timer fired
                    waiter_rx.try_recv().unwrap_or_else(|_| TaskResult::timeout(id))
                }
            }
        }
    }

    /// Hand a probe's reply to whoever is waiting on its task id. Replies
    /// with no pending waiter are late and dropped.
    pub fn complete(&self, result: TaskResult) {
        match self.locked().remove(&result.id) {
            Some(waiter) => {
                if waiter.send(result).is_err() {
                    debug!("task waiter hung up before its reply landed");
                }
            }
            None => debug!("dropping late reply for task {}", result.id),
        }
    }

    /// Fan one task out to every connected probe and collect all results,
    /// keyed by probe id. Per-probe failures and timeouts land in the map
    /// like any other result; nothing short-circuits.
    pub async fn broadcast(
        &self,
        registry: &ProbeRegistry,
        target: &str,
        port: u16,
        protocol: Protocol,
    ) -> HashMap<String, TaskResult> {
        let probes = registry.probe_ids();
        if probes.is_empty() {
            warn!("broadcast requested with no probes connected");
            return HashMap::new();
        }
        let tasks = probes.into_iter().map(|probe_id| async move {
            let result = self
                .send_task(registry, &probe_id, target, port, protocol, TASK_TIMEOUT)
                .await;
            (probe_id, result)
        });
        join_all(tasks).await.into_iter().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.locked().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ServerStatus;
    use tokio::sync::mpsc;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_env_filter("lodestone=trace")
            .try_init()
            .ok();
    }

    /// Register a fake probe and return the receiving end of its channel.
    fn fake_probe(registry: &ProbeRegistry, id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = oneshot::channel();
        registry.register(id, "test-region", tx, shutdown);
        rx
    }

    fn frame_id(frame_json: &str) -> String {
        let frame: TaskFrame = serde_json::from_str(frame_json).unwrap();
        frame.id
    }

    #[tokio::test]
    async fn unknown_probe_fails_without_waiting() {
        let dispatcher = Dispatcher::new();
        let registry = ProbeRegistry::new();
        let result = dispatcher
            .send_task(&registry, "ghost", "mc.example.com", 25565, Protocol::Java, TASK_TIMEOUT)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Probe ghost not found"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_correlates_by_task_id() {
        let dispatcher = Dispatcher::new();
        let registry = ProbeRegistry::new();
        let mut probe_rx = fake_probe(&registry, "p1");

        let send = dispatcher.send_task(
            &registry,
            "p1",
            "mc.example.com",
            25565,
            Protocol::Java,
            TASK_TIMEOUT,
        );
        let reply = async {
            let frame = probe_rx.recv().await.unwrap();
            let id = frame_id(&frame);
            dispatcher.complete(TaskResult {
                id,
                success: true,
                data: Some(ServerStatus {
                    online: true,
                    ..Default::default()
                }),
                error: None,
            });
        };
        let (result, ()) = tokio::join!(send, reply);
        assert!(result.success);
        assert!(result.data.unwrap().online);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_synthesizes_a_timeout() {
        let dispatcher = Dispatcher::new();
        let registry = ProbeRegistry::new();
        let mut probe_rx = fake_probe(&registry, "p1");

        let result = dispatcher
            .send_task(
                &registry,
                "p1",
                "mc.example.com",
                25565,
                Protocol::Java,
                Duration::from_millis(50),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Task timeout"));
        assert_eq!(dispatcher.pending_count(), 0);

        // the task frame did go out; a late reply for it is dropped quietly
        let frame = probe_rx.recv().await.unwrap();
        dispatcher.complete(TaskResult::failure(frame_id(&frame), "late"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn replies_for_unknown_ids_are_dropped() {
        let dispatcher = Dispatcher::new();
        dispatcher.complete(TaskResult::failure("never-issued", "whatever"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_returns_one_entry_per_probe() {
        let dispatcher = Dispatcher::new();
        let registry = ProbeRegistry::new();
        let mut rx1 = fake_probe(&registry, "p1");
        let _rx2 = fake_probe(&registry, "p2"); // p2 never answers

        let broadcast = dispatcher.broadcast(&registry, "mc.example.com", 25565, Protocol::Java);
        let answer = async {
            let frame = rx1.recv().await.unwrap();
            dispatcher.complete(TaskResult {
                id: frame_id(&frame),
                success: true,
                data: Some(ServerStatus {
                    online: true,
                    ..Default::default()
                }),
                error: None,
            });
        };
        let (results, ()) = tokio::join!(broadcast, answer);

        assert_eq!(results.len(), 2);
        assert!(results["p1"].success);
        assert!(!results["p2"].success);
        assert_eq!(results["p2"].error.as_deref(), Some("Task timeout"));
    }

    #[tokio::test]
    async fn empty_registry_broadcasts_to_nobody() {
        let dispatcher = Dispatcher::new();
        let registry = ProbeRegistry::new();
        let results = dispatcher
            .broadcast(&registry, "mc.example.com", 25565, Protocol::Java)
            .await;
        assert!(results.is_empty());
    }
}
