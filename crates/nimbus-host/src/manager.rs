//! Channel manager: worker channels grouped by runtime.
//!
//! The manager exclusively owns [`WorkerChannel`]s. Lookups hand out cheap
//! clones, but only the manager adds, removes and disposes them.

use std::collections::HashMap;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::channel::WorkerChannel;
use crate::error::{HostError, InvocationError, Result};
use crate::pair::WorkerId;

#[derive(Debug, Default)]
struct RuntimePool {
    channels: Vec<WorkerChannel>,
    next: usize,
}

/// Result of specialising a placeholder host for one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecializeOutcome {
    /// The pre-warmed channel accepted the new environment.
    Specialized { worker_id: WorkerId },
    /// No usable channel remains; the host must start a new worker.
    Respawn {
        /// The channel that failed to reload, if there was one.
        failed: Option<WorkerId>,
        reason: String,
    },
}

/// Specialisation result plus the standby channels that were shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specialization {
    pub outcome: SpecializeOutcome,
    /// Channels of other runtimes disposed during specialisation.
    pub stopped: Vec<WorkerId>,
}

/// Map of runtime to its pool of worker channels.
#[derive(Debug, Default)]
pub struct ChannelManager {
    pools: RwLock<HashMap<String, RuntimePool>>,
}

fn key(runtime: &str) -> String {
    runtime.to_ascii_lowercase()
}

impl ChannelManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a channel to its runtime's pool.
    pub fn add_channel(&self, channel: WorkerChannel) {
        debug!(worker_id = %channel.worker_id(), runtime = %channel.runtime(), "Channel added");
        self.pools
            .write()
            .entry(key(channel.runtime()))
            .or_default()
            .channels
            .push(channel);
    }

    /// Removes a channel without disposing it.
    pub fn remove_channel(&self, runtime: &str, worker_id: &WorkerId) -> Option<WorkerChannel> {
        let mut pools = self.pools.write();
        let pool = pools.get_mut(&key(runtime))?;
        let index = pool
            .channels
            .iter()
            .position(|c| c.worker_id() == worker_id)?;
        let channel = pool.channels.remove(index);
        if pool.channels.is_empty() {
            pools.remove(&key(runtime));
        }
        Some(channel)
    }

    /// Finds a channel by worker id across all runtimes.
    #[must_use]
    pub fn find_by_worker(&self, worker_id: &WorkerId) -> Option<WorkerChannel> {
        self.pools
            .read()
            .values()
            .flat_map(|pool| pool.channels.iter())
            .find(|c| c.worker_id() == worker_id)
            .cloned()
    }

    /// Channels for a runtime, in insertion order.
    #[must_use]
    pub fn channels(&self, runtime: &str) -> Vec<WorkerChannel> {
        self.pools
            .read()
            .get(&key(runtime))
            .map(|pool| pool.channels.clone())
            .unwrap_or_default()
    }

    /// Every managed channel.
    #[must_use]
    pub fn all_channels(&self) -> Vec<WorkerChannel> {
        self.pools
            .read()
            .values()
            .flat_map(|pool| pool.channels.iter().cloned())
            .collect()
    }

    /// Runtimes with at least one channel, sorted.
    #[must_use]
    pub fn runtimes(&self) -> Vec<String> {
        let mut runtimes: Vec<_> = self.pools.read().keys().cloned().collect();
        runtimes.sort();
        runtimes
    }

    /// Picks the next Ready channel for a runtime, round-robin.
    pub fn get_ready_channel(&self, runtime: &str) -> Result<WorkerChannel> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(&key(runtime))
            .ok_or_else(|| HostError::NoReadyChannel(runtime.to_owned()))?;

        let count = pool.channels.len();
        for offset in 0..count {
            let index = (pool.next + offset) % count;
            if pool.channels[index].is_ready() {
                pool.next = (index + 1) % count;
                return Ok(pool.channels[index].clone());
            }
        }
        Err(HostError::NoReadyChannel(runtime.to_owned()))
    }

    /// Broadcasts an environment reload to every channel.
    pub async fn reload_environment(
        &self,
        environment: &HashMap<String, String>,
        function_app_directory: &str,
    ) -> Vec<(WorkerId, Result<()>)> {
        let channels = self.all_channels();
        let reloads = channels.iter().map(|channel| async move {
            let result = channel
                .reload_environment(environment.clone(), function_app_directory)
                .await;
            if let Err(e) = &result {
                warn!(worker_id = %channel.worker_id(), error = %e, "Environment reload failed");
            }
            (channel.worker_id().clone(), result)
        });
        join_all(reloads).await
    }

    /// Specialises the pre-warmed channel for `runtime`.
    ///
    /// Standby channels for every other runtime are shut down. If the
    /// runtime's channel cannot take the new environment it is disposed and
    /// the outcome asks the caller to respawn.
    pub async fn specialize(
        &self,
        runtime: &str,
        environment: HashMap<String, String>,
        function_app_directory: &str,
    ) -> Specialization {
        let mut stopped = Vec::new();
        for other in self.runtimes() {
            if other == key(runtime) {
                continue;
            }
            for channel in self.channels(&other) {
                self.shutdown_channel(&other, channel.worker_id(), None);
                stopped.push(channel.worker_id().clone());
            }
        }

        let Some(channel) = self
            .channels(runtime)
            .into_iter()
            .find(|c| !c.state().is_terminal())
        else {
            warn!(runtime, "No pre-warmed channel to specialise");
            return Specialization {
                outcome: SpecializeOutcome::Respawn {
                    failed: None,
                    reason: format!("no pre-warmed channel for runtime {runtime}"),
                },
                stopped,
            };
        };

        let outcome = match channel
            .reload_environment(environment, function_app_directory)
            .await
        {
            Ok(()) => {
                info!(runtime, worker_id = %channel.worker_id(), "Placeholder specialised");
                SpecializeOutcome::Specialized {
                    worker_id: channel.worker_id().clone(),
                }
            }
            Err(e) => {
                warn!(runtime, worker_id = %channel.worker_id(), error = %e, "Specialisation failed, worker will be replaced");
                self.shutdown_channel(runtime, channel.worker_id(), None);
                SpecializeOutcome::Respawn {
                    failed: Some(channel.worker_id().clone()),
                    reason: e.to_string(),
                }
            }
        };

        Specialization { outcome, stopped }
    }

    /// Removes and disposes a channel, failing its invocations with `error`
    /// first when given.
    pub fn shutdown_channel(
        &self,
        runtime: &str,
        worker_id: &WorkerId,
        error: Option<&InvocationError>,
    ) -> Option<WorkerChannel> {
        let channel = self.remove_channel(runtime, worker_id)?;
        if let Some(error) = error {
            channel.fail_invocations(error);
        }
        channel.dispose();
        Some(channel)
    }

    /// Disposes every channel. Returns the disposed worker ids.
    pub fn shutdown_all(&self) -> Vec<WorkerId> {
        let pools = std::mem::take(&mut *self.pools.write());
        let mut disposed = Vec::new();
        for channel in pools.into_values().flat_map(|pool| pool.channels) {
            channel.dispose();
            disposed.push(channel.worker_id().clone());
        }
        info!(count = disposed.len(), "All worker channels shut down");
        disposed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::channel::{ChannelOptions, ChannelState};
    use crate::pair::{AttachedPair, ChannelPairRegistry, InboundMessage};
    use nimbus_proto::rpc::{
        FunctionEnvironmentReloadResponse, StatusResult, WorkerInitResponse,
    };
    use nimbus_proto::{Content, StreamingMessage};
    use std::sync::Arc;

    /// Answers init and reload requests; reloads fail when `fail_reload`.
    fn auto_worker(mut attached: AttachedPair, fail_reload: bool) {
        tokio::spawn(async move {
            while let Some(frame) = attached.outbound.recv().await {
                let reply = match frame.content {
                    Some(Content::WorkerInitRequest(_)) => {
                        Content::WorkerInitResponse(WorkerInitResponse {
                            result: Some(StatusResult::success()),
                            ..Default::default()
                        })
                    }
                    Some(Content::FunctionEnvironmentReloadRequest(_)) => {
                        let result = if fail_reload {
                            StatusResult::failure("bad environment")
                        } else {
                            StatusResult::success()
                        };
                        Content::FunctionEnvironmentReloadResponse(
                            FunctionEnvironmentReloadResponse {
                                result: Some(result),
                                ..Default::default()
                            },
                        )
                    }
                    _ => continue,
                };
                let _ = attached.inbound.send(InboundMessage {
                    worker_id: attached.worker_id.clone(),
                    message: StreamingMessage::new(reply),
                });
            }
        });
    }

    async fn ready_channel(
        registry: &Arc<ChannelPairRegistry>,
        id: &str,
        runtime: &str,
        fail_reload: bool,
    ) -> WorkerChannel {
        let worker_id = WorkerId::from(id);
        let pair = registry.register(worker_id.clone()).unwrap();
        let channel = WorkerChannel::new(
            pair,
            runtime,
            ChannelOptions::default(),
            EventBus::new(),
            registry.clone(),
        );
        auto_worker(registry.attach(&worker_id).unwrap(), fail_reload);
        channel.initialize().await.unwrap();
        channel.load_functions(Vec::new()).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn ready_channels_are_picked_round_robin() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        for id in ["a", "b", "c"] {
            manager.add_channel(ready_channel(&registry, id, "node", false).await);
        }
        manager
            .find_by_worker(&WorkerId::from("b"))
            .unwrap()
            .mark_restarting(&InvocationError::Cancelled);

        let picked: Vec<String> = (0..4)
            .map(|_| manager.get_ready_channel("node").unwrap().worker_id().to_string())
            .collect();
        assert_eq!(picked, vec!["a", "c", "a", "c"]);
    }

    #[tokio::test]
    async fn missing_runtime_has_no_ready_channel() {
        let manager = ChannelManager::new();
        let err = manager.get_ready_channel("python").unwrap_err();
        assert_eq!(err.to_string(), "no ready channel for runtime python");
    }

    #[tokio::test]
    async fn shutdown_channel_removes_and_disposes() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        manager.add_channel(ready_channel(&registry, "a", "node", false).await);

        let channel = manager
            .shutdown_channel("NODE", &WorkerId::from("a"), None)
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(manager.runtimes().is_empty());
        assert!(manager.find_by_worker(&WorkerId::from("a")).is_none());
    }

    #[tokio::test]
    async fn reload_is_broadcast_to_every_channel() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        manager.add_channel(ready_channel(&registry, "a", "node", false).await);
        manager.add_channel(ready_channel(&registry, "b", "python", true).await);

        let mut results = manager
            .reload_environment(&HashMap::from([("K".to_owned(), "V".to_owned())]), "/app")
            .await;
        results.sort_by(|x, y| x.0.cmp(&y.0));

        assert!(results[0].1.is_ok());
        assert!(matches!(
            results[1].1,
            Err(HostError::EnvironmentReloadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn specialize_keeps_target_and_stops_standbys() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        manager.add_channel(ready_channel(&registry, "node-1", "node", false).await);
        manager.add_channel(ready_channel(&registry, "py-1", "python", false).await);

        let result = manager.specialize("node", HashMap::new(), "/app").await;

        assert_eq!(
            result.outcome,
            SpecializeOutcome::Specialized {
                worker_id: WorkerId::from("node-1")
            }
        );
        assert_eq!(result.stopped, vec![WorkerId::from("py-1")]);
        assert_eq!(manager.runtimes(), vec!["node"]);
    }

    #[tokio::test]
    async fn failed_specialization_asks_for_respawn() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        manager.add_channel(ready_channel(&registry, "node-1", "node", true).await);

        let result = manager.specialize("node", HashMap::new(), "/app").await;

        assert!(matches!(
            result.outcome,
            SpecializeOutcome::Respawn { failed: Some(ref id), .. } if id.as_str() == "node-1"
        ));
        assert!(manager.channels("node").is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_disposes_everything() {
        let registry = Arc::new(ChannelPairRegistry::new());
        let manager = ChannelManager::new();
        manager.add_channel(ready_channel(&registry, "a", "node", false).await);
        manager.add_channel(ready_channel(&registry, "b", "python", false).await);

        let mut disposed = manager.shutdown_all();
        disposed.sort();
        assert_eq!(disposed, vec![WorkerId::from("a"), WorkerId::from("b")]);
        assert!(registry.is_empty());
    }
}
