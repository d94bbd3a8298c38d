//! Poll scheduler
//!
//! Owns the transport and drives it through
//! `Disconnected → Discovering → Polling → Disconnected`. Any timeout or
//! connection error while polling throws away the inventory and the groups;
//! the next connection starts over with discovery.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{derive_groups, Cadences, PollEntry, PollGroup};
use crate::counters::Counters;
use crate::discovery::{DiscoveryEngine, DiscoveryError, Inventory};
use crate::dispatcher::SinkDispatcher;
use crate::store::Reading;
use crate::transport::{ReconnectHelper, ReconnectPolicy, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disconnected,
    Discovering,
    Polling,
    /// Terminal, reached only through cancellation
    Stopped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerState::Disconnected => "disconnected",
            SchedulerState::Discovering => "discovering",
            SchedulerState::Polling => "polling",
            SchedulerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub request_timeout: Duration,
    pub cadences: Cadences,
    /// Backoff for connection attempts and discovery queries
    pub reconnect: ReconnectPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            cadences: Cadences::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Why polling stopped
enum PollExit {
    Cancelled,
    Disconnected(TransportError),
}

/// A group plus the earliest time it may run again
struct Slot {
    group: PollGroup,
    next_due: Instant,
}

pub struct PollScheduler<T: Transport> {
    transport: T,
    config: SchedulerConfig,
    dispatcher: SinkDispatcher,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    state: watch::Sender<SchedulerState>,
}

impl<T: Transport> PollScheduler<T> {
    pub fn new(
        transport: T,
        config: SchedulerConfig,
        dispatcher: SinkDispatcher,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Disconnected);
        Self {
            transport,
            config,
            dispatcher,
            counters,
            cancel,
            state,
        }
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Scheduler: {} -> {}", previous.as_str(), state.as_str());
        }
    }

    /// Run until cancelled
    pub async fn run(mut self) {
        info!("Scheduler started for {}", self.transport.endpoint());
        let mut backoff = ReconnectHelper::new(self.config.reconnect.clone());

        loop {
            self.set_state(SchedulerState::Disconnected);
            self.counters.set_device_up(false);
            self.dispatcher.reset();

            if backoff.wait_before_attempt(&self.cancel).await.is_err() {
                break;
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect() => result,
            };
            if let Err(e) = connected {
                backoff.record_failure(&e.to_string());
                continue;
            }
            self.counters.set_device_up(true);

            self.set_state(SchedulerState::Discovering);
            let inventory = match self.discover().await {
                Ok(inventory) => inventory,
                Err(DiscoveryError::Cancelled) => break,
                Err(DiscoveryError::Disconnected(e)) => {
                    warn!("Connection lost during discovery: {}", e);
                    backoff.record_failure(&e.to_string());
                    self.transport.close().await;
                    continue;
                },
            };
            // Backoff only resets once the device proved responsive
            backoff.mark_connected();

            let groups = derive_groups(&inventory, &self.config.cadences);
            info!(
                "Polling {} identifiers in {} groups for {}",
                groups.iter().map(PollGroup::len).sum::<usize>(),
                groups.len(),
                inventory.name
            );

            self.set_state(SchedulerState::Polling);
            match self.poll(groups).await {
                PollExit::Cancelled => break,
                PollExit::Disconnected(e) => {
                    warn!("Polling aborted: {}", e);
                    self.transport.close().await;
                },
            }
        }

        self.transport.close().await;
        self.counters.set_device_up(false);
        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    async fn discover(&mut self) -> Result<Inventory, DiscoveryError> {
        DiscoveryEngine::new(
            &mut self.transport,
            Arc::clone(&self.counters),
            self.config.request_timeout,
            self.config.reconnect.clone(),
            self.cancel.clone(),
        )
        .run()
        .await
    }

    async fn poll(&mut self, groups: Vec<PollGroup>) -> PollExit {
        if groups.is_empty() {
            // Nothing to poll; idle until shutdown
            self.cancel.cancelled().await;
            return PollExit::Cancelled;
        }

        let now = Instant::now();
        let mut slots: Vec<Slot> = groups
            .into_iter()
            .map(|group| Slot {
                group,
                next_due: now,
            })
            .collect();

        loop {
            let now = Instant::now();
            let due = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.next_due <= now)
                .min_by_key(|(_, slot)| (slot.group.tier.priority(), slot.next_due))
                .map(|(index, _)| index);

            match due {
                Some(index) => {
                    let slot = &mut slots[index];
                    if let Err(exit) = self.poll_group(&slot.group).await {
                        return exit;
                    }
                    slot.next_due = Instant::now() + slot.group.cadence;
                },
                None => {
                    let Some(next) = slots.iter().map(|slot| slot.next_due).min() else {
                        return PollExit::Cancelled;
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => return PollExit::Cancelled,
                        _ = tokio::time::sleep_until(next) => {},
                    }
                },
            }
        }
    }

    /// One round over a group, sequentially
    async fn poll_group(&mut self, group: &PollGroup) -> Result<(), PollExit> {
        debug!("Polling {} group ({} identifiers)", group.tier.as_str(), group.len());
        let mut skipped = 0usize;

        for entry in &group.entries {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PollExit::Cancelled),
                result = self.transport.request(entry.oid, self.config.request_timeout) => result,
            };

            match result {
                Ok(frame) => match frame.value(entry.kind) {
                    Ok(value) => {
                        self.dispatcher.dispatch(reading(entry, value));
                    },
                    Err(e) => {
                        self.counters.record_decode_error(e.kind);
                        debug!(oid = %common::hex::oid(entry.oid), "Skipping: {}", e);
                        skipped += 1;
                    },
                },
                Err(TransportError::Decode(e)) => {
                    debug!(oid = %common::hex::oid(entry.oid), "Skipping: {}", e);
                    skipped += 1;
                },
                Err(e) => return Err(PollExit::Disconnected(e)),
            }
        }

        if skipped > 0 {
            debug!("{} group round done, {} skipped", group.tier.as_str(), skipped);
        }
        Ok(())
    }
}

fn reading(entry: &PollEntry, value: crate::protocol::Value) -> Reading {
    Reading {
        oid: entry.oid,
        metric: entry.metric,
        labels: entry.labels.clone(),
        value,
        observed_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::catalog::objects::{DEVICE_NAME, GENERATOR_A_ENABLED};
    use crate::catalog::Tier;
    use crate::protocol::{DecodeErrorKind, Value};
    use crate::store::{LabelSet, MetricStore};
    use crate::transport::{MockReply, MockTransport};
    use tokio::task::JoinHandle;

    // Inverter state, first identifier of the fast group
    const FAST_OID: u32 = 0x5F33284E;
    // Core temperature, slow group
    const SLOW_OID: u32 = 0xC24E85D0;

    struct Harness {
        device: MockTransport,
        store: Arc<MetricStore>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
        state: watch::Receiver<SchedulerState>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(device: MockTransport) -> Self {
            let store = Arc::new(MetricStore::new());
            let counters = Arc::new(Counters::new().unwrap());
            let cancel = CancellationToken::new();
            let config = SchedulerConfig {
                request_timeout: Duration::from_secs(2),
                cadences: Cadences::default(),
                reconnect: ReconnectPolicy {
                    initial_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(10),
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
            };
            let scheduler = PollScheduler::new(
                device.clone(),
                config,
                SinkDispatcher::new(Arc::clone(&store)),
                Arc::clone(&counters),
                cancel.clone(),
            );
            let state = scheduler.subscribe();
            let task = tokio::spawn(scheduler.run());
            Self {
                device,
                store,
                counters,
                cancel,
                state,
                task,
            }
        }

        async fn stop(&mut self) {
            self.cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), &mut self.task)
                .await
                .unwrap()
                .unwrap();
        }

        fn state(&self) -> SchedulerState {
            *self.state.borrow()
        }

        /// Index of the first poll request, i.e. the number of discovery queries before it
        fn first_poll(&self) -> usize {
            self.device
                .requests()
                .iter()
                .position(|oid| *oid == FAST_OID)
                .unwrap()
        }
    }

    fn garage() -> MockTransport {
        let device = MockTransport::new();
        device.set_value(DEVICE_NAME, Value::Str("Garage".to_string()));
        device.set_value(GENERATOR_A_ENABLED, Value::Bool(true));
        device
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_power_reaches_store() {
        let device = garage();
        device.set_value(0xAA9AA253, Value::Float(2.5));
        let mut harness = Harness::start(device);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.state(), SchedulerState::Polling);

        let labels = LabelSet::from_pairs([("generator", "a"), ("inverter", "Garage")]);
        let reading = harness.store.get(0xAA9AA253, &labels).unwrap();
        assert_eq!(reading.value, Value::Float(2.5));
        assert_eq!(reading.metric, "rctmon_generator_power_watt");
        assert!(harness.counters.is_device_up());

        harness.stop().await;
        assert_eq!(harness.state(), SchedulerState::Stopped);
        assert!(!harness.counters.is_device_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_group_runs_before_slow_group() {
        let mut harness = Harness::start(garage());
        tokio::time::sleep(Duration::from_secs(1)).await;
        harness.stop().await;

        let inventory = Inventory {
            name: "Garage".to_string(),
            generator_a: true,
            ..Inventory::default()
        };
        let groups = derive_groups(&inventory, &Cadences::default());
        assert_eq!(groups[0].tier, Tier::Fast);
        let expected: Vec<u32> = groups
            .iter()
            .flat_map(|g| g.entries.iter().map(|e| e.oid))
            .collect();

        let requests = harness.device.requests();
        let start = harness.first_poll();
        assert_eq!(&requests[start..start + expected.len()], expected.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_repeat_at_their_cadence() {
        let mut harness = Harness::start(garage());
        tokio::time::sleep(Duration::from_secs(65)).await;
        harness.stop().await;

        let requests = harness.device.requests();
        let count = |oid: u32| requests.iter().filter(|r| **r == oid).count();
        assert!(count(FAST_OID) >= 6, "fast polled {} times", count(FAST_OID));
        assert_eq!(count(SLOW_OID), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_error_skips_identifier_only() {
        let device = garage();
        device.push_reply(FAST_OID, MockReply::Raw(Vec::new()));
        device.push_reply(0xAA9AA253, MockReply::Decode(DecodeErrorKind::Crc));
        let mut harness = Harness::start(device);

        tokio::time::sleep(Duration::from_secs(1)).await;
        harness.stop().await;

        assert_eq!(harness.device.connect_count(), 1);
        assert_eq!(
            harness.counters.decode_error_count(DecodeErrorKind::Payload),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_of_round_lands_after_skip() {
        let device = garage();
        device.push_reply(FAST_OID, MockReply::Raw(Vec::new()));
        let mut harness = Harness::start(device);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let labels = LabelSet::from_pairs([("inverter", "Garage"), ("sensor", "core")]);
        assert!(harness.store.get(SLOW_OID, &labels).is_some());
        assert!(harness
            .store
            .get(FAST_OID, &LabelSet::from_pairs([("inverter", "Garage")]))
            .is_none());
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_restarts_discovery() {
        let device = garage();
        device.push_reply(FAST_OID, MockReply::ConnectionLost);
        let mut harness = Harness::start(device);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.state(), SchedulerState::Polling);
        harness.stop().await;

        let requests = harness.device.requests();
        let lost_at = harness.first_poll();
        assert_eq!(requests[lost_at + 1], DEVICE_NAME);
        assert_eq!(harness.device.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_cleared_while_disconnected() {
        let mut harness = Harness::start(garage());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!harness.store.is_empty());

        // Device goes away for good
        harness.device.fail_next_connects(u32::MAX);
        harness.device.push_reply(FAST_OID, MockReply::ConnectionLost);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(harness.state(), SchedulerState::Disconnected);
        assert!(harness.store.is_empty());
        assert!(!harness.counters.is_device_up());
        harness.stop().await;
        assert_eq!(harness.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_hanging_request() {
        let device = garage();
        device.push_reply(FAST_OID, MockReply::Hang);
        let mut harness = Harness::start(device);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.state(), SchedulerState::Polling);
        harness.stop().await;
        assert_eq!(harness.state(), SchedulerState::Stopped);
        assert!(!harness.device.is_connected());
    }
}
