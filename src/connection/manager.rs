//! Push channel lifecycle.
//!
//! One driver task per connect request owns the socket. It reconnects with
//! exponential backoff until the attempt ceiling, then parks in `Failed`
//! until [`ConnectionManager::reconnect`] or a new session.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::storage::CredentialStore;
use crate::config::ChannelConfig;
use crate::connection::protocol::{ControlMessage, InboundMessage, Topic};
use crate::connection::state::{Backoff, ConnectionSnapshot, ConnectionState};
use crate::connection::transport::{
    ChannelHandle, InboundFrame, OutboundFrame, Transport, NORMAL_CLOSURE,
};
use crate::error::{
    channel_busy, channel_closed, channel_send_failed, config_invalid, heartbeat_timeout,
    not_authenticated, CoreError, CoreResult,
};
use crate::events::{CoreEvent, EventBus, EventKind};

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub reconnects: u64,
    pub heartbeats_sent: u64,
}

/// How a connected period ended
enum ChannelEnd {
    /// Closed with the normal-closure code; no retry
    Normal,
    /// Cancelled by `disconnect()`; state is set by the caller
    Cancelled,
    /// Anything else; retried with backoff
    Lost(CoreError),
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ChannelConfig,
    backoff: Backoff,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    events: EventBus,
    snapshot: RwLock<ConnectionSnapshot>,
    /// Also serializes subscription replay against `subscribe`/`unsubscribe`
    topics: RwLock<BTreeSet<Topic>>,
    /// Writer of the live channel, present only while `Connected`
    outbound: RwLock<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    driver: Mutex<Option<Driver>>,
    stats: RwLock<ConnectionStats>,
}

/// Owns the push channel: state machine, subscriptions, heartbeat, dispatch
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        events: EventBus,
    ) -> Self {
        let backoff = Backoff::from(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                backoff,
                transport,
                store,
                events,
                snapshot: RwLock::new(ConnectionSnapshot::default()),
                topics: RwLock::new(BTreeSet::new()),
                outbound: RwLock::new(None),
                driver: Mutex::new(None),
                stats: RwLock::new(ConnectionStats::default()),
            }),
        }
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.snapshot.read().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.snapshot.read().await.state
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.stats.read().await.clone()
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.inner.topics.read().await.iter().cloned().collect()
    }

    /// Open the channel with the current access secret.
    ///
    /// Refused while another attempt is underway or the channel is up, and
    /// without a valid credential.
    pub async fn connect(&self) -> CoreResult<()> {
        let mut driver = self.inner.driver.lock().await;
        if self.inner.snapshot.read().await.is_busy() {
            debug!("Connect requested while busy, refusing");
            return Err(channel_busy());
        }
        self.start_driver_locked(&mut driver).await
    }

    /// Tear down whatever is running and connect again with a fresh attempt count
    pub async fn reconnect(&self) -> CoreResult<()> {
        let mut driver = self.inner.driver.lock().await;
        self.stop_driver_locked(&mut driver).await;
        self.start_driver_locked(&mut driver).await
    }

    /// Close the channel with the normal-closure code and stop retrying.
    ///
    /// The subscription set is kept so a later connect resubscribes.
    pub async fn disconnect(&self) {
        let mut driver = self.inner.driver.lock().await;
        let was_running = driver.is_some();
        self.stop_driver_locked(&mut driver).await;

        let current = self.inner.snapshot.read().await.state;
        if was_running || current != ConnectionState::Disconnected {
            self.transition(|s| {
                s.state = ConnectionState::Disconnected;
                s.attempt_count = 0;
                s.retry_in_ms = None;
            })
            .await;
            info!("Push channel disconnected");
        }
    }

    /// Add a topic; sent right away when connected, otherwise on the next connect.
    /// Returns false if the topic was already present.
    pub async fn subscribe(&self, topic: Topic) -> bool {
        let mut topics = self.inner.topics.write().await;
        if !topics.insert(topic.clone()) {
            debug!(%topic, "Already subscribed");
            return false;
        }
        debug!(%topic, "Subscribed");
        self.send_control(ControlMessage::Subscribe(topic)).await;
        true
    }

    /// Remove a topic; unsubscribing an absent topic is a no-op
    pub async fn unsubscribe(&self, topic: &Topic) -> bool {
        let mut topics = self.inner.topics.write().await;
        if !topics.remove(topic) {
            return false;
        }
        debug!(%topic, "Unsubscribed");
        self.send_control(ControlMessage::Unsubscribe(topic.clone())).await;
        true
    }

    pub async fn clear_subscriptions(&self) {
        let mut topics = self.inner.topics.write().await;
        if !topics.is_empty() {
            debug!(count = topics.len(), "Clearing subscriptions");
            topics.clear();
        }
    }

    /// React to session events: connect on start, disconnect and forget
    /// subscriptions on end
    pub fn spawn_session_listener(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut subscriber = self.inner.events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscriber
                .recv_kind(&[EventKind::SessionStarted, EventKind::SessionEnded])
                .await
            {
                match event {
                    CoreEvent::SessionStarted { .. } => {
                        if let Err(e) = manager.reconnect().await {
                            warn!(error = %e, "Could not connect after session start");
                        }
                    }
                    CoreEvent::SessionEnded { reason } => {
                        info!(%reason, "Session ended, closing push channel");
                        manager.disconnect().await;
                        manager.clear_subscriptions().await;
                    }
                    _ => {}
                }
            }
            debug!("Session listener stopped");
        })
    }

    async fn send_control(&self, message: ControlMessage) {
        let Some(outbound) = self.inner.outbound.read().await.clone() else {
            return;
        };
        match message.to_text() {
            Ok(text) => {
                if outbound.send(OutboundFrame::Text(text)).is_err() {
                    warn!("Channel went away before control message was sent");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode control message"),
        }
    }

    async fn start_driver_locked(&self, driver: &mut Option<Driver>) -> CoreResult<()> {
        match self.inner.store.credential().await {
            Some(credential) if credential.is_valid() => {}
            _ => {
                debug!("No valid credential, not connecting");
                return Err(not_authenticated());
            }
        }

        // Announce before spawning so a concurrent connect sees us as busy
        self.transition(|s| {
            s.state = ConnectionState::Connecting;
            s.attempt_count = 0;
            s.retry_in_ms = None;
        })
        .await;

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { manager.drive(token).await });
        *driver = Some(Driver { cancel, handle });
        Ok(())
    }

    async fn stop_driver_locked(&self, driver: &mut Option<Driver>) {
        if let Some(outbound) = self.inner.outbound.write().await.take() {
            let _ = outbound.send(OutboundFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "client disconnect".to_string(),
            });
        }
        if let Some(Driver { cancel, handle }) = driver.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Connection driver ended abnormally");
            }
        }
    }

    async fn drive(&self, cancel: CancellationToken) {
        let backoff = self.inner.backoff;
        let mut attempt: u32 = 0;
        let mut announce = false;

        loop {
            if announce {
                self.transition(|s| {
                    s.state = ConnectionState::Connecting;
                    s.retry_in_ms = None;
                })
                .await;
            }
            announce = true;

            let url = match self.channel_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "Cannot build channel URL, giving up");
                    self.transition(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.last_error = Some(e);
                        s.retry_in_ms = None;
                    })
                    .await;
                    return;
                }
            };

            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.inner.transport.open(&url) => opened,
            };

            let failure = match opened {
                Ok(handle) => {
                    attempt = 0;
                    match self.run_connected(handle, &cancel).await {
                        ChannelEnd::Cancelled => return,
                        ChannelEnd::Normal => {
                            info!("Push channel closed normally by the server");
                            self.transition(|s| {
                                s.state = ConnectionState::Disconnected;
                                s.attempt_count = 0;
                                s.retry_in_ms = None;
                            })
                            .await;
                            return;
                        }
                        ChannelEnd::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };
            warn!(attempt, error = %failure, "Push channel unavailable");

            if backoff.exhausted(attempt) {
                error!(attempts = attempt, "Reconnect ceiling reached, giving up");
                self.transition(|s| {
                    s.state = ConnectionState::Failed;
                    s.attempt_count = attempt;
                    s.last_error = Some(failure.clone());
                    s.retry_in_ms = None;
                })
                .await;
                self.publish(CoreEvent::ChannelError {
                    error: failure,
                    fatal: true,
                })
                .await;
                return;
            }

            let delay = backoff.delay(attempt);
            attempt += 1;
            self.inner.stats.write().await.reconnects += 1;
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.transition(|s| {
                s.state = ConnectionState::Reconnecting;
                s.attempt_count = attempt;
                s.last_error = Some(failure);
                s.retry_in_ms = Some(delay.as_millis() as u64);
            })
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_connected(&self, handle: ChannelHandle, cancel: &CancellationToken) -> ChannelEnd {
        let ChannelHandle {
            outbound,
            mut inbound,
        } = handle;

        // Resubscribe everything before the channel is announced or read from
        {
            let topics = self.inner.topics.write().await;
            for topic in topics.iter() {
                let text = match ControlMessage::Subscribe(topic.clone()).to_text() {
                    Ok(text) => text,
                    Err(e) => return ChannelEnd::Lost(e),
                };
                if outbound.send(OutboundFrame::Text(text)).is_err() {
                    return ChannelEnd::Lost(channel_send_failed("channel closed during resubscribe"));
                }
            }
            if !topics.is_empty() {
                debug!(count = topics.len(), "Resubscribed topics");
            }
            *self.inner.outbound.write().await = Some(outbound.clone());
        }

        self.transition(|s| {
            s.state = ConnectionState::Connected;
            s.attempt_count = 0;
            s.last_connected_at = Some(Utc::now());
            s.last_error = None;
            s.retry_in_ms = None;
        })
        .await;
        info!("Push channel connected");

        let period = self.inner.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ChannelEnd::Cancelled,
                frame = inbound.recv() => match frame {
                    Some(InboundFrame::Text(text)) => {
                        last_inbound = Instant::now();
                        self.dispatch(&text).await;
                    }
                    Some(InboundFrame::Closed { code: Some(NORMAL_CLOSURE), .. }) => {
                        break ChannelEnd::Normal;
                    }
                    Some(InboundFrame::Closed { code, reason }) => {
                        break ChannelEnd::Lost(channel_closed(code, reason));
                    }
                    Some(InboundFrame::Error(e)) => {
                        break ChannelEnd::Lost(channel_closed(None, e));
                    }
                    None => break ChannelEnd::Lost(channel_closed(None, "transport ended")),
                },
                _ = heartbeat.tick() => {
                    if let Some(limit) = self.inner.config.heartbeat_miss_limit {
                        if last_inbound.elapsed() > period * limit {
                            warn!(limit, "No inbound traffic for too long, dropping channel");
                            break ChannelEnd::Lost(heartbeat_timeout(limit));
                        }
                    }
                    let probe = match ControlMessage::Heartbeat.to_text() {
                        Ok(text) => text,
                        Err(e) => break ChannelEnd::Lost(e),
                    };
                    if outbound.send(OutboundFrame::Text(probe)).is_err() {
                        break ChannelEnd::Lost(channel_send_failed("heartbeat"));
                    }
                    self.inner.stats.write().await.heartbeats_sent += 1;
                }
            }
        };

        self.inner.outbound.write().await.take();
        outcome
    }

    async fn dispatch(&self, text: &str) {
        self.inner.stats.write().await.messages_received += 1;

        match InboundMessage::parse(text) {
            Ok(message) => {
                debug!(
                    kind = message.kind.as_wire(),
                    task_id = ?message.correlation_id,
                    "Inbound message"
                );
                let specific = CoreEvent::from_message(&message);
                self.publish(CoreEvent::Message(message)).await;
                if let Some(event) = specific {
                    self.publish(event).await;
                }
            }
            Err(e) => {
                self.inner.stats.write().await.malformed_messages += 1;
                warn!(error = %e, "Dropping malformed message");
                self.publish(CoreEvent::ChannelError {
                    error: e,
                    fatal: false,
                })
                .await;
            }
        }
    }

    /// Channel URL with the current access secret as the `token` parameter
    async fn channel_url(&self) -> CoreResult<Url> {
        let secret = self
            .inner
            .store
            .access_secret()
            .await
            .ok_or_else(not_authenticated)?;
        let mut url = Url::parse(&self.inner.config.url)
            .map_err(|e| config_invalid("channel.url", &self.inner.config.url, &e.to_string()))?;
        url.query_pairs_mut().append_pair("token", &secret);
        Ok(url)
    }

    async fn transition<F>(&self, update: F)
    where
        F: FnOnce(&mut ConnectionSnapshot),
    {
        let snapshot = {
            let mut current = self.inner.snapshot.write().await;
            update(&mut current);
            current.clone()
        };
        debug!(
            state = %snapshot.state,
            attempt = snapshot.attempt_count,
            "Connection state changed"
        );
        self.publish(CoreEvent::ConnectionStateChanged(snapshot)).await;
    }

    async fn publish(&self, event: CoreEvent) {
        if let Err(e) = self.inner.events.publish(event).await {
            warn!(error = %e, "Failed to publish connection event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::{make_test_secret, Credential};
    use crate::connection::transport::mock::{MockConnect, MockPeer, MockTransport};
    use crate::events::EventSubscriber;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            url: "ws://push.test/ws".to_string(),
            base_delay_ms: 10,
            max_delay_ms: 40,
            max_reconnect_attempts: 5,
            heartbeat_interval_seconds: 30,
            heartbeat_miss_limit: Some(2),
            connect_timeout_seconds: 1,
        }
    }

    async fn setup(
        transport: Arc<MockTransport>,
        config: ChannelConfig,
    ) -> (ConnectionManager, EventSubscriber) {
        let store = Arc::new(CredentialStore::in_memory());
        store
            .set_session(
                Credential::new(
                    make_test_secret("ola", Utc::now() + chrono::Duration::hours(1)),
                    Some("r".to_string()),
                ),
                None,
            )
            .await
            .unwrap();
        let events = EventBus::new(256, 0);
        let subscriber = events.subscribe();
        (
            ConnectionManager::new(config, transport, store, events),
            subscriber,
        )
    }

    async fn wait_for_state(subscriber: &mut EventSubscriber, state: ConnectionState) -> ConnectionSnapshot {
        wait_for_state_within(subscriber, state, WAIT).await
    }

    async fn wait_for_state_within(
        subscriber: &mut EventSubscriber,
        state: ConnectionState,
        wait: Duration,
    ) -> ConnectionSnapshot {
        tokio::time::timeout(wait, async {
            loop {
                if let Some(CoreEvent::ConnectionStateChanged(snapshot)) = subscriber
                    .recv_kind(&[EventKind::ConnectionStateChanged])
                    .await
                {
                    if snapshot.state == state {
                        return snapshot;
                    }
                }
            }
        })
        .await
        .expect("state not reached in time")
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
        tokio::time::timeout(WAIT, peers.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_credential() {
        let (transport, _peers) = MockTransport::new();
        let events = EventBus::new(16, 0);
        let manager = ConnectionManager::new(
            fast_config(),
            Arc::new(transport),
            Arc::new(CredentialStore::in_memory()),
            events,
        );
        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NotAuthenticated);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_url_carries_token_and_second_connect_is_refused() {
        let (transport, mut peers) = MockTransport::new();
        let (manager, mut events) = setup(Arc::new(transport), fast_config()).await;

        manager.connect().await.unwrap();
        assert_eq!(
            manager.connect().await.unwrap_err().code,
            crate::error::ErrorCode::ChannelBusy
        );

        let peer = next_peer(&mut peers).await;
        assert!(peer.url.query_pairs().any(|(k, v)| k == "token" && !v.is_empty()));
        let snapshot = wait_for_state(&mut events, ConnectionState::Connected).await;
        assert!(snapshot.last_connected_at.is_some());
        assert_eq!(snapshot.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_subscription_set_semantics() {
        let (transport, _peers) = MockTransport::new();
        let (manager, _events) = setup(Arc::new(transport), fast_config()).await;

        assert!(manager.subscribe(Topic::task(1)).await);
        assert!(!manager.subscribe(Topic::task(1)).await);
        assert!(!manager.unsubscribe(&Topic::task(2)).await);
        assert_eq!(manager.topics().await, vec![Topic::task(1)]);
    }

    #[tokio::test]
    async fn test_live_subscribe_sends_control_message() {
        let (transport, mut peers) = MockTransport::new();
        let (manager, mut events) = setup(Arc::new(transport), fast_config()).await;
        manager.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        manager.subscribe(Topic::all_tasks()).await;
        manager.unsubscribe(&Topic::all_tasks()).await;

        let texts = peer.drain_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("\"subscribe\"") && texts[0].contains("crawl_tasks:all"));
        assert!(texts[1].contains("\"unsubscribe\""));
    }

    #[tokio::test]
    async fn test_client_disconnect_keeps_topics_and_does_not_retry() {
        let (transport, mut peers) = MockTransport::new();
        let transport = Arc::new(transport);
        let (manager, mut events) = setup(transport.clone(), fast_config()).await;
        manager.subscribe(Topic::task(3)).await;
        manager.connect().await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(manager.topics().await, vec![Topic::task(3)]);

        // Resubscribe frame, then the normal close
        let mut saw_close = false;
        while let Some(frame) = peer.next_frame(Duration::from_millis(100)).await {
            if let OutboundFrame::Close { code, .. } = frame {
                assert_eq!(code, NORMAL_CLOSURE);
                saw_close = true;
            }
        }
        assert!(saw_close);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_not_fatal() {
        let (transport, mut peers) = MockTransport::new();
        let (manager, mut events) = setup(Arc::new(transport), fast_config()).await;
        manager.connect().await.unwrap();
        let peer = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        peer.send_text("{not json");
        let event = tokio::time::timeout(WAIT, events.recv_kind(&[EventKind::ChannelError]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CoreEvent::ChannelError { fatal: false, .. }));

        peer.send_text(r#"{"type":"task_started","task_id":8}"#);
        let event = tokio::time::timeout(WAIT, events.recv_kind(&[EventKind::TaskStarted]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CoreEvent::TaskStarted(ref u) if u.task_id == Some(8)));

        assert_eq!(manager.state().await, ConnectionState::Connected);
        let stats = manager.stats().await;
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.malformed_messages, 1);
    }

    #[tokio::test]
    async fn test_server_normal_close_does_not_retry() {
        let (transport, mut peers) = MockTransport::new();
        let transport = Arc::new(transport);
        let (manager, mut events) = setup(transport.clone(), fast_config()).await;
        manager.connect().await.unwrap();
        let peer = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        peer.close(NORMAL_CLOSURE);
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_is_dropped_after_missed_heartbeats() {
        let (transport, mut peers) = MockTransport::new();
        let (manager, mut events) = setup(Arc::new(transport), fast_config()).await;
        manager.connect().await.unwrap();
        let mut first = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        // Two probes go out unanswered, the third tick gives up
        let snapshot =
            wait_for_state_within(&mut events, ConnectionState::Reconnecting, Duration::from_secs(300))
                .await;
        assert_eq!(
            snapshot.last_error.map(|e| e.code),
            Some(crate::error::ErrorCode::HeartbeatTimeout)
        );
        assert_eq!(first.drain_texts().len(), 2);
        assert_eq!(manager.stats().await.heartbeats_sent, 2);

        let _second = next_peer(&mut peers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_reconnect_resets_failed_state() {
        let (transport, mut peers) = MockTransport::new();
        let transport = Arc::new(transport.with_fallback(MockConnect::Refuse("down".to_string())));
        let (manager, mut events) = setup(transport.clone(), fast_config()).await;

        manager.connect().await.unwrap();
        let failed = wait_for_state(&mut events, ConnectionState::Failed).await;
        assert_eq!(failed.attempt_count, 5);
        assert_eq!(transport.opens(), 6);

        transport.script([MockConnect::Accept]);
        manager.reconnect().await.unwrap();
        let _peer = next_peer(&mut peers).await;
        let snapshot = wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(snapshot.attempt_count, 0);
    }
}
