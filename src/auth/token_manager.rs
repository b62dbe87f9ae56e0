//! Credential renewal policy.
//!
//! Renewal is single-flight: the first caller spawns the refresh call and
//! parks a shared future in [`RenewalState`]; everyone else awaits a clone of
//! it. Requests that hit a 401 queue a [`PendingRequest`] and are resumed in
//! FIFO order once the renewal settles.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::providers::AuthProvider;
use crate::auth::storage::CredentialStore;
use crate::auth::token::{redact, Credential, Identity, SessionEndReason};
use crate::config::RenewalConfig;
use crate::error::{
    not_authenticated, renewal_failed, session_ended, CoreError, CoreResult, ErrorCategory,
    ErrorCode,
};
use crate::events::{CoreEvent, EventBus};

type RenewalFuture = Shared<BoxFuture<'static, CoreResult<Credential>>>;

/// What a suspended request was doing, for logs
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates the enqueue and release log lines
    pub id: Uuid,
    pub label: String,
    pub enqueued_at: Instant,
}

impl RequestContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            enqueued_at: Instant::now(),
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// A request suspended until the in-flight renewal settles
pub struct PendingRequest {
    pub context: RequestContext,
    /// Resolved with the fresh access secret, or the reason the session ended
    resume: oneshot::Sender<CoreResult<String>>,
}

impl PendingRequest {
    fn resolve(self, result: CoreResult<String>) {
        let waited_ms = self.context.enqueued_at.elapsed().as_millis() as u64;
        debug!(
            request = %self.context,
            request_id = %self.context.id,
            waited_ms,
            ok = result.is_ok(),
            "Releasing queued request"
        );
        if self.resume.send(result).is_err() {
            debug!(request = %self.context, "Queued request was dropped before release");
        }
    }
}

#[derive(Default)]
struct RenewalState {
    inflight: Option<RenewalFuture>,
    queue: VecDeque<PendingRequest>,
    /// Bumped at every session boundary; a renewal started under an older
    /// generation must not touch the store
    generation: u64,
}

struct Inner {
    store: Arc<CredentialStore>,
    provider: Arc<dyn AuthProvider>,
    events: EventBus,
    config: RenewalConfig,
    renewal: Mutex<RenewalState>,
    poll: Mutex<Option<CancellationToken>>,
}

/// Owns renewal of the session credential
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn AuthProvider>,
        events: EventBus,
        config: RenewalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                events,
                config,
                renewal: Mutex::new(RenewalState::default()),
                poll: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub async fn current_credential(&self) -> Option<Credential> {
        self.inner.store.credential().await
    }

    /// Renew the credential, joining an in-flight renewal if there is one
    pub async fn renew(&self) -> CoreResult<Credential> {
        let renewal = {
            let mut state = self.inner.renewal.lock().await;
            self.start_renewal_locked(&mut state)
        };
        renewal.await
    }

    /// Whether a renewal is currently outstanding
    pub async fn renewal_in_flight(&self) -> bool {
        self.inner.renewal.lock().await.inflight.is_some()
    }

    /// Number of requests waiting on a renewal
    pub async fn queued_requests(&self) -> usize {
        self.inner.renewal.lock().await.queue.len()
    }

    /// Suspend a request that was rejected with 401 until a renewal settles.
    ///
    /// Resolves with the access secret to replay the request with. The call
    /// itself is never retried here.
    pub async fn on_unauthorized(
        &self,
        context: RequestContext,
        used_secret: &str,
    ) -> CoreResult<String> {
        let receiver = {
            let mut state = self.inner.renewal.lock().await;

            let Some(current) = self.inner.store.access_secret().await else {
                debug!(request = %context, "Unauthorized with no session, refusing");
                return Err(not_authenticated());
            };

            // Someone already renewed since this request was sent
            if state.inflight.is_none() && current != used_secret {
                debug!(request = %context, "Credential already renewed, replaying at once");
                return Ok(current);
            }

            let (resume, receiver) = oneshot::channel();
            state.queue.push_back(PendingRequest {
                context: context.clone(),
                resume,
            });
            debug!(
                request = %context,
                request_id = %context.id,
                queued = state.queue.len(),
                "Request queued behind renewal"
            );

            if state.inflight.is_none() {
                // Dropping the handle is fine, the spawned task drives the renewal
                let _ = self.start_renewal_locked(&mut state);
            }
            receiver
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(session_ended("renewal abandoned")),
        }
    }

    fn start_renewal_locked(&self, state: &mut RenewalState) -> RenewalFuture {
        if let Some(inflight) = &state.inflight {
            debug!("Joining in-flight renewal");
            return inflight.clone();
        }

        let manager = self.clone();
        let generation = state.generation;
        let handle = tokio::spawn(async move { manager.run_renewal(generation).await });

        let renewal: BoxFuture<'static, CoreResult<Credential>> = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CoreError::new(ErrorCode::Internal)
                    .message("Renewal task panicked or was cancelled")
                    .context(e.to_string())
                    .category(ErrorCategory::Internal)
                    .build()),
            }
        }
        .boxed();

        let shared = renewal.shared();
        state.inflight = Some(shared.clone());
        shared
    }

    async fn run_renewal(&self, generation: u64) -> CoreResult<Credential> {
        let current = self.inner.store.credential().await;

        let outcome = match &current {
            None => Err(not_authenticated()),
            Some(credential) => match credential.refresh_secret.as_deref() {
                Some(refresh) if !refresh.is_empty() => {
                    info!(refresh = %redact(refresh), "Renewing session credential");
                    self.inner.provider.refresh(refresh).await.map(|grant| {
                        let identity = grant.identity();
                        (credential.renewed(grant.access_token, grant.refresh_token), identity)
                    })
                }
                _ => Err(renewal_failed("no refresh secret held")),
            },
        };

        let mut state = self.inner.renewal.lock().await;

        // The session change already rejected this renewal's waiters; the gate
        // and queue now belong to the newer session
        if state.generation != generation {
            warn!("Session changed while renewing, discarding renewal result");
            return Err(session_ended("session changed during renewal"));
        }
        state.inflight = None;

        match outcome {
            Ok((credential, identity)) => {
                if let Err(e) = self.inner.store.replace_credential(credential.clone()).await {
                    warn!(error = %e, "Renewed credential could not be persisted");
                }
                if let Some(identity) = identity {
                    if let Err(e) = self.inner.store.update_identity(identity).await {
                        warn!(error = %e, "Renewed identity could not be persisted");
                    }
                }

                let released = state.queue.len();
                for pending in state.queue.drain(..) {
                    pending.resolve(Ok(credential.access_secret.clone()));
                }
                drop(state);

                info!(
                    released,
                    expires_at = ?credential.expires_at,
                    "Session credential renewed"
                );
                self.log_remaining(&credential);
                self.publish(CoreEvent::CredentialRenewed {
                    expires_at: credential.expires_at,
                })
                .await;
                Ok(credential)
            }
            Err(e) if current.is_none() => {
                // Nothing to end; just refuse whoever was waiting
                for pending in state.queue.drain(..) {
                    pending.resolve(Err(e.clone()));
                }
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Credential renewal failed, ending session");
                let reason = SessionEndReason::RenewalFailed(e.to_string());
                self.terminate_locked(&mut state, &reason).await;
                drop(state);
                self.publish(CoreEvent::SessionEnded { reason }).await;
                Err(e)
            }
        }
    }

    /// Clear everything tied to the current session. Caller holds the renewal lock.
    async fn terminate_locked(&self, state: &mut RenewalState, reason: &SessionEndReason) {
        state.generation += 1;
        state.inflight = None;
        let rejected = state.queue.len();
        for pending in state.queue.drain(..) {
            pending.resolve(Err(session_ended(reason)));
        }
        if rejected > 0 {
            info!(rejected, "Rejected queued requests at session end");
        }

        self.cancel_poll().await;
        if let Err(e) = self.inner.store.clear().await {
            error!(error = %e, "Failed to clear persisted session");
        }
    }

    /// Begin a session with a freshly issued credential
    pub async fn begin_session(
        &self,
        credential: Credential,
        identity: Option<Identity>,
    ) -> CoreResult<()> {
        {
            let mut state = self.inner.renewal.lock().await;
            state.generation += 1;
            state.inflight = None;
            for pending in state.queue.drain(..) {
                pending.resolve(Err(session_ended("superseded by a new session")));
            }
        }

        if let Err(e) = self
            .inner
            .store
            .set_session(credential.clone(), identity.clone())
            .await
        {
            warn!(error = %e, "Session could not be persisted, continuing in memory");
        }
        self.log_remaining(&credential);

        self.schedule_proactive_renewal().await;
        self.publish(CoreEvent::SessionStarted { identity }).await;
        Ok(())
    }

    /// Announce a session whose credential is already in the store
    pub async fn resume_session(&self) -> CoreResult<()> {
        let Some(credential) = self.inner.store.credential().await else {
            return Err(not_authenticated());
        };
        self.log_remaining(&credential);
        let identity = self.inner.store.identity().await;
        self.schedule_proactive_renewal().await;
        self.publish(CoreEvent::SessionStarted { identity }).await;
        Ok(())
    }

    /// End the session: cancel the poll, reject queued requests, clear the store
    pub async fn end_session(&self, reason: SessionEndReason) {
        {
            let mut state = self.inner.renewal.lock().await;
            self.terminate_locked(&mut state, &reason).await;
        }
        info!(%reason, "Session ended");
        self.publish(CoreEvent::SessionEnded { reason }).await;
    }

    /// (Re)start the recurring proactive renewal check.
    ///
    /// The first evaluation happens immediately, then once per poll interval,
    /// so a clock jump or a suspended process corrects itself on the next tick.
    pub async fn schedule_proactive_renewal(&self) {
        let token = CancellationToken::new();
        {
            let mut poll = self.inner.poll.lock().await;
            if let Some(previous) = poll.replace(token.clone()) {
                previous.cancel();
            }
        }

        let manager = self.clone();
        let period = self.inner.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Proactive renewal poll stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.check_proactive_renewal().await;
                    }
                }
            }
        });
        debug!(period_secs = period.as_secs(), "Proactive renewal poll scheduled");
    }

    /// One poll tick; returns true if a renewal was triggered
    pub async fn check_proactive_renewal(&self) -> bool {
        let Some(credential) = self.inner.store.credential().await else {
            return false;
        };
        if !credential.needs_proactive_renewal(Utc::now(), self.inner.config.threshold())
            || !credential.can_renew()
        {
            return false;
        }

        info!(
            expires_at = ?credential.expires_at,
            "Credential close to expiry, renewing proactively"
        );
        if let Err(e) = self.renew().await {
            warn!(error = %e, "Proactive renewal failed");
        }
        true
    }

    /// Stop background work without touching the session
    pub async fn stop(&self) {
        self.cancel_poll().await;
    }

    async fn cancel_poll(&self) {
        if let Some(token) = self.inner.poll.lock().await.take() {
            token.cancel();
        }
    }

    fn log_remaining(&self, credential: &Credential) {
        match credential.remaining(Utc::now()) {
            Some(remaining) => debug!(
                remaining_secs = remaining.num_seconds(),
                proactive = remaining < self.inner.config.threshold(),
                "Credential assigned"
            ),
            None => debug!("Credential assigned with unknown expiry"),
        }
    }

    async fn publish(&self, event: CoreEvent) {
        if let Err(e) = self.inner.events.publish(event).await {
            warn!(error = %e, "Failed to publish session event");
        }
    }
}
