//! Session supervisor: spawns one owning task per call and routes every
//! TC event to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use voicebridge_core::{
    Call, ChannelInfo, Direction, HangupReason, TcEvent, TransferType,
};

use crate::session::{
    CallSession, OutboundPreset, SessionConfig, SessionDeps, SessionEvent,
};
use crate::queue::SessionQueue;
use crate::SessionError;

/// What the readiness probe reports about the TC link and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorHealth {
    Serving,
    /// TC reader surrendered; existing calls were failed over.
    TcLinkDown,
    Draining,
}

/// Source of channels with live owners, consulted by the TC reader during
/// post-reconnect resync. Declared here so this crate stays independent of
/// the telephony crate; the server wires the two with a one-line adapter.
#[async_trait]
pub trait LiveChannelSource: Send + Sync {
    async fn live_channels(&self) -> Vec<String>;
}

struct SessionEntry {
    call_id: String,
    queue: Arc<SessionQueue>,
    audio_tx: mpsc::Sender<Bytes>,
}

pub struct SessionSupervisor {
    deps: SessionDeps,
    config: SessionConfig,
    /// channel id -> live session.
    sessions: Arc<DashMap<String, SessionEntry>>,
    /// playback id -> channel id; sessions maintain it, the router uses it.
    playbacks: Arc<DashMap<String, String>>,
    /// Outbound calls admitted at originate time, keyed by channel id.
    pending_outbound: DashMap<String, OutboundPreset>,
    draining: AtomicBool,
    tc_down: AtomicBool,
}

impl SessionSupervisor {
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            sessions: Arc::new(DashMap::new()),
            playbacks: Arc::new(DashMap::new()),
            pending_outbound: DashMap::new(),
            draining: AtomicBool::new(false),
            tc_down: AtomicBool::new(false),
        })
    }

    pub fn health(&self) -> SupervisorHealth {
        if self.draining.load(Ordering::SeqCst) {
            SupervisorHealth::Draining
        } else if self.tc_down.load(Ordering::SeqCst) {
            SupervisorHealth::TcLinkDown
        } else {
            SupervisorHealth::Serving
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Route one TC event. `StasisStart` spawns a session; everything else
    /// goes to the owning task.
    pub async fn dispatch(self: &Arc<Self>, event: TcEvent) {
        match event {
            TcEvent::StasisStart { channel } => self.on_stasis_start(channel).await,
            TcEvent::PlaybackFinished { ref playback_id }
            | TcEvent::PlaybackFailed { ref playback_id } => {
                let channel_id = self.playbacks.get(playback_id).map(|e| e.value().clone());
                if let Some(channel_id) = channel_id {
                    self.push_to(&channel_id, SessionEvent::Tc(event));
                }
            }
            other => {
                if let Some(channel_id) = other.channel_id().map(String::from) {
                    self.push_to(&channel_id, SessionEvent::Tc(other));
                }
            }
        }
    }

    /// The TC reader gave up reconnecting: fail every live call over to a
    /// terminal state; the process keeps serving the operator surface.
    pub fn on_tc_fatal(&self) {
        self.tc_down.store(true, Ordering::SeqCst);
        metrics::counter!("tc_link_failures_total").increment(1);
        for entry in self.sessions.iter() {
            entry.value().queue.push(SessionEvent::Tc(TcEvent::ChannelLost {
                channel_id: entry.key().clone(),
            }));
        }
    }

    async fn on_stasis_start(self: &Arc<Self>, channel: ChannelInfo) {
        if self.draining.load(Ordering::SeqCst) {
            tracing::info!(channel_id = %channel.id, "draining, refusing new channel");
            let _ = self
                .deps
                .telephony
                .hangup(&channel.id, Some(HangupReason::Busy))
                .await;
            return;
        }

        // A duplicate StasisStart for a channel that already has an owner
        // must not create a second call record.
        if self.sessions.contains_key(&channel.id) {
            tracing::warn!(channel_id = %channel.id, "duplicate StasisStart ignored");
            return;
        }

        let (preset, direction) = match self.pending_outbound.remove(&channel.id) {
            Some((_, preset)) => (Some(preset), Direction::Outbound),
            None => (None, Direction::Inbound),
        };

        let queue = Arc::new(SessionQueue::new(self.config.limits.session_queue_capacity));
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let session = CallSession::new(
            self.deps.clone(),
            self.config.clone(),
            &channel,
            direction,
            preset,
            queue.clone(),
            audio_rx,
            self.playbacks.clone(),
        );

        self.sessions.insert(
            channel.id.clone(),
            SessionEntry {
                call_id: session.call_id().to_string(),
                queue,
                audio_tx,
            },
        );

        let supervisor = self.clone();
        let channel_id = channel.id.clone();
        tokio::spawn(async move {
            session.run().await;
            supervisor.sessions.remove(&channel_id);
        });
    }

    fn push_to(&self, channel_id: &str, event: SessionEvent) {
        match self.sessions.get(channel_id) {
            Some(entry) => entry.queue.push(event),
            None => {
                tracing::debug!(channel_id, "event for unknown channel dropped");
            }
        }
    }

    /// Media feed ingress: hand a PCM chunk to the owning session.
    pub fn feed_audio(&self, channel_id: &str, chunk: Bytes) -> bool {
        match self.sessions.get(channel_id) {
            Some(entry) => entry.audio_tx.try_send(chunk).is_ok(),
            None => false,
        }
    }

    fn find_by_call_id(&self, call_id: &str) -> Option<Arc<SessionQueue>> {
        self.sessions
            .iter()
            .find(|e| e.value().call_id == call_id)
            .map(|e| e.value().queue.clone())
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Forcibly end a call. Idempotent: terminating a call with no live
    /// session succeeds if the record is already terminal or absent.
    pub async fn terminate_call(&self, call_id: &str, reason: &str) -> Result<(), SessionError> {
        if let Some(queue) = self.find_by_call_id(call_id) {
            queue.push(SessionEvent::Terminate {
                reason: reason.to_string(),
            });
            return Ok(());
        }
        match self.deps.store.get(call_id).await? {
            None => Ok(()),
            Some(call) if call.state.is_terminal() => Ok(()),
            // Record exists, no owner: a stale record from a dead process.
            // Best effort hangup; TTL reaps the record.
            Some(call) => {
                let _ = self
                    .deps
                    .telephony
                    .hangup(&call.channel_id, Some(HangupReason::Normal))
                    .await;
                Ok(())
            }
        }
    }

    pub async fn transfer_call(
        &self,
        call_id: &str,
        transfer_type: TransferType,
        target: String,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let queue = self
            .find_by_call_id(call_id)
            .ok_or_else(|| SessionError::NotFound(call_id.to_string()))?;
        queue.push(SessionEvent::Transfer {
            transfer_type,
            target,
            reason,
        });
        Ok(())
    }

    /// Operator-triggered outbound call. This path bypasses `StasisStart`
    /// admission, so it consults the controller explicitly before dialing.
    pub async fn originate_call(
        &self,
        tenant_id: &str,
        endpoint: &str,
        caller_id: &str,
    ) -> Result<String, SessionError> {
        let decision = self.deps.admission.try_admit(tenant_id, None, false).await?;
        if !decision.is_admitted() {
            return Err(SessionError::WrongState(format!(
                "capacity exhausted for tenant {tenant_id}"
            )));
        }

        match self.deps.telephony.originate(endpoint, caller_id).await {
            Ok(channel_id) => {
                self.pending_outbound.insert(
                    channel_id.clone(),
                    OutboundPreset {
                        tenant_id: tenant_id.to_string(),
                    },
                );
                Ok(channel_id)
            }
            Err(e) => {
                self.deps.admission.abort(tenant_id);
                Err(e.into())
            }
        }
    }

    /// Snapshot read for the operator API; never touches the live session.
    pub async fn get_call(&self, call_id: &str) -> Result<Option<Call>, SessionError> {
        Ok(self.deps.store.get(call_id).await?)
    }

    pub async fn list_tenant_calls(&self, tenant_id: &str) -> Result<Vec<Call>, SessionError> {
        let calls = self.deps.store.list_by_tenant(tenant_id).await?;
        Ok(calls.into_iter().filter(|c| !c.state.is_terminal()).collect())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting new channels, then drain: wait up to the grace
    /// period for live calls to end on their own, and terminate the rest
    /// with `resolution:shutdown`.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        tracing::info!(
            live = self.sessions.len(),
            grace_secs = grace.as_secs(),
            "draining sessions"
        );

        let deadline = tokio::time::Instant::now() + grace;
        while !self.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        if !self.sessions.is_empty() {
            tracing::warn!(
                remaining = self.sessions.len(),
                "grace period elapsed, terminating remaining calls"
            );
            for entry in self.sessions.iter() {
                entry.value().queue.push(SessionEvent::Terminate {
                    reason: "resolution:shutdown".to_string(),
                });
            }
            // One more short wait for the terminations to land.
            let hard_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !self.sessions.is_empty() && tokio::time::Instant::now() < hard_deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[async_trait]
impl LiveChannelSource for SessionSupervisor {
    async fn live_channels(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
