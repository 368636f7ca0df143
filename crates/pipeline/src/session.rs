//! The per-call session: one owning task driving the lifecycle state
//! machine and the STT -> agent -> TTS pipeline.
//!
//! All state transitions for a call are serialized through this task; other
//! components reach the call only by pushing events onto its queue. Within
//! one call there is at most one dialog step and at most one playback in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use voicebridge_config::{AudioConfig, BargeInPolicy, CallLimitsConfig};
use voicebridge_core::{
    AgentActionKind, AgentClient, AgentReply, AgentSettings, Call, CallEvent, CallState,
    CallStore, ChannelInfo, ConversationSession, DialogError, Direction, ErrorComponent,
    EventPayload, EventPublisher, HangupReason, PlaybackHandle, PlaybackSource, SpeechError,
    SttConfig, SttProvider, TcEvent, TelephonyClient, TenantResolver, TranscriptResult,
    TransferType, TtsConfig, TtsProvider,
};

use crate::admission::AdmissionController;
use crate::queue::SessionQueue;

/// Provider factory seams, injectable for tests.
pub type SttFactory = Arc<
    dyn Fn(&str, &serde_json::Value) -> Result<Arc<dyn SttProvider>, SpeechError> + Send + Sync,
>;
pub type TtsFactory = Arc<
    dyn Fn(&str, &serde_json::Value) -> Result<Arc<dyn TtsProvider>, SpeechError> + Send + Sync,
>;

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub telephony: Arc<dyn TelephonyClient>,
    pub resolver: Arc<dyn TenantResolver>,
    pub agent: Arc<dyn AgentClient>,
    pub store: Arc<dyn CallStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub admission: Arc<AdmissionController>,
    pub stt: SttFactory,
    pub tts: TtsFactory,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub limits: CallLimitsConfig,
    pub audio: AudioConfig,
}

/// Everything that can wake the owning task.
pub enum SessionEvent {
    /// TC event routed by the supervisor.
    Tc(TcEvent),
    /// One recognition result from the STT stream.
    Stt(Result<TranscriptResult, SpeechError>),
    /// A dialog step completed.
    AgentDone {
        user_text: String,
        started: Instant,
        result: Result<AgentReply, DialogError>,
    },
    /// A synthesis task completed.
    SynthesisDone {
        text: String,
        kind: UtteranceKind,
        started: Instant,
        result: Result<Bytes, SpeechError>,
    },
    /// Operator or supervisor asked for termination.
    Terminate { reason: String },
    /// Operator or agent asked for a transfer.
    Transfer {
        transfer_type: TransferType,
        target: String,
        reason: Option<String>,
    },
}

/// Why an utterance is being synthesized; decides what happens when its
/// playback finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceKind {
    /// Initial greeting; finishing it moves the call to `active`.
    Greeting,
    /// Ordinary agent reply.
    Reply,
    /// Canned apology or silence prompt.
    Prompt,
    /// Final reply before ending with the given reason.
    Farewell { end_reason: String },
}

enum Step {
    Continue,
    Finish {
        state: CallState,
        reason: String,
        hangup: bool,
    },
}

pub struct CallSession {
    deps: SessionDeps,
    config: SessionConfig,
    queue: Arc<SessionQueue>,
    audio_rx: Option<mpsc::Receiver<Bytes>>,
    /// playback id -> channel id, shared with the supervisor for routing
    /// playback events.
    playbacks: Arc<DashMap<String, String>>,

    call: Call,
    /// Tenant preset for outbound calls; inbound calls resolve by DID.
    preset: Option<OutboundPreset>,

    agent_settings: Option<AgentSettings>,
    conversation: Option<ConversationSession>,
    stt_provider_name: String,
    tts: Option<Arc<dyn TtsProvider>>,
    tts_config: TtsConfig,

    playing: Option<PlaybackHandle>,
    awaiting_greeting: bool,
    end_after_playback: Option<String>,
    turn_in_flight: bool,
    queued_final: Option<TranscriptResult>,
    turn_failures: u32,
    silence_prompted: bool,
    /// Set between a barge-in and the next user turn.
    barged_in: bool,
    /// Interrupted reply retained as context under the default policy.
    interrupted_reply: Option<String>,

    last_audio: Arc<Mutex<Instant>>,
    pump_tasks: Vec<JoinHandle<()>>,
    synth_task: Option<JoinHandle<()>>,
    stt_errors: u32,
}

/// Parameters for operator-originated outbound calls, which were admitted
/// before the channel existed.
#[derive(Debug, Clone)]
pub struct OutboundPreset {
    pub tenant_id: String,
}

const STT_ERROR_LIMIT: u32 = 3;
const INACTIVITY_TICK: Duration = Duration::from_secs(5);

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: SessionDeps,
        config: SessionConfig,
        channel: &ChannelInfo,
        direction: Direction,
        preset: Option<OutboundPreset>,
        queue: Arc<SessionQueue>,
        audio_rx: mpsc::Receiver<Bytes>,
        playbacks: Arc<DashMap<String, String>>,
    ) -> Self {
        let call = match direction {
            Direction::Inbound => Call::inbound(
                channel.id.clone(),
                channel.caller_number.clone(),
                channel.connected_number.clone(),
            ),
            Direction::Outbound => Call::outbound(
                channel.id.clone(),
                channel.caller_number.clone(),
                channel.connected_number.clone(),
            ),
        };

        Self {
            deps,
            config,
            queue,
            audio_rx: Some(audio_rx),
            playbacks,
            call,
            preset,
            agent_settings: None,
            conversation: None,
            stt_provider_name: String::new(),
            tts: None,
            tts_config: TtsConfig::default(),
            playing: None,
            awaiting_greeting: false,
            end_after_playback: None,
            turn_in_flight: false,
            queued_final: None,
            turn_failures: 0,
            silence_prompted: false,
            barged_in: false,
            interrupted_reply: None,
            last_audio: Arc::new(Mutex::new(Instant::now())),
            pump_tasks: Vec::new(),
            synth_task: None,
            stt_errors: 0,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call.id
    }

    /// Drive the call to a terminal state. Errors never escape: every
    /// failure maps to a terminal transition and an `error.*` event.
    pub async fn run(mut self) {
        metrics::gauge!("calls_active").increment(1.0);
        let outcome = self.run_inner().await;
        let (state, reason, hangup) = match outcome {
            Ok(Step::Finish {
                state,
                reason,
                hangup,
            }) => (state, reason, hangup),
            // The loop only returns Finish; Continue cannot reach here.
            Ok(Step::Continue) => (CallState::Failed, "failed:internal".to_string(), true),
            Err(e) => {
                tracing::error!(call_id = %self.call.id, error = %e, "session failed");
                self.emit_error(ErrorComponent::Internal, &e.to_string(), "session")
                    .await;
                (CallState::Failed, "failed:internal".to_string(), true)
            }
        };
        self.finish(state, reason, hangup).await;
        metrics::gauge!("calls_active").decrement(1.0);
    }

    async fn run_inner(&mut self) -> Result<Step, crate::SessionError> {
        if let Step::Finish { state, reason, hangup } = self.setup().await? {
            return Ok(Step::Finish { state, reason, hangup });
        }

        let call_deadline =
            Instant::now() + Duration::from_secs(self.config.limits.call_timeout_secs);
        let silence = Duration::from_secs(self.config.limits.silence_timeout_secs);
        let mut silence_deadline = Instant::now() + silence;
        let inactivity = Duration::from_secs(
            self.agent_settings
                .as_ref()
                .map(|a| a.safety.inactivity_timeout_secs)
                .unwrap_or(120),
        );
        let mut inactivity_tick = tokio::time::interval(INACTIVITY_TICK);
        let mut heard_user_audio = false;

        loop {
            let step = tokio::select! {
                event = self.queue.pop() => {
                    if matches!(event, SessionEvent::Stt(Ok(_))) {
                        silence_deadline = Instant::now() + silence;
                        self.silence_prompted = false;
                    }
                    self.handle_event(event).await?
                }
                _ = tokio::time::sleep_until(silence_deadline) => {
                    silence_deadline = Instant::now() + silence;
                    self.on_silence().await?
                }
                _ = tokio::time::sleep_until(call_deadline) => {
                    tracing::info!(call_id = %self.call.id, "call wall-clock cap reached");
                    Step::Finish {
                        state: CallState::Ended,
                        reason: "resolution:timeout".to_string(),
                        hangup: true,
                    }
                }
                _ = inactivity_tick.tick() => {
                    let idle = self.last_audio.lock().elapsed();
                    if !heard_user_audio && idle > inactivity {
                        tracing::info!(call_id = %self.call.id, "no user audio, ending call");
                        Step::Finish {
                            state: CallState::Ended,
                            reason: "resolution:timeout".to_string(),
                            hangup: true,
                        }
                    } else {
                        if idle < INACTIVITY_TICK {
                            heard_user_audio = true;
                        }
                        Step::Continue
                    }
                }
            };

            if let Step::Finish { state, reason, hangup } = step {
                return Ok(Step::Finish { state, reason, hangup });
            }
        }
    }

    // ------------------------------------------------------------------
    // Setup: ringing -> answered -> greeting
    // ------------------------------------------------------------------

    async fn setup(&mut self) -> Result<Step, crate::SessionError> {
        self.call.transition(CallState::Ringing)?;
        self.deps.store.save(&self.call).await?;
        self.emit(EventPayload::CallStarted {
            direction: self.call.direction,
            caller_number: self.call.caller_number.clone(),
            callee_number: self.call.callee_number.clone(),
            state: self.call.state,
        })
        .await;

        // Tenant resolution: by DID for inbound, preset for outbound.
        let tenant_id = match &self.preset {
            Some(preset) => preset.tenant_id.clone(),
            None => match self.deps.resolver.lookup_did(&self.call.callee_number).await {
                Ok(record) if record.enabled => record.tenant_id,
                Ok(_) => {
                    return Ok(self.reject("rejected:disabled", "tenant disabled").await);
                }
                Err(DialogError::NotFound(_)) => {
                    return Ok(self.reject("rejected:unroutable", "unroutable").await);
                }
                Err(e) => {
                    self.emit_error(ErrorComponent::Internal, &e.to_string(), "resolver")
                        .await;
                    return Ok(Step::Finish {
                        state: CallState::Failed,
                        reason: "failed:tenant_config".to_string(),
                        hangup: true,
                    });
                }
            },
        };
        self.call.tenant_id = tenant_id.clone();
        self.deps.store.save(&self.call).await?;

        let (agent_settings, provider_settings) = match (
            self.deps.resolver.agent_config(&tenant_id).await,
            self.deps.resolver.provider_settings(&tenant_id).await,
        ) {
            (Ok(agent), Ok(providers)) => (agent, providers),
            (Err(e), _) | (_, Err(e)) => {
                self.emit_error(ErrorComponent::Internal, &e.to_string(), "resolver")
                    .await;
                return Ok(Step::Finish {
                    state: CallState::Failed,
                    reason: "failed:tenant_config".to_string(),
                    hangup: true,
                });
            }
        };

        // Admission: this call's record is already persisted, so exclude it
        // from the counts it is compared against. Outbound calls were
        // admitted at originate time.
        if self.preset.is_none() {
            let decision = self
                .deps
                .admission
                .try_admit(
                    &tenant_id,
                    agent_settings.safety.max_concurrent_calls,
                    true,
                )
                .await?;
            if !decision.is_admitted() {
                let _ = self
                    .deps
                    .telephony
                    .hangup(&self.call.channel_id, Some(HangupReason::Busy))
                    .await;
                return Ok(Step::Finish {
                    state: CallState::Ended,
                    reason: "rejected:capacity".to_string(),
                    hangup: false,
                });
            }
        }
        self.deps.admission.confirm(&tenant_id);

        // Providers for this tenant.
        let stt = (self.deps.stt)(
            &provider_settings.stt_provider,
            &provider_settings.stt_config,
        );
        let tts = (self.deps.tts)(
            &provider_settings.tts_provider,
            &provider_settings.tts_config,
        );
        let (stt, tts) = match (stt, tts) {
            (Ok(stt), Ok(tts)) => (stt, tts),
            (Err(e), _) | (_, Err(e)) => {
                self.emit_error(ErrorComponent::Internal, &e.to_string(), "providers")
                    .await;
                return Ok(Step::Finish {
                    state: CallState::Failed,
                    reason: "failed:provider_config".to_string(),
                    hangup: true,
                });
            }
        };
        self.tts_config = TtsConfig {
            language: agent_settings.voice.language.clone(),
            voice_id: agent_settings.voice.voice_id.clone(),
            rate: agent_settings.voice.rate,
            pitch: agent_settings.voice.pitch,
            volume: 1.0,
            sample_rate: self.config.audio.sample_rate,
            encoding: self.config.audio.encoding,
            provider_config: provider_settings.tts_config.clone(),
        };
        self.stt_provider_name = provider_settings.stt_provider.clone();
        self.tts = Some(tts);

        // Answer. Auto-answer is immediate; one semantic retry on failure.
        let mut answered = self.deps.telephony.answer(&self.call.channel_id).await;
        if let Err(e) = &answered {
            tracing::warn!(call_id = %self.call.id, error = %e, "answer failed, retrying once");
            answered = self.deps.telephony.answer(&self.call.channel_id).await;
        }
        if let Err(e) = answered {
            self.emit_error(ErrorComponent::Tc, &e.to_string(), "answer").await;
            return Ok(Step::Finish {
                state: CallState::Failed,
                reason: "failed:answer".to_string(),
                hangup: true,
            });
        }
        self.call.transition(CallState::Answered)?;
        self.deps.store.save(&self.call).await?;

        // Conversation is created here; the conversation id is set at most
        // once, after `answered`.
        let start = match self
            .deps
            .agent
            .create_conversation(
                &tenant_id,
                &agent_settings.agent_id,
                serde_json::json!({ "caller_number": self.call.caller_number }),
            )
            .await
        {
            Ok(start) => start,
            Err(e) => {
                self.emit_error(ErrorComponent::Llm, &e.to_string(), "create_conversation")
                    .await;
                return Ok(Step::Finish {
                    state: CallState::Failed,
                    reason: "failed:agent_unavailable".to_string(),
                    hangup: true,
                });
            }
        };
        self.call.agent_id = Some(agent_settings.agent_id.clone());
        self.call.conversation_id = Some(start.conversation_id.clone());
        self.deps.store.save(&self.call).await?;
        self.conversation = Some(ConversationSession::new(
            start.conversation_id.clone(),
            self.call.id.clone(),
            tenant_id,
            agent_settings.agent_id.clone(),
            agent_settings.safety.max_turns,
        ));
        self.emit(EventPayload::CallAnswered {
            direction: self.call.direction,
            caller_number: self.call.caller_number.clone(),
            callee_number: self.call.callee_number.clone(),
            state: self.call.state,
        })
        .await;

        self.agent_settings = Some(agent_settings);
        self.open_stt(stt).await?;

        // Greeting; with none supplied the call is active immediately.
        match start.greeting {
            Some(text) if !text.is_empty() => {
                self.awaiting_greeting = true;
                self.spawn_synthesis(text, UtteranceKind::Greeting);
            }
            _ => {
                self.call.transition(CallState::Active)?;
                self.deps.store.save(&self.call).await?;
            }
        }
        Ok(Step::Continue)
    }

    /// Open the recognition stream and start the two pumps: TC media feed
    /// into the sink, results onto the session queue.
    async fn open_stt(&mut self, provider: Arc<dyn SttProvider>) -> Result<(), crate::SessionError> {
        let stt_config = SttConfig {
            language: self
                .agent_settings
                .as_ref()
                .map(|a| a.voice.language.clone())
                .unwrap_or_else(|| "en-US".to_string()),
            sample_rate: self.config.audio.sample_rate,
            encoding: self.config.audio.encoding,
            interim_results: true,
            single_utterance: false,
            provider_config: serde_json::Value::Null,
        };
        let stream = provider.open_stream(&stt_config).await?;

        let Some(mut audio_rx) = self.audio_rx.take() else {
            return Ok(());
        };
        let sink = stream.audio;
        let last_audio = self.last_audio.clone();
        self.pump_tasks.push(tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                *last_audio.lock() = Instant::now();
                if sink.send(chunk).await.is_err() {
                    return;
                }
            }
        }));

        let mut results = stream.results;
        let queue = self.queue.clone();
        self.pump_tasks.push(tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                queue.push(SessionEvent::Stt(result));
            }
        }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: SessionEvent) -> Result<Step, crate::SessionError> {
        match event {
            SessionEvent::Tc(tc) => self.handle_tc(tc).await,
            SessionEvent::Stt(result) => self.handle_stt(result).await,
            SessionEvent::AgentDone {
                user_text,
                started,
                result,
            } => self.handle_agent_done(user_text, started, result).await,
            SessionEvent::SynthesisDone {
                text,
                kind,
                started,
                result,
            } => self.handle_synthesis_done(text, kind, started, result).await,
            SessionEvent::Terminate { reason } => Ok(Step::Finish {
                state: CallState::Ended,
                reason,
                hangup: true,
            }),
            SessionEvent::Transfer {
                transfer_type,
                target,
                reason,
            } => self.handle_transfer(transfer_type, target, reason).await,
        }
    }

    async fn handle_tc(&mut self, event: TcEvent) -> Result<Step, crate::SessionError> {
        match event {
            TcEvent::ChannelHangupRequest { .. }
            | TcEvent::ChannelDestroyed { .. }
            | TcEvent::StasisEnd { .. } => Ok(Step::Finish {
                state: CallState::Ended,
                reason: "caller_hangup".to_string(),
                hangup: false,
            }),
            TcEvent::ChannelLost { .. } => Ok(Step::Finish {
                state: CallState::Ended,
                reason: "lost:tc_reset".to_string(),
                hangup: false,
            }),
            TcEvent::PlaybackFinished { playback_id } => {
                self.on_playback_done(&playback_id, true).await
            }
            TcEvent::PlaybackFailed { playback_id } => {
                self.on_playback_done(&playback_id, false).await
            }
            // Answer confirmations and unknown events are informational.
            TcEvent::ChannelAnswered { .. } | TcEvent::StasisStart { .. } | TcEvent::Unknown { .. } => {
                Ok(Step::Continue)
            }
        }
    }

    async fn handle_stt(
        &mut self,
        result: Result<TranscriptResult, SpeechError>,
    ) -> Result<Step, crate::SessionError> {
        let transcript = match result {
            Ok(t) => t,
            Err(e) => {
                self.emit_error(ErrorComponent::Stt, &e.to_string(), "stt").await;
                self.stt_errors += 1;
                if self.stt_errors > STT_ERROR_LIMIT {
                    return Ok(Step::Finish {
                        state: CallState::Failed,
                        reason: "failed:stt".to_string(),
                        hangup: true,
                    });
                }
                // The result pump ended with the stream; audio feed was
                // consumed by the first pump, so recovery needs a fresh
                // feed. Degrade: keep the call up, the silence timer will
                // reprompt and eventually end it.
                return Ok(Step::Continue);
            }
        };

        let latency_ms = self.last_audio.lock().elapsed().as_millis() as u64;

        if !transcript.is_final {
            if self.playing.is_some() && self.crosses_barge_in(&transcript) {
                self.barge_in().await;
            }
            return Ok(Step::Continue);
        }

        metrics::histogram!("stt_latency_ms").record(latency_ms as f64);
        self.emit(EventPayload::SttTranscribed {
            text: transcript.text.clone(),
            confidence: transcript.confidence,
            is_final: true,
            provider: self.stt_provider_name.clone(),
            latency_ms,
        })
        .await;

        if transcript.text.trim().is_empty() {
            return Ok(Step::Continue);
        }

        // A final can also cross the threshold mid-playback.
        if self.playing.is_some() {
            if self.crosses_barge_in(&transcript) {
                self.barge_in().await;
            } else {
                // Too quiet to interrupt; hold it until playback finishes
                // so at most one playback is ever in flight.
                self.queued_final = Some(transcript);
                return Ok(Step::Continue);
            }
        }

        if self.turn_in_flight {
            // Strict serialization: hold the newest final until the
            // in-flight step resolves.
            self.queued_final = Some(transcript);
            return Ok(Step::Continue);
        }
        self.start_turn(transcript.text).await
    }

    fn crosses_barge_in(&self, transcript: &TranscriptResult) -> bool {
        crosses_barge_in(&self.config.limits, transcript)
    }

    /// Cancel synthesis and playback because the caller started speaking.
    async fn barge_in(&mut self) {
        tracing::debug!(call_id = %self.call.id, "barge-in");
        metrics::counter!("barge_ins_total").increment(1);

        if let Some(task) = self.synth_task.take() {
            task.abort();
        }
        if let Some(handle) = self.playing.take() {
            self.playbacks.remove(&handle.0);
            if let Err(e) = self.deps.telephony.stop_playback(&handle).await {
                tracing::warn!(call_id = %self.call.id, error = %e, "stop_playback failed");
            }
        }
        // Interrupting the greeting still counts as completing it.
        if self.awaiting_greeting {
            self.awaiting_greeting = false;
            if self.call.transition(CallState::Active).is_ok() {
                if let Err(e) = self.deps.store.save(&self.call).await {
                    tracing::warn!(call_id = %self.call.id, error = %e, "save failed");
                }
            }
        }
        self.barged_in = true;
    }

    async fn start_turn(&mut self, user_text: String) -> Result<Step, crate::SessionError> {
        let Some(conversation) = self.conversation.as_mut() else {
            return Ok(Step::Continue);
        };
        if !conversation.begin_turn() {
            tracing::info!(call_id = %self.call.id, "turn budget exhausted");
            return Ok(Step::Finish {
                state: CallState::Ended,
                reason: "resolution:max_turns".to_string(),
                hangup: true,
            });
        }
        let conversation_id = conversation.conversation_id.clone();

        self.barged_in = false;
        let context = self
            .interrupted_reply
            .take()
            .map(|text| serde_json::json!({ "interrupted_reply": text }));

        let agent = self.deps.agent.clone();
        let queue = self.queue.clone();
        self.turn_in_flight = true;
        tokio::spawn(async move {
            let started = Instant::now();
            let result = agent
                .submit_turn(&conversation_id, &user_text, context)
                .await;
            queue.push(SessionEvent::AgentDone {
                user_text,
                started,
                result,
            });
        });
        Ok(Step::Continue)
    }

    async fn handle_agent_done(
        &mut self,
        _user_text: String,
        started: Instant,
        result: Result<AgentReply, DialogError>,
    ) -> Result<Step, crate::SessionError> {
        self.turn_in_flight = false;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.emit_error(ErrorComponent::Llm, &e.to_string(), "submit_turn")
                    .await;
                self.turn_failures += 1;
                if self.turn_failures >= self.config.limits.max_agent_retries {
                    return Ok(Step::Finish {
                        state: CallState::Ended,
                        reason: "failed:agent_unavailable".to_string(),
                        hangup: true,
                    });
                }
                self.spawn_synthesis(
                    self.config.limits.apology_text.clone(),
                    UtteranceKind::Prompt,
                );
                return Ok(Step::Continue);
            }
        };

        self.turn_failures = 0;
        let latency_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("llm_latency_ms").record(latency_ms as f64);
        self.emit(EventPayload::LlmResponded {
            agent_id: self
                .call
                .agent_id
                .clone()
                .unwrap_or_default(),
            response_text: reply.text.clone(),
            latency_ms,
        })
        .await;

        // The caller spoke over the previous reply while this step was in
        // flight: the reply was never played. Default policy keeps it as
        // context for the next turn.
        if self.barged_in {
            if self.config.limits.barge_in_policy == BargeInPolicy::Keep && !reply.text.is_empty()
            {
                self.interrupted_reply = Some(reply.text);
            }
            return self.drain_queued_final().await;
        }

        if let Some(action) = &reply.action {
            match action.kind {
                AgentActionKind::Transfer | AgentActionKind::Escalate => {
                    let transfer_type = match action.params.get("type").and_then(|v| v.as_str()) {
                        Some("agent") => TransferType::Agent,
                        Some("external") => TransferType::External,
                        _ => TransferType::Queue,
                    };
                    let target = action
                        .params
                        .get("target")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let reason = action
                        .params
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    if !self.transfer_target_allowed(&target) {
                        self.emit_error(
                            ErrorComponent::Internal,
                            &format!("transfer target {target:?} not allowed"),
                            "routing",
                        )
                        .await;
                        return Ok(Step::Continue);
                    }
                    return self.handle_transfer(transfer_type, target, reason).await;
                }
                AgentActionKind::End => {
                    if reply.text.is_empty() {
                        return Ok(Step::Finish {
                            state: CallState::Ended,
                            reason: "completed".to_string(),
                            hangup: true,
                        });
                    }
                    self.spawn_synthesis(
                        reply.text,
                        UtteranceKind::Farewell {
                            end_reason: "completed".to_string(),
                        },
                    );
                    return Ok(Step::Continue);
                }
                // Tool calls are executed inside the agent service; seeing
                // one here means the reply text still gets spoken.
                AgentActionKind::Tool => {}
            }
        }

        if reply.is_terminal() {
            self.spawn_synthesis(
                reply.text,
                UtteranceKind::Farewell {
                    end_reason: "completed".to_string(),
                },
            );
        } else if !reply.text.is_empty() {
            self.spawn_synthesis(reply.text, UtteranceKind::Reply);
        } else {
            // Nothing to play: release any final held during this step.
            return self.drain_queued_final().await;
        }
        Ok(Step::Continue)
    }

    fn transfer_target_allowed(&self, target: &str) -> bool {
        match self.agent_settings.as_ref() {
            Some(settings) if !settings.routing.allowed_transfer_targets.is_empty() => settings
                .routing
                .allowed_transfer_targets
                .iter()
                .any(|t| t == target),
            _ => true,
        }
    }

    /// Process a final that arrived while a dialog step was in flight.
    async fn drain_queued_final(&mut self) -> Result<Step, crate::SessionError> {
        match self.queued_final.take() {
            Some(transcript) => self.start_turn(transcript.text).await,
            None => Ok(Step::Continue),
        }
    }

    fn spawn_synthesis(&mut self, text: String, kind: UtteranceKind) {
        let Some(tts) = self.tts.clone() else { return };
        let tts_config = self.tts_config.clone();
        let queue = self.queue.clone();
        self.synth_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let result = tts.synthesize(&text, &tts_config).await;
            queue.push(SessionEvent::SynthesisDone {
                text,
                kind,
                started,
                result,
            });
        }));
    }

    async fn handle_synthesis_done(
        &mut self,
        text: String,
        kind: UtteranceKind,
        started: Instant,
        result: Result<Bytes, SpeechError>,
    ) -> Result<Step, crate::SessionError> {
        self.synth_task = None;

        // Stale synthesis that finished right as the caller barged in.
        if self.barged_in && kind != UtteranceKind::Greeting {
            return Ok(Step::Continue);
        }

        let audio = match result {
            Ok(audio) => audio,
            Err(e) => {
                self.emit_error(ErrorComponent::Tts, &e.to_string(), "synthesize")
                    .await;
                // Canned fallback so the caller never hears dead air.
                let fallback =
                    PlaybackSource::MediaUri(self.config.limits.fallback_apology_media.clone());
                return self.play(fallback, kind).await;
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("tts_latency_ms").record(latency_ms as f64);
        self.emit(EventPayload::TtsGenerated {
            text,
            provider: self.tts.as_ref().map(|t| t.name().to_string()).unwrap_or_default(),
            voice_id: self.tts_config.voice_id.clone(),
            latency_ms,
            audio_bytes: audio.len(),
        })
        .await;

        let source = PlaybackSource::Audio {
            data: audio,
            encoding: self.config.audio.encoding,
            sample_rate: self.config.audio.sample_rate,
        };
        self.play(source, kind).await
    }

    async fn play(
        &mut self,
        source: PlaybackSource,
        kind: UtteranceKind,
    ) -> Result<Step, crate::SessionError> {
        match self.deps.telephony.play(&self.call.channel_id, source).await {
            Ok(handle) => {
                self.playbacks
                    .insert(handle.0.clone(), self.call.channel_id.clone());
                self.playing = Some(handle);
                if let UtteranceKind::Farewell { end_reason } = kind {
                    self.end_after_playback = Some(end_reason);
                }
                Ok(Step::Continue)
            }
            Err(e) => {
                self.emit_error(ErrorComponent::Tc, &e.to_string(), "play").await;
                // Skip the utterance rather than kill the call; greeting
                // failure still moves the call to active.
                if kind == UtteranceKind::Greeting {
                    self.awaiting_greeting = false;
                    self.call.transition(CallState::Active)?;
                    self.deps.store.save(&self.call).await?;
                }
                if let UtteranceKind::Farewell { end_reason } = kind {
                    return Ok(Step::Finish {
                        state: CallState::Ended,
                        reason: end_reason,
                        hangup: true,
                    });
                }
                Ok(Step::Continue)
            }
        }
    }

    async fn on_playback_done(
        &mut self,
        playback_id: &str,
        success: bool,
    ) -> Result<Step, crate::SessionError> {
        let matches = self
            .playing
            .as_ref()
            .map(|h| h.0 == playback_id)
            .unwrap_or(false);
        if !matches {
            return Ok(Step::Continue);
        }
        self.playing = None;
        self.playbacks.remove(playback_id);

        if !success {
            self.emit_error(ErrorComponent::Tc, "playback failed", "play").await;
        }

        if self.awaiting_greeting {
            self.awaiting_greeting = false;
            self.call.transition(CallState::Active)?;
            self.deps.store.save(&self.call).await?;
        }

        if let Some(reason) = self.end_after_playback.take() {
            return Ok(Step::Finish {
                state: CallState::Ended,
                reason,
                hangup: true,
            });
        }
        self.drain_queued_final().await
    }

    async fn on_silence(&mut self) -> Result<Step, crate::SessionError> {
        // Only prompt while the dialog is live and nobody is speaking.
        if self.call.state != CallState::Active
            || self.playing.is_some()
            || self.turn_in_flight
        {
            return Ok(Step::Continue);
        }
        if self.silence_prompted {
            tracing::info!(call_id = %self.call.id, "second silence window, ending call");
            return Ok(Step::Finish {
                state: CallState::Ended,
                reason: "resolution:timeout".to_string(),
                hangup: true,
            });
        }
        self.silence_prompted = true;
        self.spawn_synthesis(
            self.config.limits.silence_prompt_text.clone(),
            UtteranceKind::Prompt,
        );
        Ok(Step::Continue)
    }

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------

    async fn handle_transfer(
        &mut self,
        transfer_type: TransferType,
        target: String,
        reason: Option<String>,
    ) -> Result<Step, crate::SessionError> {
        if self.call.state != CallState::Active {
            self.emit_error(
                ErrorComponent::Internal,
                &format!("transfer requested in state {}", self.call.state),
                "transfer",
            )
            .await;
            return Ok(Step::Continue);
        }
        self.call.transition(CallState::Transferring)?;
        self.deps.store.save(&self.call).await?;

        if let Some(handle) = self.playing.take() {
            self.playbacks.remove(&handle.0);
            let _ = self.deps.telephony.stop_playback(&handle).await;
        }

        let mut attempt = self.bridge_to(&transfer_type, &target).await;
        if let Err(e) = &attempt {
            self.emit_error(ErrorComponent::Tc, &e.to_string(), "transfer").await;
            tracing::warn!(call_id = %self.call.id, error = %e, "transfer failed, retrying once");
            attempt = self.bridge_to(&transfer_type, &target).await;
        }

        match attempt {
            Ok(()) => {
                self.call.transition(CallState::Transferred)?;
                self.deps.store.save(&self.call).await?;
                self.emit(EventPayload::CallTransferred {
                    transfer_type,
                    target,
                    reason,
                })
                .await;
                // Terminal from this service's point of view; the bridged
                // legs live on inside the TC.
                Ok(Step::Finish {
                    state: CallState::Ended,
                    reason: "transferred".to_string(),
                    hangup: false,
                })
            }
            Err(e) => {
                self.emit_error(ErrorComponent::Tc, &e.to_string(), "transfer").await;
                Ok(Step::Finish {
                    state: CallState::Ended,
                    reason: "failed:transfer".to_string(),
                    hangup: true,
                })
            }
        }
    }

    async fn bridge_to(
        &self,
        transfer_type: &TransferType,
        target: &str,
    ) -> Result<(), voicebridge_core::TelephonyError> {
        let endpoint = match transfer_type {
            TransferType::Queue => format!("Local/{target}@queues"),
            TransferType::Agent => format!("PJSIP/{target}"),
            TransferType::External => target.to_string(),
        };
        let bridge_id = self.deps.telephony.create_bridge("mixing").await?;
        self.deps
            .telephony
            .add_to_bridge(&bridge_id, &self.call.channel_id)
            .await?;
        let leg = self
            .deps
            .telephony
            .originate(&endpoint, &self.call.callee_number)
            .await?;
        self.deps.telephony.add_to_bridge(&bridge_id, &leg).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn reject(&mut self, reason: &str, message: &str) -> Step {
        self.emit_error(ErrorComponent::Internal, message, "resolver").await;
        let _ = self
            .deps
            .telephony
            .hangup(&self.call.channel_id, Some(HangupReason::Normal))
            .await;
        Step::Finish {
            state: CallState::Ended,
            reason: reason.to_string(),
            hangup: false,
        }
    }

    /// Leave the store in a consistent terminal state and emit `call.ended`
    /// exactly once, whatever path got us here.
    async fn finish(&mut self, state: CallState, reason: String, hangup: bool) {
        for task in self.pump_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.synth_task.take() {
            task.abort();
        }
        if let Some(handle) = self.playing.take() {
            self.playbacks.remove(&handle.0);
            let _ = self.deps.telephony.stop_playback(&handle).await;
        }
        if let Some(conversation) = self.conversation.as_mut() {
            if conversation.is_active() {
                conversation.close();
                let _ = self
                    .deps
                    .agent
                    .end_conversation(&conversation.conversation_id, Some(&reason))
                    .await;
            }
        }
        if hangup {
            let _ = self
                .deps
                .telephony
                .hangup(&self.call.channel_id, Some(HangupReason::Normal))
                .await;
        }

        if !self.call.state.is_terminal() {
            let target = if self.call.state.can_transition_to(state) {
                state
            } else {
                CallState::Failed
            };
            if let Err(e) = self.call.transition(target) {
                tracing::error!(call_id = %self.call.id, error = %e, "terminal transition failed");
            }
            self.call.end_reason = Some(reason.clone());
            if let Err(e) = self.deps.store.save(&self.call).await {
                tracing::error!(call_id = %self.call.id, error = %e, "terminal save failed");
            }

            let duration_ms = self.call.duration().map(|d| d.num_milliseconds());
            self.emit(EventPayload::CallEnded {
                direction: self.call.direction,
                caller_number: self.call.caller_number.clone(),
                callee_number: self.call.callee_number.clone(),
                state: self.call.state,
                reason: reason.clone(),
                duration_ms,
            })
            .await;
        }

        metrics::counter!("calls_ended_total", "reason" => reason_class(&reason)).increment(1);
        tracing::info!(
            call_id = %self.call.id,
            channel_id = %self.call.channel_id,
            state = %self.call.state,
            reason = %reason,
            "call finished"
        );
    }

    // ------------------------------------------------------------------
    // Event emission
    // ------------------------------------------------------------------

    /// Publish failures never fail the operation: the store is the source
    /// of truth and the bus a projection.
    async fn emit(&self, payload: EventPayload) {
        let mut event = CallEvent::new(self.call.id.clone(), self.call.tenant_id.clone(), payload);
        if let Some(conversation_id) = &self.call.conversation_id {
            event = event.with_conversation(conversation_id.clone());
        }
        if let Err(e) = self.deps.publisher.publish(&event).await {
            tracing::warn!(
                call_id = %self.call.id,
                event_type = event.event_type(),
                error = %e,
                "event publish failed"
            );
        }
    }

    async fn emit_error(&self, component: ErrorComponent, message: &str, source: &str) {
        self.emit(EventPayload::Error {
            error_type: component,
            message: message.to_string(),
            component: source.to_string(),
        })
        .await;
    }
}

/// Whether an interim transcript interrupts the agent. Length and
/// confidence are independent criteria: either one crossing its threshold
/// trips barge-in, and a zero threshold disables that criterion.
fn crosses_barge_in(limits: &CallLimitsConfig, transcript: &TranscriptResult) -> bool {
    let by_length = limits.barge_in_min_chars > 0
        && transcript.text.trim().len() >= limits.barge_in_min_chars;
    let by_confidence = limits.barge_in_min_confidence > 0.0
        && transcript.confidence >= limits.barge_in_min_confidence;
    by_length || by_confidence
}

fn reason_class(reason: &str) -> &'static str {
    if reason.starts_with("rejected:") {
        "rejected"
    } else if reason.starts_with("failed:") {
        "failed"
    } else if reason.starts_with("resolution:") {
        "timeout"
    } else if reason.starts_with("lost:") {
        "lost"
    } else {
        "completed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min_chars: usize, min_confidence: f32) -> CallLimitsConfig {
        CallLimitsConfig {
            barge_in_min_chars: min_chars,
            barge_in_min_confidence: min_confidence,
            ..Default::default()
        }
    }

    #[test]
    fn test_barge_in_length_alone_suffices() {
        // Long but low-confidence interim, routine for live ASR.
        let transcript = TranscriptResult::interim("wait wait hold on a second", 0.1);
        assert!(crosses_barge_in(&limits(6, 0.6), &transcript));
    }

    #[test]
    fn test_barge_in_confidence_alone_suffices() {
        let transcript = TranscriptResult::interim("no", 0.95);
        assert!(crosses_barge_in(&limits(6, 0.6), &transcript));
    }

    #[test]
    fn test_barge_in_neither_criterion_crossed() {
        let transcript = TranscriptResult::interim("uh", 0.3);
        assert!(!crosses_barge_in(&limits(6, 0.6), &transcript));
    }

    #[test]
    fn test_barge_in_zero_threshold_disables_criterion() {
        // Confidence criterion off: a short high-confidence interim no
        // longer interrupts.
        let short = TranscriptResult::interim("no", 0.95);
        assert!(!crosses_barge_in(&limits(6, 0.0), &short));

        // Length criterion off: only confidence counts.
        let long_unsure = TranscriptResult::interim("wait wait hold on a second", 0.1);
        assert!(!crosses_barge_in(&limits(0, 0.6), &long_unsure));
        let confident = TranscriptResult::interim("stop", 0.9);
        assert!(crosses_barge_in(&limits(0, 0.6), &confident));
    }

    #[test]
    fn test_reason_classes() {
        assert_eq!(reason_class("completed"), "completed");
        assert_eq!(reason_class("caller_hangup"), "completed");
        assert_eq!(reason_class("rejected:capacity"), "rejected");
        assert_eq!(reason_class("failed:agent_unavailable"), "failed");
        assert_eq!(reason_class("resolution:timeout"), "timeout");
        assert_eq!(reason_class("lost:tc_reset"), "lost");
    }
}
