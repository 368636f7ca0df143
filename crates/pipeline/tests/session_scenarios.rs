//! End-to-end session scenarios over in-memory collaborators.
//!
//! Every external seam (TC, STT, TTS, agent service, tenant directory,
//! store, event bus) is faked in-process; the orchestrator under test is
//! the real one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use voicebridge_core::CallStore;

use voicebridge_config::{AudioConfig, CallLimitsConfig};
use voicebridge_core::{
    AgentAction, AgentActionKind, AgentClient, AgentReply, AgentSettings, CallState, ChannelInfo,
    ConversationStart, DialogError, DidRecord, EventPayload, HangupReason, PlaybackHandle,
    PlaybackSource, ProviderSettings, SpeechError, SttConfig, SttProvider, SttStream, TcEvent,
    TelephonyClient, TelephonyError, TenantResolver, TranscriptResult, TtsConfig, TtsProvider,
    VoiceConfig,
};
use voicebridge_events::RecordingEventPublisher;
use voicebridge_persistence::MemoryCallStore;
use voicebridge_pipeline::{
    AdmissionController, SessionConfig, SessionDeps, SessionSupervisor, SttFactory, TtsFactory,
};

// ---------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeTelephony {
    /// Ordered action log: "answer:<chan>", "play:<id>", "stop:<id>", ...
    log: Mutex<Vec<String>>,
    playback_seq: AtomicUsize,
    /// How long a playback "runs" before PlaybackFinished is dispatched.
    playback_duration: Mutex<Duration>,
    supervisor: Mutex<Option<Arc<SessionSupervisor>>>,
}

impl FakeTelephony {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            playback_duration: Mutex::new(Duration::from_millis(30)),
            ..Default::default()
        })
    }

    fn attach(&self, supervisor: Arc<SessionSupervisor>) {
        *self.supervisor.lock() = Some(supervisor);
    }

    fn set_playback_duration(&self, duration: Duration) {
        *self.playback_duration.lock() = duration;
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

#[async_trait]
impl TelephonyClient for FakeTelephony {
    async fn answer(&self, channel_id: &str) -> Result<(), TelephonyError> {
        self.record(format!("answer:{channel_id}"));
        Ok(())
    }

    async fn play(
        &self,
        channel_id: &str,
        _source: PlaybackSource,
    ) -> Result<PlaybackHandle, TelephonyError> {
        let id = format!("pb-{}", self.playback_seq.fetch_add(1, Ordering::SeqCst));
        self.record(format!("play:{channel_id}:{id}"));

        // The TC reports completion asynchronously.
        let supervisor = self.supervisor.lock().clone();
        let duration = *self.playback_duration.lock();
        let playback_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(supervisor) = supervisor {
                supervisor
                    .dispatch(TcEvent::PlaybackFinished { playback_id })
                    .await;
            }
        });
        Ok(PlaybackHandle(id))
    }

    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<(), TelephonyError> {
        self.record(format!("stop:{}", handle.0));
        Ok(())
    }

    async fn hangup(
        &self,
        channel_id: &str,
        reason: Option<HangupReason>,
    ) -> Result<(), TelephonyError> {
        let reason = reason.map(|r| r.as_str()).unwrap_or("none");
        self.record(format!("hangup:{channel_id}:{reason}"));
        Ok(())
    }

    async fn create_bridge(&self, kind: &str) -> Result<String, TelephonyError> {
        self.record(format!("bridge:{kind}"));
        Ok("bridge-1".to_string())
    }

    async fn add_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), TelephonyError> {
        self.record(format!("add:{bridge_id}:{channel_id}"));
        Ok(())
    }

    async fn originate(&self, endpoint: &str, _caller_id: &str) -> Result<String, TelephonyError> {
        self.record(format!("originate:{endpoint}"));
        Ok("chan-out-1".to_string())
    }

    async fn channel_info(&self, _: &str) -> Result<Option<ChannelInfo>, TelephonyError> {
        Ok(None)
    }
}

/// Scripted STT: emits a fixed timeline of results after the stream opens.
struct FakeStt {
    script: Mutex<Vec<(Duration, TranscriptResult)>>,
}

impl FakeStt {
    fn scripted(script: Vec<(Duration, TranscriptResult)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }

    fn silent() -> Arc<Self> {
        Self::scripted(Vec::new())
    }
}

#[async_trait]
impl SttProvider for FakeStt {
    async fn open_stream(&self, _: &SttConfig) -> Result<SttStream, SpeechError> {
        let (audio_tx, _audio_rx) = mpsc::channel::<Bytes>(8);
        let (result_tx, result_rx) = mpsc::channel(32);
        let script: Vec<_> = self.script.lock().drain(..).collect();
        tokio::spawn(async move {
            for (delay, result) in script {
                tokio::time::sleep(delay).await;
                if result_tx.send(Ok(result)).await.is_err() {
                    return;
                }
            }
        });
        Ok(SttStream {
            audio: audio_tx,
            results: result_rx,
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

struct FakeTts;

#[async_trait]
impl TtsProvider for FakeTts {
    async fn synthesize(&self, text: &str, _: &TtsConfig) -> Result<Bytes, SpeechError> {
        // Deterministic size so tts.generated payloads are assertable.
        Ok(Bytes::from(vec![0u8; text.len() * 100]))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<mpsc::Receiver<Result<Bytes, SpeechError>>, SpeechError> {
        let audio = self.synthesize(text, config).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(audio)).await;
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Scripted agent: replies in order, then repeats the last entry.
struct FakeAgent {
    greeting: Option<String>,
    replies: Mutex<Vec<Result<AgentReply, DialogError>>>,
    turns: AtomicUsize,
}

impl FakeAgent {
    fn new(greeting: Option<&str>, replies: Vec<Result<AgentReply, DialogError>>) -> Arc<Self> {
        Arc::new(Self {
            greeting: greeting.map(String::from),
            replies: Mutex::new(replies),
            turns: AtomicUsize::new(0),
        })
    }

    fn reply(text: &str) -> AgentReply {
        AgentReply {
            turn_id: "t".to_string(),
            text: text.to_string(),
            intent: None,
            action: None,
            state: serde_json::Value::Null,
            finish_reason: None,
        }
    }

    fn final_reply(text: &str) -> AgentReply {
        AgentReply {
            action: Some(AgentAction {
                kind: AgentActionKind::End,
                params: serde_json::Value::Null,
            }),
            ..Self::reply(text)
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn create_conversation(
        &self,
        _tenant_id: &str,
        agent_id: &str,
        _initial_state: serde_json::Value,
    ) -> Result<ConversationStart, DialogError> {
        Ok(ConversationStart {
            conversation_id: "conv-1".to_string(),
            agent_id: agent_id.to_string(),
            agent_name: "Acme Assistant".to_string(),
            greeting: self.greeting.clone(),
            state: serde_json::Value::Null,
        })
    }

    async fn submit_turn(
        &self,
        _conversation_id: &str,
        _user_text: &str,
        _context: Option<serde_json::Value>,
    ) -> Result<AgentReply, DialogError> {
        self.turns.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock();
        if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies
                .first()
                .map(|r| match r {
                    Ok(reply) => Ok(reply.clone()),
                    Err(DialogError::Timeout) => Err(DialogError::Timeout),
                    Err(e) => Err(DialogError::Network(e.to_string())),
                })
                .unwrap_or_else(|| Ok(Self::reply("ok")))
        }
    }

    async fn update_context(&self, _: &str, _: serde_json::Value) -> Result<(), DialogError> {
        Ok(())
    }

    async fn end_conversation(&self, _: &str, _: Option<&str>) -> Result<(), DialogError> {
        Ok(())
    }
}

struct FakeResolver {
    routable: Vec<(String, String)>,
    tenant_cap: Option<usize>,
}

#[async_trait]
impl TenantResolver for FakeResolver {
    async fn lookup_did(&self, number: &str) -> Result<DidRecord, DialogError> {
        self.routable
            .iter()
            .find(|(did, _)| did == number)
            .map(|(did, tenant)| DidRecord {
                did: did.clone(),
                tenant_id: tenant.clone(),
                enabled: true,
            })
            .ok_or_else(|| DialogError::NotFound(number.to_string()))
    }

    async fn provider_settings(&self, _: &str) -> Result<ProviderSettings, DialogError> {
        Ok(ProviderSettings {
            stt_provider: "fake".to_string(),
            stt_config: serde_json::Value::Null,
            tts_provider: "fake".to_string(),
            tts_config: serde_json::Value::Null,
            llm_provider: "fake".to_string(),
            llm_config: serde_json::Value::Null,
        })
    }

    async fn agent_config(&self, _: &str) -> Result<AgentSettings, DialogError> {
        Ok(AgentSettings {
            agent_id: "A1".to_string(),
            system_prompt: String::new(),
            voice: VoiceConfig {
                provider: "fake".to_string(),
                voice_id: "v1".to_string(),
                rate: 1.0,
                pitch: 1.0,
                language: "en-US".to_string(),
            },
            routing: Default::default(),
            safety: voicebridge_core::SafetyConfig {
                max_concurrent_calls: self.tenant_cap,
                ..Default::default()
            },
            flow: Default::default(),
        })
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    telephony: Arc<FakeTelephony>,
    store: Arc<MemoryCallStore>,
    publisher: Arc<RecordingEventPublisher>,
    supervisor: Arc<SessionSupervisor>,
}

fn limits() -> CallLimitsConfig {
    CallLimitsConfig {
        global_max: 100,
        call_timeout_secs: 30,
        silence_timeout_secs: 600,
        max_agent_retries: 2,
        ..Default::default()
    }
}

fn build(
    stt: Arc<FakeStt>,
    agent: Arc<FakeAgent>,
    resolver: FakeResolver,
    limits: CallLimitsConfig,
) -> Harness {
    let telephony = FakeTelephony::new();
    let store = Arc::new(MemoryCallStore::new());
    let publisher = Arc::new(RecordingEventPublisher::new());
    let admission = Arc::new(AdmissionController::new(store.clone(), limits.global_max));

    let stt_factory: SttFactory = {
        let stt = stt.clone();
        Arc::new(move |_: &str, _: &serde_json::Value| Ok(stt.clone() as Arc<dyn SttProvider>))
    };
    let tts_factory: TtsFactory =
        Arc::new(|_: &str, _: &serde_json::Value| Ok(Arc::new(FakeTts) as Arc<dyn TtsProvider>));

    let deps = SessionDeps {
        telephony: telephony.clone(),
        resolver: Arc::new(resolver),
        agent,
        store: store.clone(),
        publisher: publisher.clone(),
        admission,
        stt: stt_factory,
        tts: tts_factory,
    };
    let supervisor = SessionSupervisor::new(
        deps,
        SessionConfig {
            limits,
            audio: AudioConfig::default(),
        },
    );
    telephony.attach(supervisor.clone());

    Harness {
        telephony,
        store,
        publisher,
        supervisor,
    }
}

fn channel(id: &str, caller: &str, callee: &str) -> ChannelInfo {
    ChannelInfo {
        id: id.to_string(),
        caller_number: caller.to_string(),
        connected_number: callee.to_string(),
        ..Default::default()
    }
}

async fn start_call(harness: &Harness, chan: &str, caller: &str, callee: &str) {
    harness
        .supervisor
        .dispatch(TcEvent::StasisStart {
            channel: channel(chan, caller, callee),
        })
        .await;
}

/// Poll until the call on `chan` reaches a terminal state.
async fn wait_terminal(harness: &Harness, chan: &str) -> voicebridge_core::Call {
    for _ in 0..200 {
        if let Some(call) = harness.store.get_by_channel(chan).await.unwrap() {
            if call.state.is_terminal() {
                return call;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("call on {chan} never reached a terminal state");
}

async fn wait_state(harness: &Harness, chan: &str, state: CallState) -> voicebridge_core::Call {
    for _ in 0..200 {
        if let Some(call) = harness.store.get_by_channel(chan).await.unwrap() {
            if call.state == state {
                return call;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("call on {chan} never reached {state}");
}

fn interim(text: &str, confidence: f32) -> TranscriptResult {
    TranscriptResult::interim(text, confidence)
}

fn final_t(text: &str, confidence: f32) -> TranscriptResult {
    TranscriptResult::final_result(text, confidence)
}

/// Assert `needle` appears as an ordered subsequence of `haystack`.
fn assert_subsequence(haystack: &[&str], needle: &[&str]) {
    let mut it = haystack.iter();
    for expected in needle {
        assert!(
            it.any(|t| t == expected),
            "expected {expected:?} in order within {haystack:?}"
        );
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path() {
    let stt = FakeStt::scripted(vec![
        (Duration::from_millis(150), final_t("I need help with my bill", 0.94)),
        (Duration::from_millis(500), final_t("It's 4417", 0.91)),
    ]);
    let agent = FakeAgent::new(
        Some("Hello, this is Acme."),
        vec![
            Ok(FakeAgent::reply("Sure, can you share your account number?")),
            Ok(FakeAgent::final_reply("Got it, your bill is sorted. Bye!")),
        ],
    );
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-1", "+15550100", "+15550200").await;
    let call = wait_terminal(&harness, "chan-1").await;

    assert_eq!(call.state, CallState::Ended);
    assert_eq!(call.end_reason.as_deref(), Some("completed"));
    assert_eq!(call.tenant_id, "T1");
    assert_eq!(call.conversation_id.as_deref(), Some("conv-1"));
    assert!(call.duration().is_some());

    let types = harness.publisher.types_for_call(&call.id);
    // Exactly one start and one terminal event.
    assert_eq!(types.iter().filter(|t| **t == "call.started").count(), 1);
    assert_eq!(types.iter().filter(|t| **t == "call.ended").count(), 1);
    assert_eq!(types.iter().filter(|t| **t == "stt.transcribed").count(), 2);
    assert_eq!(types.iter().filter(|t| **t == "llm.responded").count(), 2);
    // Greeting plus two replies.
    assert_eq!(types.iter().filter(|t| **t == "tts.generated").count(), 3);

    assert_subsequence(
        &types,
        &[
            "call.started",
            "call.answered",
            "stt.transcribed",
            "llm.responded",
            "tts.generated",
            "call.ended",
        ],
    );

    // The terminal event carries the duration.
    let events = harness.publisher.events_for_call(&call.id);
    let ended = events
        .iter()
        .find(|e| e.event_type() == "call.ended")
        .unwrap();
    match &ended.payload {
        EventPayload::CallEnded {
            duration_ms, reason, ..
        } => {
            assert!(duration_ms.is_some());
            assert_eq!(reason, "completed");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_unroutable_did_is_rejected() {
    let harness = build(
        FakeStt::silent(),
        FakeAgent::new(None, vec![]),
        FakeResolver {
            routable: vec![],
            tenant_cap: None,
        },
        limits(),
    );

    start_call(&harness, "chan-9", "+15550100", "+15559999").await;
    let call = wait_terminal(&harness, "chan-9").await;

    assert_eq!(call.state, CallState::Ended);
    assert_eq!(call.end_reason.as_deref(), Some("rejected:unroutable"));
    assert!(call.answered_at.is_none());

    let types = harness.publisher.types_for_call(&call.id);
    assert!(types.contains(&"error.internal"));
    assert!(!types.contains(&"call.answered"));
    assert_subsequence(&types, &["call.started", "error.internal", "call.ended"]);

    // The channel was hung up.
    assert!(harness
        .telephony
        .log()
        .iter()
        .any(|l| l.starts_with("hangup:chan-9")));
}

#[tokio::test]
async fn test_capacity_rejection_leaves_others_untouched() {
    let stt = FakeStt::scripted(vec![]);
    let agent = FakeAgent::new(Some("Hi."), vec![Ok(FakeAgent::reply("ok"))]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let mut caps = limits();
    caps.global_max = 2;
    let harness = build(stt, agent, resolver, caps);

    start_call(&harness, "chan-a", "+15550101", "+15550200").await;
    wait_state(&harness, "chan-a", CallState::Active).await;
    start_call(&harness, "chan-b", "+15550102", "+15550200").await;
    wait_state(&harness, "chan-b", CallState::Active).await;

    // Third call over the cap of two.
    start_call(&harness, "chan-c", "+15550103", "+15550200").await;
    let rejected = wait_terminal(&harness, "chan-c").await;

    assert_eq!(rejected.end_reason.as_deref(), Some("rejected:capacity"));
    let types = harness.publisher.types_for_call(&rejected.id);
    assert_subsequence(&types, &["call.started", "call.ended"]);
    assert!(!types.contains(&"call.answered"));

    // Busy indication on the rejected leg only.
    assert!(harness
        .telephony
        .log()
        .iter()
        .any(|l| l == "hangup:chan-c:busy"));

    // The first two calls are unaffected.
    for chan in ["chan-a", "chan-b"] {
        let call = harness.store.get_by_channel(chan).await.unwrap().unwrap();
        assert_eq!(call.state, CallState::Active);
    }
}

#[tokio::test]
async fn test_duplicate_stasis_start_is_idempotent() {
    let stt = FakeStt::silent();
    let agent = FakeAgent::new(Some("Hi."), vec![]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-dup", "+15550100", "+15550200").await;
    wait_state(&harness, "chan-dup", CallState::Active).await;
    let first = harness.store.get_by_channel("chan-dup").await.unwrap().unwrap();

    start_call(&harness, "chan-dup", "+15550100", "+15550200").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = harness.store.get_by_channel("chan-dup").await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(harness.store.count_active().await.unwrap(), 1);
}

#[tokio::test]
async fn test_barge_in_stops_playback_before_next_starts() {
    // Long reply playback so the interim lands mid-utterance.
    let stt = FakeStt::scripted(vec![
        (Duration::from_millis(100), final_t("tell me everything", 0.95)),
        // Arrives while the long reply is playing.
        (Duration::from_millis(600), interim("wait wait", 0.9)),
        (Duration::from_millis(150), final_t("wait, one question first", 0.92)),
    ]);
    let agent = FakeAgent::new(
        None,
        vec![
            Ok(FakeAgent::reply(
                "Here is a very long explanation of everything you asked about",
            )),
            Ok(FakeAgent::final_reply("Sure, ask away. Bye!")),
        ],
    );
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());
    harness
        .telephony
        .set_playback_duration(Duration::from_secs(3));

    start_call(&harness, "chan-bi", "+15550100", "+15550200").await;
    let call = wait_terminal(&harness, "chan-bi").await;
    assert_eq!(call.end_reason.as_deref(), Some("completed"));

    // stop_playback on the interrupted utterance precedes the next play.
    let log = harness.telephony.log();
    let plays: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("play:"))
        .map(|(i, _)| i)
        .collect();
    let stop = log
        .iter()
        .position(|l| l.starts_with("stop:"))
        .expect("barge-in never stopped playback");
    assert!(plays.len() >= 2, "expected a playback after the barge-in");
    assert!(
        stop > plays[0] && stop < *plays.last().unwrap(),
        "stop_playback must land between the interrupted and the next playback: {log:?}"
    );
}

#[tokio::test]
async fn test_barge_in_on_long_low_confidence_interim() {
    // Length alone must interrupt: the STT is unsure (confidence 0.1) but
    // the utterance is clearly long enough.
    let stt = FakeStt::scripted(vec![
        (Duration::from_millis(100), final_t("tell me everything", 0.95)),
        (
            Duration::from_millis(600),
            interim("wait wait hold on a second", 0.1),
        ),
        (Duration::from_millis(150), final_t("one question first", 0.92)),
    ]);
    let agent = FakeAgent::new(
        None,
        vec![
            Ok(FakeAgent::reply(
                "Here is a very long explanation of everything you asked about",
            )),
            Ok(FakeAgent::final_reply("Sure, ask away. Bye!")),
        ],
    );
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());
    harness
        .telephony
        .set_playback_duration(Duration::from_secs(3));

    start_call(&harness, "chan-bi2", "+15550100", "+15550200").await;
    let call = wait_terminal(&harness, "chan-bi2").await;
    assert_eq!(call.end_reason.as_deref(), Some("completed"));

    // The low-confidence interim still stopped the in-flight playback.
    let log = harness.telephony.log();
    assert!(
        log.iter().any(|l| l.starts_with("stop:")),
        "length criterion alone should trigger barge-in: {log:?}"
    );
}

#[tokio::test]
async fn test_agent_timeouts_end_call_after_max_retries() {
    let stt = FakeStt::scripted(vec![
        (Duration::from_millis(100), final_t("hello?", 0.9)),
        (Duration::from_millis(400), final_t("are you there?", 0.9)),
    ]);
    let agent = FakeAgent::new(None, vec![Err(DialogError::Timeout)]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-to", "+15550100", "+15550200").await;
    let call = wait_terminal(&harness, "chan-to").await;

    assert_eq!(call.end_reason.as_deref(), Some("failed:agent_unavailable"));
    let types = harness.publisher.types_for_call(&call.id);
    assert_eq!(types.iter().filter(|t| **t == "error.llm").count(), 2);
    // The first failure produced an apology playback.
    assert!(types.contains(&"tts.generated"));
}

#[tokio::test]
async fn test_channel_lost_after_reconnect_ends_call() {
    let stt = FakeStt::silent();
    let agent = FakeAgent::new(Some("Hi."), vec![]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-lost", "+15550100", "+15550200").await;
    wait_state(&harness, "chan-lost", CallState::Active).await;

    // The reader resynced and found the channel gone.
    harness
        .supervisor
        .dispatch(TcEvent::ChannelLost {
            channel_id: "chan-lost".to_string(),
        })
        .await;

    let call = wait_terminal(&harness, "chan-lost").await;
    assert_eq!(call.end_reason.as_deref(), Some("lost:tc_reset"));
    // The channel is already gone; no hangup was issued for it.
    assert!(!harness
        .telephony
        .log()
        .iter()
        .any(|l| l.starts_with("hangup:chan-lost")));
}

#[tokio::test]
async fn test_per_tenant_cap() {
    let stt = FakeStt::silent();
    let agent = FakeAgent::new(Some("Hi."), vec![]);
    let resolver = FakeResolver {
        routable: vec![
            ("+15550200".to_string(), "T1".to_string()),
            ("+15550300".to_string(), "T2".to_string()),
        ],
        tenant_cap: Some(1),
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-t1a", "+15550100", "+15550200").await;
    wait_state(&harness, "chan-t1a", CallState::Active).await;

    start_call(&harness, "chan-t1b", "+15550101", "+15550200").await;
    let rejected = wait_terminal(&harness, "chan-t1b").await;
    assert_eq!(rejected.end_reason.as_deref(), Some("rejected:capacity"));

    // A different tenant still gets through.
    start_call(&harness, "chan-t2", "+15550102", "+15550300").await;
    wait_state(&harness, "chan-t2", CallState::Active).await;
}

#[tokio::test]
async fn test_shutdown_drains_active_calls() {
    let stt = FakeStt::silent();
    let agent = FakeAgent::new(Some("Hi."), vec![]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-sd", "+15550100", "+15550200").await;
    wait_state(&harness, "chan-sd", CallState::Active).await;

    // Drain with an elapsed grace period: the call is terminated.
    harness.supervisor.shutdown(Duration::from_millis(100)).await;
    let call = wait_terminal(&harness, "chan-sd").await;
    assert_eq!(call.end_reason.as_deref(), Some("resolution:shutdown"));

    // New channels are refused while draining.
    start_call(&harness, "chan-late", "+15550100", "+15550200").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness
        .store
        .get_by_channel("chan-late")
        .await
        .unwrap()
        .is_none());
    assert!(harness
        .telephony
        .log()
        .iter()
        .any(|l| l == "hangup:chan-late:busy"));
}

#[tokio::test]
async fn test_operator_transfer() {
    let stt = FakeStt::silent();
    let agent = FakeAgent::new(Some("Hi."), vec![]);
    let resolver = FakeResolver {
        routable: vec![("+15550200".to_string(), "T1".to_string())],
        tenant_cap: None,
    };
    let harness = build(stt, agent, resolver, limits());

    start_call(&harness, "chan-tr", "+15550100", "+15550200").await;
    let active = wait_state(&harness, "chan-tr", CallState::Active).await;

    harness
        .supervisor
        .transfer_call(
            &active.id,
            voicebridge_core::TransferType::Queue,
            "billing".to_string(),
            Some("caller asked".to_string()),
        )
        .await
        .unwrap();

    let call = wait_terminal(&harness, "chan-tr").await;
    assert_eq!(call.end_reason.as_deref(), Some("transferred"));

    let types = harness.publisher.types_for_call(&call.id);
    assert_subsequence(&types, &["call.transferred", "call.ended"]);

    let log = harness.telephony.log();
    assert!(log.iter().any(|l| l == "bridge:mixing"));
    assert!(log.iter().any(|l| l == "originate:Local/billing@queues"));
}
