//! Voicebridge entry point: wire every component and serve.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use voicebridge_config::{load_settings, Settings};
use voicebridge_dialog::{CachedResolver, HttpAgentClient, HttpTenantResolver};
use voicebridge_events::{KafkaEventPublisher, KafkaPublisherConfig};
use voicebridge_persistence::{RedisCallStore, RedisConfig};
use voicebridge_pipeline::{
    AdmissionController, LiveChannelSource, SessionConfig, SessionDeps, SessionSupervisor,
    SttFactory, TtsFactory,
};
use voicebridge_server::{create_router, init_metrics, AppState};
use voicebridge_speech::{create_stt_provider, create_tts_provider};
use voicebridge_telephony::{
    AriClient, AriConfig, EventReader, LiveChannels, ReaderConfig, TcFeed,
};

/// Adapter between the supervisor's live-channel listing and the TC
/// reader's resync hook.
struct SupervisorChannels(Arc<SessionSupervisor>);

#[async_trait]
impl LiveChannels for SupervisorChannels {
    async fn live_channels(&self) -> Vec<String> {
        LiveChannelSource::live_channels(&*self.0).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing is not up yet; configuration failures go to stderr.
    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&settings);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting voicebridge");
    let metrics_handle = init_metrics();

    // Call state store.
    let redis = Arc::new(
        RedisCallStore::connect(RedisConfig {
            url: settings.store.url.clone(),
            password: settings.store.password.clone(),
            db: settings.store.db,
            call_ttl: Duration::from_secs(settings.store.call_ttl_secs),
        })
        .await?,
    );

    // Event bus producer.
    let publisher = Arc::new(KafkaEventPublisher::new(KafkaPublisherConfig {
        brokers: settings.events.brokers.clone(),
        topic_prefix: settings.events.topic_prefix.clone(),
        retries: settings.events.publish_retries,
    })?);
    tracing::info!(
        brokers = %settings.events.brokers,
        prefix = %settings.events.topic_prefix,
        "event publisher ready"
    );

    // External collaborators.
    let telephony = Arc::new(AriClient::new(AriConfig {
        base_url: settings.tc.ari_url.clone(),
        username: settings.tc.username.clone(),
        password: settings.tc.password.clone(),
        app_name: settings.tc.app_name.clone(),
        request_timeout: Duration::from_secs(settings.tc.request_timeout_secs),
    })?);
    let resolver = Arc::new(CachedResolver::new(
        HttpTenantResolver::new(
            settings.resolver.url.clone(),
            Duration::from_secs(settings.resolver.request_timeout_secs),
        )?,
        Duration::from_secs(settings.resolver.cache_ttl_secs),
    ));
    let agent = Arc::new(HttpAgentClient::new(
        settings.agent.url.clone(),
        Duration::from_secs(settings.agent.turn_deadline_secs),
    )?);

    let admission = Arc::new(AdmissionController::new(
        redis.clone(),
        settings.calls.global_max,
    ));

    let stt_factory: SttFactory = Arc::new(create_stt_provider);
    let tts_factory: TtsFactory = Arc::new(create_tts_provider);

    let deps = SessionDeps {
        telephony: telephony.clone(),
        resolver,
        agent,
        store: redis.clone(),
        publisher,
        admission,
        stt: stt_factory,
        tts: tts_factory,
    };
    let supervisor = SessionSupervisor::new(
        deps,
        SessionConfig {
            limits: settings.calls.clone(),
            audio: settings.audio.clone(),
        },
    );

    // TC event reader with reconnect; its feed drives the supervisor.
    let (reader, mut feed) = EventReader::spawn(
        ReaderConfig {
            ws_url: settings.tc_ws_url(),
            username: settings.tc.username.clone(),
            password: settings.tc.password.clone(),
            backoff_initial: Duration::from_millis(settings.tc.backoff_initial_ms),
            backoff_max: Duration::from_millis(settings.tc.backoff_max_ms),
            max_reconnects: settings.tc.max_reconnects,
        },
        telephony,
        Arc::new(SupervisorChannels(supervisor.clone())),
    );
    let reader = Arc::new(reader);

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            while let Some(item) = feed.recv().await {
                match item {
                    TcFeed::Event(event) => supervisor.dispatch(event).await,
                    TcFeed::Fatal(e) => {
                        tracing::error!(error = %e, "TC event feed is unrecoverable");
                        supervisor.on_tc_fatal();
                    }
                }
            }
        });
    }

    let state = AppState::new(supervisor.clone(), metrics_handle)
        .with_redis(redis)
        .with_tc_reader(reader);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP is down; drain live calls within the grace period.
    supervisor
        .shutdown(Duration::from_secs(settings.calls.shutdown_grace_secs))
        .await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.observability.log_level.clone()));
    if settings.observability.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
