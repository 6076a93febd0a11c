//! Application bootstrap and dependency wiring (C10).
//!
//! This module contains the composition root - the single place where every
//! component is instantiated and wired together in dependency order: config
//! validation, DB pool, resolver cache, audio store (with its background
//! uploader/reconciler/pruner), subscriber hub, transcription queue, call
//! state machine, handler registry, and finally the ingest sources, started
//! last so nothing can observe a partially-wired dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::audio_store::{
    AsyncUploader, AudioStore, CachePruner, LocalAudioStore, ObjectAudioStore, PrunerConfig,
    Reconciler, ReconcilerConfig, TieredAudioStore, UploaderConfig,
};
use crate::call_state::CallStateMachine;
use crate::error::{EngineError, EngineResult};
use crate::events::SubscriberHub;
use crate::handlers::{HandlerRegistry, RawArchivePolicy};
use crate::identity::IdentityResolver;
use crate::ingest::mqtt::{MqttConfig, MqttIngest};
use crate::ingest::upload::UploadState;
use crate::ingest::watch::{DirectoryWatchIngest, WatchConfig};
use crate::metrics;
use crate::shutdown::{AudioStoreHandle, CancellationScopes, ShutdownCoordinator};
use crate::transcription::{ReqwestSttBackend, SttBackend, TranscriptResult, TranscriptionConfig, TranscriptionQueue};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);
const PURGE_HORIZON: chrono::Duration = chrono::Duration::seconds(3600);

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SttConfig {
    Disabled,
    Endpoint(String),
}

/// Every recognized setting (§6), already validated and defaulted by the
/// binary's config layer. Bootstrap only does startup-time validation that
/// requires touching a live dependency (DB reachability).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub merge_p25_systems: bool,

    pub audio_dir: PathBuf,
    pub object_store: Option<ObjectStoreConfig>,
    pub uploader: UploaderConfig,
    pub reconciler: ReconcilerConfig,
    pub pruner: PrunerConfig,

    pub mqtt: Option<MqttConfig>,
    pub watch: Option<WatchConfig>,
    pub upload_instance_key: String,

    pub subscriber_queue_size: usize,

    pub transcription: TranscriptionConfig,
    pub stt: SttConfig,

    pub raw_archive: RawArchivePolicy,
}

/// A placeholder STT backend used when no transcription endpoint is
/// configured. Every call routed to it fails with `UpstreamSTT`, matching
/// the documented "`status = failed`, may be retried" policy rather than
/// silently skipping the call.
struct DisabledSttBackend;

#[async_trait::async_trait]
impl SttBackend for DisabledSttBackend {
    async fn transcribe(&self, _audio_path: &str) -> anyhow::Result<TranscriptResult> {
        anyhow::bail!("transcription disabled: no STT endpoint configured")
    }
}

/// Everything the HTTP layer and the shutdown sequence need a handle to.
/// Ingest sources and background sweepers are kept alive by being held
/// here even though nothing reads them directly after bootstrap; dropping
/// them would abort their tasks.
pub struct BootstrappedEngine {
    pub pool: PgPool,
    pub resolver: Arc<IdentityResolver>,
    pub call_state: Arc<CallStateMachine>,
    pub audio_store: Arc<dyn AudioStore>,
    pub hub: Arc<SubscriberHub>,
    pub transcription: Arc<TranscriptionQueue>,
    pub registry: Arc<HandlerRegistry>,
    pub upload_state: UploadState,
    scopes: CancellationScopes,
    audio_store_handle: AudioStoreHandle,
    _mqtt: Option<MqttIngest>,
    _watch: Option<DirectoryWatchIngest>,
    _reconciler: Option<Reconciler>,
    _pruner: Option<CachePruner>,
}

impl BootstrappedEngine {
    /// A child token scoped to live subscriber connections; closed as part
    /// of the shutdown sequence without disturbing ingest or background
    /// scopes.
    pub fn subscriber_scope(&self) -> tokio_util::sync::CancellationToken {
        self.scopes.subscribers.child_token()
    }

    /// Runs the ordered C9 drain sequence, consuming the engine.
    pub async fn shutdown(self) {
        let coordinator = ShutdownCoordinator::new(
            self.scopes,
            self.transcription,
            self.audio_store_handle,
            self.pool,
        );
        coordinator.shutdown().await;
    }
}

/// Builds every component in dependency order. `DATABASE_URL` unreachable is
/// the one fatal, process-exiting error; MQTT and object-store
/// unreachability at startup are logged and left to their own reconnect
/// loops per §4.10.
pub async fn bootstrap(config: EngineConfig) -> EngineResult<BootstrappedEngine> {
    if config.database_url.is_empty() {
        return Err(EngineError::ConfigInvalid("DATABASE_URL is required".into()));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| EngineError::DependencyUnreachable(format!("postgres: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| EngineError::DependencyUnreachable(format!("migration failed: {e}")))?;

    metrics::init();

    let scopes = CancellationScopes::new();

    let resolver = Arc::new(IdentityResolver::new(pool.clone(), config.merge_p25_systems));

    let (audio_store, audio_store_handle, reconciler, pruner) =
        build_audio_store(&config, &scopes).await?;

    let hub = Arc::new(SubscriberHub::new(config.subscriber_queue_size));
    hub.clone().start_heartbeat(scopes.subscribers.child_token());

    let stt_backend: Arc<dyn SttBackend> = match &config.stt {
        SttConfig::Disabled => Arc::new(DisabledSttBackend),
        SttConfig::Endpoint(endpoint) => Arc::new(ReqwestSttBackend::new(
            reqwest::Client::builder()
                .timeout(config.transcription.request_timeout)
                .build()
                .map_err(|e| EngineError::ConfigInvalid(format!("failed to build STT client: {e}")))?,
            endpoint.clone(),
        )),
    };
    let transcription = Arc::new(TranscriptionQueue::start(
        pool.clone(),
        config.transcription.clone(),
        stt_backend,
    ));

    let call_state = Arc::new(CallStateMachine::new(pool.clone(), hub.clone()));
    spawn_purge_sweep(call_state.clone(), scopes.background.child_token());

    let stt_enabled = matches!(config.stt, SttConfig::Endpoint(_));
    let registry = Arc::new(HandlerRegistry::new(
        resolver.clone(),
        call_state.clone(),
        audio_store.clone(),
        transcription.clone(),
        config.transcription.clone(),
        hub.clone(),
        pool.clone(),
        config.raw_archive.clone(),
        stt_enabled,
    ));

    let mqtt = config.mqtt.clone().map(|mqtt_config| {
        log::info!("starting mqtt ingest against {}:{}", mqtt_config.host, mqtt_config.port);
        MqttIngest::start(mqtt_config, registry.clone(), scopes.ingest.child_token())
    });

    let watch = match config.watch.clone() {
        Some(watch_config) => {
            log::info!("starting directory watch ingest at {}", watch_config.root.display());
            match DirectoryWatchIngest::start(watch_config, registry.clone(), scopes.ingest.child_token()) {
                Ok(ingest) => Some(ingest),
                Err(e) => {
                    log::warn!("directory watch ingest failed to start: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let upload_state = UploadState {
        registry: registry.clone(),
        fallback_instance_key: config.upload_instance_key.clone(),
    };

    Ok(BootstrappedEngine {
        pool,
        resolver,
        call_state,
        audio_store,
        hub,
        transcription,
        registry,
        upload_state,
        scopes,
        audio_store_handle,
        _mqtt: mqtt,
        _watch: watch,
        _reconciler: reconciler,
        _pruner: pruner,
    })
}

#[allow(clippy::type_complexity)]
async fn build_audio_store(
    config: &EngineConfig,
    scopes: &CancellationScopes,
) -> EngineResult<(Arc<dyn AudioStore>, AudioStoreHandle, Option<Reconciler>, Option<CachePruner>)> {
    let local = LocalAudioStore::new(config.audio_dir.clone());

    let Some(object_config) = &config.object_store else {
        let local = Arc::new(local);
        return Ok((local.clone(), AudioStoreHandle::Local(local), None, None));
    };

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
    let aws_config = match &object_config.region {
        Some(region) => aws_config.region(aws_sdk_s3::config::Region::new(region.clone())),
        None => aws_config,
    };
    let aws_config = aws_config.load().await;
    let mut s3_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(endpoint) = &object_config.endpoint {
        s3_builder = s3_builder.endpoint_url(endpoint.clone());
    }
    let client = aws_sdk_s3::Client::from_conf(s3_builder.build());

    let remote = Arc::new(ObjectAudioStore::new(client, object_config.bucket.clone(), object_config.prefix.clone()));
    let uploader = AsyncUploader::start(config.uploader.clone(), remote.clone());
    let reconciler = Reconciler::start(
        config.audio_dir.clone(),
        config.reconciler.clone(),
        remote.clone(),
        scopes.background.child_token(),
    );
    let pruner = CachePruner::start(
        config.audio_dir.clone(),
        config.pruner.clone(),
        remote.clone(),
        scopes.background.child_token(),
    );

    let tiered = Arc::new(TieredAudioStore::new(local, remote, uploader));
    Ok((
        tiered.clone(),
        AudioStoreHandle::Tiered(tiered),
        Some(reconciler),
        Some(pruner),
    ))
}

fn spawn_purge_sweep(call_state: Arc<CallStateMachine>, cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PURGE_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
            if let Err(e) = call_state.purge_stale(PURGE_HORIZON).await {
                log::warn!("stale-call purge sweep failed: {e}");
            }
        }
    });
}
