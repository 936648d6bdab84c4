//! Analysis engine: one question in, one [`SynthesisResult`] out.
//!
//! ```text
//! classify ──► prefetch facts ──► debate ──► synthesize ──► done
//!    │              │                │            │
//!    └──────────────┴── events ──────┴────────────┘──► EventBus
//! ```
//!
//! Shared collaborators live in an [`AnalysisContext`] built once at startup.
//! A run always ends with a `done` event carrying the result; a failed or
//! timed-out debate publishes `error` first and still synthesizes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::citations::ClaimVerifier;
use crate::config::AnalystConfig;
use crate::data::{BackendSet, QueryExecutor, QueryRegistry, RegistryError};
use crate::debate::{DebateOrchestrator, JaccardSimilarity, SessionStatus, SimilarityFn};
use crate::events::{spawn_heartbeat, EventBus, SharedEventBus, Stage, StageStatus, StreamEvent};
use crate::facts::FactExtractor;
use crate::participants::TextGenerator;
use crate::router::{ComplexityTier, DebateConfig, QuestionClassifier};
use crate::synthesis::{SynthesisResult, Synthesizer};

/// Everything a run needs, constructed once and shared by reference.
pub struct AnalysisContext {
    pub config: AnalystConfig,
    pub registry: Arc<QueryRegistry>,
    pub executor: Arc<QueryExecutor>,
    pub generator: Arc<dyn TextGenerator>,
    pub verifier: Arc<dyn ClaimVerifier>,
    pub similarity: Arc<dyn SimilarityFn>,
}

impl AnalysisContext {
    pub fn new(
        config: AnalystConfig,
        registry: Arc<QueryRegistry>,
        backends: BackendSet,
        generator: Arc<dyn TextGenerator>,
        verifier: Arc<dyn ClaimVerifier>,
    ) -> Self {
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&registry),
            backends,
            config.executor_options(),
        ));
        Self {
            config,
            registry,
            executor,
            generator,
            verifier,
            similarity: Arc::new(JaccardSimilarity::new()),
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityFn>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Per-run overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Skip classification and use this tier.
    pub tier: Option<ComplexityTier>,
    /// Replace the tier's debate shape.
    pub debate_config: Option<DebateConfig>,
    /// Replace the configured session deadline.
    pub session_deadline: Option<Duration>,
}

pub struct AnalysisEngine {
    ctx: Arc<AnalysisContext>,
    classifier: QuestionClassifier,
    generation_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl AnalysisEngine {
    pub fn new(ctx: Arc<AnalysisContext>) -> Self {
        let permits = ctx.config.debate.generation_concurrency.max(1);
        Self {
            ctx,
            classifier: QuestionClassifier::new(),
            generation_permits: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &Arc<AnalysisContext> {
        &self.ctx
    }

    /// A bus sized from config.
    pub fn new_bus(&self) -> SharedEventBus {
        let events = &self.ctx.config.events;
        EventBus::with_capacity(events.channel_capacity, events.record_history)
            .unwrap_or_else(|_| EventBus::new())
            .shared()
    }

    /// Run without streaming.
    pub async fn run(&self, question: &str) -> SynthesisResult {
        self.run_with(question, &RunOptions::default()).await
    }

    pub async fn run_with(&self, question: &str, options: &RunOptions) -> SynthesisResult {
        let cancel = CancellationToken::new();
        self.run_with_events(question, options, self.new_bus(), &cancel)
            .await
    }

    /// Spawn a run and return its event stream. The receiver is subscribed
    /// before the run starts, so no event is missed.
    pub fn run_streaming(
        self: &Arc<Self>,
        question: impl Into<String>,
        options: RunOptions,
    ) -> (broadcast::Receiver<StreamEvent>, JoinHandle<SynthesisResult>) {
        let bus = self.new_bus();
        let receiver = bus.subscribe();
        let engine = Arc::clone(self);
        let question = question.into();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            engine
                .run_with_events(&question, &options, bus, &cancel)
                .await
        });
        (receiver, handle)
    }

    /// Run publishing to `bus`, stopping early when `cancel` fires.
    pub async fn run_with_events(
        &self,
        question: &str,
        options: &RunOptions,
        bus: SharedEventBus,
        cancel: &CancellationToken,
    ) -> SynthesisResult {
        let config = &self.ctx.config;
        let session_id = uuid::Uuid::new_v4().to_string();
        let deadline =
            Instant::now() + options.session_deadline.unwrap_or_else(|| config.session_deadline());

        let run_token = self.shutdown.child_token();
        let forward = {
            let run_token = run_token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => run_token.cancel(),
                    _ = run_token.cancelled() => {}
                }
            })
        };
        let heartbeat_token = run_token.child_token();
        let heartbeat = config.heartbeat().map(|period| {
            spawn_heartbeat(
                Arc::clone(&bus),
                session_id.clone(),
                period,
                heartbeat_token.clone(),
            )
        });

        let result = self
            .drive(question, options, &session_id, deadline, &bus, &run_token)
            .await;

        heartbeat_token.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }
        forward.abort();

        bus.emit(
            &session_id,
            Stage::Done,
            StageStatus::Complete,
            serde_json::to_value(&result).unwrap_or_default(),
        );
        result
    }

    async fn drive(
        &self,
        question: &str,
        options: &RunOptions,
        session_id: &str,
        deadline: Instant,
        bus: &SharedEventBus,
        token: &CancellationToken,
    ) -> SynthesisResult {
        let ctx = &self.ctx;
        let started = Instant::now();

        // Classify
        bus.emit(session_id, Stage::Classify, StageStatus::Running, json!({}));
        let classification = self.classifier.analyze(question);
        let tier = options.tier.unwrap_or(classification.tier);
        let debate_config = options.debate_config.unwrap_or_else(|| tier.debate_config());
        info!(session_id, "{}", classification.summary());
        bus.emit(
            session_id,
            Stage::Classify,
            StageStatus::Complete,
            json!({
                "tier": tier,
                "score": classification.score,
                "markers": classification.markers,
                "rationale": classification.rationale,
                "debate_config": debate_config,
            }),
        );

        // Prefetch
        bus.emit(session_id, Stage::Prefetch, StageStatus::Running, json!({}));
        let extractor = FactExtractor::new(
            Arc::clone(&ctx.executor),
            ctx.config.prefetch.max_concurrency,
        )
        .with_ttl_override(ctx.config.ttl_override());
        let facts = extractor
            .fetch_facts_until(question, tier, deadline, token)
            .await;
        let summary = json!({
            "requested": facts.requested(),
            "fetched": facts.sources().len(),
            "facts": facts.len(),
            "gaps": facts.gaps(),
            "sources": facts.sources(),
        });
        if facts.was_interrupted() {
            warn!(
                session_id,
                fetched = facts.sources().len(),
                requested = facts.requested(),
                "Prefetch interrupted; keeping the sources already fetched"
            );
            bus.emit(session_id, Stage::Prefetch, StageStatus::Error, summary);
        } else {
            bus.emit(session_id, Stage::Prefetch, StageStatus::Complete, summary);
        }

        // Debate
        let orchestrator = DebateOrchestrator::new(
            Arc::clone(&ctx.generator),
            Arc::clone(&ctx.similarity),
            ctx.config.orchestrator_settings(),
        )
        .with_permits(Arc::clone(&self.generation_permits))
        .with_bus(Arc::clone(bus));
        let mut session = orchestrator
            .new_session(question, tier, debate_config, Arc::new(facts))
            .with_id(session_id);

        match orchestrator.run(&mut session, deadline, token).await {
            Ok(outcome) if !outcome.is_success() => {
                bus.emit(
                    session_id,
                    Stage::Error,
                    StageStatus::Error,
                    json!({
                        "phase": outcome.terminal_phase,
                        "reason": outcome.termination.to_string(),
                    }),
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(session_id, error = %e, "Debate could not run");
                bus.emit(
                    session_id,
                    Stage::Error,
                    StageStatus::Error,
                    json!({ "reason": e.to_string() }),
                );
            }
        }

        // Synthesize
        let synthesizer = Synthesizer::new(
            Arc::clone(&ctx.generator),
            Arc::clone(&ctx.verifier),
            ctx.config.synthesis_settings(),
        )
        .with_bus(Arc::clone(bus));
        let result = synthesizer.synthesize(&session).await;

        if result.session_status == SessionStatus::Done {
            info!(
                session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Analysis complete"
            );
        } else {
            warn!(
                session_id,
                status = %result.session_status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Analysis finished degraded"
            );
        }
        result
    }

    /// Reload query definitions and drop cached results.
    pub fn reload_definitions(&self) -> Result<usize, RegistryError> {
        let count = self.ctx.registry.reload()?;
        self.ctx.executor.clear_cache();
        Ok(count)
    }

    /// Cancel outstanding runs and clear the cache.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.ctx.executor.clear_cache();
        info!("Analysis engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
