//! The crew — owns the agent set, resolves each agent's model binding,
//! caches backend clients, wires per-agent middleware, and dispatches
//! runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crewd_domain::cancel::CancelToken;
use crewd_domain::config::{
    AgentConfig, Config, LlmPreference, ProviderSettings, ProvidersConfig, SummarizerConfig,
};
use crewd_domain::error::{Error, Result};
use crewd_domain::interfaces::{MessagePersister, Summarizer, ToolExecutor};
use crewd_domain::message::Message;
use crewd_providers::{
    AnthropicClient, ClientCache, ClientKey, CompressionMiddleware, LlmClient, Middleware,
    MiddlewareClient, RateLimitController, RateLimitMiddleware,
};
use crewd_scheduler::Schedule;
use crewd_store::{AgentStatus, StateStore, StatsStore};

use crate::tools::ToolRegistry;
use crate::turn::{RunnerParts, TurnEvent, TurnRunner};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds backend clients for resolved provider bindings. Injected so
/// embedders can wire additional adapters and tests can substitute a
/// scripted mock.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        provider: &str,
        settings: &ProviderSettings,
        credential_ref: Option<&str>,
    ) -> Result<Arc<dyn LlmClient>>;
}

/// Stock factory: every configured provider is served by the
/// messages-API adapter. A `credential_ref` on the winning preference
/// overrides the table's api_key.
pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn build(
        &self,
        _provider: &str,
        settings: &ProviderSettings,
        credential_ref: Option<&str>,
    ) -> Result<Arc<dyn LlmClient>> {
        let mut effective = settings.clone();
        if let Some(cred) = credential_ref {
            effective.api_key = Some(cred.to_string());
        }
        Ok(Arc::new(AnthropicClient::from_settings(&effective)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Binding resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The provider/model binding chosen for one agent.
struct ResolvedBinding {
    provider: String,
    settings: ProviderSettings,
    model: String,
    temperature: Option<f32>,
    credential_ref: Option<String>,
}

/// Walk the agent's preference list in order and pick the first entry
/// whose provider is enabled and configured. With no preferences, the
/// first usable provider and its default model win.
fn resolve_binding(agent: &AgentConfig, providers: &ProvidersConfig) -> Result<ResolvedBinding> {
    for pref in &agent.llm_preferences {
        if !providers.usable(&pref.provider) {
            tracing::debug!(
                agent_id = %agent.id,
                provider = %pref.provider,
                "preferred provider unavailable, trying next"
            );
            continue;
        }
        let Some(settings) = providers.get(&pref.provider).cloned() else {
            continue;
        };
        return Ok(binding_from(pref, &pref.provider, settings));
    }

    if agent.llm_preferences.is_empty() {
        if let Some((name, settings)) = providers.first_usable() {
            return Ok(ResolvedBinding {
                provider: name.clone(),
                model: settings.default_model.clone(),
                settings: settings.clone(),
                temperature: None,
                credential_ref: None,
            });
        }
    }

    Err(Error::Config(format!(
        "agent '{}' has no usable LLM provider",
        agent.id
    )))
}

fn binding_from(
    pref: &LlmPreference,
    provider: &str,
    settings: ProviderSettings,
) -> ResolvedBinding {
    let model = if pref.model.is_empty() {
        settings.default_model.clone()
    } else {
        pref.model.clone()
    };
    ResolvedBinding {
        provider: provider.to_string(),
        model,
        settings,
        temperature: pref.temperature,
        credential_ref: pref.credential_ref.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Crew
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records an agent that failed to initialize.
#[derive(Debug, Clone)]
pub struct AgentInitError {
    pub agent_id: String,
    pub error: String,
}

/// Interior maps behind the crew's single readers-writer lock.
#[derive(Default)]
struct CrewMaps {
    agents: HashMap<String, AgentConfig>,
    runners: HashMap<String, Arc<TurnRunner>>,
}

/// The agent orchestrator.
pub struct Crew {
    providers_cfg: ProvidersConfig,
    thresholds: SummarizerConfig,
    maps: RwLock<CrewMaps>,
    clients: ClientCache,
    controller: Arc<RateLimitController>,
    factory: Arc<dyn ClientFactory>,
    registry: ToolRegistry,
    executor: Arc<dyn ToolExecutor>,
    state: Arc<StateStore>,
    stats: Arc<StatsStore>,
    persister: Arc<dyn MessagePersister>,
    summarizer: Option<Arc<dyn Summarizer>>,
    cancel: CancelToken,
    init_errors: Vec<AgentInitError>,
}

impl Crew {
    /// Build the crew from configuration. Disabled agents are skipped;
    /// agents that fail to initialize (bad schedule, no usable provider)
    /// are logged, recorded in [`Crew::init_errors`], and skipped rather
    /// than aborting startup.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: ToolRegistry,
        factory: Arc<dyn ClientFactory>,
        executor: Arc<dyn ToolExecutor>,
        state: Arc<StateStore>,
        stats: Arc<StatsStore>,
        persister: Arc<dyn MessagePersister>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let mut crew = Self {
            providers_cfg: config.providers.clone(),
            thresholds: config.summarizer,
            maps: RwLock::new(CrewMaps::default()),
            clients: ClientCache::new(),
            controller: Arc::new(RateLimitController::new()),
            factory,
            registry,
            executor,
            state,
            stats,
            persister,
            summarizer,
            cancel: CancelToken::new(),
            init_errors: Vec::new(),
        };

        for agent in &config.agents {
            if agent.disabled {
                tracing::info!(agent_id = %agent.id, "agent disabled, skipping");
                continue;
            }
            if let Err(e) = crew.init_agent(agent.clone()) {
                tracing::warn!(
                    agent_id = %agent.id,
                    error = %e,
                    "failed to initialize agent, skipping"
                );
                crew.init_errors.push(AgentInitError {
                    agent_id: agent.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        crew
    }

    fn init_agent(&self, agent: AgentConfig) -> Result<()> {
        let binding = resolve_binding(&agent, &self.providers_cfg)?;
        let schedule = agent
            .schedule
            .as_deref()
            .map(Schedule::parse)
            .transpose()?;

        let key = ClientKey {
            provider: binding.provider.clone(),
            model: binding.model.clone(),
            api_key: binding
                .credential_ref
                .clone()
                .or_else(|| binding.settings.api_key.clone())
                .unwrap_or_default(),
            host: binding.settings.host.clone().unwrap_or_default(),
            base_url: binding.settings.base_url.clone().unwrap_or_default(),
            organization: binding.settings.organization.clone().unwrap_or_default(),
        };
        let backend = self.clients.get_or_create(key, || {
            self.factory.build(
                &binding.provider,
                &binding.settings,
                binding.credential_ref.as_deref(),
            )
        })?;

        // Per-agent middleware around the (possibly shared) backend.
        let scheduled = schedule.is_some();
        let mut middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimitMiddleware::new(
            &agent.id,
            self.controller.clone(),
            self.state.clone(),
            scheduled,
            self.cancel.clone(),
        ))];
        if let Some(summarizer) = &self.summarizer {
            middleware.push(Arc::new(CompressionMiddleware::new(
                &agent.id,
                summarizer.clone(),
                Some(self.persister.clone()),
            )));
        }
        let client: Arc<dyn LlmClient> = Arc::new(MiddlewareClient::new(backend, middleware));

        let tools = self.registry.expand_patterns(&agent.tools);
        tracing::info!(
            agent_id = %agent.id,
            provider = %binding.provider,
            model = %binding.model,
            tools = tools.len(),
            "initialized agent"
        );

        self.bootstrap_state(&agent, schedule.as_ref());

        let runner = TurnRunner::new(RunnerParts {
            model: binding.model,
            temperature: binding.temperature,
            client,
            tools,
            executor: self.executor.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            persister: self.persister.clone(),
            summarizer: self.summarizer.clone(),
            thresholds: self.thresholds,
            schedule,
            cancel: self.cancel.clone(),
            agent: agent.clone(),
        });

        let mut maps = self.maps.write();
        maps.runners.insert(agent.id.clone(), Arc::new(runner));
        maps.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    /// Seed or repair the agent's durable state at startup.
    ///
    /// Fresh agents wait until the earlier of startup-delay-from-now and
    /// the schedule's next firing; with neither they start idle. An
    /// existing record is only touched when the agent has a startup delay
    /// and its state is stale (idle with no wake, or a wake in the past).
    fn bootstrap_state(&self, agent: &AgentConfig, schedule: Option<&Schedule>) {
        let now = Utc::now();
        let startup_wake = agent
            .startup_delay()
            .and_then(|d| now.checked_add_signed(chrono::Duration::from_std(d).ok()?))
            .map(|t| t.timestamp());
        let schedule_wake = schedule.and_then(|s| s.next_after(now)).map(|t| t.timestamp());

        match self.state.get(&agent.id) {
            None => {
                let wake = match (startup_wake, schedule_wake) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                match wake {
                    Some(w) => {
                        self.state.set_state_with_wake(
                            &agent.id,
                            AgentStatus::WaitingExternal,
                            Some(w),
                        );
                    }
                    None => self.state.set_state(&agent.id, AgentStatus::Idle),
                }
            }
            Some(existing) => {
                let Some(startup) = startup_wake else { return };
                let stale = (existing.state == AgentStatus::Idle && existing.next_wake.is_none())
                    || existing.next_wake.is_some_and(|w| w < now.timestamp());
                if stale {
                    self.state.set_state_with_wake(
                        &agent.id,
                        AgentStatus::WaitingExternal,
                        Some(startup),
                    );
                }
            }
        }
    }

    // ── Dispatch surface ───────────────────────────────────────────

    /// Run one turn for an agent and return the final assistant text.
    pub async fn run(
        &self,
        agent_id: &str,
        thread_id: &str,
        user_msg: &str,
        history: Vec<Message>,
    ) -> Result<String> {
        let runner = self.runner(agent_id)?;
        runner.run(thread_id, user_msg, history).await
    }

    /// Streaming twin of [`run`].
    pub async fn run_stream(
        &self,
        agent_id: &str,
        thread_id: &str,
        user_msg: &str,
        history: Vec<Message>,
        tx: mpsc::Sender<TurnEvent>,
    ) -> Result<String> {
        let runner = self.runner(agent_id)?;
        runner.run_stream(thread_id, user_msg, history, tx).await
    }

    fn runner(&self, agent_id: &str) -> Result<Arc<TurnRunner>> {
        self.maps
            .read()
            .runners
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::AgentUnknown(agent_id.to_string()))
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Initialized agent ids, sorted.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.maps.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The wake prompt a scheduled dispatch should submit.
    pub fn wake_prompt(&self, agent_id: &str) -> Option<String> {
        self.maps
            .read()
            .agents
            .get(agent_id)
            .map(|a| a.prompt.clone())
    }

    /// Agents whose durable wake time is due.
    pub fn ready_agents(&self, now: i64) -> Vec<String> {
        self.state.list_ready(now)
    }

    /// Agents that failed to initialize at startup.
    pub fn init_errors(&self) -> &[AgentInitError] {
        &self.init_errors
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn stats(&self) -> &Arc<StatsStore> {
        &self.stats
    }

    /// The crew-wide cancel token handed to every runner.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of distinct backend clients in the cache.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
