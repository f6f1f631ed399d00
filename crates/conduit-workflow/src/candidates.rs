use std::collections::HashMap;

use async_trait::async_trait;
use conduit_config::{AsyncTaskSettings, AuthSchemeConfig, CandidateConfig, Config, ResultShapeConfig, RouteConfig, StrategyKind};
use conduit_core::{
    AsyncTaskConfig, AuthConfig, AuthScheme, Candidate, CandidateSource, Capability, GatewayError, Pricing,
    ResultShape, RoutingParams, StaticSecretStore, TransformConfig, micros_from_decimal,
};

use crate::error::WorkflowError;

/// Candidate lists fixed at startup, keyed by capability and model alias
#[derive(Debug, Default)]
pub struct StaticCandidateSource {
    routes: HashMap<(Capability, String), Vec<Candidate>>,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the routes declared in configuration
    pub fn from_routes(routes: &[RouteConfig]) -> Result<Self, WorkflowError> {
        let mut source = Self::new();

        for route in routes {
            let capability = Capability::parse(&route.capability)
                .ok_or_else(|| WorkflowError::Route(format!("unknown capability '{}'", route.capability)))?;
            let candidates = route.candidates.iter().map(candidate_from_config).collect();
            source.insert(capability, &route.model, candidates);
        }

        Ok(source)
    }

    #[must_use]
    pub fn with_route(mut self, capability: Capability, model: &str, candidates: Vec<Candidate>) -> Self {
        self.insert(capability, model, candidates);
        self
    }

    pub fn insert(&mut self, capability: Capability, model: &str, candidates: Vec<Candidate>) {
        self.routes.insert((capability, model.to_string()), candidates);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn candidates(&self, capability: Capability, model: &str) -> Result<Vec<Candidate>, GatewayError> {
        Ok(self
            .routes
            .get(&(capability, model.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

fn candidate_from_config(config: &CandidateConfig) -> Candidate {
    let scheme = match &config.auth {
        AuthSchemeConfig::Bearer => AuthScheme::Bearer,
        AuthSchemeConfig::Header { name } => AuthScheme::Header { name: name.clone() },
        AuthSchemeConfig::None => AuthScheme::None,
    };

    Candidate {
        id: config.resolved_id(),
        provider: config.provider.clone(),
        model: config.model.clone(),
        upstream_url: config.url.clone(),
        credential_id: config.credential_id.clone(),
        auth: AuthConfig {
            secret_ref: config.secret_ref.clone(),
            scheme,
        },
        transform: TransformConfig {
            body_template: config.body_template.clone(),
            async_task: config.async_task.as_ref().map(async_task_from_config),
        },
        routing: RoutingParams {
            strategy: config.strategy.map(|kind| strategy_name(kind).to_string()),
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
        },
        pricing: Pricing {
            input_per_mtok: micros_from_decimal(config.input_price),
            output_per_mtok: micros_from_decimal(config.output_price),
        },
    }
}

fn async_task_from_config(settings: &AsyncTaskSettings) -> AsyncTaskConfig {
    AsyncTaskConfig {
        status_url: settings.status_url.clone(),
        task_id_path: settings.task_id_path.clone(),
        status_path: settings.status_path.clone(),
        success_values: settings.success_values.clone(),
        failure_values: settings.failure_values.clone(),
        result_path: settings.result_path.clone(),
        error_path: settings.error_path.clone(),
        result_shape: match settings.result_shape {
            ResultShapeConfig::Raw => ResultShape::Raw,
            ResultShapeConfig::UrlList => ResultShape::UrlList,
            ResultShapeConfig::Base64List => ResultShape::Base64List,
        },
        poll_interval: settings.poll_interval,
        timeout: settings.timeout,
    }
}

const fn strategy_name(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::Ucb1 => "ucb1",
        StrategyKind::EpsilonGreedy => "epsilon_greedy",
    }
}

/// Secret store over the `[secrets]` table, keyed by `provider/secret_ref`
pub fn secrets_from_config(config: &Config) -> Result<StaticSecretStore, WorkflowError> {
    let mut store = StaticSecretStore::new();

    for (key, value) in &config.secrets {
        let Some((provider, secret_ref)) = key.split_once('/') else {
            return Err(WorkflowError::SecretKey(key.clone()));
        };
        store.insert(provider, secret_ref, value.clone());
    }

    Ok(store)
}
