use std::sync::Arc;

use async_trait::async_trait;
use conduit_bandit::{ArmParams, BanditState, rank_candidates};
use conduit_core::keys::{ROUTING_AFFINITY_KEY, ROUTING_CANDIDATES, ROUTING_INDEX};
use conduit_core::{Candidate, CandidateSource, Context, ErrorCode, GatewayError, Step, StepResult};
use conduit_upstream::AffinityTracker;
use jiff::Timestamp;

/// Resolves and ranks the candidates for a request
///
/// Candidates come from the [`CandidateSource`] in configured order and are
/// ranked from their bandit arms, cooling arms left out. A candidate that
/// recently served the same request prefix is moved to the front.
pub struct RoutingStep {
    source: Arc<dyn CandidateSource>,
    bandit: Arc<BanditState>,
    affinity: Option<Arc<AffinityTracker>>,
}

impl RoutingStep {
    pub fn new(source: Arc<dyn CandidateSource>, bandit: Arc<BanditState>) -> Self {
        Self {
            source,
            bandit,
            affinity: None,
        }
    }

    #[must_use]
    pub fn with_affinity(mut self, affinity: Arc<AffinityTracker>) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Ranking parameters for a route, taken from its first candidate
    fn route_params(&self, first: &Candidate) -> ArmParams {
        self.bandit.default_params().with_overrides(
            first.routing.strategy.as_deref(),
            first.routing.failure_threshold,
            first.routing.cooldown,
        )
    }
}

impl std::fmt::Debug for RoutingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingStep")
            .field("affinity", &self.affinity.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for RoutingStep {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation"]
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let capability = ctx.identity.capability;
        let candidates = self.source.candidates(capability, &ctx.request.model).await?;

        let Some(first) = candidates.first() else {
            return Err(GatewayError::client(
                ErrorCode::NoCandidates,
                format!("no candidates for {capability} model '{}'", ctx.request.model),
            ));
        };

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let states = self.bandit.get_states_map(&ids).await;
        let params = self.route_params(first);
        let order = rank_candidates(&ids, &states, &params, Timestamp::now(), &mut rand::rng());

        let mut ranked: Vec<Candidate> = order
            .iter()
            .filter_map(|id| candidates.iter().find(|c| &c.id == id).cloned())
            .collect();

        if let Some(affinity) = &self.affinity
            && let Some(key) = affinity.key_for(capability, &ctx.request.model, &ctx.request.body)
        {
            if let Some(preferred) = affinity.preferred(&key).await
                && let Some(position) = ranked.iter().position(|c| c.id == preferred)
                && position > 0
            {
                let candidate = ranked.remove(position);
                ranked.insert(0, candidate);
                tracing::debug!(trace_id = %ctx.trace_id(), candidate = %preferred, "routing by prefix affinity");
            }
            ctx.blackboard.insert(&ROUTING_AFFINITY_KEY, key);
        }

        let result = StepResult::success()
            .with_metadata("candidates", ranked.len())
            .with_metadata("cooling", candidates.len() - ranked.len())
            .with_metadata("selected", ranked.first().map(|c| c.id.clone()));

        tracing::debug!(
            trace_id = %ctx.trace_id(),
            model = %ctx.request.model,
            selected = ranked.first().map_or("", |c| c.id.as_str()),
            available = ranked.len(),
            "routed request"
        );

        ctx.blackboard.insert(&ROUTING_CANDIDATES, ranked);
        ctx.blackboard.insert(&ROUTING_INDEX, 0);
        Ok(result)
    }
}
