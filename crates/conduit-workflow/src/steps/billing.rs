use std::sync::Arc;

use async_trait::async_trait;
use conduit_billing::{QuotaLedger, TokenUsage, UsageCharge};
use conduit_core::keys::{BILLING_PENDING, PendingCharge, RENDERED_BODY, UPSTREAM_STREAM};
use conduit_core::{Context, GatewayError, IntoGatewayError, Step, StepResult};
use conduit_upstream::estimate_tokens;

use super::{selected, streams};

/// Checks the tenant can afford the call before it is made
///
/// Streamed calls open a pending transaction sized from an estimate, settled
/// once the stream ends. Buffered calls only check the estimate against the
/// quota; they are charged after the response arrives.
pub struct BillingReserveStep {
    ledger: Arc<QuotaLedger>,
}

impl BillingReserveStep {
    pub const fn new(ledger: Arc<QuotaLedger>) -> Self {
        Self { ledger }
    }
}

impl std::fmt::Debug for BillingReserveStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingReserveStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for BillingReserveStep {
    fn name(&self) -> &'static str {
        "billing.reserve"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["template"]
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let Some(tenant_id) = ctx.identity.tenant_id.clone() else {
            return Ok(StepResult::success().with_metadata("metered", false));
        };

        let candidate = selected(ctx)?;
        let pricing = candidate.pricing;
        let streamed = streams(ctx, candidate);
        let input_tokens = ctx
            .blackboard
            .get(&RENDERED_BODY)
            .map_or_else(|| estimate_tokens(&ctx.request.body), |rendered| estimate_tokens(&rendered.body));
        let estimate = TokenUsage::new(input_tokens, self.ledger.config().estimated_output_tokens);

        if !streamed {
            self.ledger
                .precheck(&tenant_id, estimate.cost(&pricing))
                .await
                .map_err(IntoGatewayError::into_gateway_error)?;
            return Ok(StepResult::success().with_metadata("estimated", estimate.cost(&pricing)));
        }

        let trace_id = ctx.trace_id().to_string();
        let tx = self
            .ledger
            .create_pending_transaction(&tenant_id, &trace_id, estimate, pricing)
            .await
            .map_err(IntoGatewayError::into_gateway_error)?;

        ctx.blackboard.insert(
            &BILLING_PENDING,
            PendingCharge {
                trace_id,
                tenant_id,
                pricing,
            },
        );

        Ok(StepResult::success().with_metadata("reserved", tx.amount))
    }
}

/// Charges the tenant for a finished buffered call
///
/// Also runs after failures, to release a pending charge that no stream
/// will ever settle. Streams that started are settled by the completion hook
/// instead. A failed charge fails the request.
pub struct BillingCommitStep {
    ledger: Arc<QuotaLedger>,
}

impl BillingCommitStep {
    pub const fn new(ledger: Arc<QuotaLedger>) -> Self {
        Self { ledger }
    }
}

impl std::fmt::Debug for BillingCommitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingCommitStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for BillingCommitStep {
    fn name(&self) -> &'static str {
        "billing.commit"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["upstream_call"]
    }

    fn runs_on_error(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let Some(tenant_id) = ctx.identity.tenant_id.clone() else {
            return Ok(StepResult::success().with_metadata("metered", false));
        };
        let pending = ctx.blackboard.get(&BILLING_PENDING).cloned();

        if let Some(error) = ctx.error() {
            let Some(pending) = pending else {
                return Ok(StepResult::success());
            };
            self.ledger
                .fail_pending_transaction(&pending.trace_id, error.code.as_str())
                .await
                .map_err(IntoGatewayError::into_gateway_error)?;
            return Ok(StepResult::success().with_metadata("released", true));
        }

        if ctx.blackboard.contains(&UPSTREAM_STREAM) {
            return Ok(StepResult::success().with_metadata("deferred", true));
        }

        let pricing = selected(ctx)?.pricing;
        let usage = TokenUsage::new(ctx.billing.input_tokens, ctx.billing.output_tokens);

        // A reservation made for a stream is settled here when a fallback
        // candidate answered without streaming
        let tx = match pending {
            Some(pending) => self.ledger.commit_pending_transaction(&pending.trace_id, usage, pricing).await,
            None => {
                let trace_id = ctx.trace_id().to_string();
                self.ledger
                    .deduct(&tenant_id, &trace_id, UsageCharge::metered(usage, pricing))
                    .await
            }
        }
        .map_err(IntoGatewayError::into_gateway_error)?;

        ctx.billing.cost_micros = tx.amount;
        tracing::debug!(
            trace_id = %ctx.trace_id(),
            tenant_id = %tenant_id,
            amount = tx.amount,
            "charged request"
        );

        Ok(StepResult::success().with_metadata("charged", tx.amount))
    }
}

#[cfg(test)]
mod tests {
    use conduit_billing::{LedgerStore, MemoryLedgerStore, TransactionStatus};
    use conduit_config::{BillingConfig, TenantSeed};
    use conduit_core::keys::{ROUTING_CANDIDATES, ROUTING_INDEX};
    use conduit_core::{ErrorCode, MICROS_PER_UNIT, Pricing};
    use conduit_store::MemoryStore;

    use super::*;
    use crate::testing::{candidate, chat_context};

    async fn ledger(balance: f64) -> Arc<QuotaLedger> {
        let config = BillingConfig {
            tenants: vec![TenantSeed {
                id: "t1".to_string(),
                balance,
                credit_limit: 0.0,
                daily_requests: None,
                monthly_requests: None,
                rpm_limit: None,
                tpm_limit: None,
            }],
            ..BillingConfig::default()
        };
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let ledger = QuotaLedger::new(store, Some(Arc::new(MemoryStore::new())), config);
        ledger.seed_tenants().await.unwrap();
        Arc::new(ledger)
    }

    fn routed_context(stream: bool) -> Context {
        let mut ctx = chat_context(stream);
        ctx.identity.tenant_id = Some("t1".to_string());
        let mut target = candidate("a", "https://api.example.com/v1/chat");
        target.pricing = Pricing {
            input_per_mtok: 1_000_000,
            output_per_mtok: 2_000_000,
        };
        ctx.blackboard.insert(&ROUTING_CANDIDATES, vec![target]);
        ctx.blackboard.insert(&ROUTING_INDEX, 0);
        ctx
    }

    #[tokio::test]
    async fn buffered_requests_are_prechecked_then_charged() {
        let ledger = ledger(10.0).await;
        let mut ctx = routed_context(false);

        BillingReserveStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();
        assert!(!ctx.blackboard.contains(&BILLING_PENDING));

        ctx.billing.input_tokens = 1_000;
        ctx.billing.output_tokens = 500;
        BillingCommitStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.billing.cost_micros, 2_000);
        let quota = ledger.quota("t1").await.unwrap();
        assert_eq!(quota.balance, 10 * MICROS_PER_UNIT - 2_000);
        let tx = ledger.transaction(ctx.trace_id()).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn streamed_requests_open_a_pending_charge() {
        let ledger = ledger(10.0).await;
        let mut ctx = routed_context(true);

        BillingReserveStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();

        let pending = ctx.blackboard.get(&BILLING_PENDING).cloned().unwrap();
        assert_eq!(pending.tenant_id, "t1");
        let tx = ledger.transaction(&pending.trace_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn empty_balance_is_rejected_before_the_call() {
        let ledger = ledger(0.0).await;
        let mut ctx = routed_context(false);

        let err = BillingReserveStep::new(ledger).execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientQuota);
    }

    #[tokio::test]
    async fn failed_requests_release_the_pending_charge() {
        let ledger = ledger(10.0).await;
        let mut ctx = routed_context(true);
        BillingReserveStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();

        ctx.set_error(GatewayError::upstream(ErrorCode::UpstreamServerError, "down"));
        let result = BillingCommitStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();

        assert_eq!(result.metadata.get("released"), Some(&serde_json::Value::Bool(true)));
        let tx = ledger.transaction(ctx.trace_id()).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(ledger.quota("t1").await.unwrap().balance, 10 * MICROS_PER_UNIT);
    }

    #[tokio::test]
    async fn unmetered_requests_skip_billing() {
        let ledger = ledger(0.0).await;
        let mut ctx = routed_context(false);
        ctx.identity.tenant_id = None;

        BillingReserveStep::new(Arc::clone(&ledger)).execute(&mut ctx).await.unwrap();
        BillingCommitStep::new(ledger).execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.billing.cost_micros, 0);
    }
}
