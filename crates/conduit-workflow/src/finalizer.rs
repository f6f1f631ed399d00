use std::sync::Arc;

use async_trait::async_trait;
use conduit_billing::{QuotaLedger, TokenUsage};
use conduit_core::{HistoryRecord, HistorySink, best_effort};
use conduit_upstream::{CompletionContext, StreamCompletionHook, StreamOutcome, StreamUsage};

/// Settles the pending charge of a finished stream and records its output
///
/// Streams that delivered anything, or ended by the client's choice, are
/// billed for the tokens seen so far. A stream that failed before its first
/// event releases the reservation instead.
pub struct BillingFinalizer {
    ledger: Arc<QuotaLedger>,
    history: Option<Arc<dyn HistorySink>>,
}

impl BillingFinalizer {
    pub fn new(ledger: Arc<QuotaLedger>, history: Option<Arc<dyn HistorySink>>) -> Self {
        Self { ledger, history }
    }
}

impl std::fmt::Debug for BillingFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingFinalizer")
            .field("history", &self.history.is_some())
            .finish_non_exhaustive()
    }
}

const fn billable(usage: &StreamUsage) -> bool {
    usage.events > 0 || !matches!(usage.outcome, StreamOutcome::Failed(_))
}

#[async_trait]
impl StreamCompletionHook for BillingFinalizer {
    async fn on_complete(&self, context: CompletionContext, usage: StreamUsage) {
        if let Some(pending) = &context.pending {
            if billable(&usage) {
                let actual = TokenUsage::new(usage.input_tokens, usage.output_tokens);
                match self
                    .ledger
                    .commit_pending_transaction(&pending.trace_id, actual, context.pricing)
                    .await
                {
                    Ok(tx) => tracing::debug!(
                        trace_id = %pending.trace_id,
                        amount = tx.amount,
                        estimated = usage.estimated,
                        outcome = usage.outcome.as_str(),
                        "settled streamed charge"
                    ),
                    Err(e) => tracing::error!(
                        trace_id = %pending.trace_id,
                        tenant_id = %pending.tenant_id,
                        error = %e,
                        "failed to settle streamed charge"
                    ),
                }
            } else {
                let reason = match &usage.outcome {
                    StreamOutcome::Failed(error) => error.code.as_str(),
                    other => other.as_str(),
                };
                best_effort(
                    "release pending charge",
                    self.ledger.fail_pending_transaction(&pending.trace_id, reason).await,
                );
            }
        }

        if let Some(history) = &self.history
            && (!usage.text.is_empty() || !usage.tool_calls.is_empty())
        {
            let record = HistoryRecord {
                trace_id: context.trace_id,
                tenant_id: context.tenant_id,
                user_id: context.user_id,
                model: context.model,
                content: usage.text,
                tool_calls: usage.tool_calls,
            };
            best_effort("record stream history", history.record(record).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use conduit_billing::{LedgerStore, MemoryLedgerStore, TransactionStatus};
    use conduit_config::{BillingConfig, TenantSeed};
    use conduit_core::keys::PendingCharge;
    use conduit_core::{Capability, ErrorCode, GatewayError, MICROS_PER_UNIT, Pricing};

    use super::*;

    const PRICING: Pricing = Pricing {
        input_per_mtok: 1_000_000,
        output_per_mtok: 1_000_000,
    };

    #[derive(Default)]
    struct Recorded(Mutex<Vec<HistoryRecord>>);

    #[async_trait]
    impl HistorySink for Recorded {
        async fn record(&self, record: HistoryRecord) -> Result<(), GatewayError> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }
    }

    async fn ledger_with_pending(trace_id: &str) -> Arc<QuotaLedger> {
        let config = BillingConfig {
            tenants: vec![TenantSeed {
                id: "t1".to_string(),
                balance: 1.0,
                credit_limit: 0.0,
                daily_requests: None,
                monthly_requests: None,
                rpm_limit: None,
                tpm_limit: None,
            }],
            ..BillingConfig::default()
        };
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(QuotaLedger::new(store, None, config));
        ledger.seed_tenants().await.unwrap();
        ledger
            .create_pending_transaction("t1", trace_id, TokenUsage::new(100, 100), PRICING)
            .await
            .unwrap();
        ledger
    }

    fn context(trace_id: &str) -> CompletionContext {
        CompletionContext {
            trace_id: trace_id.to_string(),
            capability: Capability::Chat,
            tenant_id: Some("t1".to_string()),
            user_id: Some("u1".to_string()),
            candidate_id: "a".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            pricing: PRICING,
            pending: Some(PendingCharge {
                trace_id: trace_id.to_string(),
                tenant_id: "t1".to_string(),
                pricing: PRICING,
            }),
            estimated_input_tokens: 10,
        }
    }

    fn usage(events: u64, outcome: StreamOutcome) -> StreamUsage {
        StreamUsage {
            input_tokens: 10,
            output_tokens: 40,
            estimated: false,
            events,
            text: "hello".to_string(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".to_string()),
            outcome,
        }
    }

    #[tokio::test]
    async fn completed_streams_commit_actual_usage() {
        let ledger = ledger_with_pending("s1").await;
        let history = Arc::new(Recorded::default());
        let finalizer = BillingFinalizer::new(Arc::clone(&ledger), Some(history.clone()));

        finalizer
            .on_complete(context("s1"), usage(3, StreamOutcome::Completed))
            .await;

        let tx = ledger.transaction("s1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tx.amount, 50);
        assert_eq!(ledger.quota("t1").await.unwrap().balance, MICROS_PER_UNIT - 50);

        let records = history.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hello");
    }

    #[tokio::test]
    async fn partial_streams_are_still_billed() {
        let ledger = ledger_with_pending("s2").await;
        let finalizer = BillingFinalizer::new(Arc::clone(&ledger), None);
        let failed = StreamOutcome::Failed(GatewayError::upstream(ErrorCode::UpstreamNetwork, "reset"));

        finalizer.on_complete(context("s2"), usage(2, failed)).await;

        let tx = ledger.transaction("s2").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn streams_failing_before_any_event_release_the_charge() {
        let ledger = ledger_with_pending("s3").await;
        let finalizer = BillingFinalizer::new(Arc::clone(&ledger), None);
        let failed = StreamOutcome::Failed(GatewayError::upstream(ErrorCode::UpstreamNetwork, "reset"));

        finalizer.on_complete(context("s3"), usage(0, failed)).await;

        let tx = ledger.transaction("s3").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(ledger.quota("t1").await.unwrap().balance, MICROS_PER_UNIT);
    }
}
