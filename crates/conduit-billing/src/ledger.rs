use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use conduit_config::{BillingConfig, TenantSeed};
use conduit_core::{Micros, Pricing, best_effort, micros_from_decimal};
use conduit_store::SharedStore;
use jiff::Timestamp;

use crate::error::BillingError;
use crate::quota::{ChargePolicy, PeriodBoundaries, QuotaCharge, TenantQuota};
use crate::scripts::{DeductReply, QUOTA_DEDUCT, QUOTA_SEED, deduct_args, parse_deduct_reply, quota_key, seed_args};
use crate::store::LedgerStore;
use crate::types::{BillingTransaction, QuotaKind, TokenUsage, TransactionKind, TransactionStatus, UsageCharge};

/// Outcome of trying to take the per-trace idempotency lock
enum TraceLock {
    /// Lock taken with this owner token
    Held(String),
    /// Another caller holds it
    Contended,
    /// No shared store, or it failed. The ledger's unique trace id still
    /// rejects concurrent duplicates.
    Skipped,
}

/// Tenant quota and transaction ledger
///
/// Quota charges prefer an atomic script against the shared-store mirror
/// and fall back to an optimistic compare-and-swap loop on the ledger.
/// Every mutating call is keyed by a caller-supplied trace id.
pub struct QuotaLedger {
    ledger: Arc<dyn LedgerStore>,
    fast: Option<Arc<dyn SharedStore>>,
    config: BillingConfig,
    /// Tenants charged on the ledger whose mirror could not be dropped
    stale_mirrors: Mutex<HashSet<String>>,
    /// Newest mirror snapshot per tenant that the ledger has not accepted
    unsynced: Mutex<HashMap<String, TenantQuota>>,
}

impl QuotaLedger {
    pub fn new(ledger: Arc<dyn LedgerStore>, fast: Option<Arc<dyn SharedStore>>, config: BillingConfig) -> Self {
        Self {
            ledger,
            fast,
            config,
            stale_mirrors: Mutex::new(HashSet::new()),
            unsynced: Mutex::new(HashMap::new()),
        }
    }

    pub const fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Create quota rows for configured tenants that do not have one yet
    pub async fn seed_tenants(&self) -> Result<usize, BillingError> {
        let now = Timestamp::now();
        let mut created = 0;

        for seed in &self.config.tenants {
            if self.ledger.insert_quota(&quota_from_seed(seed, now)).await? {
                created += 1;
            }
        }

        tracing::debug!(created, configured = self.config.tenants.len(), "seeded tenant quotas");
        Ok(created)
    }

    /// Latest known quota, preferring the shared-store mirror
    pub async fn quota(&self, tenant_id: &str) -> Result<TenantQuota, BillingError> {
        if let Some(fast) = self.usable_mirror(tenant_id).await {
            match fast.hash_get_all(&quota_key(tenant_id)).await {
                Ok(fields) if !fields.is_empty() => match TenantQuota::from_fields(tenant_id, &fields) {
                    Ok(quota) => return Ok(quota),
                    Err(e) => tracing::warn!(tenant_id, error = %e, "ignoring undecodable quota mirror"),
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(tenant_id, error = %e, "quota mirror read failed"),
            }
        }

        self.ledger
            .load_quota(tenant_id)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))
    }

    /// Reject early when a tenant clearly cannot afford `estimated`
    ///
    /// Reads a snapshot without charging anything. Concurrent requests may
    /// all pass; the atomic charge remains the authority.
    pub async fn precheck(&self, tenant_id: &str, estimated: Micros) -> Result<TenantQuota, BillingError> {
        let mut quota = self.quota(tenant_id).await?;
        let trial = QuotaCharge {
            amount: estimated,
            daily_requests: 1,
            monthly_requests: 1,
        };
        let policy = ChargePolicy {
            allow_negative: self.config.allow_negative,
            enforce_limits: true,
        };

        let snapshot = quota.clone();
        quota.apply_charge(&trial, policy, &PeriodBoundaries::at(Timestamp::now()))?;
        Ok(snapshot)
    }

    /// Atomically check and charge a tenant's quota
    ///
    /// Fails with [`BillingError::InsufficientQuota`] for the first exhausted
    /// dimension, checked in balance, daily, monthly order.
    pub async fn check_and_deduct(
        &self,
        tenant_id: &str,
        amount: Micros,
        daily_requests: u64,
        monthly_requests: u64,
        allow_negative: bool,
    ) -> Result<TenantQuota, BillingError> {
        let charge = QuotaCharge {
            amount,
            daily_requests,
            monthly_requests,
        };
        let policy = ChargePolicy {
            allow_negative,
            enforce_limits: true,
        };
        self.charge(tenant_id, &charge, policy).await
    }

    async fn charge(
        &self,
        tenant_id: &str,
        charge: &QuotaCharge,
        policy: ChargePolicy,
    ) -> Result<TenantQuota, BillingError> {
        let periods = PeriodBoundaries::at(Timestamp::now());

        if let Some(fast) = self.usable_mirror(tenant_id).await {
            match self.charge_mirror(fast, tenant_id, charge, policy, &periods).await {
                Ok(quota) => return Ok(quota),
                Err(e @ (BillingError::InsufficientQuota { .. } | BillingError::TenantNotFound(_))) => return Err(e),
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "quota fast path failed, falling back to ledger");
                }
            }
        }

        let quota = self.charge_ledger(tenant_id, charge, policy, &periods).await?;

        if let Some(fast) = &self.fast
            && best_effort("quota_mirror_invalidate", fast.delete(&quota_key(tenant_id)).await).is_none()
        {
            self.stale_mirrors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(tenant_id.to_string());
        }

        Ok(quota)
    }

    /// Shared store to charge through, after dropping a mirror that missed
    /// ledger-only charges
    async fn usable_mirror(&self, tenant_id: &str) -> Option<&dyn SharedStore> {
        let fast = self.fast.as_deref()?;

        let stale = self
            .stale_mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tenant_id);
        if !stale {
            return Some(fast);
        }

        match fast.delete(&quota_key(tenant_id)).await {
            Ok(_) => {
                self.stale_mirrors
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(tenant_id);
                tracing::debug!(tenant_id, "dropped stale quota mirror");
                Some(fast)
            }
            Err(e) => {
                tracing::debug!(tenant_id, error = %e, "stale quota mirror still present, staying on ledger");
                None
            }
        }
    }

    async fn charge_mirror(
        &self,
        fast: &dyn SharedStore,
        tenant_id: &str,
        charge: &QuotaCharge,
        policy: ChargePolicy,
        periods: &PeriodBoundaries,
    ) -> Result<TenantQuota, BillingError> {
        let keys = [quota_key(tenant_id)];
        let args = deduct_args(charge, policy, periods);

        for seeded in [false, true] {
            let reply = fast.run_script(&QUOTA_DEDUCT, &keys, &args).await?;

            match parse_deduct_reply(tenant_id, &reply)? {
                DeductReply::Applied(quota) => {
                    self.sync_back(&quota).await;
                    return Ok(quota);
                }
                DeductReply::Rejected(e) => return Err(e),
                DeductReply::Missing if !seeded => self.seed_mirror(fast, tenant_id).await?,
                DeductReply::Missing => {}
            }
        }

        Err(BillingError::Store(format!("quota mirror for {tenant_id} missing after seeding")))
    }

    /// Copy a mirror snapshot to the ledger
    ///
    /// A failed copy is held and replayed before the ledger is next used for
    /// the tenant, so the charge survives the mirror expiring first.
    async fn sync_back(&self, quota: &TenantQuota) {
        match self.ledger.sync_quota(quota).await {
            Ok(_) => {
                let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
                if unsynced
                    .get(&quota.tenant_id)
                    .is_some_and(|held| held.version <= quota.version)
                {
                    unsynced.remove(&quota.tenant_id);
                }
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %quota.tenant_id,
                    version = quota.version,
                    error = %e,
                    "quota ledger sync failed, holding snapshot for replay"
                );
                let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
                if unsynced
                    .get(&quota.tenant_id)
                    .is_none_or(|held| held.version < quota.version)
                {
                    unsynced.insert(quota.tenant_id.clone(), quota.clone());
                }
            }
        }
    }

    /// Write back a snapshot held by an earlier failed sync
    async fn replay_unsynced(&self, tenant_id: &str) -> Result<(), BillingError> {
        let held = self
            .unsynced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant_id)
            .cloned();
        let Some(quota) = held else {
            return Ok(());
        };

        self.ledger.sync_quota(&quota).await?;

        let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
        if unsynced.get(tenant_id).is_some_and(|h| h.version <= quota.version) {
            unsynced.remove(tenant_id);
        }
        tracing::info!(tenant_id, version = quota.version, "replayed held quota snapshot");
        Ok(())
    }

    async fn seed_mirror(&self, fast: &dyn SharedStore, tenant_id: &str) -> Result<(), BillingError> {
        self.replay_unsynced(tenant_id).await?;
        let quota = self
            .ledger
            .load_quota(tenant_id)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;

        fast.run_script(
            &QUOTA_SEED,
            &[quota_key(tenant_id)],
            &seed_args(&quota, self.config.mirror_ttl),
        )
        .await?;

        tracing::debug!(tenant_id, version = quota.version, "seeded quota mirror");
        Ok(())
    }

    async fn charge_ledger(
        &self,
        tenant_id: &str,
        charge: &QuotaCharge,
        policy: ChargePolicy,
        periods: &PeriodBoundaries,
    ) -> Result<TenantQuota, BillingError> {
        self.replay_unsynced(tenant_id).await?;
        let attempts = self.config.max_cas_retries;

        for attempt in 1..=attempts {
            let current = self
                .ledger
                .load_quota(tenant_id)
                .await?
                .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;

            let mut next = current.clone();
            next.apply_charge(charge, policy, periods)?;

            if self.ledger.compare_and_swap_quota(&next, current.version).await? {
                return Ok(next);
            }

            tracing::debug!(tenant_id, attempt, "quota version conflict");
        }

        Err(BillingError::Conflict {
            tenant_id: tenant_id.to_string(),
            attempts,
        })
    }

    /// Look up a transaction by trace id
    pub async fn transaction(&self, trace_id: &str) -> Result<Option<BillingTransaction>, BillingError> {
        self.ledger.find_transaction(trace_id).await
    }

    /// Charge a tenant once per trace id
    ///
    /// Repeating a call whose transaction already finished returns that
    /// transaction unchanged. A failed charge leaves no transaction behind so
    /// the caller can retry with the same trace id.
    pub async fn deduct(
        &self,
        tenant_id: &str,
        trace_id: &str,
        charge: UsageCharge,
    ) -> Result<BillingTransaction, BillingError> {
        let policy = ChargePolicy {
            allow_negative: self.config.allow_negative,
            enforce_limits: true,
        };
        self.execute_once(tenant_id, trace_id, TransactionKind::Deduct, charge, policy)
            .await
    }

    /// Credit a tenant once per trace id
    pub async fn recharge(
        &self,
        tenant_id: &str,
        trace_id: &str,
        amount: Micros,
    ) -> Result<BillingTransaction, BillingError> {
        self.execute_once(
            tenant_id,
            trace_id,
            TransactionKind::Recharge,
            UsageCharge::flat(amount),
            ChargePolicy::SETTLE,
        )
        .await
    }

    async fn execute_once(
        &self,
        tenant_id: &str,
        trace_id: &str,
        kind: TransactionKind,
        charge: UsageCharge,
        policy: ChargePolicy,
    ) -> Result<BillingTransaction, BillingError> {
        if let Some(existing) = self.existing_terminal(trace_id).await? {
            return Ok(existing);
        }

        let token = match self.lock_trace(trace_id).await {
            TraceLock::Held(token) => Some(token),
            TraceLock::Skipped => None,
            TraceLock::Contended => return self.contended(trace_id).await,
        };

        let result = self.apply_once(tenant_id, trace_id, kind, &charge, policy).await;

        if result.is_err() {
            self.unlock_trace(trace_id, token.as_deref()).await;
        }

        result
    }

    async fn apply_once(
        &self,
        tenant_id: &str,
        trace_id: &str,
        kind: TransactionKind,
        charge: &UsageCharge,
        policy: ChargePolicy,
    ) -> Result<BillingTransaction, BillingError> {
        let mut tx = BillingTransaction::for_charge(trace_id, tenant_id, kind, charge);

        match self.ledger.insert_transaction(&tx).await {
            Ok(()) => {}
            Err(BillingError::DuplicateTransaction(_)) => return self.contended(trace_id).await,
            Err(e) => return Err(e),
        }

        let quota_charge = QuotaCharge {
            amount: -tx.balance_delta(),
            daily_requests: u64::from(kind == TransactionKind::Deduct),
            monthly_requests: u64::from(kind == TransactionKind::Deduct),
        };

        let quota = match self.charge(tenant_id, &quota_charge, policy).await {
            Ok(quota) => quota,
            Err(e) => {
                best_effort("billing_rollback", self.ledger.rollback_transaction(trace_id).await);
                return Err(e);
            }
        };

        tx.commit(quota.balance);
        self.finish(&tx, TransactionStatus::Pending).await?;

        tracing::debug!(
            trace_id,
            tenant_id,
            amount = tx.amount,
            balance = quota.balance,
            "transaction committed"
        );
        Ok(tx)
    }

    /// Open a pending transaction sized by an estimate
    ///
    /// Idempotent: an existing transaction for the trace id is returned as is.
    pub async fn create_pending_transaction(
        &self,
        tenant_id: &str,
        trace_id: &str,
        estimated: TokenUsage,
        pricing: Pricing,
    ) -> Result<BillingTransaction, BillingError> {
        if let Some(existing) = self.ledger.find_transaction(trace_id).await? {
            return Ok(existing);
        }

        let charge = UsageCharge::metered(estimated, pricing);
        self.precheck(tenant_id, charge.amount).await?;

        let tx = BillingTransaction::for_charge(trace_id, tenant_id, TransactionKind::Deduct, &charge);
        match self.ledger.insert_transaction(&tx).await {
            Ok(()) => Ok(tx),
            Err(BillingError::DuplicateTransaction(_)) => self
                .ledger
                .find_transaction(trace_id)
                .await?
                .ok_or_else(|| BillingError::DuplicateInFlight(trace_id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Settle a pending transaction at its actual cost
    ///
    /// Committing an already committed transaction returns it unchanged.
    /// Settlement applies regardless of balance and request limits since the
    /// work has already been delivered.
    pub async fn commit_pending_transaction(
        &self,
        trace_id: &str,
        actual: TokenUsage,
        pricing: Pricing,
    ) -> Result<BillingTransaction, BillingError> {
        let tx = self.pending(trace_id).await?;
        if tx.status == TransactionStatus::Committed {
            return Ok(tx);
        }

        let token = match self.lock_trace(trace_id).await {
            TraceLock::Held(token) => Some(token),
            TraceLock::Skipped => None,
            TraceLock::Contended => return self.contended(trace_id).await,
        };

        let result = self.settle(tx, actual, pricing).await;

        if result.is_err() {
            self.unlock_trace(trace_id, token.as_deref()).await;
        }

        result
    }

    async fn settle(
        &self,
        mut tx: BillingTransaction,
        actual: TokenUsage,
        pricing: Pricing,
    ) -> Result<BillingTransaction, BillingError> {
        // Re-read under the lock
        let current = self.pending(&tx.trace_id).await?;
        if current.status == TransactionStatus::Committed {
            return Ok(current);
        }

        let charge = UsageCharge::metered(actual, pricing);
        let quota = self
            .charge(
                &tx.tenant_id,
                &QuotaCharge {
                    amount: charge.amount,
                    daily_requests: 1,
                    monthly_requests: 1,
                },
                ChargePolicy::SETTLE,
            )
            .await?;

        tx.amount = charge.amount;
        tx.usage = actual;
        tx.pricing = Some(pricing);
        tx.commit(quota.balance);
        self.finish(&tx, TransactionStatus::Pending).await?;

        tracing::debug!(
            trace_id = %tx.trace_id,
            tenant_id = %tx.tenant_id,
            amount = tx.amount,
            input_tokens = actual.input_tokens,
            output_tokens = actual.output_tokens,
            "pending transaction committed"
        );
        Ok(tx)
    }

    /// Pending or committed transaction for a trace id
    async fn pending(&self, trace_id: &str) -> Result<BillingTransaction, BillingError> {
        let tx = self
            .ledger
            .find_transaction(trace_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(trace_id.to_string()))?;

        match tx.status {
            TransactionStatus::Pending | TransactionStatus::Committed => Ok(tx),
            status => Err(BillingError::InvalidState {
                trace_id: trace_id.to_string(),
                status,
            }),
        }
    }

    /// Close a pending transaction without charging
    pub async fn fail_pending_transaction(
        &self,
        trace_id: &str,
        reason: &str,
    ) -> Result<BillingTransaction, BillingError> {
        let mut tx = self
            .ledger
            .find_transaction(trace_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(trace_id.to_string()))?;

        if tx.status.is_terminal() {
            return Ok(tx);
        }

        tx.status = TransactionStatus::Failed;
        tx.failure_reason = Some(reason.to_string());
        tx.updated_at = Timestamp::now();

        if !self.ledger.update_transaction_if(&tx, TransactionStatus::Pending).await? {
            return self.existing_terminal(trace_id).await?.ok_or_else(|| BillingError::InvalidState {
                trace_id: trace_id.to_string(),
                status: TransactionStatus::Pending,
            });
        }

        tracing::debug!(trace_id, reason, "pending transaction failed");
        Ok(tx)
    }

    /// Refund a committed deduction through a linked refund transaction
    ///
    /// Idempotent on `reverse_trace_id`. The original is marked reversed,
    /// never removed.
    pub async fn reverse(
        &self,
        original_trace_id: &str,
        reverse_trace_id: &str,
    ) -> Result<BillingTransaction, BillingError> {
        if let Some(existing) = self.existing_terminal(reverse_trace_id).await? {
            return refund_of(existing, original_trace_id);
        }

        self.reversible(original_trace_id).await?;

        let token = match self.lock_trace(reverse_trace_id).await {
            TraceLock::Held(token) => Some(token),
            TraceLock::Skipped => None,
            TraceLock::Contended => {
                let existing = self.contended(reverse_trace_id).await?;
                return refund_of(existing, original_trace_id);
            }
        };

        let result = self.apply_reversal(original_trace_id, reverse_trace_id).await;

        if result.is_err() {
            self.unlock_trace(reverse_trace_id, token.as_deref()).await;
        }

        result
    }

    async fn reversible(&self, trace_id: &str) -> Result<BillingTransaction, BillingError> {
        let original = self
            .ledger
            .find_transaction(trace_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(trace_id.to_string()))?;

        let refusal = |reason: String| BillingError::NotReversible {
            trace_id: trace_id.to_string(),
            reason,
        };

        if original.kind != TransactionKind::Deduct {
            return Err(refusal("only deductions can be reversed".to_string()));
        }
        match original.status {
            TransactionStatus::Committed => Ok(original),
            TransactionStatus::Reversed => Err(refusal("already reversed".to_string())),
            status => Err(refusal(format!("transaction is {status}"))),
        }
    }

    async fn apply_reversal(
        &self,
        original_trace_id: &str,
        reverse_trace_id: &str,
    ) -> Result<BillingTransaction, BillingError> {
        let original = self.reversible(original_trace_id).await?;

        // Claim the original first so two reversals cannot both refund it
        let mut reversed = original.clone();
        reversed.status = TransactionStatus::Reversed;
        reversed.reversed_by = Some(reverse_trace_id.to_string());
        reversed.updated_at = Timestamp::now();
        if !self
            .ledger
            .update_transaction_if(&reversed, TransactionStatus::Committed)
            .await?
        {
            return Err(BillingError::NotReversible {
                trace_id: original_trace_id.to_string(),
                reason: "already reversed".to_string(),
            });
        }

        let charge = UsageCharge {
            amount: original.amount,
            usage: original.usage,
            pricing: original.pricing,
        };
        let mut refund =
            BillingTransaction::for_charge(reverse_trace_id, &original.tenant_id, TransactionKind::Refund, &charge);
        refund.reversal_of = Some(original_trace_id.to_string());

        let result = self.apply_refund(&mut refund).await;
        if let Err(e) = &result {
            tracing::warn!(
                original = original_trace_id,
                reversal = reverse_trace_id,
                error = %e,
                "reversal failed, restoring original transaction"
            );
            best_effort(
                "billing_reversal_restore",
                self.ledger
                    .update_transaction_if(&original, TransactionStatus::Reversed)
                    .await,
            );
        }

        result?;
        tracing::info!(
            original = original_trace_id,
            reversal = reverse_trace_id,
            tenant_id = %refund.tenant_id,
            amount = refund.amount,
            "transaction reversed"
        );
        Ok(refund)
    }

    async fn apply_refund(&self, refund: &mut BillingTransaction) -> Result<(), BillingError> {
        self.ledger.insert_transaction(refund).await?;

        let credit = QuotaCharge {
            amount: -refund.amount,
            daily_requests: 0,
            monthly_requests: 0,
        };
        let quota = match self.charge(&refund.tenant_id, &credit, ChargePolicy::SETTLE).await {
            Ok(quota) => quota,
            Err(e) => {
                best_effort(
                    "billing_rollback",
                    self.ledger.rollback_transaction(&refund.trace_id).await,
                );
                return Err(e);
            }
        };

        refund.commit(quota.balance);
        self.finish(refund, TransactionStatus::Pending).await
    }

    /// Persist a transaction's final state
    async fn finish(&self, tx: &BillingTransaction, expected: TransactionStatus) -> Result<(), BillingError> {
        if self.ledger.update_transaction_if(tx, expected).await? {
            return Ok(());
        }

        // The quota already moved; the row is left for reconciliation
        tracing::error!(
            trace_id = %tx.trace_id,
            tenant_id = %tx.tenant_id,
            expected = %expected,
            "transaction changed while being finalized"
        );
        Err(BillingError::InvalidState {
            trace_id: tx.trace_id.clone(),
            status: expected,
        })
    }

    /// Existing transaction when it is terminal, an error when it is still in
    /// flight, nothing when absent
    async fn existing_terminal(&self, trace_id: &str) -> Result<Option<BillingTransaction>, BillingError> {
        match self.ledger.find_transaction(trace_id).await? {
            Some(tx) if tx.status.is_terminal() => Ok(Some(tx)),
            Some(_) => Err(BillingError::DuplicateInFlight(trace_id.to_string())),
            None => Ok(None),
        }
    }

    async fn contended(&self, trace_id: &str) -> Result<BillingTransaction, BillingError> {
        match self.ledger.find_transaction(trace_id).await? {
            Some(tx) if tx.status.is_terminal() => Ok(tx),
            _ => Err(BillingError::DuplicateInFlight(trace_id.to_string())),
        }
    }

    async fn lock_trace(&self, trace_id: &str) -> TraceLock {
        let Some(fast) = &self.fast else {
            return TraceLock::Skipped;
        };

        let token = uuid::Uuid::new_v4().to_string();
        match fast.set_nx(&lock_key(trace_id), &token, self.config.lock_ttl).await {
            Ok(true) => TraceLock::Held(token),
            Ok(false) => TraceLock::Contended,
            Err(e) => {
                tracing::warn!(trace_id, error = %e, "idempotency lock unavailable, relying on ledger uniqueness");
                TraceLock::Skipped
            }
        }
    }

    async fn unlock_trace(&self, trace_id: &str, token: Option<&str>) {
        let (Some(fast), Some(token)) = (&self.fast, token) else {
            return;
        };
        best_effort(
            "billing_lock_release",
            fast.compare_and_delete(&lock_key(trace_id), token).await,
        );
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("fast_path", &self.fast.as_ref().map(|store| store.backend()))
            .finish_non_exhaustive()
    }
}

fn lock_key(trace_id: &str) -> String {
    format!("billing:lock:{trace_id}")
}

/// An earlier reversal under the same trace, or a conflict when that trace
/// holds some other transaction
fn refund_of(existing: BillingTransaction, original_trace_id: &str) -> Result<BillingTransaction, BillingError> {
    if existing.kind == TransactionKind::Refund && existing.reversal_of.as_deref() == Some(original_trace_id) {
        Ok(existing)
    } else {
        Err(BillingError::DuplicateTransaction(existing.trace_id))
    }
}

fn quota_from_seed(seed: &TenantSeed, now: Timestamp) -> TenantQuota {
    let mut quota = TenantQuota::new(seed.id.clone(), micros_from_decimal(seed.balance), now);
    quota.credit_limit = micros_from_decimal(seed.credit_limit);
    quota.daily_limit = seed.daily_requests;
    quota.monthly_limit = seed.monthly_requests;
    quota.rpm_limit = seed.rpm_limit;
    quota.tpm_limit = seed.tpm_limit;
    quota
}

/// Shortfall reported for a quota kind, for log fields
pub fn shortfall(error: &BillingError) -> Option<(QuotaKind, Micros)> {
    match error {
        BillingError::InsufficientQuota {
            kind,
            required,
            available,
        } => Some((*kind, required.saturating_sub(*available))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::MICROS_PER_UNIT;
    use conduit_store::MemoryStore;

    use super::*;
    use crate::store::MemoryLedgerStore;

    struct Harness {
        ledger: QuotaLedger,
        rows: MemoryLedgerStore,
        fast: MemoryStore,
    }

    fn harness(balance: f64) -> Harness {
        let rows = MemoryLedgerStore::new();
        let fast = MemoryStore::new();
        let mut quota = TenantQuota::new("t1", micros_from_decimal(balance), Timestamp::now());
        quota.daily_limit = Some(100);
        quota.monthly_limit = Some(1_000);
        rows.upsert_quota(quota);

        let ledger = QuotaLedger::new(
            Arc::new(rows.clone()),
            Some(Arc::new(fast.clone())),
            BillingConfig::default(),
        );
        Harness { ledger, rows, fast }
    }

    fn units(amount: i64) -> Micros {
        amount * MICROS_PER_UNIT
    }

    const PRICING: Pricing = Pricing {
        input_per_mtok: 2 * MICROS_PER_UNIT,
        output_per_mtok: 10 * MICROS_PER_UNIT,
    };

    #[tokio::test]
    async fn deduct_is_idempotent_per_trace() {
        let h = harness(10.0);

        let first = h.ledger.deduct("t1", "t1-trace", UsageCharge::flat(units(3))).await.unwrap();
        assert_eq!(first.status, TransactionStatus::Committed);
        assert_eq!(first.balance_before, Some(units(10)));
        assert_eq!(first.balance_after, Some(units(7)));

        let second = h.ledger.deduct("t1", "t1-trace", UsageCharge::flat(units(3))).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(7));
        assert_eq!(h.rows.transactions().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_quota_leaves_no_transaction() {
        let h = harness(1.0);

        let err = h
            .ledger
            .deduct("t1", "trace-1", UsageCharge::flat(units(3)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientQuota {
                kind: QuotaKind::Balance,
                ..
            }
        ));
        assert_eq!(shortfall(&err), Some((QuotaKind::Balance, units(2))));
        assert!(h.rows.transactions().is_empty());

        // The lock was released, so a retry after a recharge goes through
        h.ledger.recharge("t1", "topup-1", units(5)).await.unwrap();
        let tx = h.ledger.deduct("t1", "trace-1", UsageCharge::flat(units(3))).await.unwrap();
        assert_eq!(tx.balance_after, Some(units(3)));
    }

    #[tokio::test]
    async fn in_flight_duplicate_is_rejected() {
        let h = harness(10.0);
        let pending = h
            .ledger
            .create_pending_transaction("t1", "stream-1", TokenUsage::new(100, 100), PRICING)
            .await
            .unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);

        let err = h
            .ledger
            .deduct("t1", "stream-1", UsageCharge::flat(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateInFlight(_)));
    }

    #[tokio::test]
    async fn held_lock_blocks_concurrent_duplicate() {
        let h = harness(10.0);
        h.fast
            .set_nx("billing:lock:busy", "someone-else", Duration::from_secs(30))
            .await
            .unwrap();

        let err = h.ledger.deduct("t1", "busy", UsageCharge::flat(1)).await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicateInFlight(_)));
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(10));
    }

    #[tokio::test]
    async fn pending_then_commit_charges_actual_usage() {
        let h = harness(10.0);

        let pending = h
            .ledger
            .create_pending_transaction("t1", "s1", TokenUsage::new(1_000, 1_024), PRICING)
            .await
            .unwrap();
        let again = h
            .ledger
            .create_pending_transaction("t1", "s1", TokenUsage::new(1, 1), PRICING)
            .await
            .unwrap();
        assert_eq!(again.id, pending.id);

        let committed = h
            .ledger
            .commit_pending_transaction("s1", TokenUsage::new(1_000, 500), PRICING)
            .await
            .unwrap();
        // 1000 * 2 + 500 * 10 micros
        assert_eq!(committed.amount, 7_000);
        assert_eq!(committed.status, TransactionStatus::Committed);
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(10) - 7_000);

        let repeat = h
            .ledger
            .commit_pending_transaction("s1", TokenUsage::new(9_999, 9_999), PRICING)
            .await
            .unwrap();
        assert_eq!(repeat, committed);
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(10) - 7_000);
    }

    #[tokio::test]
    async fn commit_of_failed_transaction_is_rejected() {
        let h = harness(10.0);
        h.ledger
            .create_pending_transaction("t1", "s2", TokenUsage::new(10, 10), PRICING)
            .await
            .unwrap();
        let failed = h.ledger.fail_pending_transaction("s2", "upstream error").await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);

        let err = h
            .ledger
            .commit_pending_transaction("s2", TokenUsage::new(10, 10), PRICING)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidState {
                status: TransactionStatus::Failed,
                ..
            }
        ));
        assert!(matches!(
            h.ledger
                .commit_pending_transaction("missing", TokenUsage::default(), PRICING)
                .await,
            Err(BillingError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn settlement_may_overdraw() {
        let h = harness(0.001);
        h.ledger
            .create_pending_transaction("t1", "s3", TokenUsage::new(1, 1), PRICING)
            .await
            .unwrap();

        let committed = h
            .ledger
            .commit_pending_transaction("s3", TokenUsage::new(0, 1_000), PRICING)
            .await
            .unwrap();
        assert_eq!(committed.balance_after, Some(1_000 - 10_000));
    }

    #[tokio::test]
    async fn reverse_refunds_once() {
        let h = harness(10.0);
        h.ledger.deduct("t1", "d1", UsageCharge::flat(units(4))).await.unwrap();

        let refund = h.ledger.reverse("d1", "r1").await.unwrap();
        assert_eq!(refund.kind, TransactionKind::Refund);
        assert_eq!(refund.reversal_of.as_deref(), Some("d1"));
        assert_eq!(refund.balance_after, Some(units(10)));

        let original = h.ledger.transaction("d1").await.unwrap().unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        assert_eq!(original.reversed_by.as_deref(), Some("r1"));

        // Same reversal trace returns the same refund
        assert_eq!(h.ledger.reverse("d1", "r1").await.unwrap(), refund);

        // A different reversal trace is refused
        let err = h.ledger.reverse("d1", "r2").await.unwrap_err();
        assert!(matches!(err, BillingError::NotReversible { .. }));
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(10));
    }

    #[tokio::test]
    async fn only_deductions_reverse() {
        let h = harness(1.0);
        h.ledger.recharge("t1", "top", units(1)).await.unwrap();

        let err = h.ledger.reverse("top", "r-top").await.unwrap_err();
        assert!(matches!(err, BillingError::NotReversible { .. }));
        assert!(h.ledger.transaction("r-top").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reversal_trace_taken_by_another_transaction_conflicts() {
        let h = harness(10.0);
        h.ledger.deduct("t1", "d1", UsageCharge::flat(units(4))).await.unwrap();
        h.ledger.deduct("t1", "d2", UsageCharge::flat(units(1))).await.unwrap();

        let err = h.ledger.reverse("d1", "d2").await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicateTransaction(ref trace) if trace == "d2"));

        // A refund of a different original is not a match either
        h.ledger.reverse("d2", "r2").await.unwrap();
        let err = h.ledger.reverse("d1", "r2").await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicateTransaction(_)));

        let original = h.ledger.transaction("d1").await.unwrap().unwrap();
        assert_eq!(original.status, TransactionStatus::Committed);
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, units(6));
    }

    #[tokio::test]
    async fn failed_sync_is_replayed_before_the_mirror_is_reseeded() {
        let h = harness(10.0);
        h.ledger.check_and_deduct("t1", units(1), 1, 1, false).await.unwrap();

        h.rows.set_offline(true);
        let quota = h.ledger.check_and_deduct("t1", units(2), 1, 1, false).await.unwrap();
        assert_eq!(quota.balance, units(7));
        h.rows.set_offline(false);

        // mirror expires before any later sync succeeds
        h.fast.delete("quota:t1").await.unwrap();

        let quota = h.ledger.check_and_deduct("t1", units(1), 1, 1, false).await.unwrap();
        assert_eq!(quota.balance, units(6));
        assert_eq!(quota.daily_used, 3);

        let row = h.rows.load_quota("t1").await.unwrap().unwrap();
        assert_eq!(row.balance, units(6));
    }

    #[tokio::test]
    async fn mirror_is_seeded_on_first_use_and_synced_back() {
        let h = harness(10.0);
        assert!(h.fast.hash_get_all("quota:t1").await.unwrap().is_empty());

        let quota = h.ledger.check_and_deduct("t1", units(1), 1, 1, false).await.unwrap();
        assert_eq!(quota.balance, units(9));
        assert_eq!(quota.daily_used, 1);

        let mirror = h.fast.hash_get_all("quota:t1").await.unwrap();
        assert_eq!(mirror["balance"], units(9).to_string());

        let row = h.rows.load_quota("t1").await.unwrap().unwrap();
        assert_eq!(row.balance, units(9));
        assert_eq!(row.version, quota.version);
    }

    #[tokio::test]
    async fn falls_back_to_ledger_when_store_is_down() {
        let h = harness(10.0);
        h.ledger.check_and_deduct("t1", units(1), 1, 1, false).await.unwrap();

        h.fast.set_offline(true);
        let quota = h.ledger.check_and_deduct("t1", units(2), 1, 1, false).await.unwrap();
        assert_eq!(quota.balance, units(7));
        assert_eq!(quota.daily_used, 2);

        // Transactions still work without the lock
        let tx = h.ledger.deduct("t1", "offline-1", UsageCharge::flat(units(1))).await.unwrap();
        assert_eq!(tx.balance_after, Some(units(6)));

        h.fast.set_offline(false);
        let quota = h.ledger.check_and_deduct("t1", units(1), 1, 1, false).await.unwrap();
        assert_eq!(quota.balance, units(5));
    }

    #[tokio::test]
    async fn daily_limit_rejects_before_charging() {
        let h = harness(10.0);
        let err = h.ledger.check_and_deduct("t1", 1, 101, 1, false).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientQuota {
                kind: QuotaKind::Daily,
                required: 101,
                available: 100
            }
        ));
        assert_eq!(h.ledger.quota("t1").await.unwrap().daily_used, 0);
    }

    #[tokio::test]
    async fn unknown_tenant_is_reported() {
        let h = harness(1.0);
        assert!(matches!(
            h.ledger.check_and_deduct("nobody", 1, 1, 1, false).await,
            Err(BillingError::TenantNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deductions_conserve_balance() {
        let h = Arc::new(harness(10.0));

        let mut handles = Vec::new();
        for i in 0..40 {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                h.ledger
                    .deduct("t1", &format!("c-{i}"), UsageCharge::flat(units(1) / 2))
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        // 10.00 covers exactly twenty 0.50 charges, but the daily limit is 100
        assert_eq!(succeeded, 20);
        assert_eq!(h.ledger.quota("t1").await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn configured_tenants_are_seeded_once() {
        let rows = MemoryLedgerStore::new();
        let config = BillingConfig {
            tenants: vec![TenantSeed {
                id: "acme".to_string(),
                balance: 25.5,
                credit_limit: 5.0,
                daily_requests: Some(10),
                monthly_requests: None,
                rpm_limit: None,
                tpm_limit: None,
            }],
            ..BillingConfig::default()
        };
        let ledger = QuotaLedger::new(Arc::new(rows.clone()), None, config);

        assert_eq!(ledger.seed_tenants().await.unwrap(), 1);
        assert_eq!(ledger.seed_tenants().await.unwrap(), 0);

        let quota = ledger.quota("acme").await.unwrap();
        assert_eq!(quota.balance, 25_500_000);
        assert_eq!(quota.credit_limit, 5 * MICROS_PER_UNIT);
        assert_eq!(quota.daily_limit, Some(10));
    }
}
