//! The limit decision orchestrator.
//!
//! Composes identity resolution, device-farm capping, decay, threshold
//! evaluation, gate escalation, and budget capping into a single decision
//! per request. The engine holds no mutable state of its own; score updates
//! are read-modify-write against the store and may under- or over-count
//! under concurrent access to the same key (see the store module docs).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::PolicyRegistry;
use crate::error::Result;
use crate::identity::DeviceIdentityResolver;
use crate::signal::CircuitMonitor;
use crate::store::{CorrelationStore, RateLimitState, RateLimitStore, StoreError};

use super::budget::BudgetTracker;
use super::context::{LimitDecision, LimitRequest, RateLimitContext, Scope, Verdict};
use super::decay;
use super::ephemeral::{ip_scope, EphemeralBucket};
use super::gate::AntiEquilibriumGate;
use super::penalty::PenaltyLadder;
use super::policy::{BlockPolicy, FailureMode, Signal, Thresholds};
use super::unix_now;

/// TTL for persisted score state.
const STATE_TTL: Duration = Duration::from_secs(86_400);
/// Window for the missing-fingerprint and spray correlation keys.
const CORRELATION_WINDOW: Duration = Duration::from_secs(900);
/// Missing-fingerprint repeats inside the window before the harder signal fires.
const REPEATED_MISSING_THRESHOLD: u64 = 3;
/// Distinct accounts per IP scope inside the window before spray fires.
const SPRAY_ACCOUNT_CAP: u64 = 5;
/// Top of the penalty ladder.
const MAX_BLOCK_LEVEL: u8 = 6;

/// Outcome for a single (scope, key) evaluation.
struct ScopeOutcome {
    level: u8,
    retry_after: Option<Duration>,
    /// True when this call placed the block, as opposed to reporting one
    /// that was already standing.
    newly_blocked: bool,
}

/// The abuse-protection rate limiter.
///
/// Safe for concurrent use; all mutable state lives in the injected stores.
pub struct RateLimiter {
    registry: PolicyRegistry,
    store: Arc<dyn RateLimitStore>,
    correlation: Arc<dyn CorrelationStore>,
    resolver: DeviceIdentityResolver,
    bucket: EphemeralBucket,
    gate: AntiEquilibriumGate,
    budget: BudgetTracker,
    monitor: Option<Arc<CircuitMonitor>>,
}

impl RateLimiter {
    /// Create a limiter over the given policy registry and stores.
    pub fn new(
        registry: PolicyRegistry,
        store: Arc<dyn RateLimitStore>,
        correlation: Arc<dyn CorrelationStore>,
        fingerprint_secret: &[u8],
    ) -> Self {
        Self {
            registry,
            resolver: DeviceIdentityResolver::new(fingerprint_secret),
            bucket: EphemeralBucket::new(correlation.clone()),
            gate: AntiEquilibriumGate::new(correlation.clone()),
            budget: BudgetTracker::new(store.clone()),
            store,
            correlation,
            monitor: None,
        }
    }

    /// Attach a circuit monitor that will observe store health outcomes.
    pub fn with_monitor(mut self, monitor: Arc<CircuitMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Evaluate one request against a named policy.
    ///
    /// Only configuration errors (unknown policy) are returned as `Err`.
    /// Store failures resolve to the policy's failure mode.
    pub async fn limit(
        &self,
        ctx: &RateLimitContext,
        request: &LimitRequest,
    ) -> Result<LimitDecision> {
        let policy = self.registry.get(&request.policy)?;

        if !self.store.is_healthy() {
            self.observe_health(false).await;
            warn!(policy = %policy.name, "store unhealthy, applying failure mode");
            return Ok(failure_decision(&policy));
        }

        match self.evaluate(&policy, ctx, request).await {
            Ok(decision) => {
                self.observe_health(true).await;
                Ok(decision)
            }
            Err(err) => {
                self.observe_health(false).await;
                warn!(policy = %policy.name, error = %err, "store failure, applying failure mode");
                Ok(failure_decision(&policy))
            }
        }
    }

    async fn evaluate(
        &self,
        policy: &BlockPolicy,
        ctx: &RateLimitContext,
        request: &LimitRequest,
    ) -> std::result::Result<LimitDecision, StoreError> {
        let mut identity = self.resolver.resolve(ctx);
        let ephemeral = self.bucket.check(ctx, &identity.fingerprint_hash).await?;
        identity.churn_detected = ephemeral.is_ephemeral;
        let device_key = self
            .bucket
            .resolve_key(ctx, &ephemeral, &identity.fingerprint_hash);

        let now = unix_now();
        // Prechecks and success reports charge nothing and are evaluated
        // against the default threshold class.
        let signal = if request.is_precheck || request.is_success {
            None
        } else {
            Some(self.derive_signal(policy, ctx, request).await?)
        };

        trace!(
            policy = %policy.name,
            signal = ?signal,
            confidence = ?identity.confidence,
            churn = identity.churn_detected,
            "evaluating limit request"
        );

        let mut outcomes = Vec::with_capacity(policy.scopes.len());
        for scope in &policy.scopes {
            let key_id = match scope {
                Scope::Account => match &ctx.account_id {
                    Some(account) => account.clone(),
                    None => continue,
                },
                Scope::Device => device_key.clone(),
                Scope::Ip => ip_scope(&ctx.ip),
            };
            let outcome = self
                .evaluate_scope(policy, request, *scope, &key_id, signal, now)
                .await?;
            outcomes.push(outcome);
        }

        // The gate only counts blocks entered on this call; a standing
        // block reported by the short-circuit is one episode, not many.
        let newly_soft = outcomes.iter().any(|o| o.newly_blocked && o.level == 1);
        let mut decision = merge(outcomes, policy.failure_mode);
        decision.ephemeral = Some(ephemeral);

        if newly_soft && decision.block_level == Some(1) {
            if let Some(account) = &ctx.account_id {
                decision = self.apply_gate(policy, account, decision, now).await?;
            }
        }

        if let Some(budget_cfg) = &policy.budget {
            if !request.is_precheck {
                decision = self
                    .apply_budget(policy, ctx, budget_cfg.threshold, budget_cfg.block_level, decision)
                    .await?;
            }
        }

        Ok(decision)
    }

    /// Evaluate one scope: block short-circuit, decay, charge, thresholds,
    /// persistence.
    async fn evaluate_scope(
        &self,
        policy: &BlockPolicy,
        request: &LimitRequest,
        scope: Scope,
        key_id: &str,
        signal: Option<Signal>,
        now: u64,
    ) -> std::result::Result<ScopeOutcome, StoreError> {
        let score_key = format!("rl:{}:{}:{}", policy.name, scope.as_str(), key_id);
        let block_key = format!("block:{}:{}:{}", policy.name, scope.as_str(), key_id);

        // An active block answers immediately. Failure reports are the
        // exception: they keep scoring, so an attacker hammering through a
        // soft block still escalates toward a hard one.
        if let Some(block) = self.store.check_block(&block_key).await? {
            if block.expires_at > now && !request.is_failure {
                return Ok(ScopeOutcome {
                    level: block.level,
                    retry_after: Some(Duration::from_secs(block.expires_at - now)),
                    newly_blocked: false,
                });
            }
        }

        let stored = self.store.get(&score_key).await?.unwrap_or(RateLimitState {
            score: 0,
            block_level: 0,
            last_update: now,
        });

        let elapsed = now.saturating_sub(stored.last_update);
        let decayed_by = decay::owed(stored.score, elapsed, stored.block_level, scope);
        let decayed = stored.score - decayed_by.amount;
        // A score that fully decayed ends the escalation episode; the stored
        // block level no longer carries forward.
        let episode_level = if decayed == 0 { 0 } else { stored.block_level };

        let thresholds = match signal {
            Some(s) => policy.thresholds_for(&s.class()),
            None => policy.default_thresholds,
        };

        if request.is_precheck {
            let level = threshold_level(decayed, thresholds);
            return Ok(ScopeOutcome {
                level,
                retry_after: None,
                newly_blocked: false,
            });
        }

        let delta = signal.map(|s| policy.delta(s)).unwrap_or(0) * u64::from(request.cost);
        let new_score = decayed + delta;

        let crossed = threshold_level(new_score, thresholds);
        let level = escalated_level(crossed, episode_level);

        let mut retry_after = None;
        let mut newly_blocked = false;
        if level > 0 {
            let duration = PenaltyLadder::duration(level);
            self.store
                .block(&block_key, level, now + duration.as_secs(), duration)
                .await?;
            retry_after = Some(duration);
            newly_blocked = true;
            debug!(key = %block_key, level, score = new_score, "block placed");
        }

        let next_level = if new_score == 0 {
            0
        } else {
            episode_level.max(level)
        };
        let last_update = if decayed == 0 {
            now
        } else {
            stored.last_update + decayed_by.consumed_secs
        };

        self.store
            .put(
                &score_key,
                RateLimitState {
                    score: new_score,
                    block_level: next_level,
                    last_update,
                },
                STATE_TTL,
            )
            .await?;

        Ok(ScopeOutcome {
            level,
            retry_after,
            newly_blocked,
        })
    }

    /// Derive which signal this request fires. Correlation observations are
    /// recorded for every counted call so the windows keep tracking even
    /// when a higher-priority signal wins.
    async fn derive_signal(
        &self,
        policy: &BlockPolicy,
        ctx: &RateLimitContext,
        request: &LimitRequest,
    ) -> std::result::Result<Signal, StoreError> {
        let missing_fp =
            policy.scopes.contains(&Scope::Device) && ctx.client_fingerprint.is_none();
        let mut repeated_missing = false;
        if missing_fp {
            let actor = ctx
                .account_id
                .clone()
                .unwrap_or_else(|| ip_scope(&ctx.ip));
            let misses = self
                .correlation
                .increment_watch_flag(&format!("fp:miss:{}", actor), CORRELATION_WINDOW)
                .await?;
            repeated_missing = misses >= REPEATED_MISSING_THRESHOLD;
        }

        let mut spray = false;
        if let Some(account) = &ctx.account_id {
            let accounts = self
                .correlation
                .add_distinct(
                    &format!("spray:ip:{}", ip_scope(&ctx.ip)),
                    account,
                    CORRELATION_WINDOW,
                )
                .await?;
            spray = accounts > SPRAY_ACCOUNT_CAP;
        }

        Ok(if request.is_failure {
            Signal::Failure
        } else if repeated_missing {
            Signal::RepeatedMissingFingerprint
        } else if missing_fp {
            Signal::MissingFingerprint
        } else if spray {
            Signal::Spray
        } else {
            Signal::Access
        })
    }

    /// Record the soft block with the gate and harden the decision once the
    /// account has accumulated enough of them.
    async fn apply_gate(
        &self,
        policy: &BlockPolicy,
        account: &str,
        mut decision: LimitDecision,
        now: u64,
    ) -> std::result::Result<LimitDecision, StoreError> {
        self.gate.record_soft_block(account).await?;
        if !self.gate.should_escalate(account).await? {
            return Ok(decision);
        }

        let level = 2;
        let duration = PenaltyLadder::duration(level);
        let block_key = format!("block:{}:acc:{}", policy.name, account);
        self.store
            .block(&block_key, level, now + duration.as_secs(), duration)
            .await?;
        warn!(
            policy = %policy.name,
            account = %account,
            "repeated soft blocks, escalating to hard block"
        );

        decision.verdict = Verdict::HardBlock;
        decision.block_level = Some(level);
        decision.retry_after = Some(duration);
        Ok(decision)
    }

    /// Count the request against the policy's budget and override any
    /// milder outcome once it is exceeded. Budget precedence is absolute.
    async fn apply_budget(
        &self,
        policy: &BlockPolicy,
        ctx: &RateLimitContext,
        threshold: u64,
        block_level: u8,
        mut decision: LimitDecision,
    ) -> std::result::Result<LimitDecision, StoreError> {
        let actor = ctx
            .account_id
            .clone()
            .unwrap_or_else(|| ip_scope(&ctx.ip));
        let budget_key = format!("budget:{}:{}", policy.name, actor);

        self.budget.increment(&budget_key).await?;
        if !self.budget.is_exceeded(&budget_key, threshold).await? {
            return Ok(decision);
        }

        let level = block_level
            .max(decision.block_level.unwrap_or(0))
            .min(MAX_BLOCK_LEVEL);
        debug!(policy = %policy.name, level, "budget exceeded, overriding decision");

        decision.verdict = Verdict::HardBlock;
        decision.block_level = Some(level);
        let duration = PenaltyLadder::duration(level);
        decision.retry_after = Some(
            decision
                .retry_after
                .map_or(duration, |current| current.max(duration)),
        );
        Ok(decision)
    }

    async fn observe_health(&self, healthy: bool) {
        if let Some(monitor) = &self.monitor {
            monitor.observe(healthy).await;
        }
    }
}

/// Decision applied when the store cannot be consulted.
fn failure_decision(policy: &BlockPolicy) -> LimitDecision {
    match policy.failure_mode {
        FailureMode::FailOpen => LimitDecision {
            degraded: true,
            ..LimitDecision::allow(FailureMode::FailOpen)
        },
        FailureMode::FailClosed => LimitDecision {
            verdict: Verdict::HardBlock,
            block_level: None,
            // Neutral, bounded retry hint: the shortest lockout tier.
            retry_after: Some(PenaltyLadder::duration(1)),
            failure_mode: FailureMode::FailClosed,
            degraded: true,
            ephemeral: None,
        },
    }
}

fn threshold_level(score: u64, thresholds: Thresholds) -> u8 {
    if score >= thresholds.l3 {
        3
    } else if score >= thresholds.l2 {
        2
    } else if score >= thresholds.l1 {
        1
    } else {
        0
    }
}

/// Combine the crossed threshold tier with the episode's standing level.
/// Re-crossing a hard threshold while already at that level steps one rung
/// up the ladder; a soft crossing never lowers an episode's level.
fn escalated_level(crossed: u8, episode_level: u8) -> u8 {
    match crossed {
        0 => 0,
        c if c >= 2 && episode_level >= c => (episode_level + 1).min(MAX_BLOCK_LEVEL),
        c => c.max(episode_level).min(MAX_BLOCK_LEVEL),
    }
}

fn merge(outcomes: Vec<ScopeOutcome>, failure_mode: FailureMode) -> LimitDecision {
    let mut level = 0u8;
    let mut retry_after: Option<Duration> = None;

    for outcome in outcomes {
        level = level.max(outcome.level);
        retry_after = match (retry_after, outcome.retry_after) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    let mut decision = LimitDecision::allow(failure_mode);
    decision.verdict = Verdict::from_level(level);
    decision.block_level = (level > 0).then_some(level);
    decision.retry_after = retry_after;
    decision
}
