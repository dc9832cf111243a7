//! Reconciliation engine
//!
//! Decides, for every inbound event, what a user's plan and quota state should become and
//! commits that transition through the guarded store write path.
//!
//! ## Ordering and replay
//!
//! - Webhook transitions are no-ops when the record already reflects the event's
//!   subscription and tier, so provider redeliveries converge on the same record.
//! - Events for a subscription other than the one backing the record are dropped as
//!   superseded. This covers the duplicates cancelled during checkout reconciliation.
//! - Timestamps written by webhook transitions come from the provider event.

use std::sync::Arc;

use quotagate_shared::{PlanTier, UserRecord};
use time::OffsetDateTime;

use crate::answers::{AnswerBackend, AnswerError, ProfileSource};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    ApologyReason, BillingEvent, Disposition, DropReason, MenuCommand, Outcome, Reply,
};
use crate::locks::IdentityLocks;
use crate::payments::{PaymentProvider, SubscriptionStatus, SubscriptionSummary};
use crate::plans::PlanResolver;
use crate::reset::{ResetOutcome, UsageReset};
use crate::store::{self, UpdateOutcome, UserStore};
use crate::usage::UsageGate;

/// Which subscription a checkout should commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubscriptionChoice {
    None,
    /// Newest subscription plus the older ones to cancel
    Latest {
        winner: SubscriptionSummary,
        superseded: Vec<SubscriptionSummary>,
    },
    /// Several subscriptions share the newest creation time
    Tie(Vec<SubscriptionSummary>),
}

/// Pick the subscription with the highest creation time.
pub(crate) fn choose_subscription(mut active: Vec<SubscriptionSummary>) -> SubscriptionChoice {
    let Some(newest) = active.iter().map(|s| s.created).max() else {
        return SubscriptionChoice::None;
    };

    let (mut latest, superseded): (Vec<_>, Vec<_>) =
        active.drain(..).partition(|s| s.created == newest);

    if latest.len() > 1 {
        return SubscriptionChoice::Tie(latest);
    }

    match latest.pop() {
        Some(winner) => SubscriptionChoice::Latest { winner, superseded },
        None => SubscriptionChoice::None,
    }
}

/// Where the smart-redirect endpoint should send an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    Checkout { url: String },
    Portal { url: String },
    /// Paid user whose portal session could not be created
    PortalUnavailable,
}

pub struct ReconciliationEngine {
    store: Arc<dyn UserStore>,
    payments: Arc<dyn PaymentProvider>,
    answers: Arc<dyn AnswerBackend>,
    profiles: Arc<dyn ProfileSource>,
    resolver: PlanResolver,
    gate: UsageGate,
    reset: UsageReset,
    locks: IdentityLocks,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn UserStore>,
        payments: Arc<dyn PaymentProvider>,
        answers: Arc<dyn AnswerBackend>,
        profiles: Arc<dyn ProfileSource>,
        resolver: PlanResolver,
        config: &BillingConfig,
    ) -> Self {
        Self {
            reset: UsageReset::new(store.clone(), config.reset),
            gate: UsageGate::new(config.quota_limit),
            store,
            payments,
            answers,
            profiles,
            resolver,
            locks: IdentityLocks::new(),
        }
    }

    pub fn quota_limit(&self) -> u32 {
        self.gate.quota_limit()
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Apply one event.
    ///
    /// Errors are dependency or invariant failures; the caller decides whether the sender
    /// should redeliver.
    pub async fn handle(&self, event: BillingEvent) -> BillingResult<Outcome> {
        let event_kind = event.kind();
        tracing::debug!(event_kind, "Handling event");

        let result = match event {
            BillingEvent::MessageReceived {
                identity,
                text,
                occurred_at,
            } => self.on_message(&identity, &text, occurred_at).await,
            BillingEvent::Follow {
                identity,
                occurred_at,
            } => self.on_follow(&identity, occurred_at).await,
            BillingEvent::MenuRequested {
                identity, command, ..
            } => self.on_menu(&identity, command).await,
            BillingEvent::CheckoutCompleted {
                identity,
                customer_id,
                subscription_id,
                occurred_at,
            } => {
                self.on_checkout_completed(
                    identity.as_deref(),
                    &customer_id,
                    subscription_id.as_deref(),
                    occurred_at,
                )
                .await
            }
            BillingEvent::SubscriptionUpdated {
                customer_id,
                subscription_id,
                status,
                price_id,
                occurred_at,
            } => {
                self.on_subscription_updated(
                    &customer_id,
                    &subscription_id,
                    status,
                    price_id.as_deref(),
                    occurred_at,
                )
                .await
            }
            BillingEvent::SubscriptionDeleted {
                customer_id,
                subscription_id,
                ..
            } => {
                self.on_subscription_deleted(&customer_id, &subscription_id)
                    .await
            }
            BillingEvent::ScheduledReset { now } => self.on_scheduled_reset(now).await,
        };

        if let Err(e) = &result {
            tracing::error!(event_kind, error = %e, kind = ?e.kind(), "Event handling failed");
        }
        result
    }

    // =========================================================================
    // Chat
    // =========================================================================

    async fn on_message(
        &self,
        identity: &str,
        text: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Outcome> {
        let _guard = self.locks.lock(identity).await;

        let existing = self.store.get(identity).await?;
        let current = existing
            .clone()
            .unwrap_or_else(|| UserRecord::new_free(identity, "", now));

        if !self.gate.check_and_consume(&current, now).allowed {
            tracing::info!(
                identity,
                usage_count = current.usage_count,
                "Free quota exhausted, offering upgrade"
            );
            return Ok(Outcome::new(Disposition::Unchanged)
                .with_record(existing)
                .reply(Reply::UpgradeOffer {
                    quota_limit: self.quota_limit(),
                }));
        }

        let answer = match self
            .answers
            .ask(text, identity, current.conversation_token.as_deref())
            .await
        {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(
                    identity,
                    dependency = "answer_backend",
                    error = %err,
                    "Answer backend failed, quota not consumed"
                );
                let reason = match err {
                    AnswerError::Overloaded => ApologyReason::Overloaded,
                    AnswerError::Failed(_) => ApologyReason::AnswerFailed,
                };
                return Ok(Outcome::new(Disposition::Unchanged)
                    .with_record(existing)
                    .reply(Reply::Apology(reason)));
            }
        };

        if existing.is_none() {
            let display_name = self.display_name(identity).await;
            store::create_checked(
                self.store.as_ref(),
                &UserRecord::new_free(identity, display_name, now),
            )
            .await?;
            tracing::info!(identity, "Created user on first message");
        }

        let gate = self.gate;
        let token = answer.conversation_token.clone();
        let outcome = store::update_with(self.store.as_ref(), identity, |current| {
            let decision = gate.check_and_consume(current, now);
            if !decision.allowed {
                return Ok(None);
            }
            let mut next = decision.record;
            if token.is_some() {
                next.conversation_token = token.clone();
            }
            Ok(Some(next))
        })
        .await?;

        let committed = match outcome {
            UpdateOutcome::Updated { after, .. } => after,
            UpdateOutcome::Unchanged(record) => {
                if !self.gate.check_and_consume(&record, now).allowed {
                    // Another writer used the last free answer while this one was generated.
                    tracing::info!(identity, "Quota exhausted during answer generation");
                    return Ok(Outcome::new(Disposition::Unchanged)
                        .with_record(Some(record))
                        .reply(Reply::UpgradeOffer {
                            quota_limit: self.quota_limit(),
                        }));
                }
                record
            }
            UpdateOutcome::Missing => return Err(BillingError::UserNotFound(identity.to_string())),
        };

        let mut result = Outcome::new(Disposition::Applied).reply(Reply::Answer(answer.text));
        if self.gate.should_warn(&committed) {
            if let Some(remaining) = self.gate.remaining(&committed) {
                result = result.notify(Reply::QuotaRemaining { remaining });
            }
        }

        tracing::info!(
            identity,
            plan = %committed.plan,
            usage_count = committed.usage_count,
            "Answered message"
        );
        Ok(result.with_record(Some(committed)))
    }

    async fn on_follow(&self, identity: &str, now: OffsetDateTime) -> BillingResult<Outcome> {
        let _guard = self.locks.lock(identity).await;

        let profile_name = self.display_name(identity).await;
        let (disposition, record) = match self.store.get(identity).await? {
            Some(existing) => (Disposition::Unchanged, existing),
            None => {
                let created = store::create_checked(
                    self.store.as_ref(),
                    &UserRecord::new_free(identity, profile_name.clone(), now),
                )
                .await?;
                tracing::info!(identity, "Created user on follow");
                (Disposition::Applied, created)
            }
        };

        let display_name = if profile_name.is_empty() {
            record.display_name.clone()
        } else {
            profile_name
        };

        Ok(Outcome::new(disposition)
            .with_record(Some(record))
            .reply(Reply::Welcome {
                display_name,
                quota_limit: self.quota_limit(),
            }))
    }

    async fn on_menu(&self, identity: &str, command: MenuCommand) -> BillingResult<Outcome> {
        let record = self.store.get(identity).await?;
        let reply = match command {
            MenuCommand::Status => self.plan_status(identity, record.as_ref()).await,
            MenuCommand::Subscribe(plan) => {
                match self
                    .checkout_link(identity, plan.unwrap_or(PlanTier::Monthly))
                    .await
                {
                    Ok(url) => Reply::CheckoutLink { url },
                    Err(e) => {
                        tracing::warn!(identity, dependency = "stripe", error = %e, "Checkout link failed");
                        Reply::LinkUnavailable
                    }
                }
            }
            MenuCommand::Manage => {
                match record.as_ref().and_then(|r| r.payment_customer_id.as_deref()) {
                    None => Reply::FreePlanNotice,
                    Some(customer_id) => match self.payments.create_portal_url(customer_id).await {
                        Ok(url) => Reply::PortalLink { url },
                        Err(e) => {
                            tracing::warn!(
                                identity,
                                customer_id,
                                dependency = "stripe",
                                error = %e,
                                "Portal link failed"
                            );
                            Reply::LinkUnavailable
                        }
                    },
                }
            }
        };

        Ok(Outcome::new(Disposition::Unchanged)
            .with_record(record)
            .reply(reply))
    }

    async fn plan_status(&self, identity: &str, record: Option<&UserRecord>) -> Reply {
        let paid = record.filter(|r| r.is_paid());
        let Some(record) = paid else {
            return Reply::PlanMenu {
                quota_limit: self.quota_limit(),
            };
        };
        let Some(customer_id) = record.payment_customer_id.as_deref() else {
            return Reply::PlanMenu {
                quota_limit: self.quota_limit(),
            };
        };

        let portal_url = match self.payments.create_portal_url(customer_id).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(identity, customer_id, error = %e, "Portal link failed");
                None
            }
        };

        let switch_plan = match record.plan.alternate_paid() {
            Some(target) => match self
                .payments
                .create_checkout_url(identity, target, Some(customer_id))
                .await
            {
                Ok(url) => Some((target, url)),
                Err(e) => {
                    tracing::warn!(identity, customer_id, error = %e, "Plan change link failed");
                    None
                }
            },
            None => None,
        };

        Reply::PlanStatus {
            plan: record.plan,
            portal_url,
            switch_plan,
        }
    }

    async fn display_name(&self, identity: &str) -> String {
        match self.profiles.display_name(identity).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(identity, dependency = "chat_profile", error = %e, "Profile lookup failed");
                String::new()
            }
        }
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Checkout URL for `plan`, reusing the identity's payment customer when known.
    pub async fn checkout_link(&self, identity: &str, plan: PlanTier) -> BillingResult<String> {
        let customer_id = self
            .store
            .get(identity)
            .await?
            .and_then(|r| r.payment_customer_id);
        self.payments
            .create_checkout_url(identity, plan, customer_id.as_deref())
            .await
    }

    /// Portal URL for the identity's payment customer, if it has one.
    pub async fn portal_link(&self, identity: &str) -> BillingResult<Option<String>> {
        match self
            .store
            .get(identity)
            .await?
            .and_then(|r| r.payment_customer_id)
        {
            Some(customer_id) => self.payments.create_portal_url(&customer_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Send paying users to the portal and everyone else to checkout.
    pub async fn smart_redirect(
        &self,
        identity: &str,
        plan: Option<PlanTier>,
    ) -> BillingResult<RedirectDecision> {
        let record = self.store.get(identity).await?;
        let plan = plan.filter(|p| p.is_paid()).unwrap_or(PlanTier::Monthly);

        let paid_customer = record
            .as_ref()
            .filter(|r| r.is_paid())
            .and_then(|r| r.payment_customer_id.clone());

        match paid_customer {
            Some(customer_id) => match self.payments.create_portal_url(&customer_id).await {
                Ok(url) => Ok(RedirectDecision::Portal { url }),
                Err(e) => {
                    tracing::error!(
                        identity,
                        customer_id = %customer_id,
                        dependency = "stripe",
                        error = %e,
                        "Portal session creation failed"
                    );
                    Ok(RedirectDecision::PortalUnavailable)
                }
            },
            None => {
                let customer_id = record.and_then(|r| r.payment_customer_id);
                let url = self
                    .payments
                    .create_checkout_url(identity, plan, customer_id.as_deref())
                    .await?;
                Ok(RedirectDecision::Checkout { url })
            }
        }
    }

    // =========================================================================
    // Payment provider webhooks
    // =========================================================================

    async fn on_checkout_completed(
        &self,
        identity: Option<&str>,
        customer_id: &str,
        session_subscription: Option<&str>,
        occurred_at: OffsetDateTime,
    ) -> BillingResult<Outcome> {
        let Some(identity) = identity.filter(|i| !i.is_empty()) else {
            tracing::warn!(customer_id, "Checkout completed without identity metadata, dropping");
            return Ok(Outcome::dropped(DropReason::UnknownIdentity));
        };
        let _guard = self.locks.lock(identity).await;

        let active = self.payments.list_active_subscriptions(customer_id).await?;
        let winner = match choose_subscription(active) {
            SubscriptionChoice::Latest { winner, superseded } => {
                for old in &superseded {
                    tracing::info!(
                        identity,
                        customer_id,
                        subscription_id = %old.id,
                        kept_subscription_id = %winner.id,
                        "Cancelling superseded subscription"
                    );
                    self.payments.cancel_subscription(&old.id, true).await?;
                }
                winner
            }
            SubscriptionChoice::Tie(tied) => {
                let tied_ids: Vec<&str> = tied.iter().map(|s| s.id.as_str()).collect();
                tracing::error!(
                    target: "billing_alert",
                    identity,
                    customer_id,
                    subscription_ids = ?tied_ids,
                    "Multiple active subscriptions share the newest creation time, none cancelled"
                );
                // Only a session subscription inside the tied set can back the plan.
                match session_subscription.and_then(|id| tied.into_iter().find(|s| s.id == id)) {
                    Some(own) => own,
                    None => return Ok(Outcome::dropped(DropReason::AmbiguousSubscription)),
                }
            }
            SubscriptionChoice::None => match session_subscription {
                // The list can lag behind a just-completed checkout.
                Some(id) => {
                    let own = self.payments.retrieve_subscription(id).await?;
                    if !own.status.is_active() {
                        tracing::warn!(
                            identity,
                            customer_id,
                            subscription_id = id,
                            status = ?own.status,
                            "Checkout subscription is not active, dropping"
                        );
                        return Ok(Outcome::dropped(DropReason::NoActiveSubscription));
                    }
                    own
                }
                None => {
                    tracing::warn!(identity, customer_id, "No active subscription for checkout");
                    return Ok(Outcome::dropped(DropReason::NoActiveSubscription));
                }
            },
        };

        let plan = self.resolver.resolve_plan(winner.price_id.as_deref());

        if self.store.get(identity).await?.is_none() {
            let display_name = self.display_name(identity).await;
            store::create_checked(
                self.store.as_ref(),
                &UserRecord::new_free(identity, display_name, occurred_at),
            )
            .await?;
            tracing::info!(identity, "Created user on checkout");
        }

        let subscription_id = winner.id.clone();
        let outcome = store::update_with(self.store.as_ref(), identity, |current| {
            let already_applied = current.plan == plan
                && current.payment_customer_id.as_deref() == Some(customer_id)
                && current.payment_subscription_id.as_deref() == Some(subscription_id.as_str());
            if already_applied {
                return Ok(None);
            }

            let mut next = current.clone();
            next.plan = plan;
            next.payment_customer_id = Some(customer_id.to_string());
            next.payment_subscription_id = Some(subscription_id.clone());
            next.subscription_started_at = Some(occurred_at);
            next.usage_count = 0;
            Ok(Some(next))
        })
        .await?;

        Ok(self.finish_webhook(identity, outcome))
    }

    async fn on_subscription_updated(
        &self,
        customer_id: &str,
        subscription_id: &str,
        status: SubscriptionStatus,
        price_id: Option<&str>,
        occurred_at: OffsetDateTime,
    ) -> BillingResult<Outcome> {
        let Some(record) = self.store.find_by_payment_customer_id(customer_id).await? else {
            tracing::warn!(customer_id, subscription_id, "No user linked to customer, dropping");
            return Ok(Outcome::dropped(DropReason::UnknownIdentity));
        };
        let identity = record.identity.clone();
        let _guard = self.locks.lock(&identity).await;

        if is_superseded(&record, subscription_id) {
            tracing::info!(
                identity = %identity,
                subscription_id,
                current_subscription_id = ?record.payment_subscription_id,
                "Ignoring update for superseded subscription"
            );
            return Ok(Outcome::dropped(DropReason::Superseded).with_record(Some(record)));
        }

        // Upgrades are confirmed against the provider so a late redelivery cannot revive a
        // subscription that has since ended.
        let (status, price_id) = if status.is_active() && !record.is_paid() {
            let live = self.payments.retrieve_subscription(subscription_id).await?;
            (live.status, live.price_id)
        } else {
            (status, price_id.map(str::to_string))
        };

        let plan = status
            .is_active()
            .then(|| self.resolver.resolve_plan(price_id.as_deref()));

        let outcome = store::update_with(self.store.as_ref(), &identity, |current| {
            if is_superseded(current, subscription_id) {
                return Ok(None);
            }
            let mut next = current.clone();
            match plan {
                Some(plan) => {
                    let same_subscription =
                        current.payment_subscription_id.as_deref() == Some(subscription_id);
                    if current.plan == plan && same_subscription {
                        return Ok(None);
                    }
                    if !current.is_paid() {
                        next.usage_count = 0;
                    }
                    if !current.is_paid() || !same_subscription {
                        next.subscription_started_at = Some(occurred_at);
                    }
                    next.plan = plan;
                    next.payment_subscription_id = Some(subscription_id.to_string());
                }
                None => {
                    if !current.is_paid() {
                        return Ok(None);
                    }
                    next.plan = PlanTier::Free;
                    next.subscription_started_at = None;
                }
            }
            Ok(Some(next))
        })
        .await?;

        Ok(self.finish_webhook(&identity, outcome))
    }

    async fn on_subscription_deleted(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<Outcome> {
        let Some(record) = self.store.find_by_payment_customer_id(customer_id).await? else {
            tracing::warn!(customer_id, subscription_id, "No user linked to customer, dropping");
            return Ok(Outcome::dropped(DropReason::UnknownIdentity));
        };
        let identity = record.identity.clone();
        let _guard = self.locks.lock(&identity).await;

        if is_superseded(&record, subscription_id) {
            tracing::info!(
                identity = %identity,
                subscription_id,
                current_subscription_id = ?record.payment_subscription_id,
                "Ignoring deletion of superseded subscription"
            );
            return Ok(Outcome::dropped(DropReason::Superseded).with_record(Some(record)));
        }

        let outcome = store::update_with(self.store.as_ref(), &identity, |current| {
            if is_superseded(current, subscription_id) {
                return Ok(None);
            }
            if !current.is_paid() && current.payment_subscription_id.is_none() {
                return Ok(None);
            }
            let mut next = current.clone();
            next.plan = PlanTier::Free;
            next.usage_count = 0;
            next.subscription_started_at = None;
            next.payment_subscription_id = None;
            Ok(Some(next))
        })
        .await?;

        Ok(self.finish_webhook(&identity, outcome))
    }

    fn finish_webhook(&self, identity: &str, outcome: UpdateOutcome) -> Outcome {
        match outcome {
            UpdateOutcome::Updated { before, after } => {
                tracing::info!(
                    identity,
                    from_plan = %before.plan,
                    to_plan = %after.plan,
                    customer_id = ?after.payment_customer_id,
                    subscription_id = ?after.payment_subscription_id,
                    "Subscription state applied"
                );
                Outcome::new(Disposition::Applied).with_record(Some(after))
            }
            UpdateOutcome::Unchanged(record) => {
                tracing::debug!(identity, "Subscription state already current");
                Outcome::new(Disposition::Unchanged).with_record(Some(record))
            }
            UpdateOutcome::Missing => {
                tracing::warn!(identity, "User disappeared during webhook handling");
                Outcome::dropped(DropReason::UnknownIdentity)
            }
        }
    }

    // =========================================================================
    // Scheduled
    // =========================================================================

    async fn on_scheduled_reset(&self, now: OffsetDateTime) -> BillingResult<Outcome> {
        let outcome = match self.reset.run(now).await? {
            ResetOutcome::NotResetDay => Outcome::dropped(DropReason::NotResetDay),
            ResetOutcome::AlreadyDone { .. } => Outcome::dropped(DropReason::AlreadyReset),
            ResetOutcome::Reset { records, .. } => {
                let mut outcome = Outcome::new(Disposition::Applied);
                outcome.affected_records = records;
                outcome
            }
        };
        Ok(outcome)
    }
}

/// The record is backed by a different subscription than the event's.
fn is_superseded(record: &UserRecord, subscription_id: &str) -> bool {
    matches!(&record.payment_subscription_id, Some(current) if current != subscription_id)
}
