//! Internal event and outcome types
//!
//! Channel adapters validate external payloads once and hand the engine one of these closed
//! variants. The engine answers with an [`Outcome`] that the adapter renders back.

use quotagate_shared::{PlanTier, UserRecord};
use time::OffsetDateTime;

use crate::payments::SubscriptionStatus;

/// Rich-menu or postback command from the chat channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuCommand {
    /// Show the current plan and management links
    Status,
    /// Send a checkout link, optionally for a specific tier
    Subscribe(Option<PlanTier>),
    /// Send a billing portal link
    Manage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    MessageReceived {
        identity: String,
        text: String,
        occurred_at: OffsetDateTime,
    },
    Follow {
        identity: String,
        occurred_at: OffsetDateTime,
    },
    MenuRequested {
        identity: String,
        command: MenuCommand,
        occurred_at: OffsetDateTime,
    },
    CheckoutCompleted {
        /// From checkout metadata; `None` when the session carried none
        identity: Option<String>,
        customer_id: String,
        /// Subscription created by this checkout session
        subscription_id: Option<String>,
        occurred_at: OffsetDateTime,
    },
    /// Also produced for subscription creation
    SubscriptionUpdated {
        customer_id: String,
        subscription_id: String,
        status: SubscriptionStatus,
        price_id: Option<String>,
        occurred_at: OffsetDateTime,
    },
    SubscriptionDeleted {
        customer_id: String,
        subscription_id: String,
        occurred_at: OffsetDateTime,
    },
    ScheduledReset {
        now: OffsetDateTime,
    },
}

impl BillingEvent {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            BillingEvent::MessageReceived { .. } => "message_received",
            BillingEvent::Follow { .. } => "follow",
            BillingEvent::MenuRequested { .. } => "menu_requested",
            BillingEvent::CheckoutCompleted { .. } => "checkout_completed",
            BillingEvent::SubscriptionUpdated { .. } => "subscription_updated",
            BillingEvent::SubscriptionDeleted { .. } => "subscription_deleted",
            BillingEvent::ScheduledReset { .. } => "scheduled_reset",
        }
    }
}

/// Why an AI answer could not be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApologyReason {
    /// Answer backend is overloaded
    Overloaded,
    /// Answer backend returned an error
    AnswerFailed,
    /// Store or another dependency is unreachable
    Unavailable,
}

/// Channel-independent reply instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer(String),
    Welcome {
        display_name: String,
        quota_limit: u32,
    },
    /// Free quota is exhausted
    UpgradeOffer {
        quota_limit: u32,
    },
    QuotaRemaining {
        remaining: u32,
    },
    Apology(ApologyReason),
    CheckoutLink {
        url: String,
    },
    PortalLink {
        url: String,
    },
    /// Management was requested by a user with no payment customer
    FreePlanNotice,
    /// Tier choices for a user on the Free plan
    PlanMenu {
        quota_limit: u32,
    },
    PlanStatus {
        plan: PlanTier,
        portal_url: Option<String>,
        /// Checkout link for switching to the other paid tier
        switch_plan: Option<(PlanTier, String)>,
    },
    /// Could not produce a payment link right now
    LinkUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The event does not name a known identity or customer
    UnknownIdentity,
    /// The event refers to a subscription the record has already moved past
    Superseded,
    /// Today is not the reset day
    NotResetDay,
    /// The billing period was already reset
    AlreadyReset,
    /// No active subscription could be found for the customer
    NoActiveSubscription,
    /// Several subscriptions share the newest creation time and none can be preferred
    AmbiguousSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// State changed
    Applied,
    /// Handled with no state change
    Unchanged,
    /// Ignored; the sender should not retry
    Dropped(DropReason),
}

/// What the engine decided for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub disposition: Disposition,
    /// Record after the event, when one is involved
    pub record: Option<UserRecord>,
    /// Replies to the triggering chat event
    pub replies: Vec<Reply>,
    /// Messages pushed to the identity outside the reply
    pub notifications: Vec<Reply>,
    /// Rows touched by a bulk transition
    pub affected_records: u64,
}

impl Outcome {
    pub fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            record: None,
            replies: Vec::new(),
            notifications: Vec::new(),
            affected_records: 0,
        }
    }

    pub fn dropped(reason: DropReason) -> Self {
        Self::new(Disposition::Dropped(reason))
    }

    pub fn with_record(mut self, record: Option<UserRecord>) -> Self {
        self.record = record;
        self
    }

    pub fn reply(mut self, reply: Reply) -> Self {
        self.replies.push(reply);
        self
    }

    pub fn notify(mut self, reply: Reply) -> Self {
        self.notifications.push(reply);
        self
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.disposition, Disposition::Dropped(_))
    }
}
