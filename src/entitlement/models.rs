use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Name of the fallback plan every account is entitled to. The row is seeded
/// by migration and must stay active and free for the lifetime of the system.
pub const FREE_PLAN_NAME: &str = "free";

/// key: entitlement-models -> plans,subscriptions,usage
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub monthly_quota: i64,
    pub price_cents: i64,
    pub features: Json<PlanFeatures>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.name.eq_ignore_ascii_case(FREE_PLAN_NAME)
    }
}

/// Feature flags carried on the plan row itself, so nothing ever branches on
/// the plan name. Stored as JSONB; absent keys fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    #[serde(default)]
    pub priority_support: Option<bool>,
    #[serde(default)]
    pub history_retention_days: Option<i32>,
    #[serde(default)]
    pub max_scan_resolution: Option<i32>,
    #[serde(default)]
    pub api_access: Option<bool>,
}

impl PlanFeatures {
    pub fn has_priority_support(&self) -> bool {
        self.priority_support.unwrap_or(false)
    }

    pub fn retention_days(&self) -> i32 {
        self.history_retention_days.unwrap_or(30)
    }
}

/// key: entitlement-subscription-status -> lifecycle state machine
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Terminal states keep their row forever; a fresh free-plan row is
    /// created instead of transitioning out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }

    pub fn can_transition(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, to),
            (Active, PastDue) | (Active, Cancelled) | (PastDue, Active) | (PastDue, Expired)
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: i32,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    /// Exclusive upper bound of the current billing period.
    pub period_end: DateTime<Utc>,
    /// Quota snapshot in force for the current period. Re-snapshotted from
    /// the plan at rollover; overwritten immediately on a plan swap.
    pub period_quota: i64,
    pub past_due_since: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn period_contains(&self, now: DateTime<Utc>) -> bool {
        self.period_start <= now && now < self.period_end
    }

    /// Whether units may still be consumed. `past_due` keeps consuming for
    /// the whole grace window; `cancelled` keeps consuming until the period
    /// the cancellation landed in closes.
    pub fn allows_consumption(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::PastDue => true,
            SubscriptionStatus::Cancelled => now < self.period_end,
            SubscriptionStatus::Expired => false,
        }
    }
}

/// key: entitlement-usage-record -> per-period counter
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageRecord {
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub consumed: i64,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

/// Outcome of a counter increment attempt. Denial is a value, not an error.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub remaining: i64,
}

/// `check_and_consume` answer, including which plan gated the decision.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub plan: String,
}

/// Self-service plan change result. "Already subscribed" is a first-class
/// variant so callers never have to string-match an error message for it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubscribeOutcome {
    Subscribed { plan: Plan },
    AlreadySubscribed { plan_id: Uuid },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageSummary {
    pub consumed: i64,
    pub quota: i64,
}

/// Composite dashboard view for one account.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementStatus {
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub usage: UsageSummary,
    pub period_end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            account_id: 1,
            plan_id: Uuid::new_v4(),
            status,
            period_start: now - Duration::days(10),
            period_end: now + Duration::days(20),
            period_quota: 8,
            past_due_since: None,
            canceled_at: None,
            version: 0,
            created_at: now - Duration::days(10),
            updated_at: now,
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use SubscriptionStatus::*;
        assert!(Active.can_transition(PastDue));
        assert!(Active.can_transition(Cancelled));
        assert!(PastDue.can_transition(Active));
        assert!(PastDue.can_transition(Expired));

        assert!(!Active.can_transition(Expired));
        assert!(!PastDue.can_transition(Cancelled));
        for from in [Cancelled, Expired] {
            for to in [Active, PastDue, Cancelled, Expired] {
                assert!(!from.can_transition(to), "{from} -> {to} must be closed");
            }
        }
    }

    #[test]
    fn cancelled_keeps_consuming_until_period_end() {
        let now = Utc::now();
        let mut sub = subscription(SubscriptionStatus::Cancelled);
        assert!(sub.allows_consumption(now));

        sub.period_end = now - Duration::seconds(1);
        assert!(!sub.allows_consumption(now));
    }

    #[test]
    fn past_due_consumes_through_grace() {
        let sub = subscription(SubscriptionStatus::PastDue);
        assert!(sub.allows_consumption(Utc::now()));
        assert!(!subscription(SubscriptionStatus::Expired).allows_consumption(Utc::now()));
    }

    #[test]
    fn status_round_trips_through_serde() {
        let json = serde_json::to_string(&SubscriptionStatus::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
        let back: SubscriptionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SubscriptionStatus::PastDue);
    }

    #[test]
    fn plan_features_default_when_absent() {
        let features: PlanFeatures = serde_json::from_str("{}").unwrap();
        assert!(!features.has_priority_support());
        assert_eq!(features.retention_days(), 30);
    }
}
