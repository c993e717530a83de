//! Subscription plan model.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing interval for plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
    Lifetime,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
            BillingInterval::Lifetime => "lifetime",
        }
    }

    /// Parse a stored interval. Unknown values yield `None` so callers can
    /// apply their own fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            "lifetime" => Some(BillingInterval::Lifetime),
            _ => None,
        }
    }
}

/// Subscription plan. Prices are integer minor units (cents).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPlan {
    pub plan_id: Uuid,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub billing_interval: String,
    pub interval_count: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn interval(&self) -> Option<BillingInterval> {
        BillingInterval::parse(&self.billing_interval)
    }

    pub fn is_lifetime(&self) -> bool {
        self.interval() == Some(BillingInterval::Lifetime)
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub interval_count: i32,
}

/// Compute the billing date following `from` for a plan interval.
///
/// Months and years use calendar addition, clamping to the last day of the
/// target month (Jan 31 + 1 month = Feb 28/29). An unrecognized interval
/// advances by a single month. Lifetime plans have no next date.
pub fn advance_billing_date(
    from: DateTime<Utc>,
    billing_interval: &str,
    interval_count: i32,
) -> Option<DateTime<Utc>> {
    let count = interval_count.max(1) as u32;

    match BillingInterval::parse(billing_interval) {
        Some(BillingInterval::Month) => from.checked_add_months(Months::new(count)),
        Some(BillingInterval::Year) => {
            from.checked_add_months(Months::new(count.checked_mul(12)?))
        }
        Some(BillingInterval::Lifetime) => None,
        None => {
            tracing::warn!(
                billing_interval = billing_interval,
                "Unrecognized billing interval, advancing by one month"
            );
            from.checked_add_months(Months::new(1))
        }
    }
}
