use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::billing::{SubscriptionRecord, SubscriptionState, SubscriptionStatusResponse};
use crate::traits::PaymentBackend;
use crate::types::{PlanId, SubjectId};

/// A user's subscriptions plus a per-plan "is active" lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub subscriptions: Vec<SubscriptionRecord>,
    pub active_by_plan_id: HashMap<PlanId, bool>,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn is_active(&self, plan_id: &PlanId) -> bool {
        self.active_by_plan_id.get(plan_id).copied().unwrap_or(false)
    }
}

impl From<SubscriptionStatusResponse> for SubscriptionStatus {
    fn from(response: SubscriptionStatusResponse) -> Self {
        let mut active_by_plan_id: HashMap<PlanId, bool> = HashMap::new();
        for record in &response.subscriptions {
            let active = record.status == SubscriptionState::Active;
            *active_by_plan_id.entry(record.plan_id.clone()).or_default() |= active;
        }
        for plan_id in response.active_subscriptions {
            active_by_plan_id.insert(plan_id, true);
        }
        Self {
            subscriptions: response.subscriptions,
            active_by_plan_id,
        }
    }
}

/// Queries the payment backend for a user's subscriptions.
///
/// Failures degrade to "nothing active" so every plan stays purchasable; the
/// cache keeps the last successful answer.
pub struct SubscriptionStatusChecker<B> {
    backend: Arc<B>,
    cache: RwLock<SubscriptionStatus>,
}

impl<B: PaymentBackend> SubscriptionStatusChecker<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            cache: RwLock::new(SubscriptionStatus::default()),
        }
    }

    pub async fn check_status(&self, user_id: &SubjectId) -> SubscriptionStatus {
        match self.backend.check_subscription_status(user_id).await {
            Ok(response) => {
                let status = SubscriptionStatus::from(response);
                tracing::debug!(
                    user_id = %user_id,
                    subscriptions = status.subscriptions.len(),
                    "Subscription status refreshed"
                );
                *self
                    .cache
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = status.clone();
                status
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    user_id = %user_id,
                    "Subscription status check failed, treating all plans as purchasable"
                );
                SubscriptionStatus::default()
            }
        }
    }

    /// Cached lookup from the last successful check.
    #[must_use]
    pub fn is_plan_active(&self, plan_id: &PlanId) -> bool {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_active(plan_id)
    }

    #[must_use]
    pub fn cached(&self) -> SubscriptionStatus {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_map_merges_records_and_active_list() {
        let response = SubscriptionStatusResponse {
            subscriptions: vec![
                SubscriptionRecord::new("strength", SubscriptionState::Canceled),
                SubscriptionRecord::new("strength", SubscriptionState::Active),
                SubscriptionRecord::new("mobility", SubscriptionState::Pending),
            ],
            active_subscriptions: vec![PlanId("nutrition".into())],
        };
        let status = SubscriptionStatus::from(response);

        assert!(status.is_active(&PlanId("strength".into())));
        assert!(!status.is_active(&PlanId("mobility".into())));
        assert!(status.is_active(&PlanId("nutrition".into())));
        assert!(!status.is_active(&PlanId("unknown".into())));
        assert_eq!(status.subscriptions.len(), 3);
    }
}
