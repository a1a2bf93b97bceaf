use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{PaymentMethodId, PlanId, PriceId, QuizResultId, SubjectId};

/// A purchasable coaching plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Plan {
    pub id: PlanId,
    pub price_id: PriceId,
    pub name: String,
}

impl Plan {
    #[must_use]
    pub fn new(id: impl Into<String>, price_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PlanId(id.into()),
            price_id: PriceId(price_id.into()),
            name: name.into(),
        }
    }
}

/// Cardholder details passed to card tokenization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingDetails {
    pub name: String,
    pub email: String,
}

/// Body of the payment function's `createSubscription` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub payment_method_id: PaymentMethodId,
    pub price_id: PriceId,
    pub subscription_plan_id: PlanId,
    pub user_id: SubjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiz_result_id: Option<QuizResultId>,
}

/// Raw answer of `createSubscription`.
///
/// The function answers with one of `{status: "active"}`, `{clientSecret}` or
/// `{error}`; anything else is unexpected. Use [`outcome`](Self::outcome) to
/// classify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

/// Classified [`CreateSubscriptionResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Charged without step-up confirmation.
    Active,
    /// The processor wants the client to confirm the payment.
    RequiresConfirmation { client_secret: String },
    /// The function reported an error message.
    Rejected(String),
    Unrecognized,
}

impl CreateSubscriptionResponse {
    #[must_use]
    pub fn active() -> Self {
        Self {
            status: Some("active".into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn requires_confirmation(client_secret: impl Into<String>) -> Self {
        Self {
            client_secret: Some(client_secret.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn outcome(&self) -> SubscriptionOutcome {
        if self.status.as_deref() == Some("active") {
            return SubscriptionOutcome::Active;
        }
        if let Some(secret) = self.client_secret.as_deref().filter(|s| !s.is_empty()) {
            return SubscriptionOutcome::RequiresConfirmation {
                client_secret: secret.to_string(),
            };
        }
        match self.error.as_deref().filter(|e| !e.is_empty()) {
            Some(error) => SubscriptionOutcome::Rejected(error.to_string()),
            None => SubscriptionOutcome::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Active,
    Pending,
    Canceled,
}

/// One subscription as reported by the payment backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SubscriptionRecord {
    pub plan_id: PlanId,
    pub status: SubscriptionState,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    #[must_use]
    pub fn new(plan_id: impl Into<String>, status: SubscriptionState) -> Self {
        Self {
            plan_id: PlanId(plan_id.into()),
            status,
            current_period_end: None,
        }
    }
}

/// Raw answer of `checkSubscriptionStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusResponse {
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,
    /// Plan ids the backend considers active.
    #[serde(default)]
    pub active_subscriptions: Vec<PlanId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_wins_over_secret() {
        let response = CreateSubscriptionResponse {
            status: Some("active".into()),
            client_secret: Some("cs_123".into()),
            ..Default::default()
        };
        assert_eq!(response.outcome(), SubscriptionOutcome::Active);
    }

    #[test]
    fn client_secret_requires_confirmation() {
        let response: CreateSubscriptionResponse =
            serde_json::from_str(r#"{"clientSecret":"cs_123","status":"incomplete"}"#).unwrap();
        assert_eq!(
            response.outcome(),
            SubscriptionOutcome::RequiresConfirmation {
                client_secret: "cs_123".into()
            }
        );
    }

    #[test]
    fn error_and_unknown_shapes() {
        let rejected: CreateSubscriptionResponse =
            serde_json::from_str(r#"{"error":"No such price"}"#).unwrap();
        assert_eq!(
            rejected.outcome(),
            SubscriptionOutcome::Rejected("No such price".into())
        );

        let unknown: CreateSubscriptionResponse =
            serde_json::from_str(r#"{"status":"incomplete"}"#).unwrap();
        assert_eq!(unknown.outcome(), SubscriptionOutcome::Unrecognized);
    }

    #[test]
    fn request_uses_camel_case_and_omits_missing_quiz() {
        let request = CreateSubscriptionRequest {
            payment_method_id: PaymentMethodId("pm_1".into()),
            price_id: PriceId("price_1".into()),
            subscription_plan_id: PlanId("plan-1".into()),
            user_id: SubjectId("u-1".into()),
            quiz_result_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "paymentMethodId": "pm_1",
                "priceId": "price_1",
                "subscriptionPlanId": "plan-1",
                "userId": "u-1",
            })
        );
    }

    #[test]
    fn status_response_tolerates_missing_lists() {
        let response: SubscriptionStatusResponse = serde_json::from_str("{}").unwrap();
        assert!(response.subscriptions.is_empty());
        assert!(response.active_subscriptions.is_empty());
    }
}
