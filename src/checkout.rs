use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::auth::AuthState;
use crate::billing::{BillingDetails, CreateSubscriptionRequest, Plan, SubscriptionOutcome};
use crate::error::{Error, ErrorClass};
use crate::subscription::SubscriptionStatusChecker;
use crate::traits::{IdentityProvider, PaymentBackend, PaymentSdk, ProfileStore};
use crate::types::{PaymentMethodId, QuizResultId, SubjectId};

const FORM_NOT_READY: &str = "payment form not ready";
const UNEXPECTED_RESPONSE: &str = "unexpected response from payment service";

/// Why a checkout attempt failed, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutFailure {
    pub message: String,
    pub class: ErrorClass,
    /// The card itself was refused; a retry tokenizes it again.
    pub card_specific: bool,
}

impl CheckoutFailure {
    fn from_error(error: &Error) -> Self {
        let class = error.class();
        let message = match (error, class) {
            (Error::Card { .. } | Error::Validation(_), _) => error.to_string(),
            (_, ErrorClass::Transient) => {
                "payment service is unavailable, please try again".to_string()
            }
            (_, ErrorClass::Authorization) => "please sign in to subscribe".to_string(),
            _ => UNEXPECTED_RESPONSE.to_string(),
        };
        Self {
            message,
            class,
            card_specific: error.is_card_specific(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Validation,
            card_specific: false,
        }
    }

    fn unexpected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Unexpected,
            card_specific: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutStatus {
    Collecting,
    Submitting,
    NeedsConfirmation,
    Confirming,
    Succeeded,
    Failed(CheckoutFailure),
}

impl CheckoutStatus {
    /// Submit is enabled only while collecting or after a failure.
    #[must_use]
    pub fn can_submit(&self) -> bool {
        matches!(self, Self::Collecting | Self::Failed(_))
    }

    #[must_use]
    pub fn failure(&self) -> Option<&CheckoutFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// State of one open checkout dialog. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub selected_plan: Plan,
    pub quiz_result_id: Option<QuizResultId>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub client_secret: Option<String>,
    pub status: CheckoutStatus,
}

/// Name and email typed into the checkout form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutForm {
    pub name: String,
    pub email: String,
}

impl CheckoutForm {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Opens checkout dialogs wired to the auth state, payment SDK and backend.
pub struct CheckoutOrchestrator<I, P, S, B> {
    auth: AuthState<I, P>,
    sdk: Arc<S>,
    backend: Arc<B>,
    subscriptions: Arc<SubscriptionStatusChecker<B>>,
}

// Manual Clone: avoid derive adding `S: Clone, B: Clone` bounds.
impl<I, P, S, B> Clone for CheckoutOrchestrator<I, P, S, B> {
    fn clone(&self) -> Self {
        Self {
            auth: self.auth.clone(),
            sdk: self.sdk.clone(),
            backend: self.backend.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }
}

impl<I, P, S, B> CheckoutOrchestrator<I, P, S, B>
where
    I: IdentityProvider,
    P: ProfileStore,
    S: PaymentSdk,
    B: PaymentBackend,
{
    #[must_use]
    pub fn new(
        auth: AuthState<I, P>,
        sdk: Arc<S>,
        backend: Arc<B>,
        subscriptions: Arc<SubscriptionStatusChecker<B>>,
    ) -> Self {
        Self {
            auth,
            sdk,
            backend,
            subscriptions,
        }
    }

    /// Open a checkout for `plan`, optionally linked to a quiz result.
    #[must_use]
    pub fn open(&self, plan: Plan, quiz_result_id: Option<QuizResultId>) -> Checkout<I, P, S, B> {
        tracing::debug!(plan = %plan.id, "Checkout opened");
        let (state, _) = watch::channel(CheckoutSession {
            selected_plan: plan,
            quiz_result_id,
            payment_method_id: None,
            client_secret: None,
            status: CheckoutStatus::Collecting,
        });
        Checkout {
            orchestrator: self.clone(),
            state,
            closed: AtomicBool::new(false),
        }
    }
}

enum Admission {
    Accepted(SubjectId),
    Rejected,
    Invalid,
}

/// One open checkout dialog.
///
/// After [`close`](Self::close) every in-flight result is ignored.
pub struct Checkout<I, P, S, B> {
    orchestrator: CheckoutOrchestrator<I, P, S, B>,
    state: watch::Sender<CheckoutSession>,
    closed: AtomicBool,
}

impl<I, P, S, B> Checkout<I, P, S, B>
where
    I: IdentityProvider,
    P: ProfileStore,
    S: PaymentSdk,
    B: PaymentBackend,
{
    #[must_use]
    pub fn status(&self) -> CheckoutStatus {
        self.state.borrow().status.clone()
    }

    #[must_use]
    pub fn session(&self) -> CheckoutSession {
        self.state.borrow().clone()
    }

    /// Receiver the dialog renders from.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CheckoutSession> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Checkout closed");
        }
    }

    /// Run one purchase attempt.
    ///
    /// Ignored (returning the current status) while a previous attempt is
    /// still submitting or confirming, or after the dialog closed. Makes at
    /// most one create-subscription call. A retry after a non-card
    /// confirmation failure confirms the pending subscription again instead
    /// of creating another one.
    pub async fn submit(&self, form: &CheckoutForm, card: Option<&S::CardElement>) -> CheckoutStatus {
        if !self.is_open() {
            return self.status();
        }

        let user_id = self
            .orchestrator
            .auth
            .profiles()
            .current()
            .map(|profile| profile.id);

        let mut admission = Admission::Rejected;
        self.state.send_if_modified(|session| {
            if !session.status.can_submit() {
                return false;
            }
            admission = match admit(form, card.is_some(), user_id.as_ref()) {
                Ok(user_id) => {
                    session.status = CheckoutStatus::Submitting;
                    Admission::Accepted(user_id.clone())
                }
                Err(failure) => {
                    session.status = CheckoutStatus::Failed(failure);
                    Admission::Invalid
                }
            };
            true
        });

        let (user_id, card) = match (admission, card) {
            (Admission::Accepted(user_id), Some(card)) => (user_id, card),
            (Admission::Rejected, _) => {
                tracing::debug!("Submit ignored, checkout busy");
                return self.status();
            }
            _ => return self.status(),
        };

        // The subscription already exists; only its payment is unconfirmed.
        let pending = self.state.borrow().client_secret.clone();
        if let Some(client_secret) = pending {
            tracing::info!(user_id = %user_id, "Retrying confirmation of pending subscription");
            return self.confirm(&user_id, client_secret).await;
        }

        let billing = BillingDetails {
            name: form.name.trim().to_string(),
            email: form.email.trim().to_string(),
        };
        let payment_method_id = match self.payment_method(card, &billing).await {
            Ok(id) => id,
            Err(e) => return self.fail(CheckoutFailure::from_error(&e)),
        };
        if self.abandoned() {
            return self.status();
        }

        let (request, plan_id) = {
            let session = self.state.borrow();
            let request = CreateSubscriptionRequest {
                payment_method_id,
                price_id: session.selected_plan.price_id.clone(),
                subscription_plan_id: session.selected_plan.id.clone(),
                user_id: user_id.clone(),
                quiz_result_id: session.quiz_result_id.clone(),
            };
            (request, session.selected_plan.id.clone())
        };
        let response = self.orchestrator.backend.create_subscription(&request).await;
        if self.abandoned() {
            return self.status();
        }

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, plan = %plan_id, "Create subscription failed");
                return self.fail(CheckoutFailure::from_error(&e));
            }
        };

        match response.outcome() {
            SubscriptionOutcome::Active => self.succeed(&user_id).await,
            SubscriptionOutcome::RequiresConfirmation { client_secret } => {
                self.confirm(&user_id, client_secret).await
            }
            SubscriptionOutcome::Rejected(message) => {
                tracing::warn!(plan = %plan_id, error = %message, "Payment service rejected subscription");
                self.fail(CheckoutFailure::unexpected(message))
            }
            SubscriptionOutcome::Unrecognized => {
                tracing::error!(plan = %plan_id, response = ?response, "Unrecognized create-subscription response");
                self.fail(CheckoutFailure::unexpected(UNEXPECTED_RESPONSE))
            }
        }
    }

    /// Reuse the token from an earlier non-card failure, or tokenize the card.
    async fn payment_method(
        &self,
        card: &S::CardElement,
        billing: &BillingDetails,
    ) -> Result<PaymentMethodId, Error> {
        if let Some(id) = self.state.borrow().payment_method_id.clone() {
            return Ok(id);
        }
        let id = self
            .orchestrator
            .sdk
            .create_payment_method(card, billing)
            .await?;
        self.state.send_modify(|session| {
            session.payment_method_id = Some(id.clone());
        });
        Ok(id)
    }

    async fn confirm(&self, user_id: &SubjectId, client_secret: String) -> CheckoutStatus {
        self.state.send_modify(|session| {
            session.client_secret = Some(client_secret.clone());
            session.status = CheckoutStatus::NeedsConfirmation;
        });
        self.state.send_modify(|session| {
            session.status = CheckoutStatus::Confirming;
        });

        let confirmed = self
            .orchestrator
            .sdk
            .confirm_card_payment(&client_secret)
            .await;
        if self.abandoned() {
            return self.status();
        }

        match confirmed {
            Ok(()) => self.succeed(user_id).await,
            Err(e) => {
                tracing::info!(error = %e, "Payment confirmation failed");
                self.fail(CheckoutFailure::from_error(&e))
            }
        }
    }

    async fn succeed(&self, user_id: &SubjectId) -> CheckoutStatus {
        self.state.send_modify(|session| {
            session.status = CheckoutStatus::Succeeded;
            session.client_secret = None;
        });
        tracing::info!(
            user_id = %user_id,
            plan = %self.state.borrow().selected_plan.id,
            "Subscription checkout succeeded"
        );

        self.orchestrator.auth.refresh_profile().await;
        self.orchestrator.subscriptions.check_status(user_id).await;
        self.close();
        CheckoutStatus::Succeeded
    }

    fn fail(&self, failure: CheckoutFailure) -> CheckoutStatus {
        let status = CheckoutStatus::Failed(failure);
        self.state.send_modify(|session| {
            if status.failure().is_some_and(|f| f.card_specific) {
                session.payment_method_id = None;
                session.client_secret = None;
            }
            session.status = status.clone();
        });
        status
    }

    fn abandoned(&self) -> bool {
        let closed = !self.is_open();
        if closed {
            tracing::debug!("Checkout closed while a request was in flight, ignoring result");
        }
        closed
    }
}

fn admit<'a>(
    form: &CheckoutForm,
    has_card: bool,
    user_id: Option<&'a SubjectId>,
) -> Result<&'a SubjectId, CheckoutFailure> {
    if form.name.trim().is_empty() || form.email.trim().is_empty() {
        return Err(CheckoutFailure::validation("name and email are required"));
    }
    if !has_card {
        return Err(CheckoutFailure::unexpected(FORM_NOT_READY));
    }
    user_id.ok_or_else(|| CheckoutFailure {
        message: "please sign in to subscribe".into(),
        class: ErrorClass::Authorization,
        card_specific: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_only_from_collecting_or_failed() {
        assert!(CheckoutStatus::Collecting.can_submit());
        assert!(CheckoutStatus::Failed(CheckoutFailure::validation("x")).can_submit());
        assert!(!CheckoutStatus::Submitting.can_submit());
        assert!(!CheckoutStatus::NeedsConfirmation.can_submit());
        assert!(!CheckoutStatus::Confirming.can_submit());
        assert!(!CheckoutStatus::Succeeded.can_submit());
    }

    #[test]
    fn admit_checks_form_then_card_then_user() {
        let user = SubjectId("u-1".into());
        let empty = CheckoutForm::new(" ", "sam@example.com");
        let filled = CheckoutForm::new("Sam", "sam@example.com");

        assert_eq!(
            admit(&empty, true, Some(&user)).unwrap_err().class,
            ErrorClass::Validation
        );
        assert_eq!(
            admit(&filled, false, Some(&user)).unwrap_err().message,
            FORM_NOT_READY
        );
        assert_eq!(
            admit(&filled, true, None).unwrap_err().class,
            ErrorClass::Authorization
        );
        assert_eq!(admit(&filled, true, Some(&user)).unwrap(), &user);
    }

    #[test]
    fn card_errors_surface_verbatim() {
        let failure = CheckoutFailure::from_error(&Error::Card {
            message: "Your card has insufficient funds.".into(),
            code: Some("card_declined".into()),
        });
        assert_eq!(failure.message, "Your card has insufficient funds.");
        assert!(failure.card_specific);
    }

    #[test]
    fn transient_errors_get_a_generic_message() {
        let failure = CheckoutFailure::from_error(&Error::Backend {
            operation: "create subscription",
            status: Some(502),
            detail: "<html>bad gateway</html>".into(),
        });
        assert_eq!(failure.class, ErrorClass::Transient);
        assert!(!failure.message.contains("bad gateway"));
        assert!(!failure.card_specific);
    }
}
