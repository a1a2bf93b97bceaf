use std::future::Future;

use tokio::sync::mpsc;
use url::Url;

use crate::billing::{
    BillingDetails, CreateSubscriptionRequest, CreateSubscriptionResponse,
    SubscriptionStatusResponse,
};
use crate::error::Error;
use crate::types::{
    PaymentMethodId, Profile, ProfileUpdate, Session, SessionChange, SignUpAttributes, SubjectId,
    UserUpdate,
};

/// Identity provider the session is owned by.
///
/// Implemented by [`SupabaseClient`](crate::SupabaseClient) and by in-memory
/// fakes in tests.
///
/// # Example
///
/// ```rust,ignore
/// impl IdentityProvider for MyProvider {
///     async fn get_session(&self) -> Result<Option<Session>, Error> {
///         Ok(self.storage.load_session()?)
///     }
///     // ...
/// }
/// ```
pub trait IdentityProvider: Send + Sync + 'static {
    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, Error>> + Send;

    /// Returns `None` when the provider requires email confirmation before
    /// issuing a session.
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: &SignUpAttributes,
    ) -> impl Future<Output = Result<Option<Session>, Error>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Current session, if any.
    fn get_session(&self) -> impl Future<Output = Result<Option<Session>, Error>> + Send;

    /// Register for session changes.
    ///
    /// Changes must be delivered in the order the provider produces them.
    fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange>;

    fn reset_password_for_email(
        &self,
        email: &str,
        redirect_url: &Url,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn update_user(&self, update: &UserUpdate) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Relational store holding profile rows.
pub trait ProfileStore: Send + Sync + 'static {
    /// Look up a profile. `Ok(None)` means the row does not exist (yet).
    fn select_profile_by_id(
        &self,
        id: &SubjectId,
    ) -> impl Future<Output = Result<Option<Profile>, Error>> + Send;

    fn update_profile(
        &self,
        id: &SubjectId,
        fields: &ProfileUpdate,
    ) -> impl Future<Output = Result<Profile, Error>> + Send;
}

/// Client-side payment SDK.
///
/// Card data only ever crosses this boundary; the checkout keeps nothing but
/// the opaque token it returns.
pub trait PaymentSdk: Send + Sync + 'static {
    /// Mounted card input the SDK tokenizes.
    type CardElement: Send + Sync;

    /// Tokenize a card. Card rejections are reported as [`Error::Card`].
    fn create_payment_method(
        &self,
        card: &Self::CardElement,
        billing: &BillingDetails,
    ) -> impl Future<Output = Result<PaymentMethodId, Error>> + Send;

    /// Complete a step-up confirmation for a payment needing one.
    fn confirm_card_payment(
        &self,
        client_secret: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Server-side payment function.
pub trait PaymentBackend: Send + Sync + 'static {
    fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> impl Future<Output = Result<CreateSubscriptionResponse, Error>> + Send;

    fn check_subscription_status(
        &self,
        user_id: &SubjectId,
    ) -> impl Future<Output = Result<SubscriptionStatusResponse, Error>> + Send;
}
