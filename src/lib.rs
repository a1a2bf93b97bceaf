#![doc = include_str!("../README.md")]

pub mod auth;
pub mod billing;
pub mod checkout;
pub mod config;
pub mod error;
pub mod guard;
#[cfg(feature = "axum")]
pub mod middleware;
pub mod profile;
pub mod session;
#[cfg(feature = "http")]
pub mod stripe;
pub mod subscription;
#[cfg(feature = "http")]
pub mod supabase;
pub mod traits;
pub mod types;

// Re-exports for convenient access
pub use auth::{AuthSnapshot, AuthState};
pub use billing::{
    BillingDetails, CreateSubscriptionRequest, CreateSubscriptionResponse, Plan,
    SubscriptionOutcome, SubscriptionRecord, SubscriptionState, SubscriptionStatusResponse,
};
pub use checkout::{
    Checkout, CheckoutFailure, CheckoutForm, CheckoutOrchestrator, CheckoutSession,
    CheckoutStatus,
};
pub use config::{BackendConfig, RouteSettings, StripeConfig};
pub use error::{Error, ErrorClass};
pub use guard::{GuardDecision, RouteGuard};
pub use profile::ProfileLoader;
pub use session::{ListenerId, SessionStore};
#[cfg(feature = "http")]
pub use stripe::{CardDetails, StripeClient};
pub use subscription::{SubscriptionStatus, SubscriptionStatusChecker};
#[cfg(feature = "http")]
pub use supabase::SupabaseClient;
pub use traits::{IdentityProvider, PaymentBackend, PaymentSdk, ProfileStore};
pub use types::{
    PaymentMethodId, PlanId, PriceId, Profile, ProfileUpdate, QuizResultId, Session,
    SessionChange, SessionEvent, SignUpAttributes, SubjectId, User, UserUpdate,
};
