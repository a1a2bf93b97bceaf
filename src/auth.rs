use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::RouteSettings;
use crate::error::Error;
use crate::guard::RouteGuard;
use crate::profile::{ProfileLoader, RefreshTicket};
use crate::session::SessionStore;
use crate::traits::{IdentityProvider, ProfileStore};
use crate::types::{
    Profile, ProfileUpdate, Session, SessionChange, SessionEvent, SignUpAttributes, SubjectId,
    User, UserUpdate,
};

/// Composite auth state the UI renders from.
///
/// Derived from the session and the profile cache; recomputed on every change
/// of either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub session: Option<Session>,
    /// True until the first session fetch and, when a session exists, the
    /// first profile fetch have both finished.
    pub is_loading: bool,
    /// Turns true once the first session fetch finished and never reverts.
    pub is_initialized: bool,
    pub is_authenticated: bool,
    pub is_admin: bool,
}

impl AuthSnapshot {
    fn initial() -> Self {
        Self {
            user: None,
            profile: None,
            session: None,
            is_loading: true,
            is_initialized: false,
            is_authenticated: false,
            is_admin: false,
        }
    }

    /// Email confirmation as recorded on the profile row.
    #[must_use]
    pub fn email_confirmed(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.email_confirmed)
    }

    /// Signed in, but the profile row does not exist (yet).
    ///
    /// Consumers show a placeholder for this state; it is not "signed out".
    #[must_use]
    pub fn is_unprovisioned(&self) -> bool {
        self.is_authenticated && self.profile.is_none()
    }

    #[must_use]
    pub fn subject_id(&self) -> Option<&SubjectId> {
        self.user.as_ref().map(|u| &u.id)
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: AtomicBool,
    loading_done: AtomicBool,
    torn_down: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Auth service: owns the session cache and the profile loader, and publishes
/// [`AuthSnapshot`]s.
///
/// Construct one per app (or per test), call [`initialize`](Self::initialize)
/// once at startup and [`teardown`](Self::teardown) on shutdown.
pub struct AuthState<I, P> {
    sessions: Arc<SessionStore<I>>,
    profiles: Arc<ProfileLoader<P>>,
    snapshot: Arc<watch::Sender<AuthSnapshot>>,
    lifecycle: Arc<Lifecycle>,
    init: Arc<OnceCell<()>>,
}

// Manual Clone: avoid derive adding `I: Clone, P: Clone` bounds.
impl<I, P> Clone for AuthState<I, P> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            profiles: self.profiles.clone(),
            snapshot: self.snapshot.clone(),
            lifecycle: self.lifecycle.clone(),
            init: self.init.clone(),
        }
    }
}

impl<I: IdentityProvider, P: ProfileStore> AuthState<I, P> {
    #[must_use]
    pub fn new(identity: Arc<I>, profile_store: Arc<P>) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::initial());
        Self {
            sessions: Arc::new(SessionStore::new(identity)),
            profiles: Arc::new(ProfileLoader::new(profile_store)),
            snapshot: Arc::new(snapshot),
            lifecycle: Arc::new(Lifecycle::default()),
            init: Arc::new(OnceCell::new()),
        }
    }

    /// Load the initial session (and its profile), then start following the
    /// provider's session changes.
    ///
    /// Runs once per instance; later calls wait for the first to finish.
    pub async fn initialize(&self) {
        self.init
            .get_or_init(|| async {
                // Subscribe before fetching so no change between the two is lost.
                let changes = self.sessions.identity().on_session_change();

                let session = self.sessions.initialize().await;
                self.lifecycle.initialized.store(true, Ordering::SeqCst);
                self.publish();

                if let Some(session) = &session {
                    self.profiles.refresh(session.subject_id()).await;
                }
                self.lifecycle.loading_done.store(true, Ordering::SeqCst);
                self.publish();

                tracing::info!(
                    signed_in = session.is_some(),
                    "Auth state initialized"
                );
                self.start_pump(changes);
            })
            .await;
    }

    /// Stop following session changes. In-flight results become no-ops.
    pub fn teardown(&self) {
        self.lifecycle.torn_down.store(true, Ordering::SeqCst);
        if let Some(pump) = self
            .lifecycle
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        self.sessions.clear_listeners();
        tracing::debug!("Auth state torn down");
    }

    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every recomputed snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore<I> {
        &self.sessions
    }

    #[must_use]
    pub fn profiles(&self) -> &Arc<ProfileLoader<P>> {
        &self.profiles
    }

    /// Guard evaluating routes against this state's snapshots.
    #[must_use]
    pub fn route_guard(&self, settings: RouteSettings) -> RouteGuard {
        RouteGuard::new(self.subscribe(), settings)
    }

    /// Apply one session change and wait for the profile refresh it triggers.
    pub async fn handle_session_change(&self, change: SessionChange) {
        if let Some(subject) = self.apply_change(change) {
            let ticket = self.profiles.ticket(&subject);
            self.finish_refresh(ticket).await;
        }
    }

    /// Re-fetch the signed-in subject's profile, e.g. after an edit elsewhere.
    pub async fn refresh_profile(&self) -> Option<Profile> {
        let subject = self.sessions.current()?.user.id;
        let ticket = self.profiles.ticket(&subject);
        self.finish_refresh(ticket).await;
        self.profiles.current().filter(|p| p.id == subject)
    }

    /// Edit the signed-in subject's profile, then refresh it.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] without a session, or the store error.
    pub async fn update_profile(&self, fields: &ProfileUpdate) -> Result<Option<Profile>, Error> {
        let subject = self
            .sessions
            .current()
            .ok_or(Error::Unauthenticated)?
            .user
            .id;
        let profile = self.profiles.update(&subject, fields).await?;
        self.publish();
        Ok(profile)
    }

    /// Sign in with email and password.
    ///
    /// The snapshot follows once the provider reports `SIGNED_IN`. Login
    /// bookkeeping on the profile row is best effort.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for empty credentials, or the provider error.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        require_field(email, "email")?;
        require_field(password, "password")?;

        let session = self
            .sessions
            .identity()
            .sign_in(email.trim(), password)
            .await?;
        tracing::info!(subject = %session.subject_id(), "Signed in");

        self.record_sign_in(session.subject_id()).await;
        Ok(session)
    }

    /// Create an account. `Ok(None)` means the provider wants the email
    /// confirmed before it issues a session.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for empty credentials, or the provider error.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: &SignUpAttributes,
    ) -> Result<Option<Session>, Error> {
        require_field(email, "email")?;
        require_field(password, "password")?;

        let session = self
            .sessions
            .identity()
            .sign_up(email.trim(), password, attributes)
            .await?;
        tracing::info!(
            confirmation_required = session.is_none(),
            "Signed up"
        );
        Ok(session)
    }

    /// # Errors
    ///
    /// Returns the provider error; the local session is left as reported by
    /// the provider.
    pub async fn sign_out(&self) -> Result<(), Error> {
        self.sessions.identity().sign_out().await.inspect_err(|e| {
            tracing::warn!(error = %e, "Sign-out failed");
        })
    }

    /// # Errors
    ///
    /// [`Error::Validation`] for an empty email, or the provider error.
    pub async fn reset_password_for_email(&self, email: &str, redirect_url: &Url) -> Result<(), Error> {
        require_field(email, "email")?;
        self.sessions
            .identity()
            .reset_password_for_email(email.trim(), redirect_url)
            .await
    }

    /// # Errors
    ///
    /// [`Error::Validation`] for an empty password, [`Error::Unauthenticated`]
    /// without a session, or the provider error.
    pub async fn update_password(&self, password: &str) -> Result<(), Error> {
        require_field(password, "password")?;
        if self.sessions.current().is_none() {
            return Err(Error::Unauthenticated);
        }
        self.sessions
            .identity()
            .update_user(&UserUpdate {
                password: password.to_string(),
            })
            .await
    }

    /// Install the session and return the subject whose profile must be
    /// refreshed, if any.
    fn apply_change(&self, change: SessionChange) -> Option<SubjectId> {
        if self.lifecycle.torn_down.load(Ordering::SeqCst) {
            return None;
        }

        let previous = self.sessions.apply(&change);
        let next_subject = change.session.as_ref().map(|s| s.subject_id().clone());
        let switched = previous.as_ref().map(|s| s.subject_id()) != next_subject.as_ref();
        if change.event == SessionEvent::SignedOut || switched {
            self.profiles.clear();
        }
        self.publish();

        tracing::debug!(event = %change.event, "Session change applied");
        next_subject.filter(|_| change.event.refreshes_profile())
    }

    async fn finish_refresh(&self, ticket: RefreshTicket) {
        if self.lifecycle.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.profiles.fetch(ticket).await;
        if !self.lifecycle.torn_down.load(Ordering::SeqCst) {
            self.publish();
        }
    }

    async fn record_sign_in(&self, subject: &SubjectId) {
        let Some(profile) = self.profiles.refresh(subject).await else {
            return;
        };
        if profile.id != *subject {
            return;
        }
        let update = ProfileUpdate::sign_in_recorded(profile.login_count, OffsetDateTime::now_utc());
        if let Err(e) = self.profiles.update(subject, &update).await {
            tracing::warn!(error = %e, subject = %subject, "Recording sign-in failed");
        }
        self.publish();
    }

    fn start_pump(&self, mut changes: mpsc::UnboundedReceiver<SessionChange>) {
        let this = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                // Refreshes run concurrently; the ticket is taken here, in
                // event order, so the loader can order their results.
                if let Some(subject) = this.apply_change(change) {
                    let ticket = this.profiles.ticket(&subject);
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.finish_refresh(ticket).await;
                    });
                }
            }
            tracing::debug!("Session change stream closed");
        });
        *self
            .lifecycle
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pump);
    }

    fn publish(&self) {
        let session = self.sessions.current();
        let profile = self
            .profiles
            .current()
            .filter(|p| session.as_ref().is_some_and(|s| &p.id == s.subject_id()));
        let user = session.as_ref().map(|s| s.user.clone());
        let is_admin = profile.as_ref().is_some_and(|p| p.is_admin);

        self.snapshot.send_replace(AuthSnapshot {
            is_authenticated: session.is_some() && user.is_some(),
            is_admin,
            is_initialized: self.lifecycle.initialized.load(Ordering::SeqCst),
            is_loading: !self.lifecycle.loading_done.load(Ordering::SeqCst),
            user,
            profile,
            session,
        });
    }
}

fn require_field(value: &str, name: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{name} is required")));
    }
    Ok(())
}
