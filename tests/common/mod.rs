#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fitcoach_accounts::{
    AuthState, BillingDetails, CreateSubscriptionRequest, CreateSubscriptionResponse, Error,
    IdentityProvider, PaymentBackend, PaymentMethodId, PaymentSdk, Profile, ProfileStore,
    ProfileUpdate, Session, SessionChange, SignUpAttributes, SubjectId,
    SubscriptionStatusResponse, User, UserUpdate,
};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use url::Url;

pub fn session_for(id: &str, email: &str) -> Session {
    Session::new(
        User::new(id).with_email(email),
        format!("access-{id}"),
        format!("refresh-{id}"),
        OffsetDateTime::now_utc() + time::Duration::hours(1),
    )
}

pub fn member(id: &str, email: &str) -> Profile {
    Profile::new(id, email).with_email_confirmed(true)
}

pub fn outage(operation: &'static str) -> Error {
    Error::Backend {
        operation,
        status: Some(503),
        detail: "service unavailable".into(),
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting until {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Identity ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeIdentity {
    session: Mutex<Option<Session>>,
    accounts: Mutex<HashMap<String, (String, Session)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionChange>>>,
    pub fail_get_session: AtomicBool,
    pub get_session_calls: AtomicUsize,
    pub sign_in_calls: AtomicUsize,
    pub password_updates: AtomicUsize,
    pub reset_requests: Mutex<Vec<(String, Url)>>,
}

impl FakeIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_session(session: Session) -> Arc<Self> {
        let identity = Self::default();
        *identity.session.lock().unwrap() = Some(session);
        Arc::new(identity)
    }

    pub fn add_account(&self, email: &str, password: &str, session: Session) {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), session));
    }

    /// Push a change to every subscriber, as the provider would.
    pub fn emit(&self, change: SessionChange) {
        *self.session.lock().unwrap() = change.session.clone();
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

impl IdentityProvider for FakeIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let account = self.accounts.lock().unwrap().get(email).cloned();
        match account {
            Some((expected, session)) if expected == password => {
                self.emit(SessionChange::signed_in(session.clone()));
                Ok(session)
            }
            _ => Err(Error::Backend {
                operation: "sign in",
                status: Some(400),
                detail: "Invalid login credentials".into(),
            }),
        }
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _attributes: &SignUpAttributes,
    ) -> Result<Option<Session>, Error> {
        Ok(None)
    }

    async fn sign_out(&self) -> Result<(), Error> {
        self.emit(SessionChange::signed_out());
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, Error> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_session.load(Ordering::SeqCst) {
            return Err(outage("session fetch"));
        }
        Ok(self.session.lock().unwrap().clone())
    }

    fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    async fn reset_password_for_email(&self, email: &str, redirect_url: &Url) -> Result<(), Error> {
        self.reset_requests
            .lock()
            .unwrap()
            .push((email.to_string(), redirect_url.clone()));
        Ok(())
    }

    async fn update_user(&self, _update: &UserUpdate) -> Result<(), Error> {
        self.password_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Profiles ───────────────────────────────────────────────────────

type Gate = oneshot::Receiver<Result<Option<Profile>, Error>>;

#[derive(Default)]
pub struct FakeProfileStore {
    rows: Mutex<HashMap<SubjectId, Profile>>,
    gates: Mutex<VecDeque<Gate>>,
    pub fail: AtomicBool,
    pub selects: AtomicUsize,
    pub updates: Mutex<Vec<ProfileUpdate>>,
}

impl FakeProfileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rows(rows: impl IntoIterator<Item = Profile>) -> Arc<Self> {
        let store = Self::default();
        store
            .rows
            .lock()
            .unwrap()
            .extend(rows.into_iter().map(|p| (p.id.clone(), p)));
        Arc::new(store)
    }

    pub fn insert(&self, profile: Profile) {
        self.rows.lock().unwrap().insert(profile.id.clone(), profile);
    }

    /// Make the next select wait for the returned sender.
    pub fn gate(&self) -> oneshot::Sender<Result<Option<Profile>, Error>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().push_back(rx);
        tx
    }

    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }
}

impl ProfileStore for FakeProfileStore {
    async fn select_profile_by_id(&self, id: &SubjectId) -> Result<Option<Profile>, Error> {
        // Pop before counting so a seen select already owns its gate.
        let gate = self.gates.lock().unwrap().pop_front();
        self.selects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = gate {
            return gate.await.unwrap_or(Ok(None));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(outage("profile select"));
        }
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn update_profile(&self, id: &SubjectId, fields: &ProfileUpdate) -> Result<Profile, Error> {
        self.updates.lock().unwrap().push(fields.clone());
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::UnexpectedResponse("profile update".into()))?;
        if let Some(name) = &fields.full_name {
            row.full_name = Some(name.clone());
        }
        if let Some(count) = fields.login_count {
            row.login_count = count;
        }
        if fields.last_login_at.is_some() {
            row.last_login_at = fields.last_login_at;
        }
        if fields.last_active_at.is_some() {
            row.last_active_at = fields.last_active_at;
        }
        Ok(row.clone())
    }
}

// ── Payment SDK ────────────────────────────────────────────────────

/// Stand-in for a mounted card input.
pub struct FakeCard;

#[derive(Default)]
pub struct FakePaymentSdk {
    create_errors: Mutex<VecDeque<String>>,
    confirm_error: Mutex<Option<String>>,
    confirm_outages: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub confirmed: Mutex<Vec<String>>,
}

impl FakePaymentSdk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn decline_next_card(&self, message: &str) {
        self.create_errors.lock().unwrap().push_back(message.to_string());
    }

    pub fn fail_confirmation(&self, message: &str) {
        *self.confirm_error.lock().unwrap() = Some(message.to_string());
    }

    /// Fail the next confirmation with a network error, not a card error.
    pub fn interrupt_next_confirmation(&self) {
        self.confirm_outages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn confirm_count(&self) -> usize {
        self.confirmed.lock().unwrap().len()
    }
}

impl PaymentSdk for FakePaymentSdk {
    type CardElement = FakeCard;

    async fn create_payment_method(
        &self,
        _card: &FakeCard,
        _billing: &BillingDetails,
    ) -> Result<PaymentMethodId, Error> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(message) = self.create_errors.lock().unwrap().pop_front() {
            return Err(Error::Card {
                message,
                code: Some("card_declined".into()),
            });
        }
        Ok(PaymentMethodId(format!("pm_{n}")))
    }

    async fn confirm_card_payment(&self, client_secret: &str) -> Result<(), Error> {
        self.confirmed.lock().unwrap().push(client_secret.to_string());
        let interrupted = self
            .confirm_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interrupted {
            return Err(outage("confirm card payment"));
        }
        match self.confirm_error.lock().unwrap().clone() {
            Some(message) => Err(Error::Card {
                message,
                code: Some("card_declined".into()),
            }),
            None => Ok(()),
        }
    }
}

// ── Payment backend ────────────────────────────────────────────────

pub enum Answer {
    Respond(CreateSubscriptionResponse),
    Unavailable,
}

#[derive(Default)]
pub struct FakePaymentBackend {
    answers: Mutex<VecDeque<Answer>>,
    holds: Mutex<VecDeque<oneshot::Receiver<()>>>,
    status: Mutex<SubscriptionStatusResponse>,
    pub fail_status: AtomicBool,
    pub requests: Mutex<Vec<CreateSubscriptionRequest>>,
    pub status_calls: AtomicUsize,
}

impl FakePaymentBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, answer: Answer) {
        self.answers.lock().unwrap().push_back(answer);
    }

    /// Keep the next create call in flight until the returned sender fires.
    pub fn hold_create(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().unwrap().push_back(rx);
        tx
    }

    pub fn set_status(&self, status: SubscriptionStatusResponse) {
        *self.status.lock().unwrap() = status;
    }

    pub fn create_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl PaymentBackend for FakePaymentBackend {
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse, Error> {
        self.requests.lock().unwrap().push(request.clone());
        let hold = self.holds.lock().unwrap().pop_front();
        match hold {
            Some(hold) => {
                let _ = hold.await;
            }
            // Network latency: let other tasks run before answering.
            None => tokio::task::yield_now().await,
        }

        let answer = self.answers.lock().unwrap().pop_front();
        match answer {
            Some(Answer::Respond(response)) => Ok(response),
            Some(Answer::Unavailable) => Err(outage("create subscription")),
            None => Ok(CreateSubscriptionResponse::default()),
        }
    }

    async fn check_subscription_status(
        &self,
        _user_id: &SubjectId,
    ) -> Result<SubscriptionStatusResponse, Error> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(outage("subscription status"));
        }
        Ok(self.status.lock().unwrap().clone())
    }
}

/// Auth state for `profile`'s subject, initialized and signed in.
pub async fn signed_in_auth(
    profile: Profile,
) -> (
    AuthState<FakeIdentity, FakeProfileStore>,
    Arc<FakeIdentity>,
    Arc<FakeProfileStore>,
) {
    let identity = FakeIdentity::with_session(session_for(&profile.id.0, &profile.email));
    let profiles = FakeProfileStore::with_rows([profile]);
    let auth = AuthState::new(identity.clone(), profiles.clone());
    auth.initialize().await;
    (auth, identity, profiles)
}
