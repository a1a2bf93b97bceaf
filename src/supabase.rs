use std::sync::{Mutex, RwLock};

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use url::Url;

use crate::billing::{CreateSubscriptionRequest, CreateSubscriptionResponse, SubscriptionStatusResponse};
use crate::config::BackendConfig;
use crate::error::Error;
use crate::traits::{IdentityProvider, PaymentBackend, ProfileStore};
use crate::types::{
    Profile, ProfileUpdate, Session, SessionChange, SignUpAttributes, SubjectId, User, UserUpdate,
};

/// Token response of the identity endpoints.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self, now: OffsetDateTime) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|at| OffsetDateTime::from_unix_timestamp(at).ok())
            .unwrap_or_else(|| now + time::Duration::seconds(self.expires_in.unwrap_or(3600)));
        Session::new(self.user, self.access_token, self.refresh_token, expires_at)
    }
}

/// HTTP client for the managed backend: identity, profile table and the
/// payment function.
///
/// Keeps the current session in memory and reports every change to all
/// [`on_session_change`](IdentityProvider::on_session_change) receivers.
pub struct SupabaseClient {
    config: BackendConfig,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionChange>>>,
}

impl SupabaseClient {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            session: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Install a session persisted by the host, without emitting an event.
    pub fn restore_session(&self, session: Session) {
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session);
    }

    /// Exchange the refresh token for a new session.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] without a session. If the provider refuses
    /// the refresh, the session is dropped and `SIGNED_OUT` is emitted.
    pub async fn refresh_session(&self) -> Result<Session, Error> {
        let refresh_token = self
            .current_session()
            .ok_or(Error::Unauthenticated)?
            .refresh_token;

        let mut url = self.config.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let result = self
            .send_json::<TokenResponse>(
                self.request(Method::POST, url)
                    .json(&json!({ "refresh_token": refresh_token })),
                "token refresh",
            )
            .await;

        match result {
            Ok(token) => {
                let session = token.into_session(OffsetDateTime::now_utc());
                self.set_session(Some(session.clone()));
                self.emit(SessionChange::token_refreshed(session.clone()));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session refresh failed, signing out locally");
                self.set_session(None);
                self.emit(SessionChange::signed_out());
                Err(e)
            }
        }
    }

    fn current_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: Option<Session>) {
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = session;
    }

    fn emit(&self, change: SessionChange) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Request carrying the project key and, when signed in, the user's token.
    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let bearer = self
            .current_session()
            .map_or_else(|| self.config.anon_key.clone(), |s| s.access_token);
        self.http
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
    }

    fn profiles_url(&self, id: &SubjectId) -> Result<Url, Error> {
        let mut url = self
            .config
            .endpoint(&format!("rest/v1/{}", self.config.profiles_table))?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("select", "*");
        Ok(url)
    }

    fn function_url(&self) -> Result<Url, Error> {
        self.config
            .endpoint(&format!("functions/v1/{}", self.config.payment_function))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, Error> {
        let response = Self::ensure_success(request.send().await?, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Backend {
            operation,
            status: Some(status),
            detail: error_detail(&body),
        })
    }
}

/// Pull the human-readable message out of an error body, if there is one.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            ["error_description", "msg", "message", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(JsonValue::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

impl IdentityProvider for SupabaseClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        let mut url = self.config.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");

        let token: TokenResponse = self
            .send_json(
                self.request(Method::POST, url)
                    .json(&json!({ "email": email, "password": password })),
                "sign in",
            )
            .await?;

        let session = token.into_session(OffsetDateTime::now_utc());
        self.set_session(Some(session.clone()));
        self.emit(SessionChange::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: &SignUpAttributes,
    ) -> Result<Option<Session>, Error> {
        let url = self.config.endpoint("auth/v1/signup")?;
        let body: JsonValue = self
            .send_json(
                self.request(Method::POST, url).json(&json!({
                    "email": email,
                    "password": password,
                    "data": attributes,
                })),
                "sign up",
            )
            .await?;

        // Without an access token the provider is waiting for email confirmation.
        if body.get("access_token").is_none() {
            return Ok(None);
        }
        let session = serde_json::from_value::<TokenResponse>(body)?
            .into_session(OffsetDateTime::now_utc());
        self.set_session(Some(session.clone()));
        self.emit(SessionChange::signed_in(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), Error> {
        if self.current_session().is_none() {
            return Ok(());
        }
        let url = self.config.endpoint("auth/v1/logout")?;
        let result = match self.request(Method::POST, url).send().await {
            Ok(response) => Self::ensure_success(response, "sign out").await.map(|_| ()),
            Err(e) => Err(e.into()),
        };

        // The local session goes regardless; the caller only learns whether
        // the provider revoked it too.
        self.set_session(None);
        self.emit(SessionChange::signed_out());
        result
    }

    async fn get_session(&self) -> Result<Option<Session>, Error> {
        match self.current_session() {
            Some(session) if session.is_expired_at(OffsetDateTime::now_utc()) => {
                self.refresh_session().await.map(Some)
            }
            session => Ok(session),
        }
    }

    fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        rx
    }

    async fn reset_password_for_email(&self, email: &str, redirect_url: &Url) -> Result<(), Error> {
        let mut url = self.config.endpoint("auth/v1/recover")?;
        url.query_pairs_mut()
            .append_pair("redirect_to", redirect_url.as_str());

        let response = self
            .request(Method::POST, url)
            .json(&json!({ "email": email }))
            .send()
            .await?;
        Self::ensure_success(response, "password reset").await?;
        Ok(())
    }

    async fn update_user(&self, update: &UserUpdate) -> Result<(), Error> {
        let session = self.current_session().ok_or(Error::Unauthenticated)?;
        let url = self.config.endpoint("auth/v1/user")?;

        let user: User = self
            .send_json(self.request(Method::PUT, url).json(update), "update user")
            .await?;

        let session = Session::new(
            user,
            session.access_token,
            session.refresh_token,
            session.expires_at,
        );
        self.set_session(Some(session.clone()));
        self.emit(SessionChange::user_updated(session));
        Ok(())
    }
}

impl ProfileStore for SupabaseClient {
    async fn select_profile_by_id(&self, id: &SubjectId) -> Result<Option<Profile>, Error> {
        let url = self.profiles_url(id)?;
        let rows: Vec<Profile> = self
            .send_json(self.request(Method::GET, url), "profile select")
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_profile(&self, id: &SubjectId, fields: &ProfileUpdate) -> Result<Profile, Error> {
        let url = self.profiles_url(id)?;
        let rows: Vec<Profile> = self
            .send_json(
                self.request(Method::PATCH, url)
                    .header("Prefer", "return=representation")
                    .json(fields),
                "profile update",
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::UnexpectedResponse("profile update".into()))
    }
}

impl PaymentBackend for SupabaseClient {
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse, Error> {
        let mut body = serde_json::to_value(request)?;
        if let Some(fields) = body.as_object_mut() {
            fields.insert("action".into(), json!("createSubscription"));
        }

        let response = self
            .request(Method::POST, self.function_url()?)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        // The function reports business errors as `{error}`, sometimes with a
        // non-2xx status; those are answers, not transport failures.
        match serde_json::from_str::<CreateSubscriptionResponse>(&text) {
            Ok(parsed) if status.is_success() || parsed.error.is_some() => Ok(parsed),
            _ if status.is_success() => Err(Error::UnexpectedResponse("payment service".into())),
            _ => Err(Error::Backend {
                operation: "create subscription",
                status: Some(status.as_u16()),
                detail: error_detail(&text),
            }),
        }
    }

    async fn check_subscription_status(
        &self,
        user_id: &SubjectId,
    ) -> Result<SubscriptionStatusResponse, Error> {
        self.send_json(
            self.request(Method::POST, self.function_url()?).json(&json!({
                "action": "checkSubscriptionStatus",
                "userId": user_id,
            })),
            "subscription status",
        )
        .await
    }
}
