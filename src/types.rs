use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identity-provider subject identifier.
///
/// Immutable, unique per account. The profile row uses the same value as its
/// primary key, so this is the sole link between a session and a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SubjectId(pub String);

/// Local subscription plan identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct PlanId(pub String);

/// Payment-processor price identifier attached to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct PriceId(pub String);

/// Onboarding quiz result a purchase may be linked to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct QuizResultId(pub String);

/// Opaque payment-method token produced by client-side card tokenization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct PaymentMethodId(pub String);

/// Identity-provider user attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct User {
    pub id: SubjectId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub email_confirmed_at: Option<OffsetDateTime>,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: SubjectId(id.into()),
            email: None,
            email_confirmed_at: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_email_confirmed_at(mut self, at: OffsetDateTime) -> Self {
        self.email_confirmed_at = Some(at);
        self
    }
}

/// Identity-provider session.
///
/// Held as a whole value: a change replaces the session, fields are never
/// patched in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: User,
}

impl Session {
    #[must_use]
    pub fn new(
        user: User,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            user,
        }
    }

    #[must_use]
    pub fn subject_id(&self) -> &SubjectId {
        &self.user.id
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("subject_id", &self.user.id)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Session lifecycle events reported by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionEvent {
    #[display("SIGNED_IN")]
    SignedIn,
    #[display("SIGNED_OUT")]
    SignedOut,
    #[display("TOKEN_REFRESHED")]
    TokenRefreshed,
    #[display("USER_UPDATED")]
    UserUpdated,
}

impl SessionEvent {
    /// Events after which the profile row must be fetched again.
    #[must_use]
    pub fn refreshes_profile(self) -> bool {
        matches!(self, Self::SignedIn | Self::TokenRefreshed | Self::UserUpdated)
    }
}

/// One notification from the identity provider: the event and the session
/// that is current after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub event: SessionEvent,
    pub session: Option<Session>,
}

impl SessionChange {
    #[must_use]
    pub fn signed_in(session: Session) -> Self {
        Self {
            event: SessionEvent::SignedIn,
            session: Some(session),
        }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self {
            event: SessionEvent::SignedOut,
            session: None,
        }
    }

    #[must_use]
    pub fn token_refreshed(session: Session) -> Self {
        Self {
            event: SessionEvent::TokenRefreshed,
            session: Some(session),
        }
    }

    #[must_use]
    pub fn user_updated(session: Session) -> Self {
        Self {
            event: SessionEvent::UserUpdated,
            session: Some(session),
        }
    }
}

/// Profile row owned by the application, keyed by [`SubjectId`].
///
/// Created by the backend at signup. This crate refreshes and edits it but
/// never deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    pub id: SubjectId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub email_confirmed: bool,
    #[serde(default)]
    pub login_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_active_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub debug_mode: bool,
}

impl Profile {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: SubjectId(id.into()),
            email: email.into(),
            full_name: None,
            username: None,
            avatar_url: None,
            is_admin: false,
            email_confirmed: false,
            login_count: 0,
            last_active_at: None,
            last_login_at: None,
            debug_mode: false,
        }
    }

    #[must_use]
    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    #[must_use]
    pub fn with_email_confirmed(mut self, confirmed: bool) -> Self {
        self.email_confirmed = confirmed;
        self
    }
}

/// Partial profile edit. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_count: Option<u32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_active_at: Option<OffsetDateTime>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_mode: Option<bool>,
}

impl ProfileUpdate {
    /// Bookkeeping written after an interactive sign-in.
    #[must_use]
    pub fn sign_in_recorded(previous_count: u32, now: OffsetDateTime) -> Self {
        Self {
            login_count: Some(previous_count.saturating_add(1)),
            last_login_at: Some(now),
            last_active_at: Some(now),
            ..Self::default()
        }
    }
}

/// Extra attributes sent with a signup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignUpAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Identity-provider user edit. Only the password is changed by this crate.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct UserUpdate {
    pub password: String,
}

impl std::fmt::Debug for UserUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserUpdate")
            .field("password", &"<redacted>")
            .finish()
    }
}
