use tokio::sync::watch;

use crate::auth::AuthSnapshot;
use crate::config::RouteSettings;

/// Outcome of guarding one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Auth has not settled; render a neutral placeholder.
    Loading,
    Admit,
    /// Not signed in. `from` is the attempted path, for returning after login.
    RedirectLogin { from: String },
    /// Signed in but the profile's email is unconfirmed.
    RedirectVerify { email: Option<String> },
    /// Admins live in the admin area.
    RedirectAdmin,
    /// Non-admin inside the admin area.
    RedirectDashboard,
}

impl GuardDecision {
    #[must_use]
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Browser location to navigate to, if this is a redirect.
    #[must_use]
    pub fn location(&self, settings: &RouteSettings) -> Option<String> {
        match self {
            Self::Loading | Self::Admit => None,
            Self::RedirectLogin { from } => Some(format!(
                "{}?from={}",
                settings.login_path,
                urlencoding::encode(from)
            )),
            Self::RedirectVerify { email: Some(email) } if !email.is_empty() => Some(format!(
                "{}?email={}",
                settings.verify_path,
                urlencoding::encode(email)
            )),
            Self::RedirectVerify { .. } => Some(settings.verify_path.clone()),
            Self::RedirectAdmin => Some(settings.admin_path.clone()),
            Self::RedirectDashboard => Some(settings.dashboard_path.clone()),
        }
    }
}

/// Decide access to `path` from one snapshot.
///
/// Rules, first match wins:
/// 1. still loading → `Loading`
/// 2. not authenticated → `RedirectLogin`
/// 3. admin outside the admin area → `RedirectAdmin`
/// 4. no profile row yet → `Loading` (signed in, not provisioned)
/// 5. non-admin inside the admin area → `RedirectDashboard`
/// 6. email unconfirmed → `RedirectVerify`
/// 7. `Admit`
#[must_use]
pub fn evaluate(snapshot: &AuthSnapshot, path: &str, settings: &RouteSettings) -> GuardDecision {
    if snapshot.is_loading || !snapshot.is_initialized {
        return GuardDecision::Loading;
    }
    if !snapshot.is_authenticated {
        return GuardDecision::RedirectLogin {
            from: path.to_string(),
        };
    }

    let in_admin_area = is_within(path, &settings.admin_path);
    if snapshot.is_admin && !in_admin_area {
        return GuardDecision::RedirectAdmin;
    }

    let Some(profile) = &snapshot.profile else {
        return GuardDecision::Loading;
    };
    if in_admin_area && !snapshot.is_admin {
        return GuardDecision::RedirectDashboard;
    }
    if !profile.email_confirmed {
        return GuardDecision::RedirectVerify {
            email: Some(profile.email.clone()).filter(|e| !e.is_empty()),
        };
    }
    GuardDecision::Admit
}

fn is_within(path: &str, area: &str) -> bool {
    let area = area.trim_end_matches('/');
    path == area
        || path
            .strip_prefix(area)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Route guard bound to a stream of [`AuthSnapshot`]s.
///
/// Obtain one with [`AuthState::route_guard`](crate::AuthState::route_guard).
/// Dropping a pending [`resolve`](Self::resolve) future abandons it without
/// side effects.
#[derive(Clone)]
pub struct RouteGuard {
    snapshots: watch::Receiver<AuthSnapshot>,
    settings: RouteSettings,
}

impl RouteGuard {
    #[must_use]
    pub fn new(snapshots: watch::Receiver<AuthSnapshot>, settings: RouteSettings) -> Self {
        Self {
            snapshots,
            settings,
        }
    }

    /// Decision for `path` against the latest snapshot, possibly `Loading`.
    #[must_use]
    pub fn evaluate(&self, path: &str) -> GuardDecision {
        evaluate(&self.snapshots.borrow(), path, &self.settings)
    }

    /// Wait until auth settles for `path` and return the decision.
    ///
    /// Never returns `Loading`. If auth has not settled within the configured
    /// timeout, or the auth state goes away first, the route is admitted: a
    /// stalled backend must not strand the user on a blank screen.
    pub async fn resolve(&self, path: &str) -> GuardDecision {
        let mut snapshots = self.snapshots.clone();
        let settled =
            snapshots.wait_for(|snapshot| !evaluate(snapshot, path, &self.settings).is_loading());

        match tokio::time::timeout(self.settings.guard_timeout, settled).await {
            Ok(Ok(snapshot)) => evaluate(&snapshot, path, &self.settings),
            Ok(Err(_)) => {
                tracing::warn!(path, "Auth state closed before settling, admitting");
                GuardDecision::Admit
            }
            Err(_) => {
                tracing::warn!(
                    path,
                    timeout_ms = self.settings.guard_timeout.as_millis() as u64,
                    "Auth did not settle in time, admitting"
                );
                GuardDecision::Admit
            }
        }
    }

    #[must_use]
    pub fn location(&self, decision: &GuardDecision) -> Option<String> {
        decision.location(&self.settings)
    }

    #[must_use]
    pub fn settings(&self) -> &RouteSettings {
        &self.settings
    }
}
