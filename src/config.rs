use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Managed-backend connection settings.
///
/// Required fields are constructor parameters; everything else has a default
/// overridable with `with_*` methods.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BackendConfig {
    pub(crate) base_url: Url,
    pub(crate) anon_key: String,
    pub(crate) profiles_table: String,
    pub(crate) payment_function: String,
}

impl BackendConfig {
    #[must_use]
    pub fn new(base_url: Url, anon_key: impl Into<String>) -> Self {
        Self {
            base_url,
            anon_key: anon_key.into(),
            profiles_table: "profiles".into(),
            payment_function: "stripe-payment".into(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `SUPABASE_URL`: project base URL
    /// - `SUPABASE_ANON_KEY`: public anon key
    ///
    /// # Optional env vars
    /// - `PROFILES_TABLE`: profile table name (default `profiles`)
    /// - `PAYMENT_FUNCTION`: payment edge function name (default `stripe-payment`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or the URL is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = required_url("SUPABASE_URL")?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::Config("SUPABASE_ANON_KEY is required".into()))?;

        let mut config = Self::new(base_url, anon_key);
        if let Ok(table) = std::env::var("PROFILES_TABLE") {
            config = config.with_profiles_table(table);
        }
        if let Ok(function) = std::env::var("PAYMENT_FUNCTION") {
            config = config.with_payment_function(function);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_profiles_table(mut self, table: impl Into<String>) -> Self {
        self.profiles_table = table.into();
        self
    }

    #[must_use]
    pub fn with_payment_function(mut self, name: impl Into<String>) -> Self {
        self.payment_function = name.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn profiles_table(&self) -> &str {
        &self.profiles_table
    }

    #[must_use]
    pub fn payment_function(&self) -> &str {
        &self.payment_function
    }

    /// Resolve `path` against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("{path}: {e}")))
    }
}

/// Payment SDK settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StripeConfig {
    pub(crate) publishable_key: String,
    pub(crate) api_url: Url,
}

impl StripeConfig {
    #[must_use]
    pub fn new(publishable_key: impl Into<String>) -> Self {
        Self {
            publishable_key: publishable_key.into(),
            api_url: "https://api.stripe.com/"
                .parse()
                .expect("valid default URL"),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `STRIPE_PUBLISHABLE_KEY`: publishable (client-side) key
    ///
    /// # Optional env vars
    /// - `STRIPE_API_URL`: override the API base URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is missing, is a secret key, or the URL is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let key = std::env::var("STRIPE_PUBLISHABLE_KEY")
            .map_err(|_| Error::Config("STRIPE_PUBLISHABLE_KEY is required".into()))?;
        if !key.starts_with("pk_") {
            return Err(Error::Config(
                "STRIPE_PUBLISHABLE_KEY must be a publishable key (pk_...)".into(),
            ));
        }

        let mut config = Self::new(key);
        if std::env::var("STRIPE_API_URL").is_ok() {
            config = config.with_api_url(required_url("STRIPE_API_URL")?);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_api_url(mut self, url: Url) -> Self {
        self.api_url = url;
        self
    }

    #[must_use]
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }
}

/// Route layout and guard tuning.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RouteSettings {
    pub(crate) login_path: String,
    pub(crate) verify_path: String,
    pub(crate) admin_path: String,
    pub(crate) dashboard_path: String,
    pub(crate) guard_timeout: Duration,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            login_path: "/login".into(),
            verify_path: "/verify-email".into(),
            admin_path: "/admin".into(),
            dashboard_path: "/dashboard".into(),
            guard_timeout: Duration::from_secs(5),
        }
    }
}

impl RouteSettings {
    /// Defaults, with the guard timeout overridable by `AUTH_GUARD_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `AUTH_GUARD_TIMEOUT_MS` is not a number.
    pub fn from_env() -> Result<Self, Error> {
        let settings = Self::default();
        match std::env::var("AUTH_GUARD_TIMEOUT_MS") {
            Ok(ms) => {
                let ms: u64 = ms
                    .trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("AUTH_GUARD_TIMEOUT_MS: {e}")))?;
                Ok(settings.with_guard_timeout(Duration::from_millis(ms)))
            }
            Err(_) => Ok(settings),
        }
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_verify_path(mut self, path: impl Into<String>) -> Self {
        self.verify_path = path.into();
        self
    }

    #[must_use]
    pub fn with_admin_path(mut self, path: impl Into<String>) -> Self {
        self.admin_path = path.into();
        self
    }

    #[must_use]
    pub fn with_dashboard_path(mut self, path: impl Into<String>) -> Self {
        self.dashboard_path = path.into();
        self
    }

    /// How long a guard waits for auth to settle before admitting anyway.
    #[must_use]
    pub fn with_guard_timeout(mut self, timeout: Duration) -> Self {
        self.guard_timeout = timeout;
        self
    }

    #[must_use]
    pub fn guard_timeout(&self) -> Duration {
        self.guard_timeout
    }

    #[must_use]
    pub fn admin_path(&self) -> &str {
        &self.admin_path
    }

    #[must_use]
    pub fn dashboard_path(&self) -> &str {
        &self.dashboard_path
    }
}

fn required_url(var: &str) -> Result<Url, Error> {
    let raw = std::env::var(var).map_err(|_| Error::Config(format!("{var} is required")))?;
    raw.parse()
        .map_err(|e| Error::Config(format!("{var}: {e}")))
}
