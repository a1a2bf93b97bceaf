/// How an error is allowed to reach the user.
///
/// Every async boundary classifies its failure: transient errors degrade to
/// cached data with a log line, validation and unexpected errors are shown,
/// authorization errors turn into a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure, timeout, 5xx. Logged, never shown.
    Transient,
    /// Bad input or a card the processor rejected. Shown inline.
    Validation,
    /// Not signed in or not allowed. Resolved by navigation.
    Authorization,
    /// A backend answered with something we do not understand.
    Unexpected,
}

impl ErrorClass {
    /// Whether errors of this class carry a message meant for the end user.
    #[must_use]
    pub fn is_user_visible(self) -> bool {
        matches!(self, Self::Validation | Self::Unexpected)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} failed (status {status:?}): {detail}")]
    Backend {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    /// The payment SDK refused the card. `message` is shown verbatim.
    #[error("{message}")]
    Card {
        message: String,
        code: Option<String>,
    },

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            #[cfg(feature = "http")]
            Self::Http(_) => ErrorClass::Transient,
            Self::Backend { status, .. } => match status {
                None => ErrorClass::Transient,
                Some(401 | 403) => ErrorClass::Authorization,
                Some(400 | 422) => ErrorClass::Validation,
                Some(408 | 429) => ErrorClass::Transient,
                Some(s) if *s >= 500 => ErrorClass::Transient,
                Some(_) => ErrorClass::Unexpected,
            },
            Self::Validation(_) | Self::Card { .. } => ErrorClass::Validation,
            Self::Unauthenticated => ErrorClass::Authorization,
            Self::Decode(_) | Self::UnexpectedResponse(_) | Self::Config(_) => {
                ErrorClass::Unexpected
            }
        }
    }

    /// Whether the failure is tied to the card itself, so a retry must
    /// tokenize the card again.
    #[must_use]
    pub fn is_card_specific(&self) -> bool {
        matches!(self, Self::Card { .. })
    }
}
