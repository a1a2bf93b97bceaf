use serde::Deserialize;

use crate::billing::BillingDetails;
use crate::config::StripeConfig;
use crate::error::Error;
use crate::traits::PaymentSdk;
use crate::types::PaymentMethodId;

/// Raw card input collected by the checkout form.
///
/// Only ever handed to [`StripeClient`] for tokenization; never stored.
#[derive(Clone)]
pub struct CardDetails {
    pub number: String,
    pub exp_month: u8,
    pub exp_year: u16,
    pub cvc: String,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digits: String = self.number.chars().filter(char::is_ascii_digit).collect();
        let last4 = &digits[digits.len().saturating_sub(4)..];
        f.debug_struct("CardDetails")
            .field("last4", &last4)
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("cvc", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct PaymentMethodResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    status: String,
    #[serde(default)]
    last_payment_error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiErrorBody {
    fn is_card_error(&self) -> bool {
        matches!(self.kind.as_deref(), Some("card_error" | "validation_error"))
    }
}

/// Client-side payment SDK over the processor's publishable-key API.
pub struct StripeClient {
    config: StripeConfig,
    http: reqwest::Client,
}

impl StripeClient {
    #[must_use]
    pub fn new(config: StripeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        operation: &'static str,
    ) -> Result<T, Error> {
        let url = self
            .config
            .api_url
            .join(path)
            .map_err(|e| Error::Config(format!("{path}: {e}")))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.publishable_key)
            .form(form)
            .send()
            .await?;

        if response.status().is_success() {
            return response.json::<T>().await.map_err(Into::into);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(api_error(operation, status, &body))
    }
}

/// Card and validation errors become [`Error::Card`] with the processor's
/// message; everything else is a backend error.
fn api_error(operation: &'static str, status: u16, body: &str) -> Error {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(ApiErrorEnvelope { error }) if error.is_card_error() => Error::Card {
            message: error
                .message
                .unwrap_or_else(|| "Your card was declined.".to_string()),
            code: error.code,
        },
        Ok(ApiErrorEnvelope { error }) => Error::Backend {
            operation,
            status: Some(status),
            detail: error.message.unwrap_or_default(),
        },
        Err(_) => Error::Backend {
            operation,
            status: Some(status),
            detail: body.to_string(),
        },
    }
}

/// Payment intent id embedded in a client secret (`pi_123_secret_abc`).
fn intent_id(client_secret: &str) -> Option<&str> {
    client_secret
        .split_once("_secret_")
        .map(|(id, _)| id)
        .filter(|id| id.starts_with("pi_"))
}

impl PaymentSdk for StripeClient {
    type CardElement = CardDetails;

    async fn create_payment_method(
        &self,
        card: &CardDetails,
        billing: &BillingDetails,
    ) -> Result<PaymentMethodId, Error> {
        let form = [
            ("type", "card".to_string()),
            ("card[number]", card.number.replace(' ', "")),
            ("card[exp_month]", card.exp_month.to_string()),
            ("card[exp_year]", card.exp_year.to_string()),
            ("card[cvc]", card.cvc.clone()),
            ("billing_details[name]", billing.name.clone()),
            ("billing_details[email]", billing.email.clone()),
        ];
        let method: PaymentMethodResponse = self
            .post_form("v1/payment_methods", &form, "create payment method")
            .await?;
        Ok(PaymentMethodId(method.id))
    }

    async fn confirm_card_payment(&self, client_secret: &str) -> Result<(), Error> {
        let id = intent_id(client_secret)
            .ok_or_else(|| Error::Validation("invalid payment client secret".into()))?;
        let intent: PaymentIntentResponse = self
            .post_form(
                &format!("v1/payment_intents/{id}/confirm"),
                &[("client_secret", client_secret.to_string())],
                "confirm payment",
            )
            .await?;

        match intent.status.as_str() {
            "succeeded" | "processing" => Ok(()),
            "requires_action" => Err(Error::Card {
                message: "Your card requires additional authentication.".into(),
                code: Some("authentication_required".into()),
            }),
            "requires_payment_method" => {
                let error = intent.last_payment_error;
                Err(Error::Card {
                    message: error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_else(|| "Your card was declined.".to_string()),
                    code: error.and_then(|e| e.code),
                })
            }
            other => Err(Error::UnexpectedResponse(format!(
                "payment confirmation ({other})"
            ))),
        }
    }
}
