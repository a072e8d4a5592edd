use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{CheckoutOptions, CheckoutOutcome, CheckoutWidget, PaymentFailure, PaymentSuccess};

const API_BASE: &str = "https://api.razorpay.com/v1";
const KEY_ID_VAR: &str = "RAZORPAY_KEY_ID";
const KEY_SECRET_VAR: &str = "RAZORPAY_KEY_SECRET";

/// A created order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Order {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkPayment {
    pub payment_id: String,
    #[serde(default)]
    pub status: String,
}

/// A hosted payment page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentLink {
    pub id: String,
    pub short_url: String,
    /// `created`, `partially_paid`, `paid`, `cancelled` or `expired`.
    pub status: String,
    #[serde(default)]
    pub payments: Option<Vec<LinkPayment>>,
}

#[derive(Serialize)]
struct OrderRequest<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    payment_capture: u8,
}

#[derive(Serialize)]
struct LinkRequest<'a> {
    amount: u64,
    currency: &'a str,
    description: &'a str,
    reference_id: &'a str,
    customer: LinkCustomer<'a>,
}

#[derive(Serialize)]
struct LinkCustomer<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    contact: &'a str,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

/// Client for the payment gateway's orders and payment links APIs.
#[derive(Clone)]
pub struct RazorpayClient {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayClient {
    pub fn new(key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: API_BASE.to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        }
    }

    /// Credentials from `RAZORPAY_KEY_ID` / `RAZORPAY_KEY_SECRET`.
    pub fn from_env() -> Result<Self> {
        let key_id = std::env::var(KEY_ID_VAR).unwrap_or_default();
        let key_secret = std::env::var(KEY_SECRET_VAR).unwrap_or_default();
        if key_id.is_empty() || key_secret.is_empty() {
            bail!("Razorpay credentials not configured (set {KEY_ID_VAR} and {KEY_SECRET_VAR})");
        }
        Ok(Self::new(key_id, key_secret))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The public key id, safe to hand to the checkout widget.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Create an auto-captured INR order for `amount` paise.
    pub async fn create_order(&self, amount: u64) -> Result<Order> {
        let receipt = new_receipt();
        let body = OrderRequest {
            amount,
            currency: super::DEFAULT_CURRENCY,
            receipt: &receipt,
            payment_capture: 1,
        };
        let resp = self
            .client
            .post(self.url("orders"))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .context("failed to reach payment gateway")?;
        let order: Order = parse(resp).await?;
        info!(order = %order.id, amount, "order created");
        Ok(order)
    }

    /// Create a hosted payment page for a checkout.
    pub async fn create_payment_link(&self, options: &CheckoutOptions) -> Result<PaymentLink> {
        let body = LinkRequest {
            amount: options.amount,
            currency: &options.currency,
            description: &options.description,
            reference_id: &options.order_id,
            customer: LinkCustomer {
                name: &options.prefill.name,
                contact: &options.prefill.contact,
            },
        };
        let resp = self
            .client
            .post(self.url("payment_links"))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .context("failed to reach payment gateway")?;
        parse(resp).await
    }

    pub async fn fetch_payment_link(&self, id: &str) -> Result<PaymentLink> {
        let resp = self
            .client
            .get(self.url(&format!("payment_links/{id}")))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .context("failed to reach payment gateway")?;
        parse(resp).await
    }

    /// Check a checkout signature with this client's secret.
    pub fn verify(&self, success: &PaymentSuccess) -> bool {
        match (&success.razorpay_order_id, &success.razorpay_signature) {
            (Some(order_id), Some(signature)) => verify_signature(
                &self.key_secret,
                order_id,
                &success.razorpay_payment_id,
                signature,
            ),
            _ => false,
        }
    }
}

async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        if let Ok(body) = serde_json::from_str::<ApiErrorBody>(&text) {
            bail!("payment gateway error ({status}) {}: {}", body.error.code, body.error.description);
        }
        bail!("payment gateway error ({status}): {text}");
    }
    serde_json::from_str(&text).context("unexpected payment gateway response")
}

fn new_receipt() -> String {
    let mut rng = rand::rng();
    format!("rcpt_{:08x}", rng.random::<u32>())
}

/// `HMAC-SHA256(secret, "{order_id}|{payment_id}")` in lowercase hex
/// must equal `signature`.
pub fn verify_signature(secret: &str, order_id: &str, payment_id: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

type Opener = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// A [`CheckoutWidget`] for terminals: creates a hosted payment link,
/// opens it in the browser and polls until the payment settles.
pub struct PaymentLinkWidget {
    client: RazorpayClient,
    poll: Duration,
    timeout: Duration,
    opener: Opener,
}

impl PaymentLinkWidget {
    pub fn new(client: RazorpayClient) -> Self {
        Self {
            client,
            poll: Duration::from_secs(3),
            timeout: Duration::from_secs(15 * 60),
            opener: Arc::new(|url: &str| open::that(url)),
        }
    }

    pub fn with_polling(mut self, poll: Duration, timeout: Duration) -> Self {
        self.poll = poll;
        self.timeout = timeout;
        self
    }

    /// Replace how the link is shown to the user.
    pub fn with_opener(mut self, opener: impl Fn(&str) -> std::io::Result<()> + Send + Sync + 'static) -> Self {
        self.opener = Arc::new(opener);
        self
    }
}

#[async_trait]
impl CheckoutWidget for PaymentLinkWidget {
    async fn open(&self, options: &CheckoutOptions) -> Result<CheckoutOutcome> {
        let link = self.client.create_payment_link(options).await?;
        info!(link = %link.id, url = %link.short_url, "payment link created");
        if let Err(e) = (self.opener)(&link.short_url) {
            warn!("could not open browser: {e}");
        }
        println!("Complete the payment at: {}", link.short_url);

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let current = self.client.fetch_payment_link(&link.id).await?;
            debug!(link = %current.id, status = %current.status, "payment link status");
            match current.status.as_str() {
                "paid" => {
                    let payment_id = current
                        .payments
                        .unwrap_or_default()
                        .into_iter()
                        .find(|p| p.status == "captured" || p.status == "authorized")
                        .map(|p| p.payment_id)
                        .unwrap_or_default();
                    return Ok(CheckoutOutcome::Paid(PaymentSuccess {
                        razorpay_payment_id: payment_id,
                        razorpay_order_id: Some(options.order_id.clone()),
                        razorpay_signature: None,
                    }));
                }
                "cancelled" | "expired" => {
                    return Ok(CheckoutOutcome::Failed(PaymentFailure {
                        code: format!("LINK_{}", current.status.to_uppercase()),
                        description: format!("payment link {}", current.status),
                        reason: None,
                    }));
                }
                _ => {}
            }
            if tokio::time::Instant::now() + self.poll > deadline {
                return Ok(CheckoutOutcome::Dismissed);
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, message: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_verifies() {
        let signature = sign("s3cret", "order_1|pay_1");
        assert!(verify_signature("s3cret", "order_1", "pay_1", &signature));
    }

    #[test]
    fn tampered_signature_fails() {
        let signature = sign("s3cret", "order_1|pay_1");
        assert!(!verify_signature("s3cret", "order_1", "pay_2", &signature));
        assert!(!verify_signature("other", "order_1", "pay_1", &signature));
        assert!(!verify_signature("s3cret", "order_1", "pay_1", "not-hex"));
        assert!(!verify_signature("s3cret", "order_1", "pay_1", "abc"));
    }

    #[test]
    fn client_verifies_checkout_response() {
        let client = RazorpayClient::new("key", "s3cret");
        let success = PaymentSuccess {
            razorpay_payment_id: "pay_9".into(),
            razorpay_order_id: Some("order_9".into()),
            razorpay_signature: Some(sign("s3cret", "order_9|pay_9")),
        };
        assert!(client.verify(&success));

        let unsigned = PaymentSuccess {
            razorpay_signature: None,
            ..success
        };
        assert!(!client.verify(&unsigned));
    }

    #[test]
    fn uppercase_signature_is_accepted() {
        let signature = sign("s3cret", "order_1|pay_1").to_uppercase();
        assert!(verify_signature("s3cret", "order_1", "pay_1", &signature));
    }

    #[test]
    fn receipts_are_prefixed() {
        let receipt = new_receipt();
        assert!(receipt.starts_with("rcpt_"));
        assert_eq!(receipt.len(), 13);
    }

    #[test]
    fn url_joins_paths() {
        let client = RazorpayClient::new("k", "s").with_base_url("http://localhost:1234/v1/");
        assert_eq!(client.url("orders"), "http://localhost:1234/v1/orders");
    }
}
