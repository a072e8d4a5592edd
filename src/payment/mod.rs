//! Payment checkout glue.
//!
//! The checkout widget itself belongs to the payment gateway. This module
//! builds the options the widget expects, injects the success handler and
//! failure hook, and hands the result back to the caller.

pub mod orders;

pub use orders::{Order, PaymentLink, PaymentLinkWidget, RazorpayClient, verify_signature};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const MERCHANT_NAME: &str = "Heartyculture Nursery";
pub const DEFAULT_DESCRIPTION: &str = "Order Payment";
pub const DEFAULT_CURRENCY: &str = "INR";
pub const THEME_COLOR: &str = "#B12704";

/// Rupees to paise, rounded to the nearest paisa.
pub fn to_paise(rupees: f64) -> u64 {
    if !rupees.is_finite() || rupees <= 0.0 {
        return 0;
    }
    (rupees * 100.0).round() as u64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prefill {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub color: String,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            color: THEME_COLOR.to_string(),
        }
    }
}

/// Options object handed to the checkout widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutOptions {
    pub key: String,
    /// Amount in paise.
    pub amount: u64,
    pub currency: String,
    pub name: String,
    pub description: String,
    pub order_id: String,
    pub prefill: Prefill,
    pub theme: Theme,
}

impl CheckoutOptions {
    pub fn new(key: impl Into<String>, amount: u64, order_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
            name: MERCHANT_NAME.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            order_id: order_id.into(),
            prefill: Prefill::default(),
            theme: Theme::default(),
        }
    }

    pub fn with_prefill(mut self, name: impl Into<String>, contact: impl Into<String>) -> Self {
        self.prefill.name = name.into();
        self.prefill.contact = contact.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// What the widget passes to the success handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSuccess {
    pub razorpay_payment_id: String,
    #[serde(default)]
    pub razorpay_order_id: Option<String>,
    #[serde(default)]
    pub razorpay_signature: Option<String>,
}

/// Payload of the widget's `payment.failed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    Paid(PaymentSuccess),
    Failed(PaymentFailure),
    /// Closed or timed out without a result.
    Dismissed,
}

/// A checkout UI that takes options and reports how the payment went.
#[async_trait]
pub trait CheckoutWidget: Send + Sync {
    async fn open(&self, options: &CheckoutOptions) -> Result<CheckoutOutcome>;
}

type SuccessFn = Box<dyn Fn(&str) + Send + Sync>;
type FailureFn = Box<dyn Fn(&PaymentFailure) + Send + Sync>;

/// One checkout attempt: options plus the injected handlers.
pub struct Checkout {
    options: CheckoutOptions,
    on_success: SuccessFn,
    on_failure: FailureFn,
}

impl Checkout {
    /// `on_success` is called with the payment id.
    pub fn new(options: CheckoutOptions, on_success: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            options,
            on_success: Box::new(on_success),
            on_failure: Box::new(|failure| error!("payment failed: {}", failure.description)),
        }
    }

    /// Subscribe to payment failures. Replaces the default, which logs.
    pub fn on_failure(mut self, hook: impl Fn(&PaymentFailure) + Send + Sync + 'static) -> Self {
        self.on_failure = Box::new(hook);
        self
    }

    pub fn options(&self) -> &CheckoutOptions {
        &self.options
    }

    pub async fn open(&self, widget: &dyn CheckoutWidget) -> Result<CheckoutOutcome> {
        info!(order = %self.options.order_id, amount = self.options.amount, "opening checkout");
        let outcome = widget.open(&self.options).await?;
        match &outcome {
            CheckoutOutcome::Paid(success) => {
                info!(payment = %success.razorpay_payment_id, "payment successful");
                (self.on_success)(&success.razorpay_payment_id);
            }
            CheckoutOutcome::Failed(failure) => (self.on_failure)(failure),
            CheckoutOutcome::Dismissed => info!("checkout dismissed"),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct FixedWidget(CheckoutOutcome);

    #[async_trait]
    impl CheckoutWidget for FixedWidget {
        async fn open(&self, _options: &CheckoutOptions) -> Result<CheckoutOutcome> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn paise_rounds_to_nearest() {
        assert_eq!(to_paise(499.0), 49_900);
        assert_eq!(to_paise(19.99), 1_999);
        assert_eq!(to_paise(1.234), 123);
        assert_eq!(to_paise(-5.0), 0);
        assert_eq!(to_paise(f64::NAN), 0);
    }

    #[test]
    fn options_serialize_like_the_widget_expects() {
        let options = CheckoutOptions::new("rzp_test_key", 49_900, "order_123")
            .with_prefill("Asha", "+919800000000");
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(
            value,
            json!({
                "key": "rzp_test_key",
                "amount": 49900,
                "currency": "INR",
                "name": "Heartyculture Nursery",
                "description": "Order Payment",
                "order_id": "order_123",
                "prefill": {"name": "Asha", "contact": "+919800000000"},
                "theme": {"color": "#B12704"}
            })
        );
    }

    #[tokio::test]
    async fn success_handler_gets_payment_id() {
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();
        let checkout = Checkout::new(CheckoutOptions::new("k", 100, "order_1"), move |id| {
            *record.lock().unwrap() = Some(id.to_string());
        });

        let widget = FixedWidget(CheckoutOutcome::Paid(PaymentSuccess {
            razorpay_payment_id: "pay_42".into(),
            razorpay_order_id: Some("order_1".into()),
            razorpay_signature: None,
        }));
        let outcome = checkout.open(&widget).await.unwrap();

        assert!(matches!(outcome, CheckoutOutcome::Paid(_)));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("pay_42"));
    }

    #[tokio::test]
    async fn failure_hook_fires_and_success_does_not() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let record = failures.clone();
        let paid = Arc::new(Mutex::new(false));
        let paid_flag = paid.clone();

        let checkout = Checkout::new(CheckoutOptions::new("k", 100, "order_1"), move |_| {
            *paid_flag.lock().unwrap() = true;
        })
        .on_failure(move |f| record.lock().unwrap().push(f.description.clone()));

        let widget = FixedWidget(CheckoutOutcome::Failed(PaymentFailure {
            code: "BAD_REQUEST_ERROR".into(),
            description: "Card declined".into(),
            reason: None,
        }));
        checkout.open(&widget).await.unwrap();

        assert_eq!(*failures.lock().unwrap(), vec!["Card declined".to_string()]);
        assert!(!*paid.lock().unwrap());
    }

    #[test]
    fn success_payload_parses() {
        let success: PaymentSuccess = serde_json::from_value(json!({
            "razorpay_payment_id": "pay_1",
            "razorpay_order_id": "order_1",
            "razorpay_signature": "abc"
        }))
        .unwrap();
        assert_eq!(success.razorpay_signature.as_deref(), Some("abc"));
    }
}
