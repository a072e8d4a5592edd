use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use whisperer::payment::{
    Checkout, CheckoutOptions, CheckoutOutcome, PaymentLinkWidget, RazorpayClient, to_paise,
};

// base64("rzp_test_key:s3cret")
const BASIC_AUTH: &str = "Basic cnpwX3Rlc3Rfa2V5OnMzY3JldA==";

fn client(server: &MockServer) -> RazorpayClient {
    RazorpayClient::new("rzp_test_key", "s3cret").with_base_url(server.uri())
}

fn widget(server: &MockServer) -> PaymentLinkWidget {
    PaymentLinkWidget::new(client(server))
        .with_polling(Duration::from_millis(10), Duration::from_secs(5))
        .with_opener(|_| Ok(()))
}

async fn mount_link(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/payment_links"))
        .and(header("authorization", BASIC_AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "plink_1",
            "short_url": "https://rzp.io/i/abc",
            "status": "created"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_order_sends_paise_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_partial_json(json!({
            "amount": 49_900,
            "currency": "INR",
            "payment_capture": 1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "order_42",
            "amount": 49_900,
            "currency": "INR",
            "receipt": "rcpt_0000abcd",
            "status": "created"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let order = client(&server).create_order(to_paise(499.0)).await.unwrap();
    assert_eq!(order.id, "order_42");
    assert_eq!(order.amount, 49_900);
    assert_eq!(order.status, "created");
}

#[tokio::test]
async fn gateway_error_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": "BAD_REQUEST_ERROR",
                "description": "The amount must be atleast INR 1.00"
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server).create_order(10).await.unwrap_err().to_string();
    assert!(err.contains("BAD_REQUEST_ERROR"), "{err}");
    assert!(err.contains("atleast INR 1.00"), "{err}");
}

#[tokio::test]
async fn paid_link_calls_success_handler() {
    let server = MockServer::start().await;
    mount_link(&server).await;
    Mock::given(method("GET"))
        .and(path("/payment_links/plink_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "plink_1",
            "short_url": "https://rzp.io/i/abc",
            "status": "created"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payment_links/plink_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "plink_1",
            "short_url": "https://rzp.io/i/abc",
            "status": "paid",
            "payments": [{"payment_id": "pay_77", "status": "captured"}]
        })))
        .mount(&server)
        .await;

    let paid = Arc::new(Mutex::new(Vec::new()));
    let seen = paid.clone();
    let checkout = Checkout::new(
        CheckoutOptions::new("rzp_test_key", 49_900, "order_42").with_prefill("Asha", "9999999999"),
        move |id| seen.lock().unwrap().push(id.to_string()),
    );

    let outcome = checkout.open(&widget(&server)).await.unwrap();
    assert!(matches!(outcome, CheckoutOutcome::Paid(ref s) if s.razorpay_payment_id == "pay_77"));
    assert_eq!(*paid.lock().unwrap(), vec!["pay_77".to_string()]);
}

#[tokio::test]
async fn expired_link_calls_failure_hook() {
    let server = MockServer::start().await;
    mount_link(&server).await;
    Mock::given(method("GET"))
        .and(path("/payment_links/plink_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "plink_1",
            "short_url": "https://rzp.io/i/abc",
            "status": "expired"
        })))
        .mount(&server)
        .await;

    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = failures.clone();
    let checkout = Checkout::new(CheckoutOptions::new("k", 100, "order_1"), |_| {
        panic!("must not succeed")
    })
    .on_failure(move |failure| seen.lock().unwrap().push(failure.code.clone()));

    let outcome = checkout.open(&widget(&server)).await.unwrap();
    assert!(matches!(outcome, CheckoutOutcome::Failed(_)));
    assert_eq!(*failures.lock().unwrap(), vec!["LINK_EXPIRED".to_string()]);
}

#[tokio::test]
async fn unpaid_link_is_dismissed_at_deadline() {
    let server = MockServer::start().await;
    mount_link(&server).await;
    Mock::given(method("GET"))
        .and(path("/payment_links/plink_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "plink_1",
            "short_url": "https://rzp.io/i/abc",
            "status": "created"
        })))
        .mount(&server)
        .await;

    let widget = PaymentLinkWidget::new(client(&server))
        .with_polling(Duration::from_millis(10), Duration::from_millis(50))
        .with_opener(|_| Ok(()));
    let checkout = Checkout::new(CheckoutOptions::new("k", 100, "order_1"), |_| {});
    assert_eq!(checkout.open(&widget).await.unwrap(), CheckoutOutcome::Dismissed);
}
