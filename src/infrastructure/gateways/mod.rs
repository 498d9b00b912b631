//! Concrete payment provider adapters.

pub mod paystack;
pub mod sandbox;
pub mod stripe;

use crate::config::Settings;
use crate::domain::gateway::{GatewayRegistry, PaymentGateway};
use crate::error::BookpayError;
use paystack::PaystackGateway;
use sandbox::SandboxGateway;
use std::sync::Arc;
use std::time::Duration;
use stripe::StripeGateway;
use tracing::{error, info};

/// Registers the sandbox plus every provider that has credentials configured.
pub fn build_registry(
    settings: &Settings,
    sandbox: Arc<SandboxGateway>,
) -> Result<GatewayRegistry, BookpayError> {
    let mut registry = GatewayRegistry::new().register(sandbox);
    if let Some(stripe) = &settings.stripe {
        let gateway = StripeGateway::new(stripe, settings.gateway_timeout)?;
        registry = registry.register(Arc::new(gateway));
        info!("stripe gateway enabled");
    }
    if let Some(paystack) = &settings.paystack {
        registry = registry.register(Arc::new(PaystackGateway::new(
            paystack,
            settings.gateway_timeout,
        )?));
        info!("paystack gateway enabled");
    }
    Ok(registry)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, BookpayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| BookpayError::ConfigError(format!("failed to build HTTP client: {}", err)))
}

/// Network-level failures are always transient from the core's point of view.
pub(crate) fn transport_error(
    gateway: PaymentGateway,
    context: &str,
    err: reqwest::Error,
) -> BookpayError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    BookpayError::GatewayUnavailable(format!("{} {} {}: {}", gateway, context, kind, err))
}

/// Passes 2xx responses through; logs and classifies everything else.
///
/// 5xx and 429 are transient, other statuses mean the provider refused the call.
pub(crate) async fn ensure_success(
    gateway: PaymentGateway,
    resp: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, BookpayError> {
    if resp.status().is_success() {
        return Ok(resp);
    }

    let status = resp.status();
    let request_id = resp
        .headers()
        .get("request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let body = match resp.text().await {
        Ok(text) if !text.is_empty() => text,
        Ok(_) => "<empty response body>".to_string(),
        Err(err) => format!("<failed to read response body: {err}>"),
    };

    error!(
        %gateway,
        status = %status,
        request_id = ?request_id,
        response_body = %body,
        context = %context,
        "gateway api request failed"
    );

    let message = format!("{} {} failed with status {}", gateway, context, status);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(BookpayError::GatewayUnavailable(message))
    } else {
        Err(BookpayError::GatewayRejected(message))
    }
}
