//! Environment driven settings.
//!
//! `.env` is loaded through `dotenvy` first; real environment variables win.
//! Every knob has a default, so an empty environment yields a working
//! sandbox-only configuration.

use crate::domain::booking::BookingPolicy;
use crate::domain::payment::{MAX_PAYMENT_ATTEMPTS, PaymentPolicy};
use crate::error::{BookpayError, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const DEFAULT_PAYSTACK_API_BASE: &str = "https://api.paystack.co";
pub const DEFAULT_SANDBOX_WEBHOOK_SECRET: &str = "bookpay-sandbox-secret";

#[derive(Debug, Clone, PartialEq)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaystackConfig {
    pub secret_key: String,
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub booking: BookingPolicy,
    pub payment: PaymentPolicy,
    /// Upper bound on any single provider call.
    pub gateway_timeout: Duration,
    pub stripe: Option<StripeConfig>,
    pub paystack: Option<PaystackConfig>,
    pub sandbox_webhook_secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            booking: BookingPolicy::default(),
            payment: PaymentPolicy::default(),
            gateway_timeout: Duration::from_millis(10_000),
            stripe: None,
            paystack: None,
            sandbox_webhook_secret: DEFAULT_SANDBOX_WEBHOOK_SECRET.to_string(),
        }
    }
}

fn parse<T: FromStr>(key: &str, get: impl Fn(&str) -> Option<String>) -> Result<Option<T>> {
    match get(key).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            BookpayError::ConfigError(format!("{} has an invalid value '{}'", key, raw))
        }),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(minutes) = parse::<u32>("BOOKPAY_PAYMENT_TTL_MINUTES", &get)? {
            if minutes == 0 {
                return Err(BookpayError::ConfigError(
                    "BOOKPAY_PAYMENT_TTL_MINUTES must be positive".to_string(),
                ));
            }
            settings.payment.payment_ttl = chrono::Duration::minutes(i64::from(minutes));
        }
        if let Some(hours) = parse::<u32>("BOOKPAY_BOOKING_TTL_HOURS", &get)? {
            if hours == 0 {
                return Err(BookpayError::ConfigError(
                    "BOOKPAY_BOOKING_TTL_HOURS must be positive".to_string(),
                ));
            }
            settings.booking.booking_ttl = chrono::Duration::hours(i64::from(hours));
        }
        if let Some(attempts) = parse::<u32>("BOOKPAY_MAX_PAYMENT_ATTEMPTS", &get)? {
            if attempts == 0 || attempts > MAX_PAYMENT_ATTEMPTS {
                return Err(BookpayError::ConfigError(format!(
                    "BOOKPAY_MAX_PAYMENT_ATTEMPTS must be between 1 and {}",
                    MAX_PAYMENT_ATTEMPTS
                )));
            }
            settings.payment.max_attempts = attempts;
        }
        if let Some(limit) = parse::<u8>("BOOKPAY_MAX_RESCHEDULES", &get)? {
            settings.booking.max_reschedules = limit;
        }
        if let Some(allow) = parse::<bool>("BOOKPAY_ALLOW_CANCEL_IN_PROGRESS", &get)? {
            settings.booking.allow_cancel_in_progress = allow;
        }
        if let Some(ms) = parse::<u64>("BOOKPAY_GATEWAY_TIMEOUT_MS", &get)? {
            if ms == 0 {
                return Err(BookpayError::ConfigError(
                    "BOOKPAY_GATEWAY_TIMEOUT_MS must be positive".to_string(),
                ));
            }
            settings.gateway_timeout = Duration::from_millis(ms);
        }
        if let Some(fee) = parse::<Decimal>("BOOKPAY_PROCESSING_FEE", &get)? {
            if fee < Decimal::ZERO {
                return Err(BookpayError::ConfigError(
                    "BOOKPAY_PROCESSING_FEE cannot be negative".to_string(),
                ));
            }
            settings.payment.processing_fee = fee;
        }
        settings.payment.escrow_hold_hours = parse::<u32>("BOOKPAY_ESCROW_HOLD_HOURS", &get)?;

        if let Some(secret_key) = get("STRIPE_SECRET_KEY") {
            let webhook_secret = get("STRIPE_WEBHOOK_SECRET").ok_or_else(|| {
                BookpayError::ConfigError(
                    "STRIPE_WEBHOOK_SECRET is required when STRIPE_SECRET_KEY is set".to_string(),
                )
            })?;
            settings.stripe = Some(StripeConfig {
                secret_key,
                webhook_secret,
                api_base: get("STRIPE_API_BASE")
                    .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string()),
            });
        }
        if let Some(secret_key) = get("PAYSTACK_SECRET_KEY") {
            settings.paystack = Some(PaystackConfig {
                secret_key,
                api_base: get("PAYSTACK_API_BASE")
                    .unwrap_or_else(|| DEFAULT_PAYSTACK_API_BASE.to_string()),
            });
        }
        if let Some(secret) = get("SANDBOX_WEBHOOK_SECRET") {
            settings.sandbox_webhook_secret = secret;
        }

        Ok(settings)
    }
}
