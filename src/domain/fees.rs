//! Pure fee and refund arithmetic.
//!
//! Nothing here rounds: callers round with [`round_money`] at the point a value
//! is persisted or returned.
//!
//! [`round_money`]: crate::domain::money::round_money

use crate::domain::gateway::PaymentGateway;
use crate::domain::money::round_money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Platform commission taken on the booking base amount.
pub const PLATFORM_FEE_RATE: Decimal = dec!(0.025);

/// Provider pricing: `amount × rate + fixed`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayFeeSchedule {
    pub rate: Decimal,
    pub fixed: Decimal,
    pub cap: Option<Decimal>,
}

impl GatewayFeeSchedule {
    pub fn for_gateway(gateway: PaymentGateway) -> Self {
        match gateway {
            PaymentGateway::Stripe => Self {
                rate: dec!(0.029),
                fixed: dec!(0.30),
                cap: None,
            },
            PaymentGateway::Paystack => Self {
                rate: dec!(0.015),
                fixed: dec!(100),
                cap: Some(dec!(2000)),
            },
            PaymentGateway::Sandbox => Self {
                rate: Decimal::ZERO,
                fixed: Decimal::ZERO,
                cap: None,
            },
        }
    }
}

/// Fee breakdown attached to a payment once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PaymentFees {
    pub platform_fee: Decimal,
    pub gateway_fee: Decimal,
    pub processing_fee: Decimal,
    pub total_fees: Decimal,
}

impl PaymentFees {
    /// The breakdown as persisted on an entity.
    pub fn rounded(&self) -> Self {
        Self {
            platform_fee: round_money(self.platform_fee),
            gateway_fee: round_money(self.gateway_fee),
            processing_fee: round_money(self.processing_fee),
            total_fees: round_money(self.total_fees),
        }
    }

    pub fn components(&self) -> [Decimal; 3] {
        [self.platform_fee, self.gateway_fee, self.processing_fee]
    }
}

pub fn platform_fee(base_amount: Decimal) -> Decimal {
    base_amount * PLATFORM_FEE_RATE
}

pub fn gateway_fee(amount: Decimal, gateway: PaymentGateway) -> Decimal {
    let schedule = GatewayFeeSchedule::for_gateway(gateway);
    let fee = amount * schedule.rate + schedule.fixed;
    match schedule.cap {
        Some(cap) if fee > cap => cap,
        _ => fee,
    }
}

/// Full breakdown for a payment of `amount` funding a booking worth `base_amount`.
pub fn compute_fees(
    base_amount: Decimal,
    amount: Decimal,
    gateway: PaymentGateway,
    processing_fee: Decimal,
) -> PaymentFees {
    let platform = platform_fee(base_amount);
    let gateway = gateway_fee(amount, gateway);
    PaymentFees {
        platform_fee: platform,
        gateway_fee: gateway,
        processing_fee,
        total_fees: platform + gateway + processing_fee,
    }
}

pub fn net_amount(amount: Decimal, fees: &[Decimal]) -> Decimal {
    amount - fees.iter().copied().sum::<Decimal>()
}

/// Share of the paid amount returned on cancellation, as a percentage.
///
/// Tiers: 48h+ → 100, 24h+ → 75, 12h+ → 50, 2h+ → 25, otherwise 0. A value
/// sitting exactly on a boundary belongs to the higher tier.
pub fn refund_percentage(hours_until_service: Decimal) -> Decimal {
    if hours_until_service >= dec!(48) {
        dec!(100)
    } else if hours_until_service >= dec!(24) {
        dec!(75)
    } else if hours_until_service >= dec!(12) {
        dec!(50)
    } else if hours_until_service >= dec!(2) {
        dec!(25)
    } else {
        Decimal::ZERO
    }
}

pub fn refund_amount(amount: Decimal, hours_until_service: Decimal) -> Decimal {
    amount * refund_percentage(hours_until_service) / dec!(100)
}

/// Hours between two instants with second precision; negative once `to` has passed.
pub fn hours_until(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    Decimal::from((to - from).num_seconds()) / dec!(3600)
}
