use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::orders::DeliveryDetails;

/// VAT applied to the merchandise subtotal.
pub const VAT_RATE: Decimal = dec!(0.10);

/// Base shipping fee for inner-city deliveries, covering the first 3 kg.
pub const INNER_CITY_BASE_FEE: Decimal = dec!(22000);
/// Weight covered by the inner-city base fee, in kg.
pub const INNER_CITY_BASE_WEIGHT_KG: Decimal = dec!(3.0);

/// Base shipping fee everywhere else, covering the first 0.5 kg.
pub const OUTER_BASE_FEE: Decimal = dec!(30000);
/// Weight covered by the outer-province base fee, in kg.
pub const OUTER_BASE_WEIGHT_KG: Decimal = dec!(0.5);

/// Surcharge per additional 0.5 kg step beyond the covered weight.
pub const EXTRA_WEIGHT_STEP_KG: Decimal = dec!(0.5);
pub const EXTRA_WEIGHT_STEP_FEE: Decimal = dec!(2500);

/// Orders above this subtotal earn a shipping rebate.
pub const REBATE_SUBTOTAL_THRESHOLD: Decimal = dec!(100000);
/// Maximum shipping rebate; shipping never goes below zero.
pub const MAX_SHIPPING_REBATE: Decimal = dec!(25000);

/// Flat surcharge per unit on rush orders, added after the rebate.
pub const RUSH_FEE_PER_UNIT: Decimal = dec!(10000);

/// Provinces billed at the inner-city shipping tariff.
const INNER_CITY_PROVINCES: [&str; 4] = ["hanoi", "ha noi", "ho chi minh", "ho chi minh city"];

/// One order line with the product attributes the tariff depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub weight_kg: Decimal,
    pub rush_eligible: bool,
}

/// Fee breakdown for an order, in whole currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderQuote {
    pub subtotal: Decimal,
    pub vat: Decimal,
    pub shipping_fee: Decimal,
    pub total: Decimal,
}

/// Computes subtotal, VAT and shipping for an order. Pure and deterministic;
/// all persistence and stock concerns stay with the callers.
pub struct FeeCalculator;

impl FeeCalculator {
    pub fn compute(
        lines: &[PricedLine],
        delivery: &DeliveryDetails,
        rush: bool,
    ) -> Result<OrderQuote, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "cannot quote an order without lines".to_string(),
            ));
        }
        if rush {
            let mut ineligible: Vec<Uuid> = lines
                .iter()
                .filter(|l| !l.rush_eligible)
                .map(|l| l.product_id)
                .collect();
            if !ineligible.is_empty() {
                ineligible.sort();
                ineligible.dedup();
                return Err(ServiceError::RushIneligible(ineligible));
            }
        }

        let mut subtotal = Decimal::ZERO;
        let mut total_weight = Decimal::ZERO;
        let mut total_units: i64 = 0;
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "quantity must be positive for product {}",
                    line.product_id
                )));
            }
            let qty = Decimal::from(line.quantity);
            subtotal += line.unit_price * qty;
            total_weight += line.weight_kg * qty;
            total_units += i64::from(line.quantity);
        }

        let vat = Self::round_whole(subtotal * VAT_RATE);
        let mut shipping_fee = Self::weight_fee(total_weight, &delivery.province);

        if subtotal > REBATE_SUBTOTAL_THRESHOLD {
            let rebate = shipping_fee.min(MAX_SHIPPING_REBATE);
            shipping_fee -= rebate;
        }
        if rush {
            shipping_fee += RUSH_FEE_PER_UNIT * Decimal::from(total_units);
        }

        let total = subtotal + vat + shipping_fee;
        Ok(OrderQuote {
            subtotal,
            vat,
            shipping_fee,
            total,
        })
    }

    /// Base fee by province plus the per-step surcharge for weight beyond
    /// what the base covers, steps rounded up.
    fn weight_fee(total_weight: Decimal, province: &str) -> Decimal {
        let (base_fee, covered) = if Self::is_inner_city(province) {
            (INNER_CITY_BASE_FEE, INNER_CITY_BASE_WEIGHT_KG)
        } else {
            (OUTER_BASE_FEE, OUTER_BASE_WEIGHT_KG)
        };
        let excess = total_weight - covered;
        if excess <= Decimal::ZERO {
            return base_fee;
        }
        let steps = (excess / EXTRA_WEIGHT_STEP_KG).ceil();
        base_fee + steps * EXTRA_WEIGHT_STEP_FEE
    }

    fn is_inner_city(province: &str) -> bool {
        let normalized = province.trim().to_lowercase();
        INNER_CITY_PROVINCES.contains(&normalized.as_str())
    }

    fn round_whole(amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
    }
}
