//! Shipping fee rules.
//!
//! All functions are pure and exact (decimal arithmetic). Inputs are expected
//! to be non-negative; callers validate before getting here. Arithmetic is
//! checked, `None` means an intermediate left the `Decimal` range.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::carrier::{RateTable, SubRegionRate};
use crate::domain::value_objects::Money;

/// Parcels at or under this billable weight pay no overweight surcharge.
pub const OVERWEIGHT_THRESHOLD_KG: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Kilograms per cubic centimeter used by the carrier for volumetric weight.
const VOLUMETRIC_FACTOR: Decimal = Decimal::from_parts(2, 0, 0, false, 4);

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Physical parcel description: kilograms and centimeters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub weight_kg: Decimal,
    pub length_cm: Decimal,
    pub width_cm: Decimal,
    pub height_cm: Decimal,
}

impl Package {
    pub fn billable_weight(&self) -> Option<Decimal> {
        billable_weight(self.weight_kg, self.length_cm, self.width_cm, self.height_cm)
    }
}

pub fn volumetric_weight(length: Decimal, width: Decimal, height: Decimal) -> Option<Decimal> {
    length.checked_mul(width)?.checked_mul(height)?.checked_mul(VOLUMETRIC_FACTOR)
}

pub fn billable_weight(actual: Decimal, length: Decimal, width: Decimal, height: Decimal) -> Option<Decimal> {
    Some(actual.max(volumetric_weight(length, width, height)?))
}

pub fn overweight_surcharge(billable_weight: Decimal, per_kg_rate: Decimal) -> Option<Decimal> {
    if billable_weight <= OVERWEIGHT_THRESHOLD_KG {
        return Some(Decimal::ZERO);
    }
    (billable_weight - OVERWEIGHT_THRESHOLD_KG).checked_mul(per_kg_rate)
}

pub fn cod_surcharge(declared_value: Option<Decimal>, cod_percent: Decimal) -> Option<Decimal> {
    match declared_value {
        Some(value) => value.checked_mul(cod_percent)?.checked_div(HUNDRED),
        None => Some(Decimal::ZERO),
    }
}

pub fn total_shipping_cost(base_fee: Decimal, weight_surcharge: Decimal, cod_surcharge: Decimal) -> Option<Decimal> {
    base_fee.checked_add(weight_surcharge)?.checked_add(cod_surcharge)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    #[error("no rate for sub-region {0}")]
    UnknownSubRegion(i64),
    #[error("{0} is out of range")]
    OutOfRange(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryCost {
    pub base_fee: Money,
    pub weight_surcharge: Money,
    pub cod_surcharge: Money,
    pub total: Money,
}

impl DeliveryCost {
    fn new(base_fee: Decimal, weight_surcharge: Decimal, cod_surcharge: Decimal) -> Result<Self, QuoteError> {
        let total = total_shipping_cost(base_fee, weight_surcharge, cod_surcharge).ok_or(QuoteError::OutOfRange("shipping total"))?;
        Ok(Self {
            base_fee: Money::new(base_fee),
            weight_surcharge: Money::new(weight_surcharge),
            cod_surcharge: Money::new(cod_surcharge),
            total: Money::new(total),
        })
    }
}

/// Costs for one speed tier. Desk delivery is absent when the route has no desk price.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TierQuote {
    pub home: DeliveryCost,
    pub desk: Option<DeliveryCost>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShippingQuote {
    pub zone: u32,
    pub sub_region_id: i64,
    pub sub_region_name: String,
    pub billable_weight_kg: Decimal,
    pub express: TierQuote,
    pub economic: Option<TierQuote>,
}

/// Prices `package` to one destination sub-region of a carrier rate table.
pub fn quote(rates: &RateTable, sub_region_id: i64, package: &Package, declared_value: Option<Decimal>) -> Result<ShippingQuote, QuoteError> {
    let route: &SubRegionRate = rates
        .per_sub_region
        .values()
        .find(|r| r.sub_region_id == sub_region_id)
        .ok_or(QuoteError::UnknownSubRegion(sub_region_id))?;
    let weight = package.billable_weight().ok_or(QuoteError::OutOfRange("package dimensions"))?;
    let weight_fee = overweight_surcharge(weight, rates.oversize_fee).ok_or(QuoteError::OutOfRange("overweight surcharge"))?;
    let cod_fee = cod_surcharge(declared_value, rates.cod_percent).ok_or(QuoteError::OutOfRange("declared value"))?;
    let tier = |home: Decimal, desk: Option<Decimal>| -> Result<TierQuote, QuoteError> {
        Ok(TierQuote {
            home: DeliveryCost::new(home, weight_fee, cod_fee)?,
            desk: desk.map(|base| DeliveryCost::new(base, weight_fee, cod_fee)).transpose()?,
        })
    };

    Ok(ShippingQuote {
        zone: rates.zone,
        sub_region_id: route.sub_region_id,
        sub_region_name: route.sub_region_name.clone(),
        billable_weight_kg: weight,
        express: tier(route.express_home, route.express_desk)?,
        economic: route.economic_home.map(|home| tier(home, route.economic_desk)).transpose()?,
    })
}
