//! Batches, their dates, and expiry ageing.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{BatchKey, DomainError, DomainResult, Entity, ItemId, WarehouseId};

/// A production batch of one item in one warehouse.
///
/// Identity `(item, warehouse, batch_code)` is immutable; `expiry_date` can be
/// corrected administratively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub batch_code: String,
    pub production_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Batch {
    type Id = i64;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Batch {
    pub fn key(&self) -> BatchKey {
        BatchKey::from_key(self.batch_code.clone())
    }

    pub fn days_left(&self, today: NaiveDate) -> Option<i64> {
        self.expiry_date.map(|exp| (exp - today).num_days())
    }
}

/// Dates for a batch first referenced by an inbound movement.
///
/// At least one date must exist; when neither is supplied the production date
/// defaults to the movement date. Expiry before production is rejected.
pub fn resolve_inbound_dates(
    production_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
    movement_date: NaiveDate,
) -> DomainResult<(Option<NaiveDate>, Option<NaiveDate>)> {
    let production_date = match (production_date, expiry_date) {
        (None, None) => Some(movement_date),
        (p, _) => p,
    };
    if let (Some(p), Some(e)) = (production_date, expiry_date) {
        if e < p {
            return Err(DomainError::validation(format!(
                "expiry_date ({e}) is before production_date ({p})"
            )));
        }
    }
    Ok((production_date, expiry_date))
}

/// Expiry risk bucket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    /// HIGH ≤ 7 days, MEDIUM ≤ 14, LOW ≤ 30. Already-expired batches are HIGH.
    pub fn classify(days_left: i64) -> Option<Self> {
        match days_left {
            d if d <= 7 => Some(RiskLevel::High),
            d if d <= 14 => Some(RiskLevel::Medium),
            d if d <= 30 => Some(RiskLevel::Low),
            _ => None,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            RiskLevel::High => 3,
            RiskLevel::Medium => 2,
            RiskLevel::Low => 1,
        }
    }
}

/// One at-risk batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAgeing {
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub batch_code: String,
    pub expiry_date: NaiveDate,
    pub days_left: i64,
    pub risk: RiskLevel,
}

/// Batches expiring within `within_days` of `today`, ascending by days left.
///
/// Batches without an expiry date never age. A batch past the 30-day LOW
/// threshold has no risk level and is not reported even if `within_days` is
/// wider.
pub fn detect_ageing(batches: &[Batch], today: NaiveDate, within_days: i64) -> Vec<BatchAgeing> {
    let mut out: Vec<BatchAgeing> = batches
        .iter()
        .filter_map(|b| {
            let expiry_date = b.expiry_date?;
            let days_left = (expiry_date - today).num_days();
            if days_left > within_days {
                return None;
            }
            let risk = RiskLevel::classify(days_left)?;
            Some(BatchAgeing {
                item_id: b.item_id,
                warehouse_id: b.warehouse_id,
                batch_code: b.batch_code.clone(),
                expiry_date,
                days_left,
                risk,
            })
        })
        .collect();

    out.sort_by(|a, b| {
        (a.days_left, a.warehouse_id, a.item_id, &a.batch_code).cmp(&(
            b.days_left,
            b.warehouse_id,
            b.item_id,
            &b.batch_code,
        ))
    });
    out
}
