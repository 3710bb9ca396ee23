//! Soft reservations: allocation promises with a TTL.
//!
//! A reservation never moves stock. It only records intent so that concurrent
//! requesters can coordinate; its lifecycle is
//! `open -> consumed | cancelled | expired`, and all three are terminal.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DomainError, DomainResult, Entity, ItemId, ReservationId, TraceId, WarehouseId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Open,
    Consumed,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Open => "open",
            ReservationStatus::Consumed => "consumed",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Open)
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ReservationStatus::Open),
            "consumed" => Ok(ReservationStatus::Consumed),
            "expired" => Ok(ReservationStatus::Expired),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// Business identity of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub platform: String,
    pub shop_id: String,
    pub warehouse_id: WarehouseId,
    pub reference: String,
}

impl ReservationKey {
    pub fn new(
        platform: impl Into<String>,
        shop_id: impl Into<String>,
        warehouse_id: WarehouseId,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            shop_id: shop_id.into(),
            warehouse_id,
            reference: reference.into(),
        }
    }

    /// String used to derive the advisory lock for this reservation.
    pub fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.platform, self.shop_id, self.warehouse_id, self.reference
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservationLine {
    pub ref_line: i32,
    pub item_id: ItemId,
    pub qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub key: ReservationKey,
    pub lines: Vec<NewReservationLine>,
    pub expire_at: DateTime<Utc>,
    pub trace_id: Option<TraceId>,
}

impl NewReservation {
    pub fn validate(&self) -> DomainResult<()> {
        if self.key.platform.trim().is_empty() {
            return Err(DomainError::validation("platform cannot be empty"));
        }
        if self.key.reference.trim().is_empty() {
            return Err(DomainError::validation("ref cannot be empty"));
        }
        let mut seen = BTreeSet::new();
        for line in &self.lines {
            if line.ref_line < 1 {
                return Err(DomainError::validation(format!(
                    "ref_line must be >= 1, got {}",
                    line.ref_line
                )));
            }
            if line.qty <= 0 {
                return Err(DomainError::validation(format!(
                    "line {} qty must be positive, got {}",
                    line.ref_line, line.qty
                )));
            }
            if !seen.insert(line.ref_line) {
                return Err(DomainError::validation(format!(
                    "duplicate ref_line {}",
                    line.ref_line
                )));
            }
        }
        Ok(())
    }

    pub fn effective_trace_id(&self) -> TraceId {
        self.trace_id
            .clone()
            .unwrap_or_else(|| TraceId::new(self.key.reference.clone()))
    }
}

/// Invariant: `0 <= consumed_qty <= qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub ref_line: i32,
    pub item_id: ItemId,
    pub qty: i64,
    pub consumed_qty: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Consumed,
    /// Already consumed earlier.
    Noop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Expired { id: ReservationId },
    /// Not open anymore, or unknown (`id` is `None` then).
    Noop { id: Option<ReservationId> },
}

impl ReleaseOutcome {
    pub fn is_expired(&self) -> bool {
        matches!(self, ReleaseOutcome::Expired { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub key: ReservationKey,
    pub status: ReservationStatus,
    pub trace_id: TraceId,
    pub lines: Vec<ReservationLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl Entity for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Reservation {
    pub fn open(id: ReservationId, new: &NewReservation, now: DateTime<Utc>) -> DomainResult<Self> {
        new.validate()?;
        let mut reservation = Self {
            id,
            key: new.key.clone(),
            status: ReservationStatus::Open,
            trace_id: new.effective_trace_id(),
            lines: Vec::with_capacity(new.lines.len()),
            created_at: now,
            updated_at: now,
            expire_at: new.expire_at,
        };
        reservation.upsert_lines(&new.lines);
        Ok(reservation)
    }

    /// Re-submission of the same business key: refresh TTL, upsert lines.
    pub fn refresh(&mut self, new: &NewReservation, now: DateTime<Utc>) -> DomainResult<()> {
        new.validate()?;
        if self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "reservation {} is {}",
                self.id, self.status
            )));
        }
        self.expire_at = new.expire_at;
        self.trace_id = new.effective_trace_id();
        self.upsert_lines(&new.lines);
        self.updated_at = now;
        Ok(())
    }

    fn upsert_lines(&mut self, lines: &[NewReservationLine]) {
        for line in lines {
            match self.lines.iter_mut().find(|l| l.ref_line == line.ref_line) {
                Some(existing) => {
                    existing.item_id = line.item_id;
                    existing.qty = line.qty;
                    existing.consumed_qty = existing.consumed_qty.min(line.qty);
                }
                None => self.lines.push(ReservationLine {
                    ref_line: line.ref_line,
                    item_id: line.item_id,
                    qty: line.qty,
                    consumed_qty: 0,
                }),
            }
        }
        self.lines.sort_by_key(|l| l.ref_line);
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Open && self.expire_at < now
    }

    pub fn consume(&mut self, now: DateTime<Utc>) -> DomainResult<ConsumeOutcome> {
        match self.status {
            ReservationStatus::Consumed => Ok(ConsumeOutcome::Noop),
            ReservationStatus::Open => {
                for line in &mut self.lines {
                    line.consumed_qty = line.qty;
                }
                self.status = ReservationStatus::Consumed;
                self.updated_at = now;
                Ok(ConsumeOutcome::Consumed)
            }
            other => Err(DomainError::conflict(format!(
                "cannot consume reservation {} in status {other}",
                self.id
            ))),
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "cannot cancel reservation {} in status {}",
                self.id, self.status
            )));
        }
        self.status = ReservationStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// TTL release. Only an open reservation transitions; anything else is a no-op.
    pub fn expire(&mut self, now: DateTime<Utc>) -> ReleaseOutcome {
        if self.status != ReservationStatus::Open {
            return ReleaseOutcome::Noop { id: Some(self.id) };
        }
        self.status = ReservationStatus::Expired;
        self.updated_at = now;
        ReleaseOutcome::Expired { id: self.id }
    }

    pub fn total_qty(&self) -> i64 {
        self.lines.iter().map(|l| l.qty).sum()
    }
}
