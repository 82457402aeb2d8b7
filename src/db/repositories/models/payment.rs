use std::{fmt, str::FromStr};

use poem_openapi::{Enum, Object};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chain::units::{BTC_DECIMALS, ETH_DECIMALS, USDC_DECIMALS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "UPPERCASE")]
#[oai(rename_all = "UPPERCASE")]
pub enum Currency {
    Eth,
    Usdc,
    Btc,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Eth, Currency::Usdc, Currency::Btc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eth => "ETH",
            Self::Usdc => "USDC",
            Self::Btc => "BTC",
        }
    }

    /// Decimal places between the smallest on-chain unit and the display unit.
    pub fn decimals(&self) -> u32 {
        match self {
            Self::Eth => ETH_DECIMALS,
            Self::Usdc => USDC_DECIMALS,
            Self::Btc => BTC_DECIMALS,
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ETH" => Ok(Self::Eth),
            "USDC" => Ok(Self::Usdc),
            "BTC" => Ok(Self::Btc),
            _ => Err(format!("unknown currency: {}", s)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The only edges are pending -> completed and pending -> expired.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Expired)
        )
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown payment status: {}", s)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Object, Serialize, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,

    pub address: String,
    pub currency: Currency,
    pub derivation_path: String,
    pub expected_amount: Decimal,
    pub webhook_url: Option<String>,

    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub confirmations: Option<u64>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub address: String,
    pub currency: Currency,
    pub derivation_path: String,
    pub expected_amount: Decimal,
    pub webhook_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Fields written when a payment leaves `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete { tx_hash: String, confirmations: u64 },
    Expire,
}

impl Transition {
    pub fn target(&self) -> PaymentStatus {
        match self {
            Self::Complete { .. } => PaymentStatus::Completed,
            Self::Expire => PaymentStatus::Expired,
        }
    }

    pub fn check_from(&self, expected: PaymentStatus) -> Result<(), String> {
        if expected.can_transition_to(self.target()) {
            Ok(())
        } else {
            Err(format!(
                "illegal payment transition {} -> {}",
                expected,
                self.target()
            ))
        }
    }

    /// Applies the transition to an in-memory record.
    pub fn apply(&self, payment: &mut Payment, at: DateTime<Utc>) {
        payment.status = self.target();
        payment.updated_at = at;
        if let Self::Complete {
            tx_hash,
            confirmations,
        } = self
        {
            payment.tx_hash = Some(tx_hash.clone());
            payment.confirmations = Some(*confirmations);
        }
    }
}
