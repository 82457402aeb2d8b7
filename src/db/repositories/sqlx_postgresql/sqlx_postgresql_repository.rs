use rust_decimal::Decimal;
use sqlx::{
    postgres::PgPoolOptions,
    types::chrono::{DateTime, Utc},
    FromRow, PgPool,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::db::{
    repositories::models::payment::{NewPayment, Payment, PaymentStatus, Transition},
    PaymentRepository,
};

const MAX_CONNECTIONS: u32 = 10;

#[derive(Clone)]
pub struct SqlxPostgresqlRepository {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    address: String,
    currency: String,
    derivation_path: String,
    expected_amount: Decimal,
    webhook_url: Option<String>,
    status: String,
    tx_hash: Option<String>,
    confirmations: Option<i64>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = String;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            address: row.address,
            currency: row.currency.parse()?,
            derivation_path: row.derivation_path,
            expected_amount: row.expected_amount,
            webhook_url: row.webhook_url,
            status: row.status.parse()?,
            tx_hash: row.tx_hash,
            confirmations: row.confirmations.map(|c| c.max(0) as u64),
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_one(row: PaymentRow) -> Result<Payment, sqlx::Error> {
    Payment::try_from(row).map_err(|e| sqlx::Error::Decode(e.into()))
}

/// Rows that fail to decode stay in the table untouched for manual inspection.
fn decode_many(rows: Vec<PaymentRow>) -> Vec<Payment> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Payment::try_from(row) {
                Ok(payment) => Some(payment),
                Err(e) => {
                    error!("[DB] Skipping undecodable payment {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

impl SqlxPostgresqlRepository {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        debug!("[DB] Connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
        debug!("[DB] Connected and migrated");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PaymentRepository for SqlxPostgresqlRepository {
    async fn create_payment(&self, payment: &NewPayment) -> Result<Payment, sqlx::Error> {
        debug!(
            "[DB] Creating {} payment for address {}",
            payment.currency, payment.address
        );

        let res = sqlx::query_as::<_, PaymentRow>(
            r#"INSERT INTO payments (address, currency, derivation_path, expected_amount, webhook_url, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6) RETURNING *;"#,
        )
        .bind(&payment.address)
        .bind(payment.currency.as_str())
        .bind(&payment.derivation_path)
        .bind(payment.expected_amount)
        .bind(&payment.webhook_url)
        .bind(payment.expires_at)
        .fetch_one(&self.pool)
        .await;

        let row = match res {
            Ok(row) => row,
            Err(e) => {
                error!(
                    "[DB] Failed to create payment for address {}: {}",
                    payment.address, e
                );
                return Err(e);
            }
        };

        let payment = decode_one(row)?;
        debug!("[DB] Created payment {}", payment.id);

        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &Uuid) -> Result<Option<Payment>, sqlx::Error> {
        debug!("[DB] Getting payment {}", payment_id);

        let res = sqlx::query_as::<_, PaymentRow>(r#"SELECT * FROM payments WHERE id = $1;"#)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await;

        match res {
            Ok(Some(row)) => Ok(Some(decode_one(row)?)),
            Ok(None) => {
                debug!("[DB] Payment {} not found", payment_id);
                Ok(None)
            }
            Err(e) => {
                error!("[DB] Failed to get payment {}", payment_id);
                Err(e)
            }
        }
    }

    async fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, sqlx::Error> {
        debug!("[DB] Getting payment by address {}", address);

        let res = sqlx::query_as::<_, PaymentRow>(r#"SELECT * FROM payments WHERE address = $1;"#)
            .bind(address)
            .fetch_optional(&self.pool)
            .await;

        match res {
            Ok(Some(row)) => Ok(Some(decode_one(row)?)),
            Ok(None) => {
                debug!("[DB] Payment by address {} not found", address);
                Ok(None)
            }
            Err(e) => {
                error!("[DB] Failed to get payment by address {}", address);
                Err(e)
            }
        }
    }

    async fn find_pending(&self) -> Result<Vec<Payment>, sqlx::Error> {
        debug!("[DB] Getting pending payments");

        let res = sqlx::query_as::<_, PaymentRow>(
            r#"SELECT * FROM payments WHERE status = 'pending';"#,
        )
        .fetch_all(&self.pool)
        .await;

        let rows = match res {
            Ok(rows) => rows,
            Err(e) => {
                error!("[DB] Failed to get pending payments");
                return Err(e);
            }
        };

        let payments = decode_many(rows);
        debug!("[DB] Got {} pending payments", payments.len());

        Ok(payments)
    }

    async fn conditional_update(
        &self,
        payment_id: &Uuid,
        expected: PaymentStatus,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, sqlx::Error> {
        transition
            .check_from(expected)
            .map_err(sqlx::Error::Protocol)?;

        debug!(
            "[DB] Transitioning payment {} {} -> {}",
            payment_id,
            expected,
            transition.target()
        );

        let query = match transition {
            Transition::Complete {
                tx_hash,
                confirmations,
            } => sqlx::query_as::<_, PaymentRow>(
                r#"UPDATE payments SET status = 'completed', tx_hash = $3, confirmations = $4, updated_at = $5
                   WHERE id = $1 AND status = $2 RETURNING *;"#,
            )
            .bind(payment_id)
            .bind(expected.as_str())
            .bind(tx_hash)
            .bind(i64::try_from(*confirmations).unwrap_or(i64::MAX))
            .bind(at),
            Transition::Expire => sqlx::query_as::<_, PaymentRow>(
                r#"UPDATE payments SET status = 'expired', updated_at = $3
                   WHERE id = $1 AND status = $2 RETURNING *;"#,
            )
            .bind(payment_id)
            .bind(expected.as_str())
            .bind(at),
        };

        let res = query.fetch_optional(&self.pool).await;

        match res {
            Ok(Some(row)) => {
                debug!("[DB] Transitioned payment {}", payment_id);
                Ok(Some(decode_one(row)?))
            }
            Ok(None) => {
                debug!(
                    "[DB] Payment {} was no longer {}, nothing written",
                    payment_id, expected
                );
                Ok(None)
            }
            Err(e) => {
                error!("[DB] Failed to transition payment {}", payment_id);
                Err(e)
            }
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, sqlx::Error> {
        debug!("[DB] Expiring payments overdue at {}", now);

        let res = sqlx::query_as::<_, PaymentRow>(
            r#"UPDATE payments SET status = 'expired', updated_at = $1
               WHERE status = 'pending' AND expires_at <= $1 RETURNING *;"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await;

        let rows = match res {
            Ok(rows) => rows,
            Err(e) => {
                error!("[DB] Failed to expire overdue payments");
                return Err(e);
            }
        };

        let payments = decode_many(rows);
        debug!("[DB] Expired {} payments", payments.len());

        Ok(payments)
    }

    async fn next_derivation_index(&self) -> Result<u32, sqlx::Error> {
        let index: i64 = sqlx::query_scalar(r#"SELECT nextval('evm_derivation_index');"#)
            .fetch_one(&self.pool)
            .await?;

        u32::try_from(index).map_err(|e| sqlx::Error::Decode(Box::new(e)))
    }
}
