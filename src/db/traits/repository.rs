use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::repositories::models::payment::{NewPayment, Payment, PaymentStatus, Transition};

/// Storage for payment records.
///
/// Every status change goes through [`PaymentRepository::conditional_update`] or
/// [`PaymentRepository::expire_overdue`], both of which must be atomic at the
/// storage layer: a record is only written when its current status matches.
#[allow(async_fn_in_trait)]
pub trait PaymentRepository
where
    Self: Clone + Send + Sync,
{
    async fn create_payment(&self, payment: &NewPayment) -> Result<Payment, sqlx::Error>;

    async fn get_payment(&self, payment_id: &Uuid) -> Result<Option<Payment>, sqlx::Error>;

    async fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, sqlx::Error>;

    async fn find_pending(&self) -> Result<Vec<Payment>, sqlx::Error>;

    /// Compare-and-swap on `status`. Returns the updated record when the write
    /// applied, `None` when the payment was no longer in `expected`.
    async fn conditional_update(
        &self,
        payment_id: &Uuid,
        expected: PaymentStatus,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, sqlx::Error>;

    /// Moves every pending payment with `expires_at <= now` to `expired` in one
    /// conditional write and returns exactly the records this call transitioned.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, sqlx::Error>;

    /// Next unused index for HD address derivation.
    async fn next_derivation_index(&self) -> Result<u32, sqlx::Error>;
}
