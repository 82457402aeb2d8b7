use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use sqlx::types::chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::db::{
    repositories::models::payment::{NewPayment, Payment, PaymentStatus, Transition},
    PaymentRepository,
};

/// Process-local ledger. Each operation runs under a single lock acquisition,
/// which makes the status compare-and-swap atomic.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    payments: Arc<Mutex<HashMap<Uuid, Payment>>>,
    derivation_index: Arc<AtomicU32>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Payment> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Payment>> {
        self.payments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PaymentRepository for MemoryRepository {
    async fn create_payment(&self, payment: &NewPayment) -> Result<Payment, sqlx::Error> {
        let mut payments = self.lock();

        if payments.values().any(|p| p.address == payment.address) {
            return Err(sqlx::Error::Protocol(format!(
                "address {} is already assigned to a payment",
                payment.address
            )));
        }

        let now = Utc::now();
        let created = Payment {
            id: Uuid::new_v4(),
            address: payment.address.clone(),
            currency: payment.currency,
            derivation_path: payment.derivation_path.clone(),
            expected_amount: payment.expected_amount,
            webhook_url: payment.webhook_url.clone(),
            status: PaymentStatus::Pending,
            tx_hash: None,
            confirmations: None,
            expires_at: payment.expires_at,
            created_at: now,
            updated_at: now,
        };
        payments.insert(created.id, created.clone());
        debug!("[DB] Created payment {}", created.id);

        Ok(created)
    }

    async fn get_payment(&self, payment_id: &Uuid) -> Result<Option<Payment>, sqlx::Error> {
        Ok(self.lock().get(payment_id).cloned())
    }

    async fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, sqlx::Error> {
        Ok(self
            .lock()
            .values()
            .find(|p| p.address == address)
            .cloned())
    }

    async fn find_pending(&self) -> Result<Vec<Payment>, sqlx::Error> {
        Ok(self
            .lock()
            .values()
            .filter(|p| p.status == PaymentStatus::Pending)
            .cloned()
            .collect())
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

        let mut payments = self.lock();
        let payment = match payments.get_mut(payment_id) {
            Some(payment) if payment.status == expected => payment,
            _ => return Ok(None),
        };

        transition.apply(payment, at);
        debug!(
            "[DB] Transitioned payment {} -> {}",
            payment_id, payment.status
        );

        Ok(Some(payment.clone()))
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, sqlx::Error> {
        let mut payments = self.lock();
        let mut expired = Vec::new();

        for payment in payments.values_mut() {
            if payment.status == PaymentStatus::Pending && payment.is_overdue(now) {
                Transition::Expire.apply(payment, now);
                expired.push(payment.clone());
            }
        }

        Ok(expired)
    }

    async fn next_derivation_index(&self) -> Result<u32, sqlx::Error> {
        Ok(self.derivation_index.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;
    use crate::db::repositories::models::payment::Currency;

    fn new_payment(address: &str, expires_in: Duration) -> NewPayment {
        NewPayment {
            address: address.to_string(),
            currency: Currency::Eth,
            derivation_path: "m/44'/60'/0'/0/0".to_string(),
            expected_amount: Decimal::new(5, 1),
            webhook_url: None,
            expires_at: Utc::now() + expires_in,
        }
    }

    #[tokio::test]
    async fn addresses_are_never_reused() {
        let repository = MemoryRepository::new();
        repository
            .create_payment(&new_payment("0xaaa", Duration::minutes(30)))
            .await
            .unwrap();

        let duplicate = repository
            .create_payment(&new_payment("0xaaa", Duration::minutes(30)))
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn conditional_update_applies_once() {
        let repository = MemoryRepository::new();
        let payment = repository
            .create_payment(&new_payment("0xaaa", Duration::minutes(30)))
            .await
            .unwrap();
        let complete = Transition::Complete {
            tx_hash: "0xfeed".to_string(),
            confirmations: 2,
        };

        let first = repository
            .conditional_update(&payment.id, PaymentStatus::Pending, &complete, Utc::now())
            .await
            .unwrap();
        let second = repository
            .conditional_update(&payment.id, PaymentStatus::Pending, &complete, Utc::now())
            .await
            .unwrap();

        let updated = first.expect("first write applies");
        assert_eq!(updated.status, PaymentStatus::Completed);
        assert_eq!(updated.tx_hash.as_deref(), Some("0xfeed"));
        assert_eq!(updated.confirmations, Some(2));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn terminal_source_is_rejected() {
        let repository = MemoryRepository::new();
        let payment = repository
            .create_payment(&new_payment("0xaaa", Duration::minutes(30)))
            .await
            .unwrap();

        let res = repository
            .conditional_update(
                &payment.id,
                PaymentStatus::Completed,
                &Transition::Expire,
                Utc::now(),
            )
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn expire_overdue_returns_only_fresh_transitions() {
        let repository = MemoryRepository::new();
        let overdue = repository
            .create_payment(&new_payment("0xold", Duration::minutes(-1)))
            .await
            .unwrap();
        repository
            .create_payment(&new_payment("0xnew", Duration::minutes(30)))
            .await
            .unwrap();

        let first = repository.expire_overdue(Utc::now()).await.unwrap();
        let second = repository.expire_overdue(Utc::now()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, overdue.id);
        assert_eq!(first[0].status, PaymentStatus::Expired);
        assert!(second.is_empty());
        assert_eq!(repository.find_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn derivation_indexes_are_unique() {
        let repository = MemoryRepository::new();
        let a = repository.next_derivation_index().await.unwrap();
        let b = repository.next_derivation_index().await.unwrap();
        assert_ne!(a, b);
    }
}
