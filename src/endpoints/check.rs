//! On-demand payment check. Never transitions a payment; the scheduler owns that.

use poem_openapi::Object;
use poem_openapi::{payload::Json, ApiResponse};
use rust_decimal::Decimal;
use tracing::{debug, error};

use crate::chain::AdapterRegistry;
use crate::db::repositories::models::payment::{Currency, Payment, PaymentStatus};
use crate::db::PaymentRepository;
use crate::responses::error::ErrorResponse;

#[derive(Debug, Object, Clone, PartialEq)]
pub struct CheckPaymentData {
    pub address: String,
    pub currency: Currency,
    pub expected_amount: Decimal,
}

#[derive(Debug, Object, Clone, PartialEq, Eq)]
pub struct CheckPaymentResponseObject {
    pub is_received: bool,
    pub tx_hash: Option<String>,
    pub confirmations: Option<u64>,
    pub status: PaymentStatus,
}

#[derive(ApiResponse)]
pub enum CheckPaymentResponse {
    #[oai(status = 200)]
    Ok(Json<CheckPaymentResponseObject>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),

    #[oai(status = 404)]
    NotFound(Json<ErrorResponse>),

    #[oai(status = 503)]
    ServiceUnavailable(Json<ErrorResponse>),

    #[oai(status = 500)]
    InternalServerError(Json<ErrorResponse>),
}

fn from_ledger(payment: &Payment) -> CheckPaymentResponseObject {
    CheckPaymentResponseObject {
        is_received: payment.status == PaymentStatus::Completed,
        tx_hash: payment.tx_hash.clone(),
        confirmations: payment.confirmations,
        status: payment.status,
    }
}

pub async fn check<R: PaymentRepository>(
    pool: &R,
    adapters: &AdapterRegistry,
    data: &CheckPaymentData,
) -> CheckPaymentResponse {
    let payment = match pool.get_payment_by_address(&data.address).await {
        Ok(Some(payment)) => payment,
        Ok(None) => return CheckPaymentResponse::NotFound(Json("Not found".into())),
        Err(e) => {
            error!("Error getting payment by address: {}", e);
            return CheckPaymentResponse::InternalServerError(Json(
                "Internal server error".into(),
            ));
        }
    };

    if payment.currency != data.currency {
        return CheckPaymentResponse::BadRequest(Json(
            format!(
                "Address {} belongs to a {} payment",
                payment.address, payment.currency
            )
            .into(),
        ));
    }

    if payment.status.is_terminal() {
        return CheckPaymentResponse::Ok(Json(from_ledger(&payment)));
    }

    if data.expected_amount != payment.expected_amount {
        debug!(
            "Check for {} asked for {}, using stored amount {}",
            payment.address, data.expected_amount, payment.expected_amount
        );
    }

    match adapters
        .detect(payment.currency, &payment.address, payment.expected_amount)
        .await
    {
        Ok(detection) => CheckPaymentResponse::Ok(Json(CheckPaymentResponseObject {
            is_received: detection.received,
            tx_hash: detection.tx_hash,
            confirmations: detection.received.then_some(detection.confirmations),
            status: payment.status,
        })),
        Err(e) => CheckPaymentResponse::ServiceUnavailable(Json(e.to_string().into())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::chain::{ChainAdapter, ChainError, Detection};
    use crate::db::repositories::models::payment::{NewPayment, Transition};
    use crate::db::MemoryRepository;

    struct PaidAdapter;

    #[async_trait]
    impl ChainAdapter for PaidAdapter {
        fn currency(&self) -> Currency {
            Currency::Eth
        }

        async fn detect(&self, _: &str, expected: Decimal) -> Result<Detection, ChainError> {
            Ok(Detection {
                received: true,
                amount: expected,
                tx_hash: Some("0xabc".to_string()),
                confirmations: 2,
                balance_only: false,
            })
        }
    }

    async fn seeded(currency: Currency) -> (MemoryRepository, Payment) {
        let pool = MemoryRepository::new();
        let payment = pool
            .create_payment(&NewPayment {
                address: "0x1111".to_string(),
                currency,
                derivation_path: "m/44'/60'/0'/0/0".to_string(),
                expected_amount: Decimal::new(5, 1),
                webhook_url: None,
                expires_at: Utc::now() + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        (pool, payment)
    }

    fn registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new(Duration::from_secs(5));
        registry.register(std::sync::Arc::new(PaidAdapter));
        registry
    }

    fn request(currency: Currency) -> CheckPaymentData {
        CheckPaymentData {
            address: "0x1111".to_string(),
            currency,
            expected_amount: Decimal::new(5, 1),
        }
    }

    #[tokio::test]
    async fn pending_payment_is_checked_live_without_transition() {
        let (pool, payment) = seeded(Currency::Eth).await;

        let res = check(&pool, &registry(), &request(Currency::Eth)).await;
        let body = match res {
            CheckPaymentResponse::Ok(Json(body)) => body,
            _ => panic!("expected a check result"),
        };

        assert!(body.is_received);
        assert_eq!(body.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(body.status, PaymentStatus::Pending);

        let stored = pool.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_payment_answers_from_the_ledger() {
        let (pool, payment) = seeded(Currency::Eth).await;
        pool.conditional_update(&payment.id, PaymentStatus::Pending, &Transition::Expire, Utc::now())
            .await
            .unwrap();

        let res = check(&pool, &registry(), &request(Currency::Eth)).await;
        match res {
            CheckPaymentResponse::Ok(Json(body)) => {
                assert!(!body.is_received);
                assert_eq!(body.status, PaymentStatus::Expired);
            }
            _ => panic!("expected a check result"),
        }
    }

    #[tokio::test]
    async fn unknown_address_and_currency_mismatch() {
        let (pool, _) = seeded(Currency::Eth).await;

        let mut unknown = request(Currency::Eth);
        unknown.address = "0x2222".to_string();
        assert!(matches!(
            check(&pool, &registry(), &unknown).await,
            CheckPaymentResponse::NotFound(_)
        ));

        assert!(matches!(
            check(&pool, &registry(), &request(Currency::Btc)).await,
            CheckPaymentResponse::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn unsupported_currency_is_unavailable() {
        let (pool, _) = seeded(Currency::Usdc).await;

        assert!(matches!(
            check(&pool, &registry(), &request(Currency::Usdc)).await,
            CheckPaymentResponse::ServiceUnavailable(_)
        ));
    }
}
