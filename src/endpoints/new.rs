use chrono::{DateTime, Duration, Utc};
use poem_openapi::Object;
use poem_openapi::{payload::Json, ApiResponse};
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::repositories::models::payment::{Currency, NewPayment};
use crate::db::PaymentRepository;
use crate::responses::error::ErrorResponse;
use crate::wallet::{WalletError, Wallets};

pub const DEFAULT_EXPIRES_IN_MINUTES: u32 = 30;
pub const MAX_EXPIRES_IN_MINUTES: u32 = 60;

#[derive(Debug, Object, Clone, PartialEq)]
pub struct CreatePaymentData {
    pub amount: Decimal,
    pub currency: Currency,
    pub webhook_url: Option<String>,
    /// Minutes until the payment expires.
    pub expires_in: Option<u32>,
}

#[derive(Debug, Object, Clone, PartialEq)]
pub struct CreatePaymentResponseObject {
    pub id: Uuid,
    pub address: String,
    pub currency: Currency,
    pub amount: Decimal,
    pub expires_at: DateTime<Utc>,
}

#[derive(ApiResponse)]
pub enum CreatePaymentResponse {
    #[oai(status = 200)]
    Ok(Json<CreatePaymentResponseObject>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),

    #[oai(status = 500)]
    InternalServerError(Json<ErrorResponse>),
}

fn validate(data: &CreatePaymentData) -> Result<u32, String> {
    if data.amount <= Decimal::ZERO {
        return Err("Amount must be greater than zero".to_string());
    }
    if data.amount.scale() > data.currency.decimals() {
        return Err(format!(
            "{} supports at most {} decimal places",
            data.currency,
            data.currency.decimals()
        ));
    }

    let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_MINUTES);
    if !(1..=MAX_EXPIRES_IN_MINUTES).contains(&expires_in) {
        return Err(format!(
            "expires_in must be between 1 and {} minutes",
            MAX_EXPIRES_IN_MINUTES
        ));
    }

    if let Some(url) = &data.webhook_url {
        match url.parse::<reqwest::Url>() {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(format!("Invalid webhook url: {}", url)),
        }
    }

    Ok(expires_in)
}

pub async fn new<R: PaymentRepository>(
    pool: &R,
    wallets: &Wallets,
    data: &CreatePaymentData,
) -> CreatePaymentResponse {
    let expires_in = match validate(data) {
        Ok(expires_in) => expires_in,
        Err(message) => return CreatePaymentResponse::BadRequest(Json(message.into())),
    };

    let generated = match wallets.generate(pool, data.currency).await {
        Ok(generated) => generated,
        Err(WalletError::Unavailable(currency)) => {
            return CreatePaymentResponse::BadRequest(Json(
                format!("{} payments are not enabled", currency).into(),
            ));
        }
        Err(e) => {
            error!("Failed to generate address: {}", e);
            return CreatePaymentResponse::InternalServerError(Json(
                "Internal server error".into(),
            ));
        }
    };

    let new_payment = NewPayment {
        address: generated.address,
        currency: data.currency,
        derivation_path: generated.derivation_path,
        expected_amount: data.amount,
        webhook_url: data.webhook_url.clone(),
        expires_at: Utc::now() + Duration::minutes(i64::from(expires_in)),
    };

    match pool.create_payment(&new_payment).await {
        Ok(payment) => {
            info!(
                "Payment {} created: {} {} to {}",
                payment.id, payment.expected_amount, payment.currency, payment.address
            );
            CreatePaymentResponse::Ok(Json(CreatePaymentResponseObject {
                id: payment.id,
                address: payment.address,
                currency: payment.currency,
                amount: payment.expected_amount,
                expires_at: payment.expires_at,
            }))
        }
        Err(e) => {
            error!("Failed to create payment: {}", e);
            CreatePaymentResponse::InternalServerError(Json("Internal server error".into()))
        }
    }
}
