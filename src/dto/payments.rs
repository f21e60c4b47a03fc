use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dto::orders::AddressRequest,
    models::{Order, Payment, PaymentMethod},
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordPaymentRequest {
    pub method: PaymentMethod,
    pub amount: Decimal,
    /// Shipping address captured inline when the order has none on file yet.
    pub address: Option<AddressRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub order: Order,
    /// Present for gateway payments; the hosted checkout link.
    pub payment_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentList {
    pub items: Vec<Payment>,
}
