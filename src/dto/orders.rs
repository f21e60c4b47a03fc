use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Order, OrderItem};

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AddressRequest {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

/// One line of the replace-item-set operation on a Pending order.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderItemUpdate {
    pub item_id: Uuid,
    pub new_quantity: Option<i32>,
    pub new_variant_id: Option<Uuid>,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NewOrderItem {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EditOrderItemsRequest {
    #[serde(default)]
    pub updates: Vec<OrderItemUpdate>,
    #[serde(default)]
    pub add: Vec<NewOrderItem>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}
