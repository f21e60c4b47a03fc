use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{ApiKey, ApiKeyValue, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{AddItemRequest, CartCount, CartItemDto, CartList, UpdateQuantityRequest},
        orders::{
            AddressRequest, CancelOrderRequest, EditOrderItemsRequest, NewOrderItem, OrderItemUpdate,
            OrderList, OrderWithItems,
        },
        payments::{PaymentList, PaymentReceipt, RecordPaymentRequest},
    },
    models::{
        Address, CartItem, CartTotals, Order, OrderItem, OrderStatus, Payment, PaymentMethod,
        PaymentStatus, ProductVariant,
    },
    response::{ApiResponse, Meta},
    routes::{admin, cart, health, orders, params},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        // Identity is injected by the upstream gateway as trusted headers.
        components.add_security_scheme(
            "user_headers",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-user-id"))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        cart::list_cart,
        cart::add_item,
        cart::update_quantity,
        cart::remove_item,
        orders::list_orders,
        orders::checkout,
        orders::get_order,
        orders::delete_order,
        orders::confirm_address,
        orders::cancel_order,
        orders::edit_items,
        orders::record_payment,
        orders::list_payments,
        admin::list_all_orders,
        admin::get_order_admin,
        admin::update_order_status,
        admin::cancel_order_admin,
        admin::list_low_stock,
        admin::adjust_inventory
    ),
    components(
        schemas(
            ProductVariant,
            CartItem,
            CartTotals,
            Order,
            OrderItem,
            OrderStatus,
            Payment,
            PaymentMethod,
            PaymentStatus,
            Address,
            AddItemRequest,
            UpdateQuantityRequest,
            CartItemDto,
            CartList,
            CartCount,
            AddressRequest,
            CancelOrderRequest,
            EditOrderItemsRequest,
            OrderItemUpdate,
            NewOrderItem,
            OrderList,
            OrderWithItems,
            RecordPaymentRequest,
            PaymentReceipt,
            PaymentList,
            admin::UpdateOrderStatusRequest,
            admin::InventoryAdjustRequest,
            admin::LowStockQuery,
            admin::VariantList,
            params::Pagination,
            params::OrderListQuery,
            Meta,
            ApiResponse<CartList>,
            ApiResponse<OrderList>,
            ApiResponse<OrderWithItems>,
            ApiResponse<PaymentReceipt>,
            ApiResponse<admin::VariantList>
        )
    ),
    security(
        ("user_headers" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Checkout and order lifecycle endpoints"),
        (name = "Payments", description = "Payment recording endpoints"),
        (name = "Admin", description = "Admin order and inventory endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
