use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, FromQueryResult, JoinType, QueryFilter,
    QuerySelect, RelationTrait, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::OrderWithItems,
    entity::{
        cart_items::{self, Column as CartItemCol, Entity as CartItems},
        carts::Column as CartCol,
        order_items::ActiveModel as OrderItemActive,
        orders::ActiveModel as OrderActive,
        product_variants,
        products::Column as ProdCol,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{OrderItem, OrderStatus},
    response::{ApiResponse, Meta},
    services::{cart_service, order_service::order_from_entity},
    state::AppState,
};

/// Convert the caller's cart into a Pending order.
///
/// Each line snapshots the variant's *current* product price, not whatever
/// the price was when the line entered the cart. Stock is not re-validated
/// and not decremented here, and the cart stays intact: both are deferred to
/// the payment recorder, so an unpaid order never consumes stock.
pub async fn checkout(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    #[derive(Debug, FromQueryResult)]
    struct CartSnapshotRow {
        variant_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
    }

    let rows = CartItems::find()
        .select_only()
        .column_as(CartItemCol::VariantId, "variant_id")
        .column_as(CartItemCol::Quantity, "quantity")
        .column_as(ProdCol::Price, "unit_price")
        .join(JoinType::InnerJoin, cart_items::Relation::Carts.def())
        .join(
            JoinType::InnerJoin,
            cart_items::Relation::ProductVariants.def(),
        )
        .join(
            JoinType::InnerJoin,
            product_variants::Relation::Products.def(),
        )
        .filter(CartCol::UserId.eq(user.user_id))
        .lock(LockType::Update)
        .into_model::<CartSnapshotRow>()
        .all(&txn)
        .await?;

    if rows.is_empty() {
        return Err(AppError::EmptyCart);
    }
    if rows.iter().any(|row| row.quantity < 1) {
        return Err(AppError::BadRequest("Cart has invalid quantity".into()));
    }

    let lines: Vec<(i32, Decimal)> = rows.iter().map(|r| (r.quantity, r.unit_price)).collect();
    let totals = cart_service::compute_totals(&lines);

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        status: Set(OrderStatus::Pending.as_str().into()),
        total_amount: Set(totals.total),
        payment_method: Set(None),
        cancellation_reason: Set(None),
        address_id: Set(None),
        version: Set(0),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItem> = Vec::with_capacity(rows.len());
    for row in &rows {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            variant_id: Set(row.variant_id),
            quantity: Set(row.quantity),
            unit_price: Set(row.unit_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;

        items.push(OrderItem {
            id: item.id,
            order_id: item.order_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            created_at: item.created_at.with_timezone(&chrono::Utc),
        });
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "total": totals.total })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Checkout success",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}
