use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, FromQueryResult,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{AddressRequest, EditOrderItemsRequest, OrderList, OrderWithItems},
    entity::{
        addresses::ActiveModel as AddressActive,
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{Column as OrderCol, Entity as Orders, Model as OrderModel},
        product_variants::{self, Entity as ProductVariants},
        products::Column as ProdCol,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, OrderStatus, PaymentMethod},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::cart_service,
    state::AppState,
};

pub fn order_from_entity(model: OrderModel) -> AppResult<Order> {
    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        status: OrderStatus::parse(&model.status)?,
        total_amount: model.total_amount,
        payment_method: model
            .payment_method
            .as_deref()
            .map(PaymentMethod::parse)
            .transpose()?,
        cancellation_reason: model.cancellation_reason,
        address_id: model.address_id,
        version: model.version,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

pub fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        variant_id: model.variant_id,
        quantity: model.quantity,
        unit_price: model.unit_price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect::<AppResult<Vec<_>>>()?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}

async fn find_owned_for_update<C: ConnectionTrait>(
    conn: &C,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<OrderModel> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .lock(LockType::Update)
        .one(conn)
        .await?;
    order.ok_or(AppError::NotFound)
}

/// Attach a shipping address to a Pending order: Pending -> AddressConfirmed.
pub async fn confirm_address(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: AddressRequest,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;

    let order = find_owned_for_update(&txn, user, id).await?;
    let status = OrderStatus::parse(&order.status)?;
    let next = status.transition_to(OrderStatus::AddressConfirmed)?;

    let address = insert_address(&txn, user.user_id, &payload).await?;

    let result = Orders::update_many()
        .col_expr(OrderCol::Status, Expr::value(next.as_str()))
        .col_expr(OrderCol::AddressId, Expr::value(address))
        .col_expr(OrderCol::Version, Expr::col(OrderCol::Version).add(1))
        .col_expr(OrderCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(OrderCol::Id.eq(order.id))
        .filter(OrderCol::Version.eq(order.version))
        .exec(&txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::Conflict);
    }

    let updated = Orders::find_by_id(order.id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_address_confirmed",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Address confirmed",
        order_from_entity(updated)?,
        Some(Meta::empty()),
    ))
}

pub(crate) async fn insert_address<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    payload: &AddressRequest,
) -> AppResult<Uuid> {
    let address = AddressActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        street: Set(payload.street.clone()),
        city: Set(payload.city.clone()),
        state: Set(payload.state.clone()),
        postal_code: Set(payload.postal_code.clone()),
        country: Set(payload.country.clone()),
    }
    .insert(conn)
    .await?;
    Ok(address.id)
}

/// User self-cancel: own order only, reason stays null.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;

    let order = find_owned_for_update(&txn, user, id).await?;
    let status = OrderStatus::parse(&order.status)?;
    let next = status.transition_to(OrderStatus::Cancelled)?;

    let result = Orders::update_many()
        .col_expr(OrderCol::Status, Expr::value(next.as_str()))
        .col_expr(OrderCol::CancellationReason, Expr::value(None::<String>))
        .col_expr(OrderCol::Version, Expr::col(OrderCol::Version).add(1))
        .col_expr(OrderCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(OrderCol::Id.eq(order.id))
        .filter(OrderCol::Version.eq(order.version))
        .exec(&txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::Conflict);
    }

    let updated = Orders::find_by_id(order.id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_cancelled",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order cancelled",
        order_from_entity(updated)?,
        Some(Meta::empty()),
    ))
}

/// Hard delete, allowed only while the order sits in Confirmed.
pub async fn delete_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let txn = state.orm.begin().await?;

    let order = find_owned_for_update(&txn, user, id).await?;
    let status = OrderStatus::parse(&order.status)?;
    if status != OrderStatus::Confirmed {
        return Err(AppError::InvalidTransition(format!(
            "only Confirmed orders can be deleted, this one is {}",
            status.as_str()
        )));
    }

    // order_items and payments cascade with the order row
    Orders::delete_by_id(order.id).exec(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_deleted",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Structured replace-item-set on a Pending order: apply the update list,
/// append the add list, then recompute the total with the fixed formula.
pub async fn edit_items(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: EditOrderItemsRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    let order = find_owned_for_update(&txn, user, id).await?;
    let status = OrderStatus::parse(&order.status)?;
    if status != OrderStatus::Pending {
        return Err(AppError::InvalidTransition(format!(
            "order items can only be edited while Pending, this one is {}",
            status.as_str()
        )));
    }

    let existing = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?;

    for update in &payload.updates {
        let item = existing
            .iter()
            .find(|item| item.id == update.item_id)
            .ok_or(AppError::NotFound)?
            .clone();

        if update.remove {
            OrderItems::delete_by_id(item.id).exec(&txn).await?;
            continue;
        }

        let mut active: OrderItemActive = item.into();
        if let Some(variant_id) = update.new_variant_id {
            // Swapping the variant re-snapshots the price of its product.
            let price = variant_unit_price(&txn, variant_id).await?;
            active.variant_id = Set(variant_id);
            active.unit_price = Set(price);
        }
        if let Some(quantity) = update.new_quantity {
            if quantity < 1 {
                return Err(AppError::BadRequest(
                    "quantity must be greater than 0".into(),
                ));
            }
            active.quantity = Set(quantity);
        }
        active.update(&txn).await?;
    }

    for add in &payload.add {
        if add.quantity < 1 {
            return Err(AppError::BadRequest(
                "quantity must be greater than 0".into(),
            ));
        }
        let price = variant_unit_price(&txn, add.variant_id).await?;
        OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            variant_id: Set(add.variant_id),
            quantity: Set(add.quantity),
            unit_price: Set(price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
    }

    // Lines inserted in one checkout transaction share a created_at, so the
    // id tiebreaker keeps the listing stable.
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .order_by_asc(OrderItemCol::CreatedAt)
        .order_by_asc(OrderItemCol::Id)
        .all(&txn)
        .await?;
    if items.is_empty() {
        return Err(AppError::BadRequest(
            "order must keep at least one item".into(),
        ));
    }

    let lines: Vec<(i32, Decimal)> = items
        .iter()
        .map(|item| (item.quantity, item.unit_price))
        .collect();
    let totals = cart_service::compute_totals(&lines);

    let result = Orders::update_many()
        .col_expr(OrderCol::TotalAmount, Expr::value(totals.total))
        .col_expr(OrderCol::Version, Expr::col(OrderCol::Version).add(1))
        .col_expr(OrderCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(OrderCol::Id.eq(order.id))
        .filter(OrderCol::Version.eq(order.version))
        .exec(&txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::Conflict);
    }

    let updated = Orders::find_by_id(order.id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_items_edited",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id, "total": totals.total })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order updated",
        OrderWithItems {
            order: order_from_entity(updated)?,
            items: items.into_iter().map(order_item_from_entity).collect(),
        },
        Some(Meta::empty()),
    ))
}

async fn variant_unit_price<C: ConnectionTrait>(conn: &C, variant_id: Uuid) -> AppResult<Decimal> {
    #[derive(Debug, FromQueryResult)]
    struct VariantPriceRow {
        unit_price: Decimal,
    }

    let row = ProductVariants::find_by_id(variant_id)
        .select_only()
        .column_as(ProdCol::Price, "unit_price")
        .join(
            JoinType::InnerJoin,
            product_variants::Relation::Products.def(),
        )
        .into_model::<VariantPriceRow>()
        .one(conn)
        .await?;
    row.map(|r| r.unit_price).ok_or(AppError::NotFound)
}
