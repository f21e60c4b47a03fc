use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::cart::{AddItemRequest, CartCount, CartItemDto, CartList, UpdateQuantityRequest},
    entity::{
        cart_items::{ActiveModel as CartItemActive, Column as CartItemCol, Entity as CartItems},
        carts::{ActiveModel as CartActive, Column as CartCol, Entity as Carts, Model as CartModel},
        product_variants::Entity as ProductVariants,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{CartItem, CartTotals, ProductVariant},
    response::{ApiResponse, Meta},
    services::inventory_service,
    state::AppState,
};

fn tax_rate() -> Decimal {
    Decimal::new(14, 2) // 14%
}

fn free_shipping_threshold() -> Decimal {
    Decimal::from(100)
}

fn flat_shipping() -> Decimal {
    Decimal::from(10)
}

/// Fixed totals formula, shared by cart display, checkout and order edits.
/// Lines are (quantity, unit_price) pairs.
pub fn compute_totals(lines: &[(i32, Decimal)]) -> CartTotals {
    let subtotal: Decimal = lines
        .iter()
        .map(|(qty, price)| *price * Decimal::from(*qty))
        .sum();
    let tax = (subtotal * tax_rate()).round_dp(2);
    let shipping = if subtotal > free_shipping_threshold() {
        Decimal::ZERO
    } else {
        flat_shipping()
    };
    let total = (subtotal + tax + shipping).round_dp(2);
    CartTotals {
        subtotal,
        tax,
        shipping,
        total,
    }
}

/// Idempotent per-user factory: the cart is created lazily on first
/// interaction and persists across sessions.
pub async fn get_or_create_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> AppResult<CartModel> {
    let existing = Carts::find()
        .filter(CartCol::UserId.eq(user_id))
        .one(conn)
        .await?;
    if let Some(cart) = existing {
        return Ok(cart);
    }

    let cart = CartActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        created_at: NotSet,
    }
    .insert(conn)
    .await?;
    Ok(cart)
}

#[derive(FromRow)]
struct CartVariantRow {
    item_id: Uuid,
    quantity: i32,
    variant_id: Uuid,
    product_id: Uuid,
    product_name: String,
    size_label: String,
    unit_price: Decimal,
    available_quantity: i32,
    version: i32,
    last_changed_at: DateTime<Utc>,
}

pub async fn list_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<CartList>> {
    let rows = sqlx::query_as::<_, CartVariantRow>(
        r#"
        SELECT ci.id AS item_id, ci.quantity,
               v.id AS variant_id, v.product_id, p.name AS product_name,
               v.size_label, p.price AS unit_price,
               v.available_quantity, v.version, v.last_changed_at
        FROM cart_items ci
        JOIN carts c ON c.id = ci.cart_id
        JOIN product_variants v ON v.id = ci.variant_id
        JOIN products p ON p.id = v.product_id
        WHERE c.user_id = $1
        ORDER BY ci.created_at
        "#,
    )
    .bind(user.user_id)
    .fetch_all(&state.pool)
    .await?;

    let lines: Vec<(i32, Decimal)> = rows.iter().map(|r| (r.quantity, r.unit_price)).collect();
    let totals = compute_totals(&lines);

    let items = rows
        .into_iter()
        .map(|row| CartItemDto {
            id: row.item_id,
            line_total: row.unit_price * Decimal::from(row.quantity),
            quantity: row.quantity,
            variant: ProductVariant {
                id: row.variant_id,
                product_id: row.product_id,
                product_name: row.product_name,
                size_label: row.size_label,
                unit_price: row.unit_price,
                available_quantity: row.available_quantity,
                version: row.version,
                last_changed_at: row.last_changed_at,
            },
        })
        .collect();

    Ok(ApiResponse::success(
        "OK",
        CartList { items, totals },
        Some(Meta::empty()),
    ))
}

pub async fn add_item(
    state: &AppState,
    user: &AuthUser,
    payload: AddItemRequest,
) -> AppResult<ApiResponse<CartCount>> {
    if payload.quantity < 1 {
        return Err(AppError::BadRequest(
            "quantity must be greater than 0".to_string(),
        ));
    }

    let txn = state.orm.begin().await?;

    let variant = ProductVariants::find_by_id(payload.variant_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let cart = get_or_create_cart(&txn, user.user_id).await?;

    let existing = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .filter(CartItemCol::VariantId.eq(payload.variant_id))
        .one(&txn)
        .await?;

    // The combined line quantity is validated against current stock; the
    // stock itself is only checked here, never reserved.
    let combined = existing.as_ref().map_or(0, |item| item.quantity) + payload.quantity;
    inventory_service::ensure_available(variant.available_quantity, combined)?;

    match existing {
        Some(item) => {
            let mut active: CartItemActive = item.into();
            active.quantity = Set(combined);
            active.update(&txn).await?;
        }
        None => {
            CartItemActive {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                variant_id: Set(payload.variant_id),
                quantity: Set(payload.quantity),
                created_at: NotSet,
            }
            .insert(&txn)
            .await?;
        }
    }

    let cart_count: i64 = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .all(&txn)
        .await?
        .iter()
        .map(|item| i64::from(item.quantity))
        .sum();

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "cart_add",
        Some("cart_items"),
        Some(serde_json::json!({ "variant_id": payload.variant_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Added to cart",
        CartCount { cart_count },
        None,
    ))
}

pub async fn remove_item(
    state: &AppState,
    user: &AuthUser,
    cart_item_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let result = sqlx::query(
        r#"
        DELETE FROM cart_items
        USING carts
        WHERE cart_items.id = $1
          AND carts.id = cart_items.cart_id
          AND carts.user_id = $2
        "#,
    )
    .bind(cart_item_id)
    .bind(user.user_id)
    .execute(&state.pool)
    .await?;

    // Someone else's line is indistinguishable from a missing one.
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "cart_remove",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": cart_item_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Removed from cart",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn update_quantity(
    state: &AppState,
    user: &AuthUser,
    cart_item_id: Uuid,
    payload: UpdateQuantityRequest,
) -> AppResult<ApiResponse<Option<CartItem>>> {
    // Delete-on-zero policy.
    if payload.quantity < 1 {
        remove_item(state, user, cart_item_id).await?;
        return Ok(ApiResponse::success(
            "Removed from cart",
            None,
            Some(Meta::empty()),
        ));
    }

    let txn = state.orm.begin().await?;

    let item = CartItems::find_by_id(cart_item_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let cart = Carts::find_by_id(item.cart_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    if cart.user_id != user.user_id {
        return Err(AppError::NotFound);
    }

    let variant = ProductVariants::find_by_id(item.variant_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    inventory_service::ensure_available(variant.available_quantity, payload.quantity)?;

    let mut active: CartItemActive = item.into();
    active.quantity = Set(payload.quantity);
    let updated = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "cart_update",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": cart_item_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Quantity updated",
        Some(CartItem {
            id: updated.id,
            cart_id: updated.cart_id,
            variant_id: updated.variant_id,
            quantity: updated.quantity,
            created_at: updated.created_at.with_timezone(&Utc),
        }),
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn totals_over_free_shipping_threshold() {
        // 2 x 100.00: subtotal 200, tax 28, free shipping
        let totals = compute_totals(&[(2, dec("100.00"))]);
        assert_eq!(totals.subtotal, dec("200.00"));
        assert_eq!(totals.tax, dec("28.00"));
        assert_eq!(totals.shipping, Decimal::ZERO);
        assert_eq!(totals.total, dec("228.00"));
    }

    #[test]
    fn totals_under_threshold_pay_flat_shipping() {
        let totals = compute_totals(&[(1, dec("50.00"))]);
        assert_eq!(totals.subtotal, dec("50.00"));
        assert_eq!(totals.tax, dec("7.00"));
        assert_eq!(totals.shipping, dec("10"));
        assert_eq!(totals.total, dec("67.00"));
    }

    #[test]
    fn threshold_is_exclusive() {
        // exactly 100 still pays shipping
        let totals = compute_totals(&[(1, dec("100.00"))]);
        assert_eq!(totals.shipping, dec("10"));
        assert_eq!(totals.total, dec("124.00"));
    }

    #[test]
    fn tax_is_rounded_to_cents() {
        let totals = compute_totals(&[(3, dec("9.99"))]);
        assert_eq!(totals.subtotal, dec("29.97"));
        assert_eq!(totals.tax, dec("4.20")); // 4.1958 rounded
        assert_eq!(totals.total, dec("44.17"));
    }
}
