use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::{
    entity::product_variants::{
        Column as VariantCol, Entity as ProductVariants, Model as VariantModel,
    },
    error::{AppError, AppResult},
    state::AppState,
};

/// Current available quantity for a variant.
pub async fn get_available(state: &AppState, variant_id: Uuid) -> AppResult<i32> {
    let variant = load(&state.orm, variant_id).await?;
    Ok(variant.available_quantity)
}

/// Check-only stock validation used at cart-add time. There is no
/// reservation or hold: two carts can both "fit" against the same stock.
pub fn ensure_available(available: i32, requested: i32) -> AppResult<()> {
    if requested > available {
        return Err(AppError::InsufficientStock(available));
    }
    Ok(())
}

/// Reduce available stock for a variant, clamped at zero. The clamp absorbs
/// oversells from the unguarded checkout window instead of blocking
/// fulfillment on a stale read. One retry with a fresh read on Conflict,
/// then the caller's transaction rolls back.
pub async fn decrement<C: ConnectionTrait>(conn: &C, variant_id: Uuid, qty: i32) -> AppResult<()> {
    let variant = load(conn, variant_id).await?;
    match decrement_at_version(conn, &variant, qty).await {
        Err(AppError::Conflict) => {
            tracing::debug!(%variant_id, "stock version moved, retrying decrement");
            let variant = load(conn, variant_id).await?;
            decrement_at_version(conn, &variant, qty).await
        }
        other => other,
    }
}

/// One compare-and-swap attempt against the caller's snapshot of the variant
/// row. Fails with Conflict when the snapshot's version token has gone stale.
pub async fn decrement_at_version<C: ConnectionTrait>(
    conn: &C,
    variant: &VariantModel,
    qty: i32,
) -> AppResult<()> {
    let new_quantity = (variant.available_quantity - qty).max(0);

    let result = ProductVariants::update_many()
        .col_expr(VariantCol::AvailableQuantity, Expr::value(new_quantity))
        .col_expr(VariantCol::Version, Expr::col(VariantCol::Version).add(1))
        .col_expr(VariantCol::LastChangedAt, Expr::value(Utc::now()))
        .filter(VariantCol::Id.eq(variant.id))
        .filter(VariantCol::Version.eq(variant.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::Conflict);
    }
    Ok(())
}

async fn load<C: ConnectionTrait>(conn: &C, variant_id: Uuid) -> AppResult<VariantModel> {
    ProductVariants::find_by_id(variant_id)
        .one(conn)
        .await?
        .ok_or(AppError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_available_reports_current_stock() {
        assert!(ensure_available(5, 5).is_ok());
        match ensure_available(5, 6) {
            Err(AppError::InsufficientStock(available)) => assert_eq!(available, 5),
            other => panic!("expected InsufficientStock, got {other:?}"),
        }
    }
}
