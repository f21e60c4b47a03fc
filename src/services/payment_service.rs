use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::payments::{PaymentList, PaymentReceipt, RecordPaymentRequest},
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{Column as CartCol, Entity as Carts},
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{Column as OrderCol, Entity as Orders},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments,
            Model as PaymentModel},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{OrderStatus, Payment, PaymentMethod, PaymentStatus},
    response::{ApiResponse, Meta},
    services::{inventory_service, order_service},
    state::AppState,
};

fn payment_from_entity(model: PaymentModel) -> AppResult<Payment> {
    Ok(Payment {
        id: model.id,
        order_id: model.order_id,
        amount: model.amount,
        method: PaymentMethod::parse(&model.method)?,
        status: PaymentStatus::parse(&model.status)?,
        created_at: model.created_at.with_timezone(&Utc),
    })
}

/// Record a payment against an order and commit its stock.
///
/// Everything between the order lock and the cart clear runs in one
/// transaction: a failure anywhere (including a decrement Conflict after its
/// retry) rolls the whole payment back, so a Payment row never exists
/// without its stock decrement.
pub async fn record_payment(
    state: &AppState,
    user: &AuthUser,
    order_id: Uuid,
    payload: RecordPaymentRequest,
) -> AppResult<ApiResponse<PaymentReceipt>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(order_id)),
        )
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let status = OrderStatus::parse(&order.status)?;

    // At most one Completed payment per order, ever.
    let completed = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .filter(PaymentCol::Status.eq(PaymentStatus::Completed.as_str()))
        .one(&txn)
        .await?;
    if completed.is_some() {
        return Err(AppError::AlreadyPaid);
    }

    if !matches!(
        status,
        OrderStatus::Pending | OrderStatus::AddressConfirmed
    ) {
        return Err(AppError::InvalidTransition(format!(
            "payment not accepted while {}",
            status.as_str()
        )));
    }

    if payload.amount != order.total_amount {
        return Err(AppError::BadRequest(format!(
            "amount {} does not match order total {}",
            payload.amount, order.total_amount
        )));
    }

    // A Pending order can still be paid if the request carries the address.
    let address_id = match order.address_id {
        Some(id) => id,
        None => match &payload.address {
            Some(addr) => order_service::insert_address(&txn, user.user_id, addr).await?,
            None => {
                return Err(AppError::InvalidTransition(
                    "a shipping address is required before payment".into(),
                ));
            }
        },
    };

    let effective = if status == OrderStatus::Pending {
        OrderStatus::AddressConfirmed
    } else {
        status
    };
    let next = effective.transition_to(match payload.method {
        PaymentMethod::Cash => OrderStatus::Confirmed,
        PaymentMethod::Gateway => OrderStatus::Paid,
    })?;

    // Both methods settle synchronously; no pending/async state here.
    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(order.total_amount),
        method: Set(payload.method.as_str().into()),
        status: Set(PaymentStatus::Completed.as_str().into()),
        created_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let payment_url = match payload.method {
        PaymentMethod::Gateway => Some(state.gateway.create_payment_link(
            order.total_amount,
            order.id,
            user.email.as_deref().unwrap_or_default(),
        )),
        PaymentMethod::Cash => None,
    };

    let result = Orders::update_many()
        .col_expr(OrderCol::Status, Expr::value(next.as_str()))
        .col_expr(
            OrderCol::PaymentMethod,
            Expr::value(Some(payload.method.as_str().to_string())),
        )
        .col_expr(OrderCol::AddressId, Expr::value(Some(address_id)))
        .col_expr(OrderCol::Version, Expr::col(OrderCol::Version).add(1))
        .col_expr(OrderCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(OrderCol::Id.eq(order.id))
        .filter(OrderCol::Version.eq(order.version))
        .exec(&txn)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::Conflict);
    }

    // Stock commits only now, on successful payment.
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?;
    for item in &items {
        inventory_service::decrement(&txn, item.variant_id, item.quantity).await?;
    }

    // Cart empties post-payment, not post-checkout.
    if let Some(cart) = Carts::find()
        .filter(CartCol::UserId.eq(user.user_id))
        .one(&txn)
        .await?
    {
        CartItems::delete_many()
            .filter(CartItemCol::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
    }

    let updated = Orders::find_by_id(order.id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    txn.commit().await?;

    if let Some(email) = user.email.clone() {
        let notifier = state.notifier.clone();
        let total = order.total_amount;
        tokio::spawn(async move {
            notifier.send(
                &email,
                "Your order is confirmed",
                &format!("Order {order_id} was paid, total {total}."),
            );
        });
    }

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_recorded",
        Some("payments"),
        Some(serde_json::json!({
            "order_id": order.id,
            "payment_id": payment.id,
            "method": payload.method.as_str(),
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment recorded",
        PaymentReceipt {
            payment: payment_from_entity(payment)?,
            order: order_service::order_from_entity(updated)?,
            payment_url,
        },
        Some(Meta::empty()),
    ))
}

/// Payment attempts for one of the caller's own orders.
pub async fn list_payments(
    state: &AppState,
    user: &AuthUser,
    order_id: Uuid,
) -> AppResult<ApiResponse<PaymentList>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(order_id)),
        )
        .one(&state.orm)
        .await?;
    if order.is_none() {
        return Err(AppError::NotFound);
    }

    let items = Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .order_by_asc(PaymentCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(payment_from_entity)
        .collect::<AppResult<Vec<_>>>()?;

    Ok(ApiResponse::success(
        "OK",
        PaymentList { items },
        Some(Meta::empty()),
    ))
}
