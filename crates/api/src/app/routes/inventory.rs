use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use stocktake_auth::Permission;
use stocktake_core::{AggregateId, WarehouseId};
use stocktake_infra::reconciliation::INVENTORY_AGGREGATE_TYPE;
use stocktake_inventory::{
    AdjustStock, InventoryCommand, InventoryItem, InventoryItemId, ProductId, ProductRef,
    RegisterItem, StorageLocation,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/items", post(create_item).get(list_items))
        .route("/items/:id", get(get_item))
        .route("/items/:id/adjust", post(adjust_stock))
}

pub async fn create_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::RegisterItemRequest>,
) -> axum::response::Response {
    let warehouse_id: WarehouseId = match body.warehouse_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid warehouse id")
        }
    };
    let product_id = match body.product_id.as_deref() {
        Some(raw) => match raw.parse::<ProductId>() {
            Ok(v) => v,
            Err(_) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_id",
                    "invalid product id",
                )
            }
        },
        None => ProductId::new(),
    };

    if let Err(e) =
        crate::authz::require_permissions(&user, &[Permission::new("inventory.items.create")])
    {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let agg = AggregateId::new();
    let item_id = InventoryItemId::new(agg);

    let cmd = InventoryCommand::RegisterItem(RegisterItem {
        item_id,
        product: ProductRef {
            product_id,
            sku: body.sku,
            name: body.name,
        },
        warehouse_id,
        location: StorageLocation {
            bin: body.bin,
            shelf: body.shelf,
            aisle: body.aisle,
            zone: body.zone,
        },
        initial_on_hand: body.initial_on_hand.unwrap_or(0),
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<InventoryItem>(
        agg,
        INVENTORY_AGGREGATE_TYPE,
        cmd,
        |aggregate_id| InventoryItem::empty(InventoryItemId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn adjust_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AdjustStockRequest>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid item id")
        }
    };

    if let Err(e) =
        crate::authz::require_permissions(&user, &[Permission::new("inventory.items.adjust")])
    {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let item_id = InventoryItemId::new(agg);
    let cmd = InventoryCommand::AdjustStock(AdjustStock {
        item_id,
        delta: body.delta,
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<InventoryItem>(
        agg,
        INVENTORY_AGGREGATE_TYPE,
        cmd,
        |aggregate_id| InventoryItem::empty(InventoryItemId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
            "stream_version": committed.last().map(|e| e.sequence_number).unwrap_or(0),
        })),
    )
        .into_response()
}

pub async fn get_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid item id")
        }
    };

    let item_id = InventoryItemId::new(agg);
    match services.stock_get(&item_id) {
        Some(rm) => (StatusCode::OK, Json(dto::stock_to_json(&rm))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "item not found"),
    }
}

pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::StockQuery>,
) -> axum::response::Response {
    let warehouse_id = match query.warehouse_id.as_deref() {
        Some(raw) => match raw.parse::<WarehouseId>() {
            Ok(v) => Some(v),
            Err(_) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_id",
                    "invalid warehouse id",
                )
            }
        },
        None => None,
    };

    let items: Vec<_> = services
        .stock_list(warehouse_id)
        .iter()
        .map(dto::stock_to_json)
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "count": items.len(),
            "items": items,
        })),
    )
        .into_response()
}
