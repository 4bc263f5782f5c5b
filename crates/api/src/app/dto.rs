use serde::Deserialize;
use serde_json::json;

use stocktake_audit::{metrics, AuditItem};
use stocktake_infra::projections::{AuditReadModel, StockReadModel};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAuditRequest {
    pub warehouse_id: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAuditRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignCounterRequest {
    pub user_id: String,
    pub zones: Vec<String>,
}

/// Body of `PATCH /audits/{id}/items/{item_id}/status`.
///
/// Exactly one of `actual_quantity` (direct count), `missing_quantity`
/// (discrepancy report), or `status` (reconciliation) must be present.
#[derive(Debug, Deserialize)]
pub struct UpdateItemStatusRequest {
    pub actual_quantity: Option<i64>,
    pub missing_quantity: Option<i64>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    pub status: Option<String>,
    pub zone: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterItemRequest {
    pub product_id: Option<String>,
    pub sku: String,
    pub name: String,
    pub warehouse_id: String,
    pub bin: String,
    pub shelf: Option<String>,
    pub aisle: Option<String>,
    pub zone: Option<String>,
    pub initial_on_hand: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustStockRequest {
    pub delta: i64,
}

#[derive(Debug, Deserialize)]
pub struct StockQuery {
    pub warehouse_id: Option<String>,
}

// -------------------------
// Response mapping
// -------------------------

/// Audit summary for listings: header plus freshly computed metrics.
pub fn audit_summary_to_json(rm: &AuditReadModel) -> serde_json::Value {
    let progress = metrics::progress(rm.items.iter());
    json!({
        "id": rm.audit_id.to_string(),
        "reference": rm.reference,
        "warehouse_id": rm.warehouse_id.to_string(),
        "status": rm.status,
        "notes": rm.notes,
        "created_by": rm.created_by.to_string(),
        "start_date": rm.start_date,
        "end_date": rm.end_date,
        "metrics": progress,
    })
}

/// Full audit detail: summary plus per-zone breakdown and assignments.
pub fn audit_detail_to_json(rm: &AuditReadModel) -> serde_json::Value {
    let mut value = audit_summary_to_json(rm);
    value["zones"] = serde_json::to_value(metrics::zone_breakdown(rm.items.iter()))
        .unwrap_or_else(|_| json!([]));
    value["assignments"] = json!(rm
        .assignments
        .iter()
        .map(|a| json!({
            "user_id": a.user_id.to_string(),
            "zones": a.zones,
        }))
        .collect::<Vec<_>>());
    value
}

pub fn audit_item_to_json(item: &AuditItem) -> serde_json::Value {
    json!({
        "id": item.id.to_string(),
        "inventory_item_id": item.inventory_item_id.to_string(),
        "product": {
            "product_id": item.product.product_id.to_string(),
            "sku": item.product.sku,
            "name": item.product.name,
        },
        "location": {
            "bin": item.location.bin,
            "shelf": item.location.shelf,
            "aisle": item.location.aisle,
            "zone": item.location.zone,
        },
        "zone": item.zone_label(),
        "expected_quantity": item.expected_quantity,
        "counted_quantity": item.counted_quantity,
        "discrepancy": item.discrepancy,
        "status": item.status,
        "notes": item.notes,
        "counted_by": item.counted_by.map(|u| u.to_string()),
        "counted_at": item.counted_at,
    })
}

pub fn stock_to_json(rm: &StockReadModel) -> serde_json::Value {
    json!({
        "id": rm.item_id.to_string(),
        "product": {
            "product_id": rm.product.product_id.to_string(),
            "sku": rm.product.sku,
            "name": rm.product.name,
        },
        "warehouse_id": rm.warehouse_id.to_string(),
        "location": {
            "bin": rm.location.bin,
            "shelf": rm.location.shelf,
            "aisle": rm.location.aisle,
            "zone": rm.location.zone,
        },
        "on_hand": rm.on_hand,
    })
}
