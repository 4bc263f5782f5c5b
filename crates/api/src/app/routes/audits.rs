use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};

use stocktake_audit::{AuditId, AuditItemId};
use stocktake_auth::Permission;
use stocktake_core::{AggregateId, UserId, WarehouseId};
use stocktake_infra::projections::AuditItemFilter;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_audit).get(list_audits))
        .route("/:id", get(get_audit).patch(update_audit))
        .route("/:id/start", post(start_audit))
        .route("/:id/items", get(list_items))
        .route("/:id/items/:item_id/status", patch(update_item_status))
        .route("/:id/items/:item_id/reopen", post(reopen_item))
        .route("/:id/assignments", post(assign_counter))
}

fn parse_audit_id(id: &str) -> Result<AuditId, axum::response::Response> {
    id.parse::<AggregateId>()
        .map(AuditId::new)
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid audit id"))
}

fn parse_item_id(id: &str) -> Result<AuditItemId, axum::response::Response> {
    id.parse::<AggregateId>()
        .map(AuditItemId::new)
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid item id"))
}

fn forbidden(e: stocktake_auth::AuthzError) -> axum::response::Response {
    errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string())
}

pub async fn create_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateAuditRequest>,
) -> axum::response::Response {
    let warehouse_id: WarehouseId = match body.warehouse_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid warehouse id")
        }
    };

    if let Err(e) = crate::authz::require_permissions(&user, &[Permission::new("audits.create")]) {
        return forbidden(e);
    }

    let created = match services
        .orchestrator()
        .plan_audit(warehouse_id, body.notes, user.user_id())
    {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": created.audit_id.to_string(),
            "reference": created.reference,
        })),
    )
        .into_response()
}

pub async fn list_audits(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let audits: Vec<_> = services
        .audits_list()
        .iter()
        .map(dto::audit_summary_to_json)
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "count": audits.len(),
            "audits": audits,
        })),
    )
        .into_response()
}

pub async fn get_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.audits_get(&audit_id) {
        Some(rm) => (StatusCode::OK, Json(dto::audit_detail_to_json(&rm))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "audit not found"),
    }
}

pub async fn start_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = crate::authz::require_permissions(&user, &[Permission::new("audits.start")]) {
        return forbidden(e);
    }

    match services.orchestrator().start_audit(audit_id) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": audit_id.to_string(),
                "items_created": outcome.items_created,
            })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// `PATCH /audits/{id}` — audit-level transitions: completion or cancellation.
pub async fn update_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateAuditRequest>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match body.status.to_uppercase().as_str() {
        "COMPLETED" => {
            if let Err(e) =
                crate::authz::require_permissions(&user, &[Permission::new("audits.complete")])
            {
                return forbidden(e);
            }
            match services.orchestrator().complete_audit(audit_id) {
                Ok(outcome) => (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "id": audit_id.to_string(),
                        "status": "COMPLETED",
                        "corrections": outcome.corrections,
                        "adjustments_applied": outcome.adjustments_applied,
                    })),
                )
                    .into_response(),
                Err(e) => errors::dispatch_error_to_response(e),
            }
        }
        "CANCELLED" => {
            if let Err(e) =
                crate::authz::require_permissions(&user, &[Permission::new("audits.cancel")])
            {
                return forbidden(e);
            }
            match services.orchestrator().cancel_audit(audit_id) {
                Ok(()) => (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "id": audit_id.to_string(),
                        "status": "CANCELLED",
                    })),
                )
                    .into_response(),
                Err(e) => errors::dispatch_error_to_response(e),
            }
        }
        _ => errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "status must be COMPLETED or CANCELLED",
        ),
    }
}

pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::ItemsQuery>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Empty filter values mean "no filter".
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match errors::parse_item_status(s) {
            Ok(status) => Some(status),
            Err(resp) => return resp,
        },
        None => None,
    };

    let rm = match services.audits_get(&audit_id) {
        Some(rm) => rm,
        None => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "audit not found"),
    };

    let filter = AuditItemFilter {
        status,
        zone: query.zone.filter(|z| !z.is_empty()),
        search: query.search.filter(|s| !s.is_empty()),
    };
    let items: Vec<_> = rm
        .filtered_items(&filter)
        .into_iter()
        .map(dto::audit_item_to_json)
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

/// `PATCH /audits/{id}/items/{item_id}/status` — the counting surface.
///
/// Exactly one of `actual_quantity`, `missing_quantity`, or `status` selects
/// the operation (direct count, discrepancy report, reconciliation).
pub async fn update_item_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path((id, item_id)): Path<(String, String)>,
    Json(body): Json<dto::UpdateItemStatusRequest>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let item_id = match parse_item_id(&item_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let provided = [
        body.actual_quantity.is_some(),
        body.missing_quantity.is_some(),
        body.status.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();
    if provided != 1 {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "provide exactly one of actual_quantity, missing_quantity, or status",
        );
    }

    let result = if let Some(actual_quantity) = body.actual_quantity {
        if let Err(e) = crate::authz::require_permissions(&user, &[Permission::new("audits.count")])
        {
            return forbidden(e);
        }
        services.orchestrator().record_count(
            audit_id,
            item_id,
            actual_quantity,
            body.notes,
            user.user_id(),
        )
    } else if let Some(missing_quantity) = body.missing_quantity {
        if let Err(e) = crate::authz::require_permissions(&user, &[Permission::new("audits.count")])
        {
            return forbidden(e);
        }
        services.orchestrator().report_missing(
            audit_id,
            item_id,
            missing_quantity,
            body.notes,
            user.user_id(),
        )
    } else {
        let status = match errors::parse_item_status(body.status.as_deref().unwrap_or_default()) {
            Ok(status) => status,
            Err(resp) => return resp,
        };
        if let Err(e) =
            crate::authz::require_permissions(&user, &[Permission::new("audits.reconcile")])
        {
            return forbidden(e);
        }
        services
            .orchestrator()
            .set_item_status(audit_id, item_id, status, body.notes, user.user_id())
    };

    if let Err(e) = result {
        return errors::dispatch_error_to_response(e);
    }

    item_response(&services, audit_id, item_id)
}

/// `POST /audits/{id}/items/{item_id}/reopen` — privileged recount path.
pub async fn reopen_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path((id, item_id)): Path<(String, String)>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let item_id = match parse_item_id(&item_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) =
        crate::authz::require_permissions(&user, &[Permission::new("audits.items.reopen")])
    {
        return forbidden(e);
    }

    if let Err(e) = services
        .orchestrator()
        .reopen_item(audit_id, item_id, user.user_id())
    {
        return errors::dispatch_error_to_response(e);
    }

    item_response(&services, audit_id, item_id)
}

pub async fn assign_counter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AssignCounterRequest>,
) -> axum::response::Response {
    let audit_id = match parse_audit_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let assignee: UserId = match body.user_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id")
        }
    };

    if let Err(e) = crate::authz::require_permissions(&user, &[Permission::new("audits.assign")]) {
        return forbidden(e);
    }

    match services
        .orchestrator()
        .assign_counter(audit_id, assignee, body.zones.clone())
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": audit_id.to_string(),
                "user_id": assignee.to_string(),
                "zones": body.zones,
            })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Strongly consistent item readback: the write path's own aggregate, not the
/// (eventually consistent) projection.
fn item_response(
    services: &AppServices,
    audit_id: AuditId,
    item_id: AuditItemId,
) -> axum::response::Response {
    let audit = match services.orchestrator().load_audit(audit_id) {
        Ok(audit) => audit,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    match audit.item(item_id) {
        Some(item) => (StatusCode::OK, Json(dto::audit_item_to_json(item))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "audit item not found"),
    }
}
