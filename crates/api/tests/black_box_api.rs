use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;

use stocktake_auth::{JwtClaims, Role};
use stocktake_core::{UserId, WarehouseId};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(jwt_secret: &str) -> Self {
        // Build app (same router as prod), but bind to an ephemeral port.
        let app = stocktake_api::app::build_app(jwt_secret.to_string()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(jwt_secret: &str, user_id: UserId, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: user_id,
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn admin_token(jwt_secret: &str) -> String {
    mint_jwt(jwt_secret, UserId::new(), vec![Role::new("admin")])
}

/// Poll a read endpoint until the projection catches up (the command path and
/// the read path are intentionally eventually consistent).
async fn get_json_eventually<F>(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    ready: F,
) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    for _ in 0..100 {
        let res = client.get(url).bearer_auth(token).send().await.unwrap();
        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if ready(&body) {
                return body;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("read model did not converge within timeout: {url}");
}

async fn register_item(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    warehouse_id: &str,
    sku: &str,
    zone: &str,
    on_hand: i64,
) -> String {
    let res = client
        .post(format!("{}/inventory/items", base_url))
        .bearer_auth(token)
        .json(&json!({
            "sku": sku,
            "name": format!("{sku} name"),
            "warehouse_id": warehouse_id,
            "bin": format!("BIN-{sku}"),
            "zone": zone,
            "initial_on_hand": on_hand,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

/// Create an audit, start it, and return (audit_id, items by sku).
async fn started_audit(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    warehouse_id: &str,
    expected_items: usize,
) -> (String, serde_json::Value) {
    let res = client
        .post(format!("{}/audits", base_url))
        .bearer_auth(token)
        .json(&json!({ "warehouse_id": warehouse_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let audit_id = created["id"].as_str().unwrap().to_string();
    assert!(created["reference"].as_str().unwrap().starts_with("AUD-"));

    let res = client
        .post(format!("{}/audits/{}/start", base_url, audit_id))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let started: serde_json::Value = res.json().await.unwrap();
    assert_eq!(started["items_created"].as_u64().unwrap() as usize, expected_items);

    let items = get_json_eventually(
        client,
        &format!("{}/audits/{}/items", base_url, audit_id),
        token,
        |body| body["count"].as_u64().unwrap_or(0) as usize == expected_items,
    )
    .await;

    (audit_id, items)
}

fn item_id_by_sku(items: &serde_json::Value, sku: &str) -> String {
    items["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["product"]["sku"] == sku)
        .unwrap_or_else(|| panic!("no audit item for sku {sku}"))["id"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/audits", srv.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn whoami_reflects_token_identity() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let user_id = UserId::new();
    let token = mint_jwt(jwt_secret, user_id, vec![Role::new("counter")]);

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/whoami", srv.base_url))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["user_id"].as_str().unwrap(), user_id.to_string());
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "counter"));
}

#[tokio::test]
async fn audit_lifecycle_counts_reconciles_and_corrects_inventory() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;
    let token = admin_token(jwt_secret);
    let client = reqwest::Client::new();
    let warehouse_id = WarehouseId::new().to_string();

    let _item_a = register_item(&client, &srv.base_url, &token, &warehouse_id, "SKU-A", "A", 10).await;
    let item_b = register_item(&client, &srv.base_url, &token, &warehouse_id, "SKU-B", "A", 5).await;

    get_json_eventually(
        &client,
        &format!("{}/inventory/items?warehouse_id={}", srv.base_url, warehouse_id),
        &token,
        |body| body["count"] == 2,
    )
    .await;

    let (audit_id, items) = started_audit(&client, &srv.base_url, &token, &warehouse_id, 2).await;
    let audit_item_a = item_id_by_sku(&items, "SKU-A");
    let audit_item_b = item_id_by_sku(&items, "SKU-B");

    // Clean count on A.
    let res = client
        .patch(format!(
            "{}/audits/{}/items/{}/status",
            srv.base_url, audit_id, audit_item_a
        ))
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "COUNTED");
    assert_eq!(body["discrepancy"], 0);

    // Two units missing on B → derived count 3, open discrepancy.
    let res = client
        .patch(format!(
            "{}/audits/{}/items/{}/status",
            srv.base_url, audit_id, audit_item_b
        ))
        .bearer_auth(&token)
        .json(&json!({ "missing_quantity": 2, "notes": "box crushed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "DISCREPANCY");
    assert_eq!(body["counted_quantity"], 3);
    assert_eq!(body["discrepancy"], -2);

    // Operator accepts the variance.
    let res = client
        .patch(format!(
            "{}/audits/{}/items/{}/status",
            srv.base_url, audit_id, audit_item_b
        ))
        .bearer_auth(&token)
        .json(&json!({ "status": "RECONCILED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "RECONCILED");
    assert_eq!(body["discrepancy"], -2, "variance is kept as the historical record");

    // Metrics recomputed on read: everything counted, one discrepancy line.
    let detail = get_json_eventually(
        &client,
        &format!("{}/audits/{}", srv.base_url, audit_id),
        &token,
        |body| body["metrics"]["progress_percent"] == 100,
    )
    .await;
    assert_eq!(detail["metrics"]["total_items"], 2);
    assert_eq!(detail["metrics"]["counted_items"], 2);
    assert_eq!(detail["metrics"]["discrepancy_items"], 1);
    assert_eq!(detail["metrics"]["accuracy_rate"], 50.0);

    // Completion applies the accepted variance to live inventory once.
    let res = client
        .patch(format!("{}/audits/{}", srv.base_url, audit_id))
        .bearer_auth(&token)
        .json(&json!({ "status": "COMPLETED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["corrections"], 1);
    assert_eq!(body["adjustments_applied"], 1);

    get_json_eventually(
        &client,
        &format!("{}/inventory/items/{}", srv.base_url, item_b),
        &token,
        |body| body["on_hand"] == 3,
    )
    .await;

    // Terminal state: neither a second completion nor a cancellation.
    for status in ["COMPLETED", "CANCELLED"] {
        let res = client
            .patch(format!("{}/audits/{}", srv.base_url, audit_id))
            .bearer_auth(&token)
            .json(&json!({ "status": status }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}

#[tokio::test]
async fn counting_surface_validates_its_input() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;
    let token = admin_token(jwt_secret);
    let client = reqwest::Client::new();
    let warehouse_id = WarehouseId::new().to_string();

    register_item(&client, &srv.base_url, &token, &warehouse_id, "SKU-A", "A", 10).await;
    get_json_eventually(
        &client,
        &format!("{}/inventory/items?warehouse_id={}", srv.base_url, warehouse_id),
        &token,
        |body| body["count"] == 1,
    )
    .await;

    let (audit_id, items) = started_audit(&client, &srv.base_url, &token, &warehouse_id, 1).await;
    let item = item_id_by_sku(&items, "SKU-A");
    let item_url = format!("{}/audits/{}/items/{}/status", srv.base_url, audit_id, item);

    // Exactly one operation per request.
    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": 5, "missing_quantity": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "notes": "no operation" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Negative and out-of-range quantities are rejected, item unchanged.
    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": -1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "missing_quantity": 11 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let items = get_json_eventually(
        &client,
        &format!("{}/audits/{}/items?status=PENDING", srv.base_url, audit_id),
        &token,
        |body| body["count"] == 1,
    )
    .await;
    assert_eq!(items["items"][0]["counted_quantity"], serde_json::Value::Null);
}

#[tokio::test]
async fn counted_items_lock_until_reopened() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;
    let token = admin_token(jwt_secret);
    let client = reqwest::Client::new();
    let warehouse_id = WarehouseId::new().to_string();

    register_item(&client, &srv.base_url, &token, &warehouse_id, "SKU-A", "A", 10).await;
    get_json_eventually(
        &client,
        &format!("{}/inventory/items?warehouse_id={}", srv.base_url, warehouse_id),
        &token,
        |body| body["count"] == 1,
    )
    .await;

    let (audit_id, items) = started_audit(&client, &srv.base_url, &token, &warehouse_id, 1).await;
    let item = item_id_by_sku(&items, "SKU-A");
    let item_url = format!("{}/audits/{}/items/{}/status", srv.base_url, audit_id, item);

    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Locked against casual recounts.
    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": 8 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // The privileged recount path clears the line.
    let res = client
        .post(format!(
            "{}/audits/{}/items/{}/reopen",
            srv.base_url, audit_id, item
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["counted_quantity"], serde_json::Value::Null);

    let res = client
        .patch(&item_url)
        .bearer_auth(&token)
        .json(&json!({ "actual_quantity": 8 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "DISCREPANCY");
    assert_eq!(body["discrepancy"], -2);
}

#[tokio::test]
async fn zone_assignments_are_authoritative_for_counters() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;
    let admin = admin_token(jwt_secret);
    let counter_id = UserId::new();
    let counter = mint_jwt(jwt_secret, counter_id, vec![Role::new("counter")]);
    let client = reqwest::Client::new();
    let warehouse_id = WarehouseId::new().to_string();

    register_item(&client, &srv.base_url, &admin, &warehouse_id, "SKU-A", "A", 4).await;
    register_item(&client, &srv.base_url, &admin, &warehouse_id, "SKU-B", "B", 4).await;
    get_json_eventually(
        &client,
        &format!("{}/inventory/items?warehouse_id={}", srv.base_url, warehouse_id),
        &admin,
        |body| body["count"] == 2,
    )
    .await;

    let (audit_id, items) = started_audit(&client, &srv.base_url, &admin, &warehouse_id, 2).await;
    let zone_a_item = item_id_by_sku(&items, "SKU-A");
    let zone_b_item = item_id_by_sku(&items, "SKU-B");

    let res = client
        .post(format!("{}/audits/{}/assignments", srv.base_url, audit_id))
        .bearer_auth(&admin)
        .json(&json!({ "user_id": counter_id.to_string(), "zones": ["A"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Outside the assigned zone: rejected, item untouched.
    let res = client
        .patch(format!(
            "{}/audits/{}/items/{}/status",
            srv.base_url, audit_id, zone_b_item
        ))
        .bearer_auth(&counter)
        .json(&json!({ "actual_quantity": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // Inside it: accepted, provenance recorded.
    let res = client
        .patch(format!(
            "{}/audits/{}/items/{}/status",
            srv.base_url, audit_id, zone_a_item
        ))
        .bearer_auth(&counter)
        .json(&json!({ "actual_quantity": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["counted_by"], counter_id.to_string());
}

#[tokio::test]
async fn counters_cannot_complete_audits() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;
    let admin = admin_token(jwt_secret);
    let counter = mint_jwt(jwt_secret, UserId::new(), vec![Role::new("counter")]);
    let client = reqwest::Client::new();
    let warehouse_id = WarehouseId::new().to_string();

    register_item(&client, &srv.base_url, &admin, &warehouse_id, "SKU-A", "A", 1).await;
    get_json_eventually(
        &client,
        &format!("{}/inventory/items?warehouse_id={}", srv.base_url, warehouse_id),
        &admin,
        |body| body["count"] == 1,
    )
    .await;
    let (audit_id, _items) = started_audit(&client, &srv.base_url, &admin, &warehouse_id, 1).await;

    let res = client
        .patch(format!("{}/audits/{}", srv.base_url, audit_id))
        .bearer_auth(&counter)
        .json(&json!({ "status": "COMPLETED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}
