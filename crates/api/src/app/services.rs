use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use stocktake_audit::AuditId;
use stocktake_core::DomainError;
use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus};
use stocktake_infra::{
    command_dispatcher::{CommandDispatcher, DispatchError},
    event_store::{EventStore, InMemoryEventStore, PostgresEventStore, StoredEvent},
    projections::{AuditReadModel, AuditsProjection, StockLevelsProjection, StockReadModel},
    read_model::InMemoryStore,
    reconciliation::{AuditOrchestrator, AUDIT_AGGREGATE_TYPE, INVENTORY_AGGREGATE_TYPE},
};
use stocktake_inventory::InventoryItemId;

/// Realtime message broadcasted via SSE.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub payload: JsonValue,
}

/// Type-erased event store: in-memory for dev/test, Postgres when
/// `USE_PERSISTENT_STORES=true`. Both run behind the same sync trait.
pub type SharedStore = Arc<dyn EventStore>;
pub type SharedBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

type SharedStockProjection =
    Arc<StockLevelsProjection<Arc<InMemoryStore<InventoryItemId, StockReadModel>>>>;
type SharedAuditsProjection = Arc<AuditsProjection<Arc<InMemoryStore<AuditId, AuditReadModel>>>>;
type Orchestrator = AuditOrchestrator<SharedStore, SharedBus, SharedStockProjection>;

pub struct AppServices {
    dispatcher: CommandDispatcher<SharedStore, SharedBus>,
    orchestrator: Orchestrator,
    audits_projection: SharedAuditsProjection,
    stock_projection: SharedStockProjection,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
}

pub async fn build_services() -> AppServices {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let store: SharedStore = if use_persistent {
        let database_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        let pool = sqlx::PgPool::connect(&database_url)
            .await
            .expect("failed to connect to Postgres");
        let store = PostgresEventStore::new(pool);
        store.migrate().await.expect("event store migration failed");
        Arc::new(store)
    } else {
        Arc::new(InMemoryEventStore::new())
    };

    build_with_store(store)
}

fn build_with_store(store: SharedStore) -> AppServices {
    let bus: SharedBus = Arc::new(InMemoryEventBus::new());

    let stock_projection: SharedStockProjection =
        Arc::new(StockLevelsProjection::new(Arc::new(InMemoryStore::new())));
    let audits_projection: SharedAuditsProjection =
        Arc::new(AuditsProjection::new(Arc::new(InMemoryStore::new())));

    // Realtime channel (SSE): lossy broadcast, no backpressure on the core.
    let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(256);

    // Background subscriber: bus → projections + reconciliation safety net.
    {
        let sub = bus.subscribe();
        let stock_projection = stock_projection.clone();
        let audits_projection = audits_projection.clone();
        let realtime_tx = realtime_tx.clone();
        let reconciler: Orchestrator =
            AuditOrchestrator::new(store.clone(), bus.clone(), stock_projection.clone());

        tokio::task::spawn_blocking(move || loop {
            match sub.recv() {
                Ok(env) => {
                    let at = env.aggregate_type().to_string();

                    let apply_ok = match at.as_str() {
                        AUDIT_AGGREGATE_TYPE => {
                            audits_projection.apply_envelope(&env).map_err(|e| e.to_string())
                        }
                        INVENTORY_AGGREGATE_TYPE => {
                            stock_projection.apply_envelope(&env).map_err(|e| e.to_string())
                        }
                        _ => Ok(()),
                    };

                    if let Err(e) = apply_ok {
                        tracing::warn!("projection apply failed: {e}");
                        continue;
                    }

                    // At-least-once reconciliation: re-drive corrections for
                    // completed audits (idempotent per inventory aggregate).
                    if at == AUDIT_AGGREGATE_TYPE {
                        match reconciler.handle_audit_envelope(&env) {
                            Ok(applied) if applied > 0 => {
                                tracing::info!(applied, "reconciliation re-drive applied corrections");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!("reconciliation re-drive failed: {e:?}"),
                        }
                    }

                    // Broadcast projection update (lossy).
                    let _ = realtime_tx.send(RealtimeMessage {
                        topic: format!("{at}.projection_updated"),
                        payload: serde_json::json!({
                            "kind": "projection_update",
                            "aggregate_type": at,
                            "aggregate_id": env.aggregate_id().to_string(),
                            "sequence_number": env.sequence_number(),
                        }),
                    });
                }
                Err(_) => break,
            }
        });
    }

    let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
    let orchestrator = AuditOrchestrator::new(store, bus, stock_projection.clone());

    AppServices {
        dispatcher,
        orchestrator,
        audits_projection,
        stock_projection,
        realtime_tx,
    }
}

impl AppServices {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn dispatch<A>(
        &self,
        aggregate_id: stocktake_core::AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(stocktake_core::AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: stocktake_core::Aggregate<Error = DomainError>,
        A::Event: stocktake_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        self.dispatcher
            .dispatch::<A>(aggregate_id, aggregate_type, command, make_aggregate)
    }

    pub fn audits_get(&self, audit_id: &AuditId) -> Option<AuditReadModel> {
        self.audits_projection.get(audit_id)
    }

    pub fn audits_list(&self) -> Vec<AuditReadModel> {
        self.audits_projection.list()
    }

    pub fn stock_get(&self, item_id: &InventoryItemId) -> Option<StockReadModel> {
        self.stock_projection.get(item_id)
    }

    pub fn stock_list(
        &self,
        warehouse_id: Option<stocktake_core::WarehouseId>,
    ) -> Vec<StockReadModel> {
        match warehouse_id {
            Some(warehouse_id) => self.stock_projection.list_warehouse(warehouse_id),
            None => self.stock_projection.list(),
        }
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        &self.realtime_tx
    }
}

/// Build an SSE stream of realtime messages (used by `/stream`).
pub fn realtime_sse_stream(
    services: Arc<AppServices>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(m) => {
            let data = serde_json::to_string(&m.payload).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.topic).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
