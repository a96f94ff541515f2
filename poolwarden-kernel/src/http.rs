/**
 * HTTP API - the kernel's only surface towards the web layer and agents
 *
 * ROLE:
 * Maps requests onto the coordinator and the aggregator. The authenticated
 * user name arrives in `x-remote-user`, set by the fronting web server.
 *
 * HOW IT WORKS:
 * - axum router with an `x-api-key` middleware (health routes exempt)
 * - mutating calls run in their own task: a client hanging up halfway
 *   through a boot override must not cancel the restore
 * - every failure degrades to `{"ok": false}` with status 200; denied and
 *   missing VMs are indistinguishable from failed ones
 * - read endpoints answer with null or an empty list instead
 */

use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::aggregator::{SnapshotResponse, StatusAggregator};
use crate::authz::{Action, Principal};
use crate::config::{fullname, Registry};
use crate::coordinator::{
    ActionCoordinator, ActionRequest, ConfirmRequest, ConsoleGrant, SnapshotInfo, SnapshotOp, VmProperties,
};
use crate::error::ActionError;
use crate::health::{HealthTracker, KernelHealth};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub coordinator: Arc<ActionCoordinator>,
    pub aggregator: Arc<StatusAggregator>,
    pub health: HealthTracker,
    pub api_key: Option<String>,
}

impl AppState {
    /// Log the outcome of a mutating call and count it.
    fn settle<T>(&self, user: &Principal, action: &str, target: &str, outcome: Result<T, ActionError>) -> Option<T> {
        self.health.record(&outcome);
        match outcome {
            Ok(v) => {
                tracing::info!(principal = %user, action, resource = %target, "[http] action succeeded");
                Some(v)
            }
            Err(e @ (ActionError::Denied { .. } | ActionError::NotFound(_))) => {
                tracing::info!(principal = %user, action, resource = %target, kind = ?e.kind(), error = %e, "[http] action refused");
                None
            }
            Err(e) => {
                tracing::warn!(principal = %user, action, resource = %target, kind = ?e.kind(), error = %e, "[http] action failed");
                None
            }
        }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        tracing::warn!("[http] POOLWARDEN_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Principal taken from the `x-remote-user` header.
pub struct RemoteUser(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for RemoteUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-remote-user")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| RemoteUser(Principal::new(v)))
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Run to completion even if the request future is dropped.
async fn detached<T, F>(fut: F) -> Result<T, ActionError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ActionError>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(outcome) => outcome,
        Err(e) => Err(ActionError::PartialData(format!("action task ended abnormally: {e}"))),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/status", get(get_status))
        .route("/actions/confirm", post(confirm_action))
        .route("/actions/{action}", post(perform_action))
        .route("/actions/{action}/prepare", post(prepare_action))
        .route("/vms/{pool}/{vm}/console", get(get_console))
        .route("/vms/{pool}/{vm}/properties", get(get_properties))
        .route("/vms/{pool}/{vm}/dvd", post(change_dvd))
        .route("/vms/{pool}/{vm}/snapshots", get(list_snapshots).post(snapshot_op))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(app.registry.pools().len(), app.registry.vm_count()))
}

// GET /status
async fn get_status(State(app): State<AppState>, RemoteUser(user): RemoteUser) -> Json<SnapshotResponse> {
    Json(app.aggregator.snapshot(&user, OffsetDateTime::now_utc()).await)
}

// POST /actions/{action}
async fn perform_action(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path(action): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Json<Value> {
    let target = fullname(&req.pool, &req.vm);
    let Ok(action) = action.parse::<Action>() else {
        tracing::info!(principal = %user, action = %action, resource = %target, "[http] unknown action");
        return Json(json!({ "ok": false }));
    };

    let coord = app.coordinator.clone();
    let who = user.clone();
    let outcome = detached(async move { coord.perform(&who, action, &req).await }).await;
    let ok = app.settle(&user, action.as_str(), &target, outcome).is_some();
    Json(json!({ "ok": ok }))
}

#[derive(Debug, Deserialize)]
struct PrepareBody {
    pool: String,
    vm: String,
}

// POST /actions/{action}/prepare
async fn prepare_action(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path(action): Path<String>,
    Json(body): Json<PrepareBody>,
) -> Json<Value> {
    let unavailable = Json(json!({ "status": "unavailable" }));
    let Ok(action) = action.parse::<Action>() else {
        return unavailable;
    };

    let target = fullname(&body.pool, &body.vm);
    let outcome = app.coordinator.prepare(&user, action, &body.pool, &body.vm).await;
    match app.settle(&user, action.as_str(), &target, outcome) {
        Some(prepared) => Json(serde_json::to_value(prepared).unwrap_or_else(|_| json!({ "status": "unavailable" }))),
        None => unavailable,
    }
}

// POST /actions/confirm
async fn confirm_action(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Json(req): Json<ConfirmRequest>,
) -> Json<Value> {
    let target = req.target.clone();
    let coord = app.coordinator.clone();
    let who = user.clone();
    let outcome = detached(async move { coord.confirm(&who, &req).await }).await;
    let ok = app.settle(&user, "confirm", &target, outcome).is_some();
    Json(json!({ "ok": ok }))
}

// GET /vms/{pool}/{vm}/console
async fn get_console(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path((pool, vm)): Path<(String, String)>,
) -> Json<Option<ConsoleGrant>> {
    Json(app.coordinator.console(&user, &pool, &vm).ok())
}

// GET /vms/{pool}/{vm}/properties
async fn get_properties(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path((pool, vm)): Path<(String, String)>,
) -> Json<Option<VmProperties>> {
    match app.coordinator.properties(&user, &pool, &vm).await {
        Ok(props) => Json(Some(props)),
        Err(e) => {
            tracing::debug!(principal = %user, resource = %fullname(&pool, &vm), error = %e, "[http] properties unavailable");
            Json(None)
        }
    }
}

#[derive(Debug, Deserialize)]
struct DvdBody {
    image: String,
}

// POST /vms/{pool}/{vm}/dvd
async fn change_dvd(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path((pool, vm)): Path<(String, String)>,
    Json(body): Json<DvdBody>,
) -> Json<Value> {
    let target = fullname(&pool, &vm);
    let coord = app.coordinator.clone();
    let who = user.clone();
    let outcome = detached(async move { coord.change_dvd(&who, &pool, &vm, &body.image).await }).await;
    let ok = app.settle(&user, "dvd", &target, outcome).is_some();
    Json(json!({ "ok": ok }))
}

// GET /vms/{pool}/{vm}/snapshots
async fn list_snapshots(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path((pool, vm)): Path<(String, String)>,
) -> Json<Vec<SnapshotInfo>> {
    Json(app.coordinator.snapshots(&user, &pool, &vm).await.unwrap_or_default())
}

// POST /vms/{pool}/{vm}/snapshots
async fn snapshot_op(
    State(app): State<AppState>,
    RemoteUser(user): RemoteUser,
    Path((pool, vm)): Path<(String, String)>,
    Json(op): Json<SnapshotOp>,
) -> Json<Value> {
    let target = fullname(&pool, &vm);
    let coord = app.coordinator.clone();
    let who = user.clone();
    let (p, v) = (pool.clone(), vm.clone());
    let outcome = detached(async move { coord.snapshot(&who, &p, &v, &op).await }).await;
    let ok = app.settle(&user, Action::Snapshot.as_str(), &target, outcome).is_some();

    let snapshots = app.coordinator.snapshots(&user, &pool, &vm).await.unwrap_or_default();
    Json(json!({ "ok": ok, "snapshots": snapshots }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Gate, OperationMap};
    use crate::config::KernelConfig;
    use crate::error::ErrorKind;
    use crate::hypervisor::simulated::{SimPool, SimulatedHypervisor};
    use crate::hypervisor::PowerState;
    use crate::rights::StaticRightsStore;
    use crate::state::Shared;
    use crate::tokens::TokenSigner;
    use axum::body::Body;
    use axum::http;
    use tower::ServiceExt;

    const FIXTURE: &str = r#"
pools:
  - name: lab
    hosts: [{ name: xs1 }, { name: xs2 }]
    vms:
      - { name: web01, console: ":3" }
      - { name: db01 }
rights:
  - { who: ops, pool: lab, level: all }
  - { who: guest, pool: lab, vm: web01, level: read }
simulation:
  pools:
    - name: lab
      hosts: [{ name_label: xs1 }, { name_label: xs2 }]
      vms:
        - { name_label: web01, power_state: Running, resident_on: xs1 }
        - { name_label: db01 }
"#;

    fn app() -> (Router, Shared<SimPool>, HealthTracker) {
        let cfg: KernelConfig = serde_yaml::from_str(FIXTURE).unwrap();
        let registry = Arc::new(Registry::from_config(&cfg).unwrap());
        let store = Arc::new(StaticRightsStore::new(cfg.rights.clone(), cfg.groups.clone()));
        let gate = Gate::new(store, OperationMap::default());
        let sim = Arc::new(SimulatedHypervisor::from_conf(cfg.simulation.as_ref().unwrap()));
        let pool = sim.pool("lab").unwrap();
        let tokens = TokenSigner::new("test", time::Duration::seconds(300));
        let health = HealthTracker::new();
        let state = AppState {
            registry: registry.clone(),
            coordinator: Arc::new(ActionCoordinator::new(registry.clone(), gate.clone(), sim.clone(), tokens)),
            aggregator: Arc::new(StatusAggregator::new(registry, gate, sim)),
            health: health.clone(),
            api_key: Some("k".into()),
        };
        (build_router(state), pool, health)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut b = http::Request::builder().method(method).uri(uri).header("x-api-key", "k");
        if let Some(u) = user {
            b = b.header("x-remote-user", u);
        }
        match body {
            Some(v) => b.header("content-type", "application/json").body(Body::from(v.to_string())).unwrap(),
            None => b.body(Body::empty()).unwrap(),
        }
    }

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_is_open_everything_else_needs_the_key() {
        let (router, _, _) = app();
        let resp = router
            .clone()
            .oneshot(http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .clone()
            .oneshot(http::Request::builder().uri("/status").header("x-remote-user", "ops").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, request("GET", "/status", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn action_runs_and_is_counted() {
        let (router, pool, health) = app();
        let (status, body) = call(
            &router,
            request("POST", "/actions/poweroff", Some("ops"), Some(json!({ "pool": "lab", "vm": "web01" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
        assert_eq!(pool.lock().vm_named("web01").unwrap().1.power_state, PowerState::Halted);
        assert_eq!(health.get_health(1, 2).actions_succeeded, 1);
    }

    #[tokio::test]
    async fn denial_unknown_vm_and_unknown_action_look_alike() {
        let (router, pool, health) = app();
        for (user, action, vm) in [("guest", "poweroff", "web01"), ("ops", "poweroff", "nope"), ("ops", "explode", "web01")] {
            let (status, body) = call(
                &router,
                request("POST", &format!("/actions/{action}"), Some(user), Some(json!({ "pool": "lab", "vm": vm }))),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "ok": false }));
        }
        assert_eq!(pool.lock().vm_named("web01").unwrap().1.power_state, PowerState::Running);
        // the unparseable action never reached the coordinator
        assert_eq!(health.get_health(1, 2).actions_failed, 2);
    }

    #[tokio::test]
    async fn migrate_goes_through_prepare_and_confirm() {
        let (router, pool, _) = app();
        let (_, prepared) = call(
            &router,
            request("POST", "/actions/migrate/prepare", Some("ops"), Some(json!({ "pool": "lab", "vm": "web01" }))),
        )
        .await;
        assert_eq!(prepared["status"], "ready");
        assert_eq!(prepared["candidates"], json!([{ "name": "xs2", "home": false }]));

        let token = prepared["token"].as_str().unwrap().to_string();
        let (_, body) = call(
            &router,
            request("POST", "/actions/confirm", Some("guest"), Some(json!({ "token": token, "target": "xs2" }))),
        )
        .await;
        assert_eq!(body, json!({ "ok": false }));

        let (_, body) = call(
            &router,
            request("POST", "/actions/confirm", Some("ops"), Some(json!({ "token": token, "target": "xs2" }))),
        )
        .await;
        assert_eq!(body, json!({ "ok": true }));
        let p = pool.lock();
        let (_, vm) = p.vm_named("web01").unwrap();
        assert_eq!(vm.resident_on.as_ref(), p.host_named("xs2"));
    }

    #[tokio::test]
    async fn prepare_denied_is_unavailable_and_counted() {
        let (router, _, health) = app();
        let (_, body) = call(
            &router,
            request("POST", "/actions/migrate/prepare", Some("guest"), Some(json!({ "pool": "lab", "vm": "web01" }))),
        )
        .await;
        assert_eq!(body, json!({ "status": "unavailable" }));

        let (_, body) = call(
            &router,
            request("POST", "/actions/bogus/prepare", Some("ops"), Some(json!({ "pool": "lab", "vm": "web01" }))),
        )
        .await;
        assert_eq!(body, json!({ "status": "unavailable" }));

        // discovery refusals are counted like any other action
        let report = health.get_health(1, 2);
        assert_eq!((report.actions_attempted, report.actions_failed), (1, 1));
        assert_eq!(report.failures_by_kind[&ErrorKind::AuthorizationDenied], 1);
    }

    #[tokio::test]
    async fn read_endpoints_blank_out_when_denied() {
        let (router, _, _) = app();
        let (_, grant) = call(&router, request("GET", "/vms/lab/web01/console", Some("guest"), None)).await;
        assert_eq!(grant["port"], 5903);
        assert_eq!(grant["kbdmouse"], false);

        let (_, grant) = call(&router, request("GET", "/vms/lab/db01/console", Some("guest"), None)).await;
        assert_eq!(grant, Value::Null);
        let (_, props) = call(&router, request("GET", "/vms/lab/db01/properties", Some("guest"), None)).await;
        assert_eq!(props, Value::Null);
        let (_, snaps) = call(&router, request("GET", "/vms/lab/web01/snapshots", Some("guest"), None)).await;
        assert_eq!(snaps, json!([]));
    }

    #[tokio::test]
    async fn snapshot_create_returns_the_new_list() {
        let (router, _, _) = app();
        let (_, body) = call(
            &router,
            request("POST", "/vms/lab/db01/snapshots", Some("ops"), Some(json!({ "op": "create", "name": " before upgrade " }))),
        )
        .await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["snapshots"][0]["name"], "before upgrade");
    }

    #[tokio::test]
    async fn status_is_filtered_by_rights() {
        let (router, _, _) = app();
        let (_, snap) = call(&router, request("GET", "/status", Some("guest"), None)).await;
        let vms = snap["pools"][0]["vms"].as_array().unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0]["fullname"], "lab:web01");
    }
}
