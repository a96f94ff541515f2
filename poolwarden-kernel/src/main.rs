/**
 * POOLWARDEN KERNEL - entry point
 *
 * ROLE: Wires configuration, authorization, the hypervisor backend, the
 * action coordinator and the status aggregator behind one HTTP surface.
 *
 * ARCHITECTURE: immutable registry + stateless signed tokens; every request
 * opens its own hypervisor session. Nothing but health counters is mutable.
 */

mod aggregator;
mod authz;
mod compensation;
mod config;
mod coordinator;
mod error;
mod health;
mod http;
mod hypervisor;
mod logging;
mod rights;
mod state;
mod tokens;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::aggregator::StatusAggregator;
use crate::authz::{Gate, OperationMap};
use crate::config::{load_config, BackendKind, Registry};
use crate::coordinator::ActionCoordinator;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hypervisor::simulated::SimulatedHypervisor;
use crate::hypervisor::xenapi::XenApi;
use crate::hypervisor::Hypervisor;
use crate::rights::StaticRightsStore;
use crate::tokens::TokenSigner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cfg = load_config().await?;
    logging::init(cfg.log_json)?;

    let registry = Arc::new(Registry::from_config(&cfg).context("invalid pool configuration")?);
    tracing::info!(pools = registry.pools().len(), vms = registry.vm_count(), "[kernel] registry loaded");

    let operations = OperationMap::with_overrides(&cfg.operations).context("invalid operations table")?;
    let store = Arc::new(StaticRightsStore::new(cfg.rights.clone(), cfg.groups.clone()));
    let gate = Gate::new(store, operations);

    let hypervisor: Arc<dyn Hypervisor> = match cfg.backend {
        BackendKind::Simulated => {
            let conf = cfg.simulation.clone().unwrap_or_default();
            tracing::info!(pools = conf.pools.len(), "[kernel] using simulated hypervisor");
            Arc::new(SimulatedHypervisor::from_conf(&conf))
        }
        BackendKind::Xenapi => Arc::new(XenApi::new().context("building XenAPI client")?),
    };

    let ttl = time::Duration::seconds(cfg.token_ttl_secs as i64);
    let tokens = match std::env::var("POOLWARDEN_TOKEN_SECRET") {
        Ok(secret) if !secret.is_empty() => TokenSigner::new(secret, ttl),
        _ => {
            tracing::info!("[kernel] POOLWARDEN_TOKEN_SECRET not set, tokens are valid for this process only");
            TokenSigner::random(ttl)
        }
    };

    let app_state = AppState {
        registry: registry.clone(),
        coordinator: Arc::new(ActionCoordinator::new(registry.clone(), gate.clone(), hypervisor.clone(), tokens)),
        aggregator: Arc::new(StatusAggregator::new(registry, gate, hypervisor)),
        health: HealthTracker::new(),
        api_key: std::env::var("POOLWARDEN_API_KEY").ok(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen).await.with_context(|| format!("binding {}", cfg.listen))?;
    tracing::info!(addr = %cfg.listen, "[kernel] listening");
    axum::serve(listener, app).await?;
    Ok(())
}
