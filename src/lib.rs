pub mod body;
pub mod cache;
pub mod cli;
pub mod gateway;
pub mod io_util;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod settings;
pub mod storage;
pub mod trace;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::gateway::origin::HttpOrigin;
use crate::settings::Settings;
use crate::storage::disk::{DiskEntityStore, DiskMetaStore};
use crate::storage::heap::{HeapEntityStore, HeapMetaStore};
use crate::storage::{EntityStore, MetaStore};
use crate::trace::TraceLog;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let (meta, entity) = build_stores(&settings).await?;

    let origin = Arc::new(HttpOrigin::new(
        &settings.origin_uri()?,
        settings.origin_connect_timeout(),
        settings.origin_timeout(),
        settings.max_header_size,
        settings.max_response_body_size,
    )?);
    tracing::info!(origin = %origin.authority(), "forwarding to origin");

    let trace = Arc::new(TraceLog::stderr(settings.verbose));
    let app = gateway::AppContext::new(settings, meta, entity, origin, trace)?;
    gateway::run(app).await
}

async fn build_stores(
    settings: &Settings,
) -> Result<(Arc<dyn MetaStore>, Arc<dyn EntityStore>)> {
    match &settings.cache_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "using disk-backed stores");
            let meta = DiskMetaStore::open(dir.join("meta")).await?;
            let entity = DiskEntityStore::open(dir.join("entity")).await?;
            Ok((Arc::new(meta), Arc::new(entity)))
        }
        None => {
            let meta = HeapMetaStore::new(settings.cache_max_entries_nonzero());
            let entity = HeapEntityStore::new();
            Ok((Arc::new(meta), Arc::new(entity)))
        }
    }
}
