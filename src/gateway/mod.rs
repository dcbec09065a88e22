use std::sync::Arc;

use anyhow::Result;

use crate::cache::CachePolicy;
use crate::message::Origin;
use crate::settings::Settings;
use crate::storage::{EntityStore, MetaStore};
use crate::trace::TraceLog;

pub mod codec;
pub mod origin;
mod server;

/// Everything a connection handler needs, shared across the accept loop.
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub meta: Arc<dyn MetaStore>,
    pub entity: Arc<dyn EntityStore>,
    pub origin: Arc<dyn Origin>,
    pub policy: CachePolicy,
    pub trace: Arc<TraceLog>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        meta: Arc<dyn MetaStore>,
        entity: Arc<dyn EntityStore>,
        origin: Arc<dyn Origin>,
        trace: Arc<TraceLog>,
    ) -> Result<Self> {
        let policy = settings.cache_policy()?;
        Ok(Self {
            settings,
            meta,
            entity,
            origin,
            policy,
            trace,
        })
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    let listener = server::bind(&app).await?;
    server::serve(Arc::new(app), listener).await
}

/// Runs the accept loop on a listener the caller already bound. Lets tests
/// bind port 0 and learn the address before starting the gateway.
pub async fn run_on(app: AppContext, listener: tokio::net::TcpListener) -> Result<()> {
    server::serve(Arc::new(app), listener).await
}
