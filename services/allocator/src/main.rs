//! corral allocator
//!
//! Runs the hierarchical allocator as a standalone service. Offers are
//! written to the log; quota persisted by the in-memory registrar lives as
//! long as the process.

use std::sync::Arc;

use anyhow::{Context, Result};
use corral_allocator::{
    authorizer::{Authorizer, LocalAuthorizer},
    config::AllocatorConfig,
    metrics::describe_metrics,
    registrar::InMemoryRegistrar,
    watcher::WhitelistWatcher,
    Allocator, DispatchAllocator, OfferSink, Offers,
};
use corral_id::FrameworkId;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sink that logs every offer.
struct LoggingOfferSink;

impl OfferSink for LoggingOfferSink {
    fn offer(&self, framework_id: FrameworkId, offers: Offers) {
        for (slave_id, resources) in offers {
            info!(
                framework_id = %framework_id,
                slave_id = %slave_id,
                resources = %resources,
                "Offer"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AllocatorConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CORRAL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    describe_metrics();

    info!("Starting corral allocator");
    info!(
        allocation_interval = ?config.allocation_interval,
        roles = config.roles.len(),
        whitelist = ?config.whitelist,
        "Configuration loaded"
    );

    let authorizer = match &config.acls {
        Some(path) => {
            let authorizer = LocalAuthorizer::from_file(path)
                .with_context(|| format!("failed to load ACLs from {}", path.display()))?;
            Some(Arc::new(authorizer) as Arc<dyn Authorizer>)
        }
        None => None,
    };

    let whitelist = config.whitelist.clone();
    let allocator: Arc<dyn Allocator> = Arc::new(DispatchAllocator::initialize(
        config,
        Arc::new(LoggingOfferSink),
        Arc::new(InMemoryRegistrar::new()),
        authorizer,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher_handle = whitelist.map(|path| {
        let watcher = WhitelistWatcher::new(path, Arc::clone(&allocator));
        tokio::spawn(watcher.run(shutdown_rx.clone()))
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = watcher_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Whitelist watcher panicked");
        }
    }
    allocator.cease_allocation().await;

    info!("Allocator shutdown complete");
    Ok(())
}
