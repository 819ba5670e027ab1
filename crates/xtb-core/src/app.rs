use std::sync::Arc;

use tracing::{error, info};

use crate::{
    config::Config,
    dispatch::Dispatcher,
    ports::TransportClient,
    reconcile::ensure_group,
    supervisor::{StreamSupervisor, SupervisorReport},
    Result,
};

/// Bootstrap and run the bot on an already connected client.
///
/// Returns once the stream supervisor has exhausted its retry budget. Errors
/// are limited to registration and group setup.
pub async fn run(client: Arc<dyn TransportClient>, cfg: &Config) -> Result<SupervisorReport> {
    let me = client.identity();
    info!(
        inbox_id = %me.inbox_id,
        address = %me.address,
        env = cfg.env.as_str(),
        "client created"
    );

    if client.is_registered().await? {
        info!("client already registered");
    } else {
        info!("registering client");
        client.register().await?;
        info!("client registered");
    }

    let rec = ensure_group(client.as_ref(), &cfg.group, cfg.admin_settle_delay)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create or find group");
            e
        })?;
    info!(
        group_id = %rec.group.id(),
        created = rec.created,
        admin = ?rec.admin,
        "group ready"
    );

    let dispatcher = Dispatcher::new(client.clone(), rec.group);
    let report = StreamSupervisor::new(cfg.retry)
        .run(client.as_ref(), &dispatcher)
        .await;
    info!(
        attempts = report.connect_attempts,
        clean_completions = report.clean_completions,
        "listener finished"
    );
    Ok(report)
}
