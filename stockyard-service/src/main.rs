//! Broker entry point
//!
//! Everything is constructed here and passed down explicitly: configuration,
//! vendor registry, database gateway, pipeline, planner, scheduler daemon,
//! and finally the HTTP front-end, which owns the process lifetime.

use anyhow::Context as _;
use std::path::Path;
use std::sync::Arc;

use stockyard_service::config::Config;
use stockyard_service::db::{self, Gateway};
use stockyard_service::http;
use stockyard_service::observability::init_tracing;
use stockyard_service::pipeline::{Pipeline, Priority};
use stockyard_service::planner::{templates, Planner};
use stockyard_service::scheduler::{self, Daemon, Schedule};
use stockyard_service::state::AppState;
use stockyard_service::vendor::VendorRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(&config);

    let registry =
        Arc::new(VendorRegistry::build(&config).context("building vendor registry")?);
    if registry.is_empty() {
        tracing::warn!("no vendors configured; the broker will reject every request");
    }

    let gateway = match &config.database {
        Some(db_config) => {
            let pool = db::create_pool(db_config).await.context("connecting to database")?;
            Some(Arc::new(Gateway::new(pool)))
        }
        None => {
            tracing::warn!("no database configured; responses will not be persisted");
            None
        }
    };

    // Vendor companion tasks (the gateway socket reader)
    for (name, vendor) in registry.iter() {
        if let Some(runner) = &vendor.runner {
            let runner = Arc::clone(runner);
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    tracing::error!(vendor = %name, error = %e, "vendor runner exited");
                }
            });
        }
    }

    let pipeline = Pipeline::new(Arc::clone(&registry), gateway.clone());
    tokio::spawn(Arc::clone(&pipeline).run());

    // Templates drive both the one-shot fill plan and the recurring schedule
    let items = templates::load_dir(Path::new(&config.service.templates_dir))
        .context("loading templates")?;
    if !items.is_empty() {
        let planner = Planner::new(Arc::clone(&registry));

        if let Some(gateway) = &gateway {
            let actual = gateway.snapshot().await.context("introspecting coverage")?;
            let fills = planner.plan(&items, &actual).context("planning fills")?;
            for request in fills {
                pipeline.submit(request, Priority::Urgent)?;
            }
        }

        if config.daemon.enabled {
            let entries = planner.expand(&items).context("expanding templates")?;
            let schedule = Schedule::from_config(
                &config.daemon,
                scheduler::recurring_items(&entries),
            )
            .context("building schedule")?;
            let endpoint = format!("http://{}:{}/", config.service.host, config.service.port);
            tracing::info!(cycles = schedule.cycles(), "starting scheduler daemon");
            tokio::spawn(Daemon::new(schedule, endpoint).run());
        }
    }

    let state = AppState::new(Arc::new(config.clone()), pipeline);
    http::serve(&config, state).await?;
    Ok(())
}
