use std::{
    io::{self, Write},
    process,
    sync::Arc,
};

use serde::Serialize;
use sitecms::{
    application::{error::AppError, query::QueryOptions, registry::ServiceRegistry},
    cache::CacheConfig,
    config::{self, Command, Settings},
    infra::{error::InfraError, store::PostgrestClient, telemetry},
    util::SystemClock,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, kind = error.kind(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, kind = error.kind(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let registry = build_registry(&settings)?;

    match cli_args.command {
        Command::Read(args) => {
            let mut options = QueryOptions::new();
            if let Some(limit) = args.limit {
                options = options.limit(limit);
            }
            if let Some(offset) = args.offset {
                options = options.offset(offset);
            }
            let records = registry.operations(args.entity).read(options).await?;
            info!(entity = ?args.entity, count = records.len(), "Read complete");
            print_json(&records)
        }
        Command::Get(args) => {
            let record = registry.operations(args.entity).get_by_id(&args.id).await?;
            print_json(&record)
        }
        Command::Stats(args) => {
            let stats = registry.operations(args.entity).get_stats().await?;
            print_json(&stats)
        }
    }
}

fn build_registry(settings: &Settings) -> Result<ServiceRegistry, AppError> {
    let client = PostgrestClient::from_settings(&settings.store)?;
    Ok(ServiceRegistry::build(
        Arc::new(client),
        &CacheConfig::from(&settings.cache),
        Arc::new(SystemClock),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{rendered}").map_err(InfraError::from)?;
    Ok(())
}
