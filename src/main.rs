//! dmhub CLI
//!
//! Connects to a coordinator as an ephemeral, objectless source and issues
//! one get/set/list against the federated data model. Prints the result as
//! JSON on stdout; all diagnostics go to stderr.

use std::process::ExitCode;

use clap::Parser;
use eyre::Context;
use tracing::debug;

use dmhub::cli::{Cli, Command, coerce_value};
use dmhub::message::Object;
use dmhub::source::Source;

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let source_name = format!("dmhub-cli-{}", uuid::Uuid::now_v7());
    debug!(%source_name, coordinator = %cli.coordinator_url, "starting dmhub cli");

    let mut source = Source::new(&source_name, &cli.coordinator_url, &cli.source_url);
    source.connect().await.context("failed to connect source")?;

    // Register with no objects so the coordinator will route for us
    let result = async {
        source.register(Vec::new()).await.context("failed to register source")?;

        match &cli.command {
            Command::Get { path } => cmd_get(&source, path).await,
            Command::List { path } => cmd_list(&source, path).await,
            Command::Set { path, value } => cmd_set(&source, path, value).await,
        }
    }
    .await;

    source.disconnect().await;
    result
}

async fn cmd_get(source: &Source, path: &str) -> eyre::Result<()> {
    let objects = source.get_objects(vec![Object::named(path)]).await?;
    print_objects(&objects)
}

async fn cmd_list(source: &Source, path: &str) -> eyre::Result<()> {
    let objects = source.list_objects(vec![Object::named(path)]).await?;
    println!("{}", serde_json::to_string_pretty(&objects)?);
    Ok(())
}

async fn cmd_set(source: &Source, path: &str, value: &str) -> eyre::Result<()> {
    // Fetch the object first to learn its declared type
    let objects = source.get_objects(vec![Object::named(path)]).await?;
    let [object] = objects.as_slice() else {
        eyre::bail!("expected exactly one object at {path}, got {}", objects.len());
    };

    let mut object = object.clone();
    object.value = Some(coerce_value(&object, value)?);
    source.set_object(object).await?;
    Ok(())
}

/// A single object prints unwrapped; anything else prints as an array
fn print_objects(objects: &[Object]) -> eyre::Result<()> {
    if let [object] = objects {
        println!("{}", serde_json::to_string_pretty(object)?);
    } else {
        println!("{}", serde_json::to_string_pretty(objects)?);
    }
    Ok(())
}
