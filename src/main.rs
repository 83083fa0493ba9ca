#![allow(dead_code)]

use clap::Parser;
use std::sync::Arc;

mod builder;
mod capabilities;
mod collaborators;
mod config;
mod core;
mod element;
mod error;
mod events;
mod legacy_adapter;
mod logging;
mod metrics;
mod pipeline;
mod priority_channel;
mod registry;
mod stage;
mod stages;
mod topology;

use config::types::PipelineDefinition;
use core::channel::{Channel, ChannelType as CoreChannelType, PubSubChannel};
use element::Element;
use stage::{Inbound, SubscriberInbound};

/// A declarative runtime for streaming stage pipelines.
#[derive(Parser)]
#[command(name = "confluent-stages")]
#[command(version = "0.1.0")]
#[command(about = "Runs a stage pipeline defined in TOML, lines of stdin in, elements of stdout out")]
struct Cli {
    /// Pipeline definition file path
    #[arg(short, long, default_value = "./config/pipeline.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// List the registered stage kinds and exit
    #[arg(short = 'L', long)]
    list_stages: bool,
}

fn build_pipeline(definition: PipelineDefinition) -> anyhow::Result<pipeline::Pipeline> {
    let mut builder = builder::Builder::new().with_config(definition.runtime.clone());

    for (name, spec) in &definition.stages {
        let stage = registry::create_stage(name, spec)?;
        builder = builder.add_stage(stage);
    }
    for (from, targets) in &definition.edges {
        builder = builder.branch(from.clone(), targets.clone());
    }

    if definition.runtime.tracing_enabled {
        builder = builder.with_event_emitter(Arc::new(events::TracingEmitter));
    }

    Ok(builder.build()?)
}

async fn maybe_serve_metrics(config: &config::types::PipelineConfig) {
    if !config.prometheus_enabled {
        return;
    }
    let Some(addr) = config.prometheus_addr.clone() else {
        tracing::warn!("prometheus_enabled is set but prometheus_addr is missing, skipping");
        return;
    };
    match metrics::MetricsRegistry::new() {
        Ok(registry) => {
            tokio::spawn(async move {
                if let Err(err) = registry.serve(&addr).await {
                    tracing::error!(error = %err, "metrics server exited");
                }
            });
        }
        Err(err) => tracing::error!(error = %err, "failed to build metrics registry"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    if cli.list_stages {
        println!("Registered stage kinds:");
        for kind in registry::list_stage_kinds() {
            println!("  - {kind}");
        }
        return Ok(());
    }

    let definition = match config::load_config(&cli.config) {
        Ok(def) => def,
        Err(err) => {
            tracing::warn!(path = %cli.config, error = %err, "falling back to the built-in demo pipeline");
            config::default_config()
        }
    };

    let pipeline = build_pipeline(definition.clone())?;
    maybe_serve_metrics(&definition.runtime).await;

    let input_channel: Arc<dyn PubSubChannel<Element>> =
        Arc::new(Channel::new(CoreChannelType::Direct, definition.runtime.channel_buffer_size));
    let input_inbound: Inbound = Box::new(SubscriberInbound(input_channel.subscribe()));

    let stdin_channel = input_channel.clone();
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_channel.publish(Element::new_text(line)).await.is_err() {
                break;
            }
        }
        stdin_channel.close();
    });

    let run = pipeline.execute(input_inbound)?;
    let ctx = run.ctx.clone();
    let mut output = run.output;
    while let Some(element) = output.recv(&ctx).await {
        if let Some(message) = element.error() {
            eprintln!("error: {message}");
        } else if let Some(text) = element.extract_text() {
            println!("{text}");
        }
    }

    run.join().await?;
    tracing::info!("pipeline run complete");
    Ok(())
}
