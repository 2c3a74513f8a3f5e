// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_consumer::{
    AmqpError, ConsumerConfigs, ConsumerHandler, ConsumerMessage, HandlerError, RabbitMQConsumer,
};
use std::{env, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Logs every payload it receives.
struct PrintHandler;

#[async_trait]
impl ConsumerHandler for PrintHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        info!(
            queue = msg.queue(),
            delivery_tag = msg.metadata.delivery_tag,
            redelivered = msg.metadata.redelivered,
            "received: {}",
            msg.text()
        );
        Ok(())
    }
}

fn load_configs() -> Result<ConsumerConfigs, AmqpError> {
    let cfgs = match env::var("CONSUMER_CONFIG") {
        Ok(path) => ConsumerConfigs::from_file(path)?,
        Err(_) => ConsumerConfigs::default(),
    };

    cfgs.with_env()
}

async fn run() -> Result<(), AmqpError> {
    let cfgs = load_configs()?;
    info!(
        endpoint = cfgs.rabbitmq.endpoint(),
        queue = cfgs.queue_name,
        ack_mode = ?cfgs.ack_mode,
        prefetch = cfgs.prefetch,
        "starting consumer"
    );

    let consumer = RabbitMQConsumer::with_lapin(cfgs)?;
    consumer.start().await?;
    consumer.subscribe_configured(Arc::new(PrintHandler)).await?;

    tokio::select! {
        result = consumer.consume_blocking() => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = err.to_string(), "failure to listen for ctrl-c");
            }
            consumer.shutdown().await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), fatal = err.is_fatal(), "consumer stopped");
            ExitCode::FAILURE
        }
    }
}
