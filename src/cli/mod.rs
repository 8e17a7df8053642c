//! Command line front end: argument parsing, settings overrides, and the
//! interactive producer and consumer sessions.

pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use crate::client::{AckLevel, BrokerClient, StartOffset};
use crate::config::{Settings, load_config_from, split_brokers};
use crate::consumer::{Consumer, ConsumerConfig};
use crate::producer::{self, ProducerConfig, ProducerMode};
use crate::utils::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Produce,
    Consume,
}

/// How the interactive producer reads records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Name and message prompts, sent as a JSON record keyed by name.
    Json,
    /// One line per message, sent as is.
    Raw,
}

#[derive(Debug, Parser)]
#[command(
    name = "partlog",
    version,
    about = "Interactive producer and consumer for a partitioned log"
)]
pub struct Cli {
    /// Comma separated host:port list, or `memory` / `memory://<dir>`.
    /// Falls back to the config file and KAFKA_PEERS.
    #[arg(long, value_name = "LIST")]
    pub brokers: Option<String>,

    /// Topic to produce to or consume from [default: golangmessages]
    #[arg(long)]
    pub topic: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Produce)]
    pub mode: Mode,

    /// Acknowledgement level: none, leader or all
    #[arg(long, value_name = "LEVEL")]
    pub ack: Option<AckLevel>,

    /// Queue messages and deliver them in the background
    #[arg(long = "async")]
    pub async_send: bool,

    #[arg(long, value_enum, default_value_t = Format::Json)]
    pub format: Format,

    /// Where the consumer starts: oldest or newest
    #[arg(long, value_name = "POSITION")]
    pub from: Option<StartOffset>,

    /// Configuration file (toml, yaml or json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log broker client diagnostics
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Load the layered configuration, apply the flags on top and validate.
    pub fn settings(&self) -> Result<Settings, Error> {
        let mut settings = load_config_from(self.config.as_deref())?;
        self.apply(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Flags win over every other configuration source.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(brokers) = &self.brokers {
            settings.brokers = split_brokers(brokers);
        }
        if let Some(topic) = &self.topic {
            settings.topic = topic.clone();
        }
        if let Some(ack) = self.ack {
            settings.producer.acks = ack;
        }
        if self.async_send {
            settings.producer.mode = ProducerMode::Async;
        }
        if let Some(from) = self.from {
            settings.consumer.start = from;
        }
        if self.verbose && settings.log_level == "info" {
            settings.log_level = "debug".to_string();
        }
    }
}

/// Run the session `cli.mode` selects against an already connected client.
pub async fn run(cli: &Cli, settings: &Settings, client: Arc<dyn BrokerClient>) -> Result<(), Error> {
    match cli.mode {
        Mode::Produce => run_producer(cli.format, settings, client).await,
        Mode::Consume => run_consumer(settings, client).await,
    }
}

async fn run_producer(
    format: Format,
    settings: &Settings,
    client: Arc<dyn BrokerClient>,
) -> Result<(), Error> {
    let config = ProducerConfig::from(&settings.producer);
    info!(
        topic = %settings.topic,
        brokers = %settings.brokers.join(","),
        mode = ?config.mode,
        acks = %config.acks,
        "starting producer"
    );
    let producer = producer::build(client, &settings.topic, config);

    let failures = producer.take_errors().map(|mut errors| {
        tokio::spawn(async move {
            while let Some(failure) = errors.recv().await {
                error!(
                    topic = %failure.message.topic,
                    error = %failure.error,
                    "Failed to store your data"
                );
            }
        })
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let outcome = session::produce_lines(producer.as_ref(), format, stdin, &mut stdout).await;

    // close even if the session broke off, so buffered messages are handled
    let report = producer.close().await;
    if let Some(failures) = failures {
        if let Err(e) = failures.await {
            warn!(error = %e, "failure reporter ended abnormally");
        }
    }

    let summary = outcome?;
    let report = report?;
    info!(
        sent = summary.sent,
        failed = summary.failed + report.failed,
        discarded = report.discarded,
        "producer finished"
    );
    Ok(())
}

async fn run_consumer(settings: &Settings, client: Arc<dyn BrokerClient>) -> Result<(), Error> {
    let consumer = Consumer::new(client.clone(), ConsumerConfig::from(&settings.consumer));
    info!(
        topic = %settings.topic,
        brokers = %settings.brokers.join(","),
        start = ?consumer.config().start,
        "starting consumer"
    );

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let stdin = BufReader::new(tokio::io::stdin());
    let outcome =
        session::consume_until(&consumer, &settings.topic, stdin, std::io::stdout(), stop).await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "failed to shut down the broker client cleanly");
    }

    let report = outcome?;
    info!(
        delivered = report.delivered,
        failed_partitions = ?report.failed_partitions,
        "consumer finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests;
