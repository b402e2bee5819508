use crate::commands;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rigger_core::redaction::RedactionConfig;
use rigger_core::settings::Settings;
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Agent subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a build job: download, build and store the artifact
    Build {
        /// Id of the stored build job
        job_id: String,
    },
    /// Run a release job: fetch the artifact and deploy it
    Deploy {
        /// Id of the stored release job
        job_id: String,
    },
    /// Check an image against the configured allow-list
    CheckImage {
        /// Image reference, e.g. `node:20`
        image: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Build and deployment agent",
    long_about = "Build and deployment agent\n\nRuns build jobs in throwaway Docker containers and deploys the resulting artifacts to remote hosts.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via RIGGER_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Agent settings file (defaults to RIGGER_CONFIG, then the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Secrets file path (KEY=VALUE format, can be specified multiple times)
    #[arg(long, global = true, value_name = "PATH")]
    pub secrets_file: Vec<PathBuf>,

    /// Disable secret redaction in output (debugging only - WARNING: may expose secrets)
    #[arg(long, global = true)]
    pub no_redact: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn init_logging(&self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };

        if std::env::var_os("RIGGER_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            let level = self.log_level.as_str();
            std::env::set_var("RUST_LOG", format!("rigger={},rigger_core={}", level, level));
        }
        rigger_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", self.log_level.as_str());
        Ok(())
    }

    fn redaction(&self) -> RedactionConfig {
        if self.no_redact {
            tracing::warn!("Secret redaction is DISABLED via --no-redact flag. Use only for debugging purposes!");
            RedactionConfig::disabled()
        } else {
            RedactionConfig::default()
        }
    }

    /// Initialise logging, load settings and run the selected subcommand
    ///
    /// A failed job surfaces as a [`StageFailure`](rigger_core::pipeline::StageFailure)
    /// inside the returned error so `main` can map it to an exit code.
    pub async fn dispatch(self) -> Result<()> {
        self.init_logging()?;
        let settings = Settings::load(self.config.as_deref())?;
        let redaction = self.redaction();

        match &self.command {
            Commands::Build { job_id } => {
                let agent = commands::agent::Agent::new(&settings, redaction, &self.secrets_file)?;
                agent.build(job_id).await
            }
            Commands::Deploy { job_id } => {
                let agent = commands::agent::Agent::new(&settings, redaction, &self.secrets_file)?;
                agent.deploy(job_id).await
            }
            Commands::CheckImage { image } => {
                let output = commands::check_image::execute(&settings, image)?;
                println!("{}", output);
                Ok(())
            }
        }
    }
}
