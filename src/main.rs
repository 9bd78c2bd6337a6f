mod logging;
mod mail_reader;
mod settings;
mod web_services;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::{info, warn};

use crate::mail_reader::imap::Credentials;
use crate::mail_reader::summary::SummaryOptions;
use crate::settings::{load_settings, Config};

#[derive(Parser, Debug)]
#[command(name = "invoice_mail_reader", version, about = "Reads invoice mails from an IMAP mailbox")]
struct Cli {
    /// YAML settings file
    #[arg(long, global = true, default_value = "src/resources/settings.yaml")]
    config: PathBuf,

    /// Overrides the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the HTTP service (default)
    Serve,
    /// Prints message summaries as JSON
    List {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MAIL_APP_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Received on or after, YYYY-MM-DD
        #[arg(long)]
        after: Option<NaiveDate>,
        /// Received on or before, YYYY-MM-DD
        #[arg(long)]
        before: Option<NaiveDate>,
    },
    /// Prints full messages with their attachments as JSON
    Attachments {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MAIL_APP_PASSWORD", hide_env_values = true)]
        password: String,
        /// External message ids, e.g. "<1234@yahoo.imap>"
        #[arg(required = true)]
        message_uids: Vec<String>,
    },
}

fn read_config(cli: &Cli) -> Result<Config> {
    let config = if cli.config.exists() {
        load_settings(&cli.config)?
    } else {
        warn!("Settings {} not found, using defaults", cli.config.display());
        Config::default()
    };
    Ok(config.apply_env_overrides())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = read_config(&cli)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    logging::setup_logging(logging::parse_level(level))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("Starting invoice mail reader on port {}", config.server.port);
            web_services::entrypoint(config).await
        }
        Command::List { email, password, limit, after, before } => {
            let credentials = Credentials { email, app_password: password };
            let options = SummaryOptions {
                limit: limit.unwrap_or(config.fetch.default_limit),
                received_after: after,
                received_before: before,
            };
            mail_reader::print_summaries(&config, &credentials, &options).await
        }
        Command::Attachments { email, password, message_uids } => {
            let credentials = Credentials { email, app_password: password };
            mail_reader::print_full_messages(&config, &credentials, &message_uids).await
        }
    }
}
