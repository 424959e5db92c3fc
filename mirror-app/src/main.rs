//! tgmirror: mirrors Telegram channel posts into mapped target channels.

mod commands;
mod config;
mod routes;
mod server;
mod settings;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "tgmirror", version, about = "Telegram channel mirror")]
struct Cli {
    /// Config file (defaults to ~/.tgmirror/config.toml).
    #[arg(long, global = true, env = "TGMIRROR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the mirror engine, Telegram intake, and HTTP status surface (default).
    Serve,
    /// Validate config and settings without contacting Telegram.
    Doctor,
    /// Print persisted mappings, toggles, and counters as JSON.
    Status,
    /// Mirror posts from a source chat into a target chat.
    #[command(allow_negative_numbers = true)]
    Map { source: i64, target: i64 },
    /// Stop mirroring a source chat.
    #[command(allow_negative_numbers = true)]
    Unmap { source: i64 },
    /// Remove every channel mapping.
    ClearMappings,
    /// Turn a mirror option on or off, e.g. `set batching_enabled on`.
    Set {
        option: String,
        #[arg(value_enum)]
        value: commands::Switch,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Status => server::status(cli.config).await,
        Command::Map { source, target } => commands::map(cli.config, source, target).await,
        Command::Unmap { source } => commands::unmap(cli.config, source).await,
        Command::ClearMappings => commands::clear_mappings(cli.config).await,
        Command::Set { option, value } => commands::set_option(cli.config, &option, value).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,tgmirror=debug,mirror_engine=debug,mirror_telegram=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("TGMIRROR_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported TGMIRROR_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["tgmirror"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn config_flag_applies_to_subcommands() {
        let cli = Cli::try_parse_from(["tgmirror", "status", "--config", "/etc/tgmirror.toml"])
            .expect("parse");
        assert!(matches!(cli.command, Some(Command::Status)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tgmirror.toml")));
    }

    #[test]
    fn map_accepts_negative_channel_ids() {
        let cli = Cli::try_parse_from(["tgmirror", "map", "-1001234", "-1005678"]).expect("parse");
        match cli.command {
            Some(Command::Map { source, target }) => {
                assert_eq!(source, -1001234);
                assert_eq!(target, -1005678);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn set_takes_an_on_off_switch() {
        let cli =
            Cli::try_parse_from(["tgmirror", "set", "smart_mode", "on"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Set { ref option, value: commands::Switch::On }) if option == "smart_mode"
        ));
        assert!(Cli::try_parse_from(["tgmirror", "set", "smart_mode", "maybe"]).is_err());
    }

    #[test]
    fn panic_payloads_render_as_strings() {
        assert_eq!(panic_payload_to_string(&"boom"), "boom");
        assert_eq!(panic_payload_to_string(&String::from("bang")), "bang");
        assert_eq!(panic_payload_to_string(&42_u8), "non-string panic payload");
    }
}
