use anyhow::Result;
use clap::Parser;
use pgbackrest_exporter::{
    collector::Collector,
    config::{parse_key_value, Settings},
    metrics::MetricsStore,
    scrape::Scraper,
    server::start_server,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// pgBackRest Exporter - executes commands, interprets their output as pgBackRest
/// JSON status information and exposes it as Prometheus metrics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Print version
    #[arg(long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Path to configuration file
    #[arg(long, value_name = "FILE", env = "PGBACKREST_EXPORTER_CONFIG")]
    config: Option<String>,

    /// Target name and command to execute, repeatable
    #[arg(short = 'c', long = "command", value_name = "NAME=COMMAND", value_parser = parse_key_value)]
    commands: Vec<(String, String)>,

    /// Target name and file holding the command to execute, repeatable
    #[arg(short = 'f', long = "file", value_name = "NAME=FILE", value_parser = parse_key_value)]
    files: Vec<(String, String)>,

    /// Address to listen on
    #[arg(short = 'l', long, value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Host to bind to, replaces the host of the listen address
    #[arg(short = 'H', long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind to, replaces the port of the listen address
    #[arg(short = 'P', long, value_name = "PORT")]
    port: Option<u16>,

    /// Path to serve metrics on
    #[arg(
        short = 'p',
        long,
        value_name = "PATH",
        visible_short_alias = 'U',
        visible_alias = "path"
    )]
    metrics_path: Option<String>,

    /// Produce verbose output
    #[arg(short = 'V', long, visible_short_alias = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration and merge command-line overrides
    let mut settings = Settings::load(args.config.as_deref())?;
    for (name, command) in args.commands {
        settings.add_target(name, command);
    }
    for (name, path) in args.files {
        settings.add_target_file(name, path);
    }
    if let Some(listen_address) = args.listen_address {
        settings.exporter.listen_address = listen_address;
    }
    settings
        .exporter
        .override_listen(args.host.as_deref(), args.port);
    if let Some(metrics_path) = args.metrics_path {
        settings.exporter.metrics_path = metrics_path;
    }
    if args.verbose {
        settings.exporter.log_level = "info".to_string();
    }

    // Initialize logging
    init_logging(&settings.exporter.log_level)?;

    let targets = settings.resolve_targets()?;

    info!("Starting pgBackRest Exporter");
    info!("Targets: {}", targets.keys().cloned().collect::<Vec<_>>().join(", "));
    info!("Listen address: {}", settings.exporter.listen_address);

    // Create metric store, collector and scraper
    let store = Arc::new(MetricsStore::new()?);
    let collector = Arc::new(Collector::new(
        Arc::clone(&store),
        settings.exporter.command_timeout(),
    ));
    let scraper = Arc::new(Scraper::new(collector, Arc::new(targets)));
    info!("Metric store initialized");

    // Start HTTP server
    if let Err(e) = start_server(
        &settings.exporter.listen_address,
        &settings.exporter.metrics_path,
        store,
        scraper,
    )
    .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Initialize structured logging with tracing.
fn init_logging(log_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_short_args() {
        let args = Args::try_parse_from([
            "pgbackrest-exporter",
            "-l",
            "0.0.0.0:8080",
            "-p",
            "/mertics",
            "-c",
            "cfoo=cbar",
            "-c",
            "cbar=cbaz",
            "-f",
            "ffoo=fbar",
            "-f",
            "fbar=fbaz",
        ])
        .unwrap();

        assert_eq!(args.listen_address.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(args.metrics_path.as_deref(), Some("/mertics"));
        assert_eq!(
            args.commands,
            vec![
                ("cfoo".to_string(), "cbar".to_string()),
                ("cbar".to_string(), "cbaz".to_string())
            ]
        );
        assert_eq!(
            args.files,
            vec![
                ("ffoo".to_string(), "fbar".to_string()),
                ("fbar".to_string(), "fbaz".to_string())
            ]
        );
        assert!(!args.verbose);
    }

    #[test]
    fn test_long_args() {
        let args = Args::try_parse_from([
            "pgbackrest-exporter",
            "--listen-address",
            "127.0.0.1:9854",
            "--metrics-path",
            "/metrics",
            "--command",
            "main=pgbackrest info --output=json",
            "--file",
            "standby=/etc/pgbackrest-exporter/standby.cmd",
            "--verbose",
        ])
        .unwrap();

        assert_eq!(args.listen_address.as_deref(), Some("127.0.0.1:9854"));
        assert_eq!(
            args.commands,
            vec![(
                "main".to_string(),
                "pgbackrest info --output=json".to_string()
            )]
        );
        assert_eq!(args.files.len(), 1);
        assert!(args.verbose);
    }

    #[test]
    fn test_legacy_flags() {
        let args = Args::try_parse_from([
            "pgbackrest-exporter",
            "-H",
            "127.0.0.1",
            "-P",
            "9854",
            "-U",
            "/probe",
            "-V",
            "-c",
            "main=pgbackrest info --output=json",
        ])
        .unwrap();

        assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(9854));
        assert_eq!(args.metrics_path.as_deref(), Some("/probe"));
        assert!(args.verbose);

        let args = Args::try_parse_from(["pgbackrest-exporter", "--path", "/probe", "-v"]).unwrap();
        assert_eq!(args.metrics_path.as_deref(), Some("/probe"));
        assert!(args.verbose);
    }

    #[test]
    fn test_version_flag_is_long_only() {
        let err = Args::try_parse_from(["pgbackrest-exporter", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_invalid_key_value_rejected() {
        let result = Args::try_parse_from(["pgbackrest-exporter", "--command", "nokeyvalue"]);
        assert!(result.is_err());
    }
}
