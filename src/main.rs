mod config;
mod dispatcher;
mod dns_header;
mod dns_message;
mod dns_question_and_answer;
mod formatter;
mod forwarder;
mod query;
mod rdata;
mod resolver;
mod server;
mod zonefile;
mod zones;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{CliOverrides, Config};
use dispatcher::QueryDispatcher;
use forwarder::Forwarder;
use server::DnsServer;
use zones::ZoneCollection;

#[derive(Parser, Debug)]
#[command(name = "zone-dns-server")]
#[command(version)]
#[command(about = "DNS server answering from static JSON zones and forwarding everything else")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the DNS server (the default)
    Serve(ServeArgs),

    /// Convert an RFC 1035 zone file into a JSON zone
    Import {
        zonefile: PathBuf,

        json: PathBuf,

        /// Zone origin; defaults to $ORIGIN, then the JSON file name
        #[arg(long)]
        origin: Option<String>,
    },

    /// Convert a JSON zone into an RFC 1035 zone file
    Export {
        json: PathBuf,

        zonefile: PathBuf,

        /// Zone origin; defaults to the JSON file name
        #[arg(long)]
        origin: Option<String>,

        /// Value of the $TTL directive
        #[arg(long, default_value_t = zonefile::DEFAULT_EXPORT_TTL)]
        ttl: u32,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen_address: Option<String>,

    /// UDP port to listen on
    #[arg(long)]
    listen_port: Option<u16>,

    /// Upstream resolvers, comma-separated (e.g., 8.8.8.8,1.1.1.1:53)
    #[arg(long)]
    forwarders: Option<String>,

    /// Directory holding <zone>.json files
    #[arg(long, value_name = "DIR")]
    zones_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            forwarders: self.forwarders.clone(),
            zones_dir: self.zones_dir.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

/// RUST_LOG, when set, wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref(), args.overrides())?;

    init_logging(&config.logging.level);
    config.validate()?;

    info!("Starting zone DNS server v{}", env!("CARGO_PKG_VERSION"));

    let (zones, partial) = ZoneCollection::load(&config.zones.directory).into_parts();
    if let Some(partial) = partial {
        warn!(error = %partial, "Zone load incomplete");
    }
    if zones.is_empty() {
        warn!(directory = %config.zones.directory.display(), "No zones loaded, forwarding every query");
    } else {
        info!(zones = zones.len(), "Zones ready");
    }

    let forwarder = Forwarder::new(config.forward_policy()?);
    info!(
        forwarders = ?forwarder.policy().upstreams,
        strategy = ?forwarder.policy().strategy,
        timeout = ?forwarder.policy().timeout,
        "Forwarding configured"
    );

    let dispatcher = QueryDispatcher::new(Arc::new(zones), forwarder);
    let server = DnsServer::new(config.listen_socket_addr()?, dispatcher, config.server.workers)?;

    server.run()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Serve(args)) => serve(args),
        None => serve(cli.serve),
        Some(Command::Import {
            zonefile: source,
            json,
            origin,
        }) => {
            init_logging("info");
            zonefile::import_file(&source, &json, origin.as_deref())
                .with_context(|| format!("failed to convert {}", source.display()))?;
            Ok(())
        }
        Some(Command::Export {
            json,
            zonefile: destination,
            origin,
            ttl,
        }) => {
            init_logging("info");
            zonefile::export_file(&json, &destination, origin.as_deref(), ttl)
                .with_context(|| format!("failed to export {}", json.display()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["zone-dns-server", "--listen-port", "5300", "--forwarders", "1.1.1.1,9.9.9.9"]).unwrap();

        assert!(cli.command.is_none());
        let overrides = cli.serve.overrides();
        assert_eq!(overrides.listen_port, Some(5300));
        assert_eq!(overrides.forwarders.as_deref(), Some("1.1.1.1,9.9.9.9"));
    }

    #[test]
    fn test_cli_converter_subcommands() {
        let cli = Cli::try_parse_from(["zone-dns-server", "export", "zones/example.com.json", "out.zone"]).unwrap();

        match cli.command {
            Some(Command::Export { ttl, origin, .. }) => {
                assert_eq!(ttl, zonefile::DEFAULT_EXPORT_TTL);
                assert_eq!(origin, None);
            }
            other => panic!("expected export, got {:?}", other),
        }

        let cli = Cli::try_parse_from(["zone-dns-server", "import", "db.example", "example.com.json", "--origin", "example.com"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Import { origin: Some(_), .. })));
    }
}
