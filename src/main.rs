//! CLI entry point for labwire
//!
//! ```bash
//! labwire serve --port 8765 --offline
//! labwire descriptors --uri http://10.7.0.2:8765
//! labwire query "serial:/dev/ttyUSB0?baud=9600&timeout=1.0" "++ver"
//! labwire tree bench.yaml --offline
//! labwire tree bench.yaml --dry-run
//! labwire index configs/
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labwire::broker::ChannelBroker;
use labwire::config::LabSettings;
use labwire::deps::BrokerDep;
use labwire::descriptor::{parse_descriptor, Descriptor};
use labwire::tree::{render_tree, ConfigIndex};
use labwire::{logging, InstrumentRegistry, Params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "labwire")]
#[command(about = "Descriptor-addressed instrument channels and instrument trees")]
#[command(version)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Settings file
    #[arg(long, global = true, default_value = labwire::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a broker over HTTP for remote clients
    Serve {
        /// Interface to bind (overrides settings)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides settings)
        #[arg(long)]
        port: Option<u16>,

        /// Simulate every channel
        #[arg(long)]
        offline: bool,

        /// Simulate channels whose native transport is missing
        #[arg(long)]
        dummy_fallback: bool,
    },

    /// List the descriptors a broker has open
    Descriptors {
        /// Remote broker URI; defaults to settings or BROKER_URI
        #[arg(long)]
        uri: Option<String>,
    },

    /// Send one command on a channel and print the reply
    Query {
        /// Channel descriptor, e.g. `dummy:bench`
        descriptor: String,

        /// Command text; for http descriptors, the path to GET
        command: String,

        /// Remote broker URI; a local broker is used when absent
        #[arg(long)]
        uri: Option<String>,
    },

    /// Build an instrument tree from YAML and print it
    Tree {
        /// YAML file with the root instrument
        file: PathBuf,

        /// Simulate every channel
        #[arg(long)]
        offline: bool,

        /// Validate and list the configuration without opening any channel
        #[arg(long)]
        dry_run: bool,
    },

    /// Index the YAML configs in a directory by instrument type
    Index {
        /// Directory to scan
        dir: PathBuf,

        /// Index cache file (defaults to a file inside the directory)
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Only list files of this instrument type
        #[arg(long)]
        kind: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json_logs);

    let settings = LabSettings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            offline,
            dummy_fallback,
        } => serve(settings, host, port, offline, dummy_fallback),
        Commands::Descriptors { uri } => descriptors(&settings, uri),
        Commands::Query {
            descriptor,
            command,
            uri,
        } => query(&settings, &descriptor, &command, uri),
        Commands::Tree {
            file,
            offline,
            dry_run,
        } => tree(&settings, &file, offline, dry_run),
        Commands::Index { dir, cache, kind } => index(dir, cache, kind),
    }
}

fn serve(
    mut settings: LabSettings,
    host: Option<String>,
    port: Option<u16>,
    offline: bool,
    dummy_fallback: bool,
) -> Result<()> {
    if let Some(host) = host {
        settings.broker.bind_host = host;
    }
    if let Some(port) = port {
        settings.broker.port = port;
    }
    settings.broker.offline |= offline;
    settings.broker.dummy_fallback |= dummy_fallback;
    if settings.broker.port == 0 {
        bail!("broker.port must be non-zero to serve");
    }

    let broker = Arc::new(ChannelBroker::with_options(settings.broker.broker_options()));
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(settings.broker.bind_addr()).await?;
        info!(
            offline = settings.broker.offline,
            dummy_fallback = settings.broker.dummy_fallback,
            "starting broker"
        );
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        };
        labwire::broker::server::serve(listener, broker.clone(), shutdown).await?;
        let closed = broker.close_all();
        info!(closed, "broker channels closed");
        Ok::<(), anyhow::Error>(())
    })
}

fn descriptors(settings: &LabSettings, uri: Option<String>) -> Result<()> {
    let Some(uri) = uri.or_else(|| settings.broker.uri.clone()) else {
        bail!("no broker URI; pass --uri or set BROKER_URI");
    };
    let broker = BrokerDep::remote(&uri)?;
    for descriptor in broker.list_descriptors()? {
        println!("{descriptor}");
    }
    Ok(())
}

fn query(settings: &LabSettings, descriptor: &str, command: &str, uri: Option<String>) -> Result<()> {
    let broker = match uri {
        Some(uri) => BrokerDep::remote(&uri)?,
        None => BrokerDep::local(Arc::new(ChannelBroker::with_options(
            settings.broker.broker_options(),
        ))),
    };

    let reply = match parse_descriptor(descriptor)? {
        Descriptor::Serial { .. } => broker.serial(descriptor)?.query(command)?,
        Descriptor::Visa { .. } => broker.visa(descriptor)?.query(command)?,
        Descriptor::Dummy { .. } => broker.dummy(descriptor)?.query(command)?,
        Descriptor::Http { .. } => {
            let body = broker.http(descriptor)?.get(command)?;
            String::from_utf8_lossy(&body).into_owned()
        }
    };
    println!("{}", reply.trim_end());
    Ok(())
}

fn tree(settings: &LabSettings, file: &Path, offline: bool, dry_run: bool) -> Result<()> {
    let params = Params::load(file)?;
    if dry_run {
        print!("{}", render_params(&params));
        return Ok(());
    }
    let mut options = settings.broker.broker_options();
    options.offline |= offline;

    let registry = Arc::new(InstrumentRegistry::standard());
    let mut root = registry
        .build_root(params, options)
        .with_context(|| format!("building tree from {}", file.display()))?;
    println!("{}", render_tree(root.as_ref()));

    root.disconnect()?;
    Ok(())
}

/// Indented `key: type` listing of a configuration.
fn render_params(root: &Params) -> String {
    fn walk(out: &mut String, params: &Params, depth: usize) {
        for (key, child) in params.children() {
            out.push_str(&format!("{:indent$}{key}: {}\n", "", child.kind(), indent = depth * 2));
            walk(out, child, depth + 1);
        }
    }

    let mut out = match root.child_count() {
        Some(n) => format!("{} ({n} children)\n", root.kind()),
        None => format!("{}\n", root.kind()),
    };
    walk(&mut out, root, 1);
    out
}

fn index(dir: PathBuf, cache: Option<PathBuf>, kind: Option<String>) -> Result<()> {
    let mut index = match cache {
        Some(cache) => ConfigIndex::with_cache(dir, cache),
        None => ConfigIndex::new(dir),
    };
    match kind {
        Some(kind) => {
            for path in index.files_for(&kind)? {
                println!("{}", path.display());
            }
        }
        None => {
            for (kind, paths) in &index.load()?.kinds {
                println!("{kind}: {} file(s)", paths.len());
                for path in paths {
                    println!("  {}", path.display());
                }
            }
        }
    }
    Ok(())
}
