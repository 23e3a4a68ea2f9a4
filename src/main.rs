use anyhow::{Context, Result};
use clap::Parser;
use ldap_engine::config::EntryConfig;
use ldap_engine::server::parse_listen_url;
use ldap_engine::tls;
use ldap_engine::{run_metrics_server, Config, LdapServer, MemoryDirectory, Metrics};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-engine")]
#[command(about = "LDAPv3 server backed by an in-memory directory")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// YAML file with additional directory entries (a list of dn + attributes)
    #[arg(short, long, value_name = "FILE")]
    entries: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_engine={},info", log_level))
        .init();

    info!("Starting ldap-engine");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path).with_context(|| format!("Load config {:?}", path))?
        }
        None => {
            info!("No configuration file given; using defaults");
            Config::default()
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    config.server.validate()?;
    if let Some(path) = &args.entries {
        let content = std::fs::read_to_string(path).with_context(|| format!("Read entries {:?}", path))?;
        let extra: Vec<EntryConfig> = serde_yaml::from_str(&content).context("Parse entries file")?;
        config.entries.extend(extra);
    }

    let options = config.server.clone();
    info!("Configuration loaded:");
    info!("  Listen URL: {}", options.listen);
    info!("  Entries: {}", config.entries.len());
    info!("  Require authentication: {}", options.require_authentication);
    info!("  Anonymous binds: {}", options.allow_anonymous);

    let tls_config = match (&options.ssl_cert_file, &options.ssl_key_file) {
        (Some(cert_file), Some(key_file)) => {
            tls::validate_tls_files(cert_file, key_file, options.ssl_ca_file.as_deref())?;
            let server_config =
                tls::load_server_config_from_files(cert_file, key_file, options.ssl_ca_file.as_deref())?;
            info!("TLS enabled for listener ({})", if options.is_ldaps() { "LDAPS" } else { "StartTLS" });
            Some(server_config)
        }
        _ => None,
    };

    let directory = MemoryDirectory::from_config(&config.entries)?;
    let metrics = Arc::new(Metrics::new());
    let ready = Arc::new(AtomicBool::new(false));

    if let Some(addr) = options.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let ready_flag = Arc::clone(&ready);
        let is_ready = Arc::new(move || ready_flag.load(Ordering::Relaxed));
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, is_ready).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let addr = parse_listen_url(&options.listen)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    ready.store(true, Ordering::Relaxed);

    let server = LdapServer::new(options, Arc::new(directory), metrics, tls_config);
    server.run(listener).await?;

    Ok(())
}
