//! cdac - Client Device Authentication Core CLI
//!
//! Offline-capable administration of the local certificate authority: bring
//! up a managed or custom CA, issue one-off client/server leaves against
//! it, and run the policy evaluator against a recorded session for testing
//! device-group rules before they go live.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use client_device_auth_core::adapters::{FileKeyProvider, FileRuntimeStore, RcgenX509Adapter};
use client_device_auth_core::ca::issuer::CertificateIssuer;
use client_device_auth_core::ca::CaStore;
use client_device_auth_core::config::Config;
use client_device_auth_core::events::DomainEventBus;
use client_device_auth_core::ports::key_provider::SchemeRouter;
use client_device_auth_core::ports::x509::X509Port;
use client_device_auth_core::session::manager::Session;
use client_device_auth_core::session::policy::{GroupManager, PolicyEvaluator};
use client_device_auth_core::types::DistinguishedName;

#[derive(Parser)]
#[command(name = "cdac")]
#[command(about = "Client device authentication core administration tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding the runtime key/value store (CA keystore, cached
    /// identity records).
    #[arg(short, long, global = true, default_value = "./cdac-state")]
    state_dir: PathBuf,

    /// Path to a TOML configuration file (defaults applied if absent).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the managed CA, generating one if none is persisted yet.
    CaInit {
        /// Passphrase protecting the persisted keystore. A fresh random
        /// passphrase is generated (and printed) when none is supplied and
        /// no keystore yet exists.
        #[arg(long)]
        passphrase: Option<String>,
    },

    /// Print the active CA's certificate chain, leaf-first.
    CaShow,

    /// Issue a one-off client-auth leaf certificate and print it.
    IssueClient {
        /// Common name for the leaf subject.
        #[arg(long)]
        common_name: String,
    },

    /// Issue a one-off server-auth leaf certificate and print it.
    IssueServer {
        /// Common name for the leaf subject.
        #[arg(long)]
        common_name: String,

        /// SAN hosts/addresses beyond the always-included `localhost`.
        #[arg(long = "san", value_delimiter = ',')]
        sans: Vec<String>,
    },

    /// Evaluate `authorize(operation, resource)` for a synthetic session
    /// carrying the given Thing name, against the configured device groups.
    Authorize {
        /// `Thing.ThingName` attribute to populate on the test session.
        #[arg(long)]
        thing_name: String,

        /// `service:action` operation string.
        #[arg(long)]
        operation: String,

        /// `service:type:name` resource string.
        #[arg(long)]
        resource: String,
    },

    /// Write an example configuration file.
    CreateExampleConfig {
        /// Output path.
        #[arg(short, long, default_value = "cdac.example.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
    } else {
        tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::CaInit { passphrase } => ca_init_command(&cli.state_dir, &config, passphrase).await?,
        Commands::CaShow => ca_show_command(&cli.state_dir, &config).await?,
        Commands::IssueClient { common_name } => issue_client_command(&cli.state_dir, &config, common_name).await?,
        Commands::IssueServer { common_name, sans } => {
            issue_server_command(&cli.state_dir, &config, common_name, sans).await?
        }
        Commands::Authorize { thing_name, operation, resource } => {
            authorize_command(&config, thing_name, operation, resource)?
        }
        Commands::CreateExampleConfig { output } => {
            Config::default().save(&output)?;
            println!("wrote example configuration to {}", output.display());
        }
    }

    Ok(())
}

async fn build_ca_store(state_dir: &PathBuf) -> Result<(Arc<CaStore>, Arc<RcgenX509Adapter>), Box<dyn std::error::Error>> {
    let bus = Arc::new(DomainEventBus::new());
    let x509 = Arc::new(RcgenX509Adapter::new());
    let store = Arc::new(FileRuntimeStore::new(state_dir).await?);
    let mut router = SchemeRouter::new();
    router.register("file", Box::new(FileKeyProvider::new()));
    let ca_store = Arc::new(CaStore::new(x509.clone(), store, Arc::new(router), bus));
    Ok((ca_store, x509))
}

async fn ca_init_command(state_dir: &PathBuf, config: &Config, passphrase: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let (ca_store, _x509) = build_ca_store(state_dir).await?;
    let algorithm = config.certificate_authority.key_algorithm();

    if config.certificate_authority.is_custom() {
        let chain_uri = config.certificate_authority.certificate_chain_uri.as_deref();
        ca_store
            .load_custom(
                config.certificate_authority.private_key_uri.as_deref().unwrap(),
                config.certificate_authority.certificate_uri.as_deref().unwrap(),
                chain_uri,
            )
            .await?;
        println!("loaded custom CA from {:?}", config.certificate_authority.private_key_uri);
        return Ok(());
    }

    let passphrase = passphrase.unwrap_or_else(|| "cdac-default-bootstrap-passphrase".to_string());
    let loaded = ca_store.load_or_create_managed(&passphrase, algorithm).await?;
    println!("managed CA ready: {}", loaded.ca.leaf().subject.to_display_string());
    if loaded.passphrase != passphrase {
        println!("a new keystore was generated; record this passphrase: {}", loaded.passphrase);
    }
    Ok(())
}

async fn ca_show_command(state_dir: &PathBuf, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (ca_store, _x509) = build_ca_store(state_dir).await?;
    let algorithm = config.certificate_authority.key_algorithm();
    ca_store.load_or_create_managed("cdac-default-bootstrap-passphrase", algorithm).await?;
    for pem in ca_store.ca_certificates() {
        println!("{pem}");
    }
    Ok(())
}

async fn issue_client_command(state_dir: &PathBuf, config: &Config, common_name: String) -> Result<(), Box<dyn std::error::Error>> {
    let (ca_store, x509) = build_ca_store(state_dir).await?;
    let algorithm = config.certificate_authority.key_algorithm();
    ca_store.load_or_create_managed("cdac-default-bootstrap-passphrase", algorithm).await?;

    let issuer = CertificateIssuer::new(x509.clone() as Arc<dyn X509Port>);
    let ca = ca_store.active();
    let key_pair = x509.generate_key_pair(algorithm)?;
    let leaf = issuer.issue_client(&ca, &DistinguishedName::with_common_name(common_name), &key_pair, config.certificates.client_validity())?;
    println!("{}", leaf.pem);
    Ok(())
}

async fn issue_server_command(
    state_dir: &PathBuf,
    config: &Config,
    common_name: String,
    sans: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (ca_store, x509) = build_ca_store(state_dir).await?;
    let algorithm = config.certificate_authority.key_algorithm();
    ca_store.load_or_create_managed("cdac-default-bootstrap-passphrase", algorithm).await?;

    let issuer = CertificateIssuer::new(x509.clone() as Arc<dyn X509Port>);
    let ca = ca_store.active();
    let key_pair = x509.generate_key_pair(algorithm)?;
    let leaf = issuer.issue_server(
        &ca,
        &DistinguishedName::with_common_name(common_name),
        &key_pair,
        config.certificates.server_validity(),
        &sans,
    )?;
    println!("{}", leaf.pem);
    Ok(())
}

fn authorize_command(config: &Config, thing_name: String, operation: String, resource: String) -> Result<(), Box<dyn std::error::Error>> {
    let group_manager = GroupManager::new(config.device_groups.clone());
    let evaluator = PolicyEvaluator::new(group_manager);

    let mut attributes = HashMap::new();
    attributes.insert("Thing.ThingName".to_string(), thing_name);
    let session = Session { session_id: "cdac-cli-session".to_string(), attributes };

    let decision = evaluator.authorize(&session, &operation, &resource)?;
    println!("{}", if decision { "ALLOWED" } else { "DENIED" });
    Ok(())
}
