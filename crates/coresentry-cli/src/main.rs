#![deny(unsafe_code)]

//! coresentry CLI: runs the privileged daemon and talks to it.

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand::rngs::OsRng;
use tracing::info;

use coresentry_config::{APP_DIR_NAME, AppConfig, LoggingConfig, config_dir};
use coresentry_core::auth::{AuthError, AuthGate, encode_public_key_base64};
use coresentry_core::ipc::{Endpoint, IpcClient, Response};
use coresentry_core::sys::DeviceScope;
use coresentry_core::{Daemon, build_info, logging};

/// coresentry: supervises the core proxy and guards it behind a signed
/// local control API.
#[derive(Parser)]
#[command(name = "coresentry", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "coresentry.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Connect to this local socket or pipe instead of the configured one.
    #[arg(long, global = true)]
    socket: Option<String>,

    /// Connect over the loopback TCP listener.
    #[arg(long, global = true)]
    tcp: bool,

    /// PKCS#8 PEM signing key used for authenticated commands.
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Serve,

    /// Install the trusted client public key (operator only).
    InitKey {
        /// Base64 DER SubjectPublicKeyInfo of the client key.
        #[arg(short = 'k', long)]
        public_key: String,
    },

    /// Generate a client signing key and print its public half.
    Keygen {
        /// Where to write the private key.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Overwrite an existing key file.
        #[arg(long)]
        force: bool,
    },

    /// Unauthenticated liveness check.
    Ping,

    /// Check that the daemon accepts this client's signature.
    Test,

    /// Manage the core process.
    Core {
        #[command(subcommand)]
        action: CoreAction,
    },

    /// Inspect or change the system proxy.
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },

    /// Set the DNS servers of a network service.
    Dns {
        /// Network service name.
        #[arg(long)]
        device: String,

        /// DNS servers; none resets to DHCP.
        servers: Vec<String>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print build details.
    Version,
}

#[derive(Subcommand)]
enum CoreAction {
    Status,
    Start,
    Stop,
    Restart,
    Health,
}

#[derive(Subcommand)]
enum ProxyAction {
    Status,
    /// Point the system at a PAC URL.
    Pac {
        url: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set the web and secure web proxy.
    Set {
        /// `host:port`
        server: String,
        /// Comma separated bypass domains.
        #[arg(long, default_value = "")]
        bypass: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Turn off every proxy kind.
    Disable {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(Args)]
struct ScopeArgs {
    /// Only this network service.
    #[arg(long)]
    device: Option<String>,

    /// Only services with an assigned address.
    #[arg(long)]
    only_active: bool,
}

impl From<&ScopeArgs> for DeviceScope {
    fn from(args: &ScopeArgs) -> Self {
        DeviceScope {
            device: args.device.clone(),
            only_active: args.only_active,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let log_config = if matches!(cli.command, Commands::Serve) {
        config.logging.clone()
    } else {
        LoggingConfig {
            level: "warn".to_string(),
            file: None,
        }
    };
    logging::init(&log_config, cli.verbose)?;

    match &cli.command {
        Commands::Serve => cmd_serve(config).await?,
        Commands::InitKey { public_key } => cmd_init_key(&config, public_key)?,
        Commands::Keygen { out, force } => cmd_keygen(out.clone(), *force)?,
        Commands::Ping => print_envelope(client(&cli, &config, false)?.ping().await?),
        Commands::Test => print_envelope(client(&cli, &config, true)?.test().await?),
        Commands::Core { action } => cmd_core(client(&cli, &config, true)?, action).await?,
        Commands::Proxy { action } => cmd_proxy(client(&cli, &config, true)?, action).await?,
        Commands::Dns { device, servers } => {
            print_envelope(client(&cli, &config, true)?.set_dns(device, servers).await?)
        }
        Commands::Config { show } => cmd_config(&cli.config, &config, *show)?,
        Commands::Version => println!("{}", build_info::long_version()),
    }

    Ok(())
}

async fn cmd_serve(config: AppConfig) -> Result<()> {
    info!(version = %build_info::version_string(), "Starting coresentry daemon");
    let daemon = Daemon::new(config);
    daemon.run().await?;
    Ok(())
}

fn cmd_init_key(config: &AppConfig, public_key: &str) -> Result<()> {
    let key_dir = config.auth.resolved_key_dir();
    let drift = Duration::from_secs(config.auth.max_drift_secs);
    let gate = match AuthGate::open(&key_dir, drift) {
        Ok(gate) => gate,
        Err(e @ AuthError::Io { .. }) => return Err(e.into()),
        // A broken old key must not block replacing it.
        Err(_) => AuthGate::new(&key_dir, drift),
    };
    gate.set_public_key(public_key)
        .context("failed to install public key")?;
    println!("Trusted public key saved to {}", gate.key_path().display());
    println!("Restart the daemon for it to take effect.");
    Ok(())
}

fn default_client_key_path() -> PathBuf {
    config_dir().join(APP_DIR_NAME).join("client_key.pem")
}

fn cmd_keygen(out: Option<PathBuf>, force: bool) -> Result<()> {
    let path = out.unwrap_or_else(default_client_key_path);
    let key = SigningKey::generate(&mut OsRng);
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow!("failed to encode private key: {e}"))?;
    write_private_key(&path, pem.as_bytes(), force)?;

    let public = encode_public_key_base64(&key.verifying_key())?;
    eprintln!("Private key written to {}", path.display());
    println!("{public}");
    Ok(())
}

/// Write `pem` readable by the owner only.
fn write_private_key(path: &Path, pem: &[u8], force: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create key file {}", path.display()))?;
    file.write_all(pem)?;
    Ok(())
}

fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read signing key {}", path.display()))?;
    SigningKey::from_pkcs8_pem(&pem)
        .map_err(|e| anyhow!("invalid signing key {}: {e}", path.display()))
}

fn endpoint(cli: &Cli, config: &AppConfig) -> Result<Endpoint> {
    if cli.tcp {
        let ip: IpAddr = config
            .daemon
            .tcp_addr
            .parse()
            .with_context(|| format!("invalid daemon.tcp_addr {:?}", config.daemon.tcp_addr))?;
        return Ok(Endpoint::Tcp(SocketAddr::new(ip, config.daemon.tcp_port)));
    }
    Ok(Endpoint::local(
        cli.socket.as_deref().unwrap_or(&config.daemon.listen_addr),
    ))
}

fn client(cli: &Cli, config: &AppConfig, signed: bool) -> Result<IpcClient> {
    let client = IpcClient::new(endpoint(cli, config)?);
    if !signed {
        return Ok(client);
    }
    let key_path = cli.key.clone().unwrap_or_else(default_client_key_path);
    Ok(client.with_signing_key(load_signing_key(&key_path)?))
}

fn print_envelope(response: Response) {
    println!("{}", response.message);
}

async fn cmd_core(client: IpcClient, action: &CoreAction) -> Result<()> {
    match action {
        CoreAction::Status => {
            let info = client.core_status().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        CoreAction::Start => print_envelope(client.core_start().await?),
        CoreAction::Stop => print_envelope(client.core_stop().await?),
        CoreAction::Restart => print_envelope(client.core_restart().await?),
        CoreAction::Health => print_envelope(client.core_health().await?),
    }
    Ok(())
}

async fn cmd_proxy(client: IpcClient, action: &ProxyAction) -> Result<()> {
    match action {
        ProxyAction::Status => {
            let status = client.proxy_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        ProxyAction::Pac { url, scope } => client.set_pac(url, &scope.into()).await?,
        ProxyAction::Set {
            server,
            bypass,
            scope,
        } => {
            if !server.contains(':') {
                bail!("proxy server must be host:port, got {server:?}");
            }
            client.set_proxy(server, bypass, &scope.into()).await?
        }
        ProxyAction::Disable { scope } => client.disable_proxy(&scope.into()).await?,
    }
    println!("ok");
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_or_default(path)
        .await
        .with_context(|| format!("failed to load config {}", path.display()))
}
