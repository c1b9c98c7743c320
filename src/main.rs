//! sopsfs - Read-only FUSE filesystem for SOPS-encrypted secrets
//!
//! Usage:
//!   sopsfs init                 - Write a default configuration file
//!   sopsfs mount [mount_point]  - Mount the secrets filesystem
//!   sopsfs unmount <mount_point> - Unmount the filesystem
//!   sopsfs tree                 - List the secret paths of the document
//!   sopsfs selftest             - Decrypt one value end to end
//!   sopsfs ks-smoketest         - Check the keyservice is reachable

use clap::{Parser, Subcommand};
use sopsfs::{
    cache::{CacheSweeper, SecretCache},
    config::Config,
    fs::{mount, SecretsFs, SecretsFsOptions},
    sops::{self, Decryptor, KeyserviceAddr, SopsClient, PROBE_TIMEOUT},
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

/// How often the mount loop checks whether the session ended on its own
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "sopsfs")]
#[command(author = "sopsfs Contributors")]
#[command(version)]
#[command(about = "Read-only FUSE filesystem exposing SOPS-encrypted secrets")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/sopsfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Mount the filesystem
    Mount {
        /// Mount point directory
        mount_point: Option<PathBuf>,

        /// SOPS-encrypted secrets file
        #[arg(long)]
        secrets: Option<PathBuf>,

        /// Keyservice address (host:port or tcp://host:port)
        #[arg(long)]
        keyservice: Option<String>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// List the secret paths exposed by the secrets file
    Tree,

    /// Decrypt the first secret once and report its size
    #[command(name = "selftest")]
    SelfTest,

    /// Check that the keyservice accepts connections
    #[command(name = "ks-smoketest")]
    KsSmoketest,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config_path),

        Commands::Mount {
            mount_point,
            secrets,
            keyservice,
            allow_other,
        } => {
            let mut config = Config::load_or_default(config_path)?;
            if let Some(mount_point) = mount_point {
                config.mount.mount_point = mount_point;
            }
            if let Some(secrets) = secrets {
                config.sops.secrets_file = secrets;
            }
            if let Some(keyservice) = keyservice {
                config.sops.keyservice = keyservice;
            }
            config.mount.allow_other |= allow_other;
            config.validate()?;

            cmd_mount(config)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Tree => cmd_tree(&Config::load_or_default(config_path)?),

        Commands::SelfTest => cmd_selftest(&Config::load_or_default(config_path)?),

        Commands::KsSmoketest => cmd_ks_smoketest(&Config::load_or_default(config_path)?),
    }
}

fn cmd_init(config_path: &Path) -> Result<()> {
    info!("Initializing sopsfs configuration...");

    let config = Config::default();

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Keyservice: {}", config.sops.keyservice);
    info!("Secrets file: {:?}", config.sops.secrets_file);
    info!("");
    info!("Next steps:");
    info!("  1. Edit the keyservice address and secrets file in {:?}", config_path);
    info!("  2. Run 'sopsfs ks-smoketest' to check the keyservice");
    info!("  3. Run 'sopsfs mount <mount_point>' to mount the filesystem");

    Ok(())
}

fn cmd_mount(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;

    let client = SopsClient::new(&config.sops, runtime.handle().clone())?;
    log_recipients(&config.sops.secrets_file);

    let cache = Arc::new(SecretCache::new(config.cache.ttl()));
    let fs = Arc::new(SecretsFs::new(
        config.sops.secrets_file.clone(),
        Arc::new(client),
        cache.clone(),
        SecretsFsOptions::from(&config),
    )?);

    let session = mount(
        fs.clone(),
        &config.mount.mount_point,
        &config.mount,
        runtime.handle().clone(),
    )?;
    let sweeper = CacheSweeper::spawn(runtime.handle(), cache, config.cache.sweep_interval());

    info!(
        "Serving {:?} at {:?} (cache TTL: {}s)",
        config.sops.secrets_file,
        config.mount.mount_point,
        config.cache.ttl_secs
    );
    info!("Send SIGHUP to reload the secrets structure, SIGINT or SIGTERM to unmount");

    let waited = runtime.block_on(async {
        let result = wait_for_shutdown(&fs, &session).await;
        sweeper.stop().await;
        result
    });

    drop(session);
    info!("Unmounted {:?}", config.mount.mount_point);
    waited
}

/// Serve until a termination signal arrives or the session ends.
///
/// SIGHUP reloads the structure; a failed reload keeps the current tree.
async fn wait_for_shutdown(fs: &SecretsFs, session: &fuser::BackgroundSession) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut poll = tokio::time::interval(SESSION_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("Received SIGINT, unmounting");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, unmounting");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading secrets structure");
                let _ = fs.refresh();
            }
            _ = poll.tick() => {
                if session.guard.is_finished() {
                    warn!("Filesystem was unmounted externally");
                    return Ok(());
                }
            }
        }
    }
}

/// Log who can decrypt the secrets file; informational only
fn log_recipients(secrets_file: &Path) {
    let Ok(content) = std::fs::read_to_string(secrets_file) else {
        return;
    };

    match sops::recipients(&content) {
        Ok(recipients) if recipients.is_empty() => {
            warn!("No recipients found in {:?}; is it SOPS-encrypted?", secrets_file);
        }
        Ok(recipients) => {
            for recipient in recipients {
                info!("Recipient: {} {}", recipient.kind, recipient.id);
            }
        }
        Err(e) => warn!("Could not read recipients: {}", e),
    }
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Mount(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn cmd_tree(config: &Config) -> Result<()> {
    let tree = sops::load_structure_file(&config.sops.secrets_file)?;

    for key_path in tree.leaf_paths() {
        println!("{}", key_path.to_fs_path());
    }

    Ok(())
}

fn cmd_selftest(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    let client = SopsClient::new(&config.sops, runtime.handle().clone())?;

    let tree = client.load_structure(&config.sops.secrets_file)?;
    let key_path = tree.first_leaf().ok_or_else(|| {
        Error::StructureSource(format!("{:?} contains no secrets", config.sops.secrets_file))
    })?;

    println!("Decrypting {} ...", key_path.to_fs_path());
    let value = Zeroizing::new(runtime.block_on(client.decrypt(
        &config.sops.secrets_file,
        &key_path,
        config.sops.decrypt_timeout(),
    ))?);

    println!("OK: {} bytes", value.len());
    Ok(())
}

fn cmd_ks_smoketest(config: &Config) -> Result<()> {
    let addr = KeyserviceAddr::parse(&config.sops.keyservice)?;
    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;

    println!("Connecting to keyservice at {} ...", addr);
    runtime.block_on(addr.probe(PROBE_TIMEOUT))?;

    println!("OK: keyservice is reachable");
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
