//! sbxfs - self-healing overlay filesystem
//!
//! Usage:
//!   sbxfs mount <root> <mount_point>  - Mount a protected view of <root>
//!   sbxfs unmount <mount_point>       - Unmount
//!   sbxfs protect <root> <path>       - Create or refresh one container
//!   sbxfs verify <root> <path>        - Compare one file with its container
//!   sbxfs scrub <root>                - Verify and repair every file
//!   sbxfs init-config                 - Write the default configuration

use clap::{Parser, Subcommand};
use sbxfs::{
    codec::RsbxCodec,
    config::Config,
    container::ContainerManager,
    fs::{Overlay, SbxFs},
    integrity::Verdict,
    mapper::PathMapper,
    scrub::scrub,
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sbxfs")]
#[command(version)]
#[command(about = "Overlay filesystem that keeps an erasure-coded container beside every file")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a protected view of a directory
    Mount {
        /// Backing directory holding files and containers
        root: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Create or refresh the container of one file
    Protect {
        /// Backing directory
        root: PathBuf,

        /// File, relative to the root
        path: PathBuf,
    },

    /// Compare one file with its container without repairing it
    Verify {
        /// Backing directory
        root: PathBuf,

        /// File, relative to the root
        path: PathBuf,
    },

    /// Verify every file under the root and repair what can be repaired
    Scrub {
        /// Backing directory
        root: PathBuf,

        /// Also create containers for unprotected files
        #[arg(long)]
        adopt: bool,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            root,
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &root, &mount_point, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Protect { root, path } => cmd_protect(config_path, &root, &path),

        Commands::Verify { root, path } => cmd_verify(config_path, &root, &path),

        Commands::Scrub { root, adopt } => cmd_scrub(config_path, &root, adopt),

        Commands::InitConfig { force } => cmd_init_config(config_path, force),
    }
}

fn manager(config: &Config, root: &Path) -> Result<ContainerManager> {
    if !root.is_dir() {
        return Err(Error::NotFound(root.to_path_buf()));
    }
    let codec = RsbxCodec::new(config.codec.clone())?;
    Ok(ContainerManager::new(
        PathMapper::new(root),
        Arc::new(codec),
        config.container.clone(),
    ))
}

/// Accept either a path inside the root or one already relative to it
fn logical_path(root: &Path, path: &Path) -> PathBuf {
    PathMapper::new(root)
        .to_logical(path)
        .unwrap_or_else(|| PathMapper::normalize(path))
}

fn cmd_mount(
    config_path: &Path,
    root: &Path,
    mount_point: &Path,
    allow_other: bool,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let root = root.canonicalize().map_err(|e| Error::from_io(root, e))?;

    info!("Starting sbxfs over {:?}...", root);

    let codec = RsbxCodec::new(config.codec.clone())?;
    let overlay = Overlay::new(&root, Arc::new(codec), config.container.clone())?;
    let fs = SbxFs::new(
        Arc::new(overlay),
        Duration::from_millis(config.mount.attr_ttl_ms),
    );

    // Ensure mount point exists
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting at {:?}", mount_point);

    // Build mount options
    let mut options = vec![fuser::MountOption::FSName(config.mount.fs_name.clone())];

    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    if allow_other || config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
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
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_protect(config_path: &Path, root: &Path, path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let manager = manager(&config, root)?;
    let logical = logical_path(root, path);

    manager.ensure_container(&logical)?;
    println!(
        "{} protected by {}",
        logical.display(),
        manager.mapper().resolve_container(&logical).display()
    );
    Ok(())
}

fn cmd_verify(config_path: &Path, root: &Path, path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let manager = manager(&config, root)?;
    let logical = logical_path(root, path);

    match manager.verifier().check(&logical)? {
        Verdict::NoContainer => {
            println!("{}: no container", logical.display());
            Ok(())
        }
        Verdict::Match(digest) => {
            println!("{}: ok ({})", logical.display(), digest);
            Ok(())
        }
        Verdict::Mismatch { actual, stored } => {
            println!("{}: MISMATCH", logical.display());
            println!("  file:      {}", actual);
            println!("  container: {}", stored);
            Err(Error::Internal(format!(
                "{} does not match its container",
                logical.display()
            )))
        }
    }
}

fn cmd_scrub(config_path: &Path, root: &Path, adopt: bool) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let manager = manager(&config, root)?;

    let report = scrub(&manager, adopt);

    println!("Scrub Report");
    println!("============");
    println!("Checked:     {}", report.checked);
    println!("Intact:      {}", report.intact);
    println!("Restored:    {}", report.restored);
    println!("Unprotected: {}", report.unprotected);
    if adopt {
        println!("Adopted:     {}", report.adopted);
    }
    println!("Failed:      {}", report.failures.len());
    for failure in &report.failures {
        println!("  {}: {}", failure.path.display(), failure.error);
    }

    if report.is_clean() {
        Ok(())
    } else {
        if report.unrecoverable() > 0 {
            warn!("{} files are beyond repair", report.unrecoverable());
        }
        Err(Error::Internal(format!(
            "{} files could not be verified",
            report.failures.len()
        )))
    }
}

fn cmd_init_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    let config = Config::default();
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
