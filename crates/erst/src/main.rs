use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use erst_lib::cli::Cli;
use erst_lib::filesystems::{FilesystemGateway, TimeTravelFS};
use erst_lib::{Config, GitStore};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger with specified or default log level
    let env = match cli.log_level {
        Some(ref log_level) => Env::default().filter_or("RUST_LOG", log_level),
        None => Env::default().filter_or("RUST_LOG", "info"),
    };
    env_logger::init_from_env(env);

    let mut config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {:?}", path),
        None => "Failed to load configuration".to_string(),
    })?;
    cli.apply_to(&mut config);

    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("Failed to canonicalize path: {:?}", cli.root))?;
    let mountpoint = std::fs::canonicalize(&cli.mountpoint)
        .with_context(|| format!("Failed to canonicalize path: {:?}", cli.mountpoint))?;

    check_mountpoint(&root, &mountpoint)?;

    let store = GitStore::new(&root, &config.vcs);
    let mut gateway = FilesystemGateway::new(store, &root)
        .with_context(|| format!("Failed to open repository at {:?}", root))?
        .with_commit_failure_policy(config.vcs.on_commit_failure);
    gateway
        .checkout_live()
        .context("Failed to check out the live branch")?;
    if let Some(branch) = gateway.resolver().store().branch() {
        info!("Live view follows branch '{}'", branch);
    }

    if cli.unmount_on_exit {
        info!("Will unmount filesystem on exit");
        install_unmount_handler(mountpoint.clone())?;
    }

    println!("✓ Mounting history of '{}'", root.display());
    println!("  Mount point: {}", mountpoint.display());
    println!(
        "  Browse a date with: ls {}/YYYY-MM-DD/",
        mountpoint.display()
    );

    TimeTravelFS::new(gateway)
        .mount(&mountpoint, &config.mount)
        .with_context(|| format!("Failed to mount filesystem at {:?}", mountpoint))?;

    info!("Unmounted {:?}", mountpoint);
    Ok(())
}

/// The mount point must lie outside the working tree git manages.
fn check_mountpoint(root: &Path, mountpoint: &Path) -> Result<()> {
    if mountpoint.starts_with(root) {
        return Err(anyhow::anyhow!(
            "Mount point {:?} must be outside the repository root {:?}",
            mountpoint,
            root
        ));
    }
    Ok(())
}

/// Unmount with `fusermount -u` on Ctrl+C.
fn install_unmount_handler(mountpoint: PathBuf) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, unmounting filesystem");
        unmount(&mountpoint);
        std::process::exit(0);
    })
    .context("Error setting signal handler")
}

fn unmount(mountpoint: &Path) {
    match Command::new("fusermount").arg("-u").arg(mountpoint).status() {
        Ok(status) if status.success() => info!("Successfully unmounted filesystem"),
        Ok(status) => error!("Failed to unmount filesystem, exit code: {}", status),
        Err(e) => error!("Failed to execute unmount command: {}", e),
    }
}
