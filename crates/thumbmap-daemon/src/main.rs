//! thumbmap daemon
//!
//! Forks a keyboard remapper and, when a touchpad is present, a touchpad
//! remapper. The parent process stays as the host: it owns the layer,
//! receives forwarded frames and serves the control socket.

mod control;
mod device;
mod frame;
mod host;
mod injector;
mod keyboard;
mod layer_manager;
mod matcher;
mod modifier;
mod palm;
mod remapper;
mod selector;
mod shutdown;
mod touchpad;

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{fork, pipe, ForkResult};
use thumbmap_config::{control_socket_path, Config};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use crate::host::{Child, HostOptions, HostState};
use crate::injector::{VIRTUAL_KEYBOARD_NAME, VIRTUAL_TOUCHPAD_NAME};
use crate::keyboard::KeyboardRemapper;
use crate::layer_manager::LayerManager;
use crate::selector::DeviceSelector;
use crate::shutdown::EXIT_FAILURE;
use crate::touchpad::TouchpadRemapper;

/// Values of EV_KEY events
pub mod event_value {
    pub const RELEASE: i32 = 0;
    pub const PRESS: i32 = 1;
    pub const REPEAT: i32 = 2;
}

#[derive(Parser, Debug)]
#[command(name = "thumbmapd")]
#[command(about = "Context-aware keyboard remapping daemon with touchpad thumbsense")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/thumbmap/config.kdl")]
    config: String,

    /// Print forwarded key and touch events as JSON lines on stdout
    #[arg(long)]
    print_events: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();
    tracing::info!("Loading configuration from {}", config_path.display());
    let config = Arc::new(thumbmap_config::parse_config(&config_path)?);

    if !from_env {
        let level = config.global.log_level.as_filter();
        if let Err(e) = filter_handle.reload(EnvFilter::new(level)) {
            tracing::warn!("Failed to apply log level '{}': {}", level, e);
        }
    }
    for invalid in &config.invalid_keys {
        tracing::warn!("Ignoring invalid key {}", invalid);
    }
    tracing::info!(
        "Loaded configuration with {} remap section(s)",
        config.sections.len()
    );

    let layers = LayerManager::new(Arc::clone(&config)).context("Failed to create layer pipe")?;

    // Fork before any thread exists; the async runtime is built afterwards.
    let (keyboard_read, keyboard_write) = pipe().context("Failed to create keyboard pipe")?;
    let keyboard_pid = match unsafe { fork() }.context("Failed to fork keyboard remapper")? {
        ForkResult::Child => {
            drop(keyboard_read);
            let code = run_keyboard(
                Arc::clone(&config),
                layers.into_receiver(),
                File::from(keyboard_write),
            );
            std::process::exit(code);
        }
        ForkResult::Parent { child } => child,
    };
    drop(keyboard_write);
    let mut children = vec![Child {
        kind: "keyboard",
        pid: keyboard_pid,
    }];

    let mut touchpad_read = None;
    if has_touchpad(&config) {
        let (read_end, write_end) = pipe().context("Failed to create touchpad pipe")?;
        match unsafe { fork() }.context("Failed to fork touchpad remapper")? {
            ForkResult::Child => {
                drop(read_end);
                drop(keyboard_read);
                let mut layers = layers;
                layers.close();
                let code = run_touchpad(&config, File::from(write_end));
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(write_end);
                children.push(Child {
                    kind: "touchpad",
                    pid: child,
                });
                touchpad_read = Some(read_end);
            }
        }
    } else {
        tracing::info!("No touchpad found, running without touchpad remapper");
    }

    let code = run_host(
        &args,
        &config,
        layers.into_sender(),
        children,
        keyboard_read,
        touchpad_read,
    )?;
    std::process::exit(code);
}

fn has_touchpad(config: &Config) -> bool {
    let mut selector = DeviceSelector::evdev(
        "touchpad",
        &config.touchpad.name_patterns,
        &[VIRTUAL_KEYBOARD_NAME, VIRTUAL_TOUCHPAD_NAME],
    );
    !selector.candidates().is_empty()
}

fn run_keyboard(config: Arc<Config>, layers: LayerManager, forward: File) -> i32 {
    let _span = tracing::info_span!("remapper", kind = "keyboard").entered();
    if let Err(e) = shutdown::install_signal_handlers() {
        tracing::error!("Failed to install signal handlers: {}", e);
        return EXIT_FAILURE;
    }
    match KeyboardRemapper::start(config, layers, forward) {
        Ok(remapper) => remapper.run(),
        Err(e) => {
            tracing::error!("Failed to start keyboard remapper: {}", e);
            EXIT_FAILURE
        }
    }
}

fn run_touchpad(config: &Config, forward: File) -> i32 {
    let _span = tracing::info_span!("remapper", kind = "touchpad").entered();
    if let Err(e) = shutdown::install_signal_handlers() {
        tracing::error!("Failed to install signal handlers: {}", e);
        return EXIT_FAILURE;
    }
    TouchpadRemapper::new(&config.touchpad.name_patterns, forward).run()
}

fn run_host(
    args: &Args,
    config: &Config,
    layers: LayerManager,
    children: Vec<Child>,
    keyboard_pipe: OwnedFd,
    touchpad_pipe: Option<OwnedFd>,
) -> Result<i32> {
    for child in &children {
        tracing::info!("Started {} remapper (pid {})", child.kind, child.pid);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let socket_path = control_socket_path();
    let state = Arc::new(HostState::new(layers, children));
    runtime.block_on(host::run(
        state,
        keyboard_pipe,
        touchpad_pipe,
        HostOptions {
            print_events: args.print_events,
            thumbsense_bridge: config.global.thumbsense_bridge,
            socket_path: &socket_path,
        },
    ))
}
