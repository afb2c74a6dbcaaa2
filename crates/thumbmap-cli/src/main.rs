//! thumbmap CLI
//!
//! Validates configuration, lists devices and talks to the running daemon
//! over its control socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{miette, IntoDiagnostic};
use thumbmap_config::{control_socket_path, ControlRequest, ControlResponse, Layer, LayerValue};

#[derive(Parser, Debug)]
#[command(name = "thumbmap")]
#[command(about = "Context-aware keyboard remapping with touchpad thumbsense")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/thumbmap/config.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file
    Validate,

    /// List available input devices
    Devices,

    /// List the contexts declared in the configuration
    Contexts,

    /// Change the layer of the running daemon
    Layer {
        #[command(subcommand)]
        action: LayerAction,
    },

    /// Show current daemon status
    Status,
}

#[derive(Subcommand, Debug)]
enum LayerAction {
    /// Merge context flags into the layer, e.g. `application=Chrome`
    Add {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Remove context keys from the layer, e.g. `application`
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate => cmd_validate(&config_path),
        Commands::Devices => cmd_devices(),
        Commands::Contexts => cmd_contexts(&config_path),
        Commands::Layer { action } => cmd_layer(action),
        Commands::Status => cmd_status(),
    }
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = thumbmap_config::parse_config(config_path)?;
    thumbmap_config::validate_keys(&config)?;

    println!("Configuration is valid!");
    println!("  Keyboard patterns: {}", config.keyboard.name_patterns.join(", "));
    println!("  Emergency ungrab: {}", config.keyboard.emergency_ungrab_keys);
    println!("  Remap sections: {}", config.sections.len());
    for section in &config.sections {
        println!(
            "    - {} ({} remap(s))",
            describe_context(&section.context),
            section.table.len()
        );
    }
    Ok(())
}

fn cmd_contexts(config_path: &Path) -> miette::Result<()> {
    let config = thumbmap_config::parse_config(config_path)?;
    for context in config.contexts() {
        println!("{}", describe_context(context));
    }
    Ok(())
}

fn describe_context(context: &Layer) -> String {
    if context.is_empty() {
        "(default)".to_string()
    } else {
        context.to_string()
    }
}

fn cmd_devices() -> miette::Result<()> {
    println!("Available input devices:\n");

    let mut devices: Vec<_> = evdev::enumerate().collect();
    devices.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (path, device) in devices {
        let name = device.name().unwrap_or("Unknown");
        let id = device.input_id();

        let is_keyboard = device
            .supported_keys()
            .map(|keys| keys.contains(evdev::Key::KEY_A))
            .unwrap_or(false);
        let is_touchpad = device
            .supported_absolute_axes()
            .map(|axes| axes.contains(evdev::AbsoluteAxisType::ABS_MT_POSITION_X))
            .unwrap_or(false)
            && device
                .supported_keys()
                .map(|keys| keys.contains(evdev::Key::BTN_TOOL_FINGER))
                .unwrap_or(false)
            && !device.properties().contains(evdev::PropType::DIRECT);

        let device_type = if is_touchpad {
            "touchpad"
        } else if is_keyboard {
            "keyboard"
        } else {
            "other"
        };

        println!("  {} [{}]", name, device_type);
        println!("    Path: {}", path.display());
        println!("    ID: {:04x}:{:04x}", id.vendor(), id.product());
        println!();
    }
    Ok(())
}

fn cmd_layer(action: LayerAction) -> miette::Result<()> {
    let request = match action {
        LayerAction::Add { pairs } => ControlRequest::LayerAdd {
            layer: parse_layer_pairs(&pairs)?,
        },
        LayerAction::Remove { keys } => ControlRequest::LayerRemove {
            layer: parse_layer_keys(&keys),
        },
    };

    match send_request(&request)? {
        ControlResponse::Success { message } => {
            println!("{}", message.unwrap_or_else(|| "OK".to_string()));
            Ok(())
        }
        ControlResponse::Error { message } => Err(miette!("{}", message)),
        other => Err(miette!("Unexpected response: {:?}", other)),
    }
}

fn cmd_status() -> miette::Result<()> {
    match send_request(&ControlRequest::Status)? {
        ControlResponse::Status { layer, remappers } => {
            println!("Layer: {}", describe_context(&layer));
            for remapper in remappers {
                println!(
                    "  {} remapper (pid {}): {}",
                    remapper.kind,
                    remapper.pid,
                    if remapper.running { "running" } else { "stopped" }
                );
            }
            Ok(())
        }
        ControlResponse::Error { message } => Err(miette!("{}", message)),
        other => Err(miette!("Unexpected response: {:?}", other)),
    }
}

/// `key=value` arguments; a bare `key` means `key=true`.
fn parse_layer_pairs(pairs: &[String]) -> miette::Result<Layer> {
    let mut layer = Layer::new();
    for pair in pairs {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair.as_str(), "true"),
        };
        if key.is_empty() {
            return Err(miette!("Invalid layer entry '{}': missing key", pair));
        }
        let value: LayerValue = match value.parse() {
            Ok(value) => value,
            Err(never) => match never {},
        };
        layer.insert(key, value);
    }
    Ok(layer)
}

/// Keys to remove; any `=value` suffix is ignored.
fn parse_layer_keys(keys: &[String]) -> Layer {
    let mut layer = Layer::new();
    for key in keys {
        let key = key.split_once('=').map_or(key.as_str(), |(k, _)| k);
        layer.insert(key, true);
    }
    layer
}

fn send_request(request: &ControlRequest) -> miette::Result<ControlResponse> {
    let socket_path = control_socket_path();
    tracing::debug!("Connecting to {}", socket_path.display());
    let mut stream = UnixStream::connect(&socket_path)
        .map_err(|e| miette!("Cannot reach daemon at {}: {}", socket_path.display(), e))?;

    let mut line = serde_json::to_string(request).into_diagnostic()?;
    line.push('\n');
    stream.write_all(line.as_bytes()).into_diagnostic()?;

    let mut response = String::new();
    BufReader::new(stream)
        .read_line(&mut response)
        .into_diagnostic()?;
    serde_json::from_str(response.trim()).into_diagnostic()
}
