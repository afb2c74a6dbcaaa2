//! The host process
//!
//! Owns the sending end of the layer pipe, reads the frames forwarded by the
//! remapper processes, serves the control socket and supervises the children.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thumbmap_config::{ControlRequest, ControlResponse, Layer, RemapperStatus};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe::Receiver;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

use crate::control::{handle_connection, ControlServer};
use crate::frame::{FrameDecoder, FrameError, KeyFrame, TouchpadFrame};
use crate::layer_manager::LayerManager;
use crate::shutdown::{EXIT_FAILURE, EXIT_SIGINT, EXIT_SIGTERM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pressed,
    Released,
}

/// A physical key transition, as seen before remapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeypressEvent {
    pub code: String,
    pub status: KeyStatus,
    pub layer: Layer,
}

impl From<KeyFrame> for KeypressEvent {
    fn from(frame: KeyFrame) -> Self {
        Self {
            code: frame.key,
            status: if frame.status == 1 {
                KeyStatus::Pressed
            } else {
                KeyStatus::Released
            },
            layer: frame.layer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchStatus {
    Begin,
    End,
}

/// Start or end of a valid touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TouchRecord {
    pub status: TouchStatus,
    pub finger: u8,
}

impl From<&TouchpadFrame> for TouchRecord {
    fn from(frame: &TouchpadFrame) -> Self {
        Self {
            status: if frame.status == 1 {
                TouchStatus::Begin
            } else {
                TouchStatus::End
            },
            finger: frame.finger,
        }
    }
}

/// A forked remapper process
#[derive(Debug, Clone, Copy)]
pub struct Child {
    pub kind: &'static str,
    pub pid: Pid,
}

impl Child {
    fn is_running(&self) -> bool {
        kill(self.pid, None).is_ok()
    }
}

/// State shared with control connections
pub struct HostState {
    layers: Mutex<LayerManager>,
    children: Vec<Child>,
}

impl HostState {
    pub fn new(layers: LayerManager, children: Vec<Child>) -> Self {
        Self {
            layers: Mutex::new(layers),
            children,
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::LayerAdd { layer } => self.change_layer(layer, false).await,
            ControlRequest::LayerRemove { layer } => self.change_layer(layer, true).await,
            ControlRequest::Status => ControlResponse::Status {
                layer: self.layers.lock().await.current().clone(),
                remappers: self
                    .children
                    .iter()
                    .map(|child| RemapperStatus {
                        kind: child.kind.to_string(),
                        pid: child.pid.as_raw(),
                        running: child.is_running(),
                    })
                    .collect(),
            },
        }
    }

    async fn change_layer(&self, layer: Layer, remove: bool) -> ControlResponse {
        if layer.is_empty() {
            return ControlResponse::Error {
                message: "Layer must name at least one context key".to_string(),
            };
        }

        let mut layers = self.layers.lock().await;
        match layers.send_layer(layer, remove) {
            Ok(()) => ControlResponse::Success {
                message: Some(format!("Current layer: {}", layers.current())),
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        }
    }

    /// Thumbsense is on while a valid touch rests on the touchpad.
    async fn bridge_touch(&self, frame: &TouchpadFrame) {
        let layer = Layer::from_pairs([("thumbsense", true)]);
        let mut layers = self.layers.lock().await;
        if let Err(e) = layers.send_layer(layer, frame.status == 0) {
            tracing::warn!("Failed to update thumbsense layer: {}", e);
        }
    }
}

async fn read_frame<T: DeserializeOwned>(
    receiver: &mut Receiver,
    decoder: &mut FrameDecoder<T>,
) -> Result<T, FrameError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        let n = receiver.read(&mut chunk).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        decoder.feed(&chunk[..n]);
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}

pub struct HostOptions<'a> {
    pub print_events: bool,
    pub thumbsense_bridge: bool,
    pub socket_path: &'a Path,
}

/// Run the host until a signal arrives or the keyboard remapper exits.
///
/// Children are stopped on every exit path. The status is the signal's, or
/// the keyboard remapper's own when it exited first.
pub async fn run(
    state: Arc<HostState>,
    keyboard_pipe: OwnedFd,
    touchpad_pipe: Option<OwnedFd>,
    options: HostOptions<'_>,
) -> Result<i32> {
    let result = serve(&state, keyboard_pipe, touchpad_pipe, options).await;
    tracing::info!("Shutting down...");
    let keyboard_status = stop_children(&state.children);
    result.map(|signal_status| signal_status.unwrap_or(keyboard_status))
}

async fn serve(
    state: &Arc<HostState>,
    keyboard_pipe: OwnedFd,
    touchpad_pipe: Option<OwnedFd>,
    options: HostOptions<'_>,
) -> Result<Option<i32>> {
    let mut keyboard = Receiver::from_owned_fd(keyboard_pipe)?;
    let mut keyboard_frames = FrameDecoder::<KeyFrame>::new();
    let mut touchpad = match touchpad_pipe {
        Some(fd) => Some((Receiver::from_owned_fd(fd)?, FrameDecoder::<TouchpadFrame>::new())),
        None => None,
    };

    let server = ControlServer::bind(options.socket_path)?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tracing::info!("Host started");

    let code = loop {
        tokio::select! {
            frame = read_frame(&mut keyboard, &mut keyboard_frames) => match frame {
                Ok(frame) => {
                    let event = KeypressEvent::from(frame);
                    tracing::trace!("Key {} {:?}", event.code, event.status);
                    if options.print_events {
                        print_json(&event);
                    }
                }
                Err(FrameError::Closed) => {
                    tracing::error!("Keyboard remapper exited");
                    break None;
                }
                Err(e) => tracing::error!("Dropped keyboard frame: {}", e),
            },

            frame = async {
                match touchpad.as_mut() {
                    Some((receiver, decoder)) => read_frame(receiver, decoder).await,
                    None => std::future::pending().await,
                }
            } => match frame {
                Ok(frame) => {
                    let record = TouchRecord::from(&frame);
                    tracing::debug!("Touch {:?} with {} finger(s)", record.status, record.finger);
                    if options.print_events {
                        print_json(&record);
                    }
                    if options.thumbsense_bridge {
                        state.bridge_touch(&frame).await;
                    }
                }
                Err(FrameError::Closed) => {
                    tracing::warn!("Touchpad remapper exited");
                    touchpad = None;
                }
                Err(e) => tracing::error!("Dropped touchpad frame: {}", e),
            },

            conn = server.accept() => match conn {
                Ok(stream) => {
                    let state = Arc::clone(state);
                    tokio::spawn(async move {
                        let result = handle_connection(stream, |request| async move {
                            state.handle(request).await
                        })
                        .await;
                        if let Err(e) = result {
                            tracing::warn!("Control connection failed: {:#}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("{:#}", e),
            },

            _ = sigint.recv() => break Some(EXIT_SIGINT),
            _ = sigterm.recv() => break Some(EXIT_SIGTERM),
        }
    };

    Ok(code)
}

/// SIGTERM every child and reap it. Returns the keyboard remapper's exit status.
fn stop_children(children: &[Child]) -> i32 {
    let mut keyboard_status = EXIT_FAILURE;
    for child in children {
        match kill(child.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to stop {} remapper: {}", child.kind, e),
        }
        match waitpid(child.pid, None) {
            Ok(WaitStatus::Exited(_, status)) => {
                tracing::debug!("{} remapper exited with {}", child.kind, status);
                if child.kind == "keyboard" {
                    keyboard_status = status;
                }
            }
            Ok(other) => tracing::debug!("{} remapper: {:?}", child.kind, other),
            Err(e) => tracing::warn!("Failed to reap {} remapper: {}", child.kind, e),
        }
    }
    keyboard_status
}
