//! Pipe frames
//!
//! Every pipe carries concatenated MessagePack maps. Readers buffer partial
//! frames across reads with a [`FrameDecoder`].

use std::collections::BTreeMap;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use thumbmap_config::Layer;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("corrupt frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("pipe closed by peer")]
    Closed,

    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Layer change sent to the keyboard remapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFrame {
    pub layer: Layer,
    pub remove: bool,
}

/// Raw key forwarded to the host process; repeats are never sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFrame {
    /// Upper-case key name before any remapping
    pub key: String,
    /// 0 released, 1 pressed
    pub status: u8,
    #[serde(default)]
    pub layer: Layer,
}

/// Touch state of one multitouch slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFrame {
    pub id: i32,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub valid: bool,
}

/// Aggregate touchpad contact, sent only when `status` flips
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchpadFrame {
    /// 1 while any non-palm touch is down
    pub status: u8,
    pub finger: u8,
    #[serde(default)]
    pub touch_state: BTreeMap<i32, SlotFrame>,
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, FrameError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Write one whole frame. A broken pipe surfaces as [`FrameError::Closed`].
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), FrameError> {
    let bytes = encode(frame)?;
    writer.write_all(&bytes).map_err(closed_on_broken_pipe)?;
    writer.flush().map_err(closed_on_broken_pipe)?;
    Ok(())
}

fn closed_on_broken_pipe(e: std::io::Error) -> FrameError {
    if e.kind() == ErrorKind::BrokenPipe {
        FrameError::Closed
    } else {
        FrameError::Io(e)
    }
}

/// Streaming decoder for concatenated frames
pub struct FrameDecoder<T> {
    buf: Vec<u8>,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            _frame: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` if more bytes are needed.
    ///
    /// A corrupt frame discards the whole buffer since frame boundaries are lost.
    pub fn next_frame(&mut self) -> Result<Option<T>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(self.buf.as_slice());
        let result = T::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor));
        let consumed = cursor.position() as usize;

        match result {
            Ok(frame) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Err(e) if is_truncated(&e) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e.into())
            }
        }
    }

    /// Blocking read until one frame is complete.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<T, FrameError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(frame);
            }
            match reader.read(&mut chunk) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_truncated(e: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;

    match e {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frames_are_buffered() {
        let frame = KeyFrame {
            key: "J".to_string(),
            status: 1,
            layer: Layer::from_pairs([("thumbsense", true)]),
        };
        let mut bytes = encode(&frame).unwrap();
        bytes.extend(encode(&frame).unwrap());

        let mut decoder = FrameDecoder::<KeyFrame>::new();
        decoder.feed(&bytes[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.feed(&bytes[3..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(frame.clone()));
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_frames_are_maps_not_arrays() {
        let bytes = encode(&LayerFrame {
            layer: Layer::new(),
            remove: false,
        })
        .unwrap();
        // fixmap with two entries
        assert_eq!(bytes[0], 0x82);
    }

    #[test]
    fn test_key_frame_without_layer() {
        let bytes = rmp_serde::to_vec_named(&serde_json::json!({"key": "J", "status": 1})).unwrap();
        let mut decoder = FrameDecoder::<KeyFrame>::new();
        decoder.feed(&bytes);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.key, "J");
        assert_eq!(frame.status, 1);
        assert!(frame.layer.is_empty());
    }

    #[test]
    fn test_corrupt_frame_is_an_error() {
        let mut decoder = FrameDecoder::<LayerFrame>::new();
        decoder.feed(&[0xc1, 0x00]);
        assert!(matches!(decoder.next_frame(), Err(FrameError::Decode(_))));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_read_frame_reports_closed_pipe() {
        let bytes = encode(&LayerFrame {
            layer: Layer::from_pairs([("application", "Chrome")]),
            remove: true,
        })
        .unwrap();
        let mut reader = Cursor::new(bytes);
        let mut decoder = FrameDecoder::<LayerFrame>::new();

        let frame = decoder.read_frame(&mut reader).unwrap();
        assert!(frame.remove);
        assert!(matches!(
            decoder.read_frame(&mut reader),
            Err(FrameError::Closed)
        ));
    }

    #[test]
    fn test_write_frame() {
        let mut out = Vec::new();
        let frame = TouchpadFrame {
            status: 1,
            finger: 2,
            touch_state: BTreeMap::from([(
                0,
                SlotFrame {
                    id: 7,
                    x: Some(10),
                    y: Some(20),
                    valid: true,
                },
            )]),
        };
        write_frame(&mut out, &frame).unwrap();

        let mut decoder = FrameDecoder::<TouchpadFrame>::new();
        decoder.feed(&out);
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
    }
}
