//! Current context layer and merged remap tables
//!
//! The layer lives in the host process and is pushed to the keyboard
//! remapper over a pipe. Both ends are created before forking; each process
//! drops the end it does not use.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use thiserror::Error;
use thumbmap_config::{Config, Layer, RemapTable};

use crate::frame::{write_frame, FrameDecoder, FrameError, LayerFrame};

/// Priority of a table declared for a single context key
pub fn context_priority(key: &str) -> u32 {
    match key {
        "device" => 1,
        "thumbsense" => 2,
        "application" => 3,
        _ => 1,
    }
}

/// Priority of the table whose context equals the whole layer
pub const COMPLETE_MATCH_PRIORITY: u32 = 100;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer pipe is not available in this process")]
    NoPipe,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub struct LayerManager {
    config: Arc<Config>,
    reader: Option<File>,
    writer: Option<File>,
    decoder: FrameDecoder<LayerFrame>,
    current: Layer,
    last_sent: Option<LayerFrame>,
    cache: HashMap<Layer, Arc<RemapTable>>,
}

impl LayerManager {
    /// Create the manager together with its pipe.
    ///
    /// Call this before forking; the keyboard remapper keeps the receiving
    /// end with [`LayerManager::into_receiver`] and the host the sending end
    /// with [`LayerManager::into_sender`].
    ///
    /// # Errors
    ///
    /// Returns the errno if the pipe cannot be created.
    pub fn new(config: Arc<Config>) -> nix::Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe()?;
        let mut manager = Self::detached(config);
        manager.reader = Some(File::from(read_end));
        manager.writer = Some(File::from(write_end));
        Ok(manager)
    }

    /// A manager without a pipe, resolving mappings for a fixed layer.
    pub fn detached(config: Arc<Config>) -> Self {
        Self {
            config,
            reader: None,
            writer: None,
            decoder: FrameDecoder::new(),
            current: Layer::new(),
            last_sent: None,
            cache: HashMap::new(),
        }
    }

    /// Keep only the receiving end (keyboard remapper process).
    pub fn into_receiver(mut self) -> Self {
        self.writer = None;
        self
    }

    /// Keep only the sending end (host process).
    pub fn into_sender(mut self) -> Self {
        self.reader = None;
        self
    }

    /// Move the receiving end into a second manager.
    #[cfg(test)]
    pub(crate) fn split_for_test(mut self) -> (Self, Self) {
        let mut receiver = Self::detached(Arc::clone(&self.config));
        receiver.reader = self.reader.take();
        (self, receiver)
    }

    /// Drop both ends (processes that never touch the layer).
    pub fn close(&mut self) {
        self.reader = None;
        self.writer = None;
    }

    pub fn reader_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|f| f.as_fd())
    }

    pub fn current(&self) -> &Layer {
        &self.current
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Send a layer change. Repeating the previous call is a no-op.
    pub fn send_layer(&mut self, layer: Layer, remove: bool) -> Result<(), LayerError> {
        let frame = LayerFrame { layer, remove };
        if self.last_sent.as_ref() == Some(&frame) {
            return Ok(());
        }

        let writer = self.writer.as_mut().ok_or(LayerError::NoPipe)?;
        write_frame(writer, &frame)?;
        tracing::debug!(
            "Sent layer {} {}",
            if remove { "removal" } else { "addition" },
            frame.layer
        );

        apply(&mut self.current, &frame);
        self.last_sent = Some(frame);
        Ok(())
    }

    /// Block for one layer change and return the updated layer.
    ///
    /// Every complete frame that arrived with the same read is applied too,
    /// since the pipe will not poll readable for bytes already buffered.
    /// A closed pipe means the host went away and the caller should shut down.
    pub fn receive_layer(&mut self) -> Result<Layer, LayerError> {
        let reader = self.reader.as_mut().ok_or(LayerError::NoPipe)?;
        let frame = self.decoder.read_frame(reader)?;
        apply(&mut self.current, &frame);

        while let Some(frame) = self.decoder.next_frame()? {
            apply(&mut self.current, &frame);
        }

        self.invalidate();
        tracing::info!("Layer changed: {}", self.current);
        Ok(self.current.clone())
    }

    /// Remap table for `layer`, merged from every applicable context.
    pub fn find_merged_mapping(&mut self, layer: &Layer) -> Arc<RemapTable> {
        if let Some(table) = self.cache.get(layer) {
            return Arc::clone(table);
        }
        let table = Arc::new(merge_remap_tables(&self.config, layer));
        self.cache.insert(layer.clone(), Arc::clone(&table));
        table
    }

    /// Drop cached mappings after a layer or device-set change.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }
}

fn apply(current: &mut Layer, frame: &LayerFrame) {
    if frame.remove {
        current.remove_keys(&frame.layer);
    } else {
        current.merge(&frame.layer);
    }
}

/// Merge tables in ascending priority; later merges overwrite equal keys.
///
/// Candidates are the default context (0), each single key of `layer`, and
/// the complete context (100) when `layer` has more than one key.
pub fn merge_remap_tables(config: &Config, layer: &Layer) -> RemapTable {
    let mut candidates: Vec<(u32, &RemapTable)> = Vec::new();

    if let Some(table) = config.search_remap_table(&Layer::new()) {
        candidates.push((0, table));
    }

    for (key, value) in layer.iter() {
        let single = Layer::from_pairs([(key, value.clone())]);
        if let Some(table) = config.search_remap_table(&single) {
            candidates.push((context_priority(key), table));
        }
    }

    if layer.len() > 1 {
        if let Some(table) = config.search_remap_table(layer) {
            candidates.push((COMPLETE_MATCH_PRIORITY, table));
        }
    }

    candidates.sort_by_key(|(priority, _)| *priority);

    let mut merged = RemapTable::new();
    for (_, table) in candidates {
        merged.extend(table.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use thumbmap_config::{parse_config_str, LayerValue, RemapValue};

    fn config() -> Arc<Config> {
        Arc::new(
            parse_config_str(
                r#"
                remap {
                    A "DEFAULT"
                    Z "Z_DEFAULT"
                }
                context device="HHKB" {
                    remap {
                        A "DEVICE"
                    }
                }
                context thumbsense=true {
                    remap {
                        A "THUMBSENSE"
                    }
                }
                context application="Chrome" {
                    remap {
                        A "APPLICATION"
                    }
                }
                context device="HHKB" thumbsense=true application="Chrome" {
                    remap {
                        A "COMPLETE"
                    }
                }
                "#,
            )
            .unwrap(),
        )
    }

    fn resolved(table: &RemapTable, key: &str) -> Option<String> {
        match table.get(key) {
            Some(RemapValue::Key(k)) => Some(k.clone()),
            _ => None,
        }
    }

    fn layer(pairs: &[(&str, LayerValue)]) -> Layer {
        Layer::from_pairs(pairs.iter().cloned())
    }

    #[test]
    fn test_complete_context_wins() {
        let table = merge_remap_tables(
            &config(),
            &layer(&[
                ("device", "HHKB".into()),
                ("thumbsense", true.into()),
                ("application", "Chrome".into()),
            ]),
        );
        assert_eq!(resolved(&table, "A").as_deref(), Some("COMPLETE"));
        // lower layers still contribute distinct keys
        assert_eq!(resolved(&table, "Z").as_deref(), Some("Z_DEFAULT"));
    }

    #[test]
    fn test_thumbsense_beats_device() {
        let table = merge_remap_tables(
            &config(),
            &layer(&[("device", "HHKB".into()), ("thumbsense", true.into())]),
        );
        assert_eq!(resolved(&table, "A").as_deref(), Some("THUMBSENSE"));
    }

    #[test]
    fn test_device_only_and_default() {
        let table = merge_remap_tables(&config(), &layer(&[("device", "HHKB".into())]));
        assert_eq!(resolved(&table, "A").as_deref(), Some("DEVICE"));

        let table = merge_remap_tables(&config(), &Layer::new());
        assert_eq!(resolved(&table, "A").as_deref(), Some("DEFAULT"));
    }

    #[test]
    fn test_send_layer_deduplicates_and_receive_applies() {
        let manager = LayerManager::new(config()).unwrap();
        let thumbsense = Layer::from_pairs([("thumbsense", true)]);

        let (mut manager, mut receiver) = manager.split_for_test();

        manager.send_layer(thumbsense.clone(), false).unwrap();
        manager.send_layer(thumbsense.clone(), false).unwrap();
        assert_eq!(manager.current(), &thumbsense);

        // the repeated call wrote nothing
        assert_eq!(receiver.receive_layer().unwrap(), thumbsense);
        let fd = receiver.reader_fd().unwrap();
        assert_eq!(
            crate::device::wait_readable(&[fd], std::time::Duration::ZERO).unwrap(),
            vec![false]
        );

        manager.send_layer(thumbsense.clone(), true).unwrap();
        assert!(manager.current().is_empty());
        assert!(receiver.receive_layer().unwrap().is_empty());

        manager.writer = None;
        assert!(matches!(
            receiver.receive_layer(),
            Err(LayerError::Frame(FrameError::Closed))
        ));
    }

    #[test]
    fn test_receive_layer_clears_cache() {
        let mut manager = LayerManager::new(config()).unwrap();
        let mut writer = manager.writer.take().unwrap();

        let before = manager.find_merged_mapping(&Layer::new());
        assert_eq!(resolved(&before, "A").as_deref(), Some("DEFAULT"));
        assert_eq!(manager.cache.len(), 1);

        let bytes = crate::frame::encode(&LayerFrame {
            layer: Layer::from_pairs([("application", "Chrome")]),
            remove: false,
        })
        .unwrap();
        writer.write_all(&bytes).unwrap();

        let current = manager.receive_layer().unwrap();
        assert!(manager.cache.is_empty());
        let after = manager.find_merged_mapping(&current);
        assert_eq!(resolved(&after, "A").as_deref(), Some("APPLICATION"));
    }

    #[test]
    fn test_receive_applies_every_buffered_frame() {
        let mut manager = LayerManager::new(config()).unwrap();
        let mut writer = manager.writer.take().unwrap();
        let thumbsense = Layer::from_pairs([("thumbsense", true)]);

        let mut bytes = crate::frame::encode(&LayerFrame {
            layer: thumbsense.clone(),
            remove: false,
        })
        .unwrap();
        bytes.extend(
            crate::frame::encode(&LayerFrame {
                layer: thumbsense,
                remove: true,
            })
            .unwrap(),
        );
        writer.write_all(&bytes).unwrap();

        // one call sees both frames, nothing is left for a later wakeup
        assert!(manager.receive_layer().unwrap().is_empty());
        assert_eq!(manager.decoder.pending(), 0);
        assert!(manager.current().is_empty());
    }

    #[test]
    fn test_send_without_pipe() {
        let mut manager = LayerManager::detached(config());
        assert!(matches!(
            manager.send_layer(Layer::new(), false),
            Err(LayerError::NoPipe)
        ));
    }
}
