//! Per-channel flow-control policy handed out when a channel becomes active.

use std::fmt;
use std::sync::Arc;

use crate::endpoint::Channel;

/// Send window used by [`DefaultProducerControl`].
pub const DEFAULT_WINDOW_LENGTH: u32 = 128 * 1024;

/// Decides how far a source may run ahead of its receivers.
pub trait ProducerControl: Send + Sync + fmt::Debug {
    fn window_length(&self) -> u32;

    fn can_send(&self, in_flight: u64) -> bool {
        in_flight < u64::from(self.window_length())
    }
}

/// Creates the [`ProducerControl`] for a channel once the driver confirms it.
pub type ProducerControlFactory = Arc<dyn Fn(&Channel) -> Arc<dyn ProducerControl> + Send + Sync>;

/// Fixed-window control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultProducerControl {
    window_length: u32,
}

impl DefaultProducerControl {
    pub fn new(window_length: u32) -> Self {
        Self { window_length }
    }
}

impl Default for DefaultProducerControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LENGTH)
    }
}

impl ProducerControl for DefaultProducerControl {
    fn window_length(&self) -> u32 {
        self.window_length
    }
}

pub fn default_producer_control() -> ProducerControlFactory {
    Arc::new(|_channel: &Channel| Arc::new(DefaultProducerControl::default()) as Arc<dyn ProducerControl>)
}
