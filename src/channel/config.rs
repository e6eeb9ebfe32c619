//! Recognized channel options (spec §3 "configuration", §4.3 auto-read and
//! water marks).

use std::sync::Arc;
use std::time::Duration;

use crate::buf::ByteBufAllocator;

/// Low/high buffered-byte thresholds that drive a channel's writability
/// flag. Defaults are Netty's own published values, recovered via
/// SPEC_FULL.md §9 since `original_source/` retained no source to read the
/// constants from directly.
#[derive(Clone, Copy, Debug)]
pub struct WaterMark {
    pub low: usize,
    pub high: usize,
}

impl Default for WaterMark {
    fn default() -> Self {
        WaterMark {
            low: 32 * 1024,
            high: 64 * 1024,
        }
    }
}

/// Per-channel configuration (spec §3, §6.3's allocator knob plus the
/// water marks and auto-read flag named in §4.3).
#[derive(Clone)]
pub struct ChannelConfig {
    pub allocator: Arc<dyn ByteBufAllocator>,
    pub auto_read: bool,
    pub water_mark: WaterMark,
    /// How long a `TcpChannel::connect` may stay unresolved before it fails
    /// with `ChannelError::ConnectTimedOut` (spec §5).
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(allocator: Arc<dyn ByteBufAllocator>) -> Self {
        ChannelConfig {
            allocator,
            auto_read: true,
            water_mark: WaterMark::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    pub fn with_water_mark(mut self, water_mark: WaterMark) -> Self {
        self.water_mark = water_mark;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}
