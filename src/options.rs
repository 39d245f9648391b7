//! Configuration for the signal, engine and room layers.
//!
//! All option types follow the same shape: `Default` (or `new` where a
//! collaborator is required) plus consuming `with_*` builders.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{VideoLayer, VideoQuality};
use crate::rtc::peer::PeerFactory;
use crate::socket::SocketConnector;
use crate::utils::retry::RetryPolicy;

/// Default join handshake timeout.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for the signal connection.
#[derive(Debug, Clone)]
pub struct SignalOptions {
    /// Ask the server to subscribe this participant to every published track.
    pub auto_subscribe: bool,
    /// How long to wait for the join response before giving up.
    pub join_timeout: Duration,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl SignalOptions {
    #[must_use]
    pub fn with_auto_subscribe(mut self, auto_subscribe: bool) -> Self {
        self.auto_subscribe = auto_subscribe;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }
}

/// Options for [`RtcEngine`](crate::rtc::engine::RtcEngine): the two
/// collaborator factories plus signal and reconnect tuning.
#[derive(Clone)]
pub struct EngineOptions {
    pub connector: Arc<dyn SocketConnector>,
    pub peers: Arc<dyn PeerFactory>,
    pub signal: SignalOptions,
    pub reconnect: RetryPolicy,
}

impl EngineOptions {
    pub fn new(connector: Arc<dyn SocketConnector>, peers: Arc<dyn PeerFactory>) -> Self {
        Self {
            connector,
            peers,
            signal: SignalOptions::default(),
            reconnect: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: SignalOptions) -> Self {
        self.signal = signal;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("signal", &self.signal)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// Options for [`Room::connect`](crate::room::Room::connect).
///
/// The peer factory is always required; the socket connector defaults to
/// [`WebSocketConnector`](crate::sockets::websocket::WebSocketConnector) when
/// the `socket-websocket` feature is enabled.
#[derive(Clone)]
pub struct RoomOptions {
    pub signal: SignalOptions,
    pub reconnect: RetryPolicy,
    peers: Arc<dyn PeerFactory>,
    connector: Option<Arc<dyn SocketConnector>>,
}

impl RoomOptions {
    pub fn new(peers: Arc<dyn PeerFactory>) -> Self {
        Self {
            signal: SignalOptions::default(),
            reconnect: RetryPolicy::default(),
            peers,
            connector: None,
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: SignalOptions) -> Self {
        self.signal = signal;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replace the default socket connector, e.g. with a mock in tests.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub(crate) fn into_engine_options(self) -> Result<EngineOptions> {
        let connector = match self.connector {
            Some(connector) => connector,
            #[cfg(feature = "socket-websocket")]
            None => Arc::new(crate::sockets::websocket::WebSocketConnector::new()),
            #[cfg(not(feature = "socket-websocket"))]
            None => {
                return Err(crate::error::RoomWireError::State(
                    "no socket connector configured and the socket-websocket feature is disabled"
                        .into(),
                ))
            }
        };
        Ok(EngineOptions {
            connector,
            peers: self.peers,
            signal: self.signal,
            reconnect: self.reconnect,
        })
    }
}

impl std::fmt::Debug for RoomOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomOptions")
            .field("signal", &self.signal)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

// ── Simulcast presets ───────────────────────────────────────────────

/// A resolution / encode-bitrate pairing used to seed simulcast layer
/// bitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPreset {
    pub width: u32,
    pub height: u32,
    /// Target encode bitrate, bits per second.
    pub max_bitrate: u64,
}

impl VideoPreset {
    pub const fn new(width: u32, height: u32, max_bitrate: u64) -> Self {
        Self {
            width,
            height,
            max_bitrate,
        }
    }
}

/// Standard 16:9 bitrate ladder, ascending.
pub const PRESETS_16_9: [VideoPreset; 6] = [
    VideoPreset::new(160, 90, 90_000),
    VideoPreset::new(320, 180, 160_000),
    VideoPreset::new(640, 360, 450_000),
    VideoPreset::new(960, 540, 800_000),
    VideoPreset::new(1280, 720, 1_700_000),
    VideoPreset::new(1920, 1080, 3_000_000),
];

/// Standard 4:3 bitrate ladder, ascending.
pub const PRESETS_4_3: [VideoPreset; 6] = [
    VideoPreset::new(120, 90, 70_000),
    VideoPreset::new(240, 180, 125_000),
    VideoPreset::new(480, 360, 330_000),
    VideoPreset::new(720, 540, 600_000),
    VideoPreset::new(960, 720, 1_300_000),
    VideoPreset::new(1440, 1080, 2_800_000),
];

/// Derive the simulcast layers announced for a video track of the given
/// capture size: full, half and quarter resolution, with bitrates taken from
/// the ladder preset closest in height (ties resolve to the smaller preset).
pub fn compute_video_layers(width: u32, height: u32) -> Vec<VideoLayer> {
    const DIVISORS: [(u32, VideoQuality); 3] = [
        (1, VideoQuality::High),
        (2, VideoQuality::Medium),
        (4, VideoQuality::Low),
    ];
    let ladder: &[VideoPreset] = if width * 3 == height * 4 {
        &PRESETS_4_3
    } else {
        &PRESETS_16_9
    };
    DIVISORS
        .iter()
        .filter_map(|&(divisor, quality)| {
            let layer_height = height / divisor;
            let preset = nearest_preset(ladder, layer_height)?;
            Some(VideoLayer {
                quality,
                width: width / divisor,
                height: layer_height,
                bitrate: preset.max_bitrate,
            })
        })
        .collect()
}

fn nearest_preset(ladder: &[VideoPreset], height: u32) -> Option<VideoPreset> {
    // `min_by_key` keeps the first of equals, so ties go to the smaller preset.
    ladder
        .iter()
        .copied()
        .min_by_key(|preset| preset.height.abs_diff(height))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn layers_for_720p_span_the_ladder() {
        let layers = compute_video_layers(1280, 720);
        assert_eq!(layers.len(), 3);

        assert_eq!(layers[0].quality, VideoQuality::High);
        assert_eq!((layers[0].width, layers[0].height), (1280, 720));
        assert_eq!(layers[0].bitrate, 1_700_000);

        assert_eq!(layers[1].quality, VideoQuality::Medium);
        assert_eq!((layers[1].width, layers[1].height), (640, 360));
        assert_eq!(layers[1].bitrate, 450_000);

        assert_eq!(layers[2].quality, VideoQuality::Low);
        assert_eq!((layers[2].width, layers[2].height), (320, 180));
        assert_eq!(layers[2].bitrate, 160_000);
    }

    #[test]
    fn four_by_three_input_uses_the_four_by_three_ladder() {
        let layers = compute_video_layers(640, 480);
        // 480 is closer to the 540-high preset than the 360-high one.
        assert_eq!(layers[0].bitrate, 600_000);
        assert_eq!((layers[1].width, layers[1].height), (320, 240));
    }

    #[test]
    fn odd_sizes_fall_back_to_sixteen_by_nine() {
        let layers = compute_video_layers(1000, 600);
        // 600 ties nowhere; 540 is nearest.
        assert_eq!(layers[0].bitrate, 800_000);
    }

    #[test]
    fn signal_options_defaults() {
        let options = SignalOptions::default();
        assert!(options.auto_subscribe);
        assert_eq!(options.join_timeout, DEFAULT_JOIN_TIMEOUT);

        let options = options.with_auto_subscribe(false);
        assert!(!options.auto_subscribe);
    }
}
