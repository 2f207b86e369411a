//! Centralized configuration for Rivulet.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::engine::{ContainerFormat, FrameSpec};

/// Central configuration for all Rivulet components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct RivuletConfig {
    pub chunking: ChunkingConfig,
    pub decode: DecodeConfig,
    pub frame_pool: FramePoolConfig,
    pub persistence: PersistenceConfig,
}

/// Chunk boundary and strategy configuration.
///
/// Controls target chunk duration, the overflow cut rule, which codecs are
/// repackaged verbatim, and what transcoding normalizes to.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Approximate duration of each chunk
    pub target_duration: Duration,
    /// A chunk is cut regardless of key frames once it exceeds this many
    /// target durations
    pub overflow_factor: u32,
    /// Codecs whose packets can be copied into standalone chunks
    pub repackage_codecs: Vec<String>,
    /// Codec transcoded chunks are encoded with
    pub transcode_codec: String,
    /// Container transcoded chunks are written in
    pub transcode_container: ContainerFormat,
    /// Frames between forced key frames when transcoding
    pub transcode_gop: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_duration: Duration::from_secs(5),
            overflow_factor: 3,
            repackage_codecs: [
                "h264",
                "hevc",
                "mpeg1video",
                "mpeg2video",
                "mpeg4",
                "vp8",
                "vp9",
                "av1",
                "flv1",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            transcode_codec: "h264".to_string(),
            transcode_container: ContainerFormat::MpegTs,
            transcode_gop: 30,
        }
    }
}

impl ChunkingConfig {
    pub fn target_millis(&self) -> i64 {
        i64::try_from(self.target_duration.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Packet decoding configuration.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Consecutive failed decode calls tolerated per packet
    pub max_decode_attempts: u32,
    /// Shape decoded frames are converted to (None = as decoded)
    pub output_frame: Option<FrameSpec>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_decode_attempts: 3,
            output_frame: None,
        }
    }
}

/// Shared frame buffer pool configuration.
#[derive(Debug, Clone)]
pub struct FramePoolConfig {
    /// Maximum buffers alive at once, checked out plus idle
    pub capacity: usize,
    /// Inactivity after which idle buffers are dropped
    pub idle_window: Duration,
    /// How long a blocked acquisition sleeps between re-checks
    pub wait_slice: Duration,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            idle_window: Duration::from_secs(30),
            wait_slice: Duration::from_millis(50),
        }
    }
}

impl FramePoolConfig {
    /// Small pool with short timers for tests
    pub fn for_testing() -> Self {
        Self {
            capacity: 8,
            idle_window: Duration::from_millis(100),
            wait_slice: Duration::from_millis(5),
        }
    }
}

/// Chunk persistence configuration.
///
/// Retention drives chunk expiration; the channel bounds how many finished
/// chunks may wait for the sink.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// How long persisted chunks are kept
    pub retention: Duration,
    /// Upper bound on the expiration buffer window
    pub max_buffer_window: Duration,
    /// Finished chunks queued between the chunking worker and the sink
    pub channel_capacity: usize,
    /// Entries kept by the in-memory sink
    pub memory_max_chunks: usize,
    /// Total payload bytes kept by the in-memory sink
    pub memory_max_bytes: u64,
    /// How often the in-memory sink sweeps expired chunks
    pub sweep_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            max_buffer_window: Duration::from_secs(5 * 60),
            channel_capacity: 8,
            memory_max_chunks: 1024,
            memory_max_bytes: 512 * 1024 * 1024, // 512 MiB
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RivuletConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(seconds) = std::env::var("RIVULET_CHUNK_SECONDS")
            && let Ok(seconds) = seconds.parse::<u64>()
            && seconds > 0
        {
            config.chunking.target_duration = Duration::from_secs(seconds);
        }

        if let Ok(capacity) = std::env::var("RIVULET_POOL_CAPACITY")
            && let Ok(capacity) = capacity.parse::<usize>()
            && capacity > 0
        {
            config.frame_pool.capacity = capacity;
        }

        if let Ok(seconds) = std::env::var("RIVULET_POOL_IDLE_SECONDS")
            && let Ok(seconds) = seconds.parse::<u64>()
        {
            config.frame_pool.idle_window = Duration::from_secs(seconds);
        }

        if let Ok(seconds) = std::env::var("RIVULET_RETENTION_SECONDS")
            && let Ok(seconds) = seconds.parse::<u64>()
        {
            config.persistence.retention = Duration::from_secs(seconds);
        }

        if let Ok(codec) = std::env::var("RIVULET_TRANSCODE_CODEC")
            && !codec.trim().is_empty()
        {
            config.chunking.transcode_codec = codec.trim().to_string();
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            frame_pool: FramePoolConfig::for_testing(),
            persistence: PersistenceConfig {
                sweep_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Same as [`RivuletConfig::for_testing`] with a different target chunk
    /// duration
    pub fn with_target(mut self, target: Duration) -> Self {
        self.chunking.target_duration = target;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = RivuletConfig::default();

        assert_eq!(config.chunking.target_duration, Duration::from_secs(5));
        assert_eq!(config.chunking.target_millis(), 5000);
        assert_eq!(config.chunking.overflow_factor, 3);
        assert_eq!(config.chunking.transcode_codec, "h264");
        assert_eq!(config.chunking.transcode_container, ContainerFormat::MpegTs);
        assert_eq!(config.chunking.transcode_gop, 30);
        assert!(config.chunking.repackage_codecs.iter().any(|c| c == "h264"));
        assert_eq!(config.decode.max_decode_attempts, 3);
        assert_eq!(config.frame_pool.capacity, 32);
        assert_eq!(config.frame_pool.idle_window, Duration::from_secs(30));
        assert_eq!(config.persistence.retention, Duration::from_secs(3600));
        assert_eq!(
            config.persistence.max_buffer_window,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_config_presets() {
        let testing_config = RivuletConfig::for_testing();
        assert_eq!(testing_config.frame_pool.capacity, 8);
        assert!(testing_config.frame_pool.idle_window < Duration::from_secs(1));

        let short = RivuletConfig::for_testing().with_target(Duration::from_secs(2));
        assert_eq!(short.chunking.target_millis(), 2000);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("RIVULET_CHUNK_SECONDS", "10");
            std::env::set_var("RIVULET_POOL_CAPACITY", "64");
            std::env::set_var("RIVULET_POOL_IDLE_SECONDS", "5");
            std::env::set_var("RIVULET_RETENTION_SECONDS", "120");
            std::env::set_var("RIVULET_TRANSCODE_CODEC", "mpeg4");
        }

        let config = RivuletConfig::from_env();

        assert_eq!(config.chunking.target_duration, Duration::from_secs(10));
        assert_eq!(config.frame_pool.capacity, 64);
        assert_eq!(config.frame_pool.idle_window, Duration::from_secs(5));
        assert_eq!(config.persistence.retention, Duration::from_secs(120));
        assert_eq!(config.chunking.transcode_codec, "mpeg4");

        // Cleanup
        unsafe {
            std::env::remove_var("RIVULET_CHUNK_SECONDS");
            std::env::remove_var("RIVULET_POOL_CAPACITY");
            std::env::remove_var("RIVULET_POOL_IDLE_SECONDS");
            std::env::remove_var("RIVULET_RETENTION_SECONDS");
            std::env::remove_var("RIVULET_TRANSCODE_CODEC");
        }
    }
}
