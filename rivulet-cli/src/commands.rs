//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Subcommand, ValueEnum};
use rivulet_core::chunking::{ChunkingRequest, select_provider_kind};
use rivulet_core::decode::{CoderPack, MetadataRecorder};
use rivulet_core::engine::simulation::SimulationEngine;
use rivulet_core::engine::simulation::fixture::SyntheticStream;
use rivulet_core::engine::MediaEngine;
use rivulet_core::{
    ChunkProviderFactory, DirectoryChunkSink, FramePool, InputStream, RivuletConfig,
    RivuletError, StreamChunkOrchestrator,
};
use tracing::{info, warn};

/// Codec engine backing a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// In-process engine reading `rsim` streams
    Sim,
    /// System libav libraries
    Ffmpeg,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Chunk a stream into a directory
    Chunk {
        /// Input file, or "-" for stdin
        input: PathBuf,
        /// Directory receiving `<category>/<start>-<end>.<ext>` chunks
        #[arg(short, long)]
        out: PathBuf,
        /// Target chunk duration in seconds
        #[arg(long)]
        target_secs: Option<f64>,
        /// Category the chunks are stored under
        #[arg(long, default_value = "stream")]
        category: String,
        /// Epoch milliseconds of the first frame (defaults to now)
        #[arg(long)]
        start_ms: Option<i64>,
        /// Known epoch end of the stream in milliseconds
        #[arg(long)]
        end_ms: Option<i64>,
        /// Drop the partial last chunk when interrupted
        #[arg(long)]
        discard_partial: bool,
        /// File extension of chunk payloads
        #[arg(long, default_value = "chunk")]
        extension: String,
        #[arg(long, value_enum, default_value_t = EngineKind::Sim)]
        engine: EngineKind,
    },
    /// Show the tracks of a stream and how it would be chunked
    Inspect {
        /// Input file, or "-" for stdin
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = EngineKind::Sim)]
        engine: EngineKind,
    },
    /// Write a synthetic `rsim` stream for experiments
    Simulate {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        /// Stream length in seconds
        #[arg(long, default_value = "30")]
        seconds: u32,
        /// Seconds between key frames
        #[arg(long, default_value = "2")]
        keyframe_secs: f64,
        /// Codec name written into the video track
        #[arg(long, default_value = "h264")]
        codec: String,
        /// Milliseconds between metadata packets
        #[arg(long)]
        metadata: Option<i64>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Chunk {
            input,
            out,
            target_secs,
            category,
            start_ms,
            end_ms,
            discard_partial,
            extension,
            engine,
        } => {
            let options = ChunkOptions {
                target_secs,
                category,
                start_ms,
                end_ms,
                discard_partial,
                extension,
            };
            chunk_stream(&input, &out, options, engine).await
        }
        Commands::Inspect { input, engine } => inspect_stream(&input, engine).await,
        Commands::Simulate {
            out,
            seconds,
            keyframe_secs,
            codec,
            metadata,
        } => write_simulated_stream(&out, seconds, keyframe_secs, &codec, metadata).await,
    }
}

/// Options of the `chunk` command
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub target_secs: Option<f64>,
    pub category: String,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub discard_partial: bool,
    pub extension: String,
}

/// Builds the configuration for a run from the environment and flags
///
/// # Errors
/// - `RivuletError::Configuration` - target duration is not positive
pub fn chunking_config(target_secs: Option<f64>) -> rivulet_core::Result<RivuletConfig> {
    let mut config = RivuletConfig::from_env();
    if let Some(seconds) = target_secs {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(RivuletError::Configuration {
                reason: format!("target duration must be positive, got {seconds}"),
            });
        }
        config.chunking.target_duration = Duration::from_secs_f64(seconds);
    }
    Ok(config)
}

fn build_engine(kind: EngineKind) -> anyhow::Result<Arc<dyn MediaEngine>> {
    match kind {
        EngineKind::Sim => Ok(Arc::new(SimulationEngine::new())),
        #[cfg(feature = "ffmpeg")]
        EngineKind::Ffmpeg => Ok(Arc::new(rivulet_core::engine::ffmpeg::FfmpegEngine::new()?)),
        #[cfg(not(feature = "ffmpeg"))]
        EngineKind::Ffmpeg => bail!("rivulet was built without the ffmpeg feature"),
    }
}

fn open_input(path: &Path) -> anyhow::Result<InputStream> {
    if path.as_os_str() == "-" {
        return Ok(InputStream::new(std::io::stdin()).with_label("stdin"));
    }
    InputStream::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Chunk a stream into a directory
///
/// # Errors
/// - Input cannot be opened, or chunking and persistence fail
pub async fn chunk_stream(
    input: &Path,
    out: &Path,
    options: ChunkOptions,
    engine: EngineKind,
) -> anyhow::Result<()> {
    let config = chunking_config(options.target_secs)?;
    let engine = build_engine(engine)?;
    let pool = FramePool::new(config.frame_pool.clone());
    let _reclaimer = pool.spawn_reclaimer();

    let factory = Arc::new(ChunkProviderFactory::from_config(engine, pool, &config));
    let sink = Arc::new(DirectoryChunkSink::new(out).with_extension(&options.extension));
    let orchestrator = StreamChunkOrchestrator::new(factory, sink, &config.persistence);

    let stream = open_input(input)?;
    let handle = stream.handle();
    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, flushing the current chunk");
            interrupt.cancel();
        }
    });

    let metadata = Arc::new(MetadataRecorder::new());
    let start_ms = options
        .start_ms
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let mut request = ChunkingRequest::new(options.category.clone(), stream, start_ms)
        .with_metadata_handler(metadata.clone());
    if let Some(end_ms) = options.end_ms {
        request = request.with_stream_end(end_ms);
    }
    if options.discard_partial {
        request = request.discard_partial_on_cancel();
    }

    println!(
        "Chunking {} into {} ({} s target)",
        handle.label(),
        out.display(),
        config.chunking.target_duration.as_secs_f64()
    );
    let report = orchestrator
        .run(request)
        .await
        .map_err(|e| anyhow::anyhow!(RivuletError::from(e).user_message()))?;

    println!(
        "Stored {} chunks via {} provider{}",
        report.chunks_persisted,
        report.provider,
        if report.failover_used {
            " (after failover)"
        } else {
            ""
        }
    );
    println!("  Session: {}", report.session_id);
    println!("  Bytes read: {}", report.bytes_read);
    println!("  Metadata packets: {}", metadata.len());
    if report.cancelled {
        println!("  Stream was interrupted");
    }
    info!("Chunks written to {}", out.join(&options.category).display());
    Ok(())
}

/// Show the tracks of a stream and how it would be chunked
///
/// # Errors
/// - Input cannot be opened or has no video track
pub async fn inspect_stream(input: &Path, engine: EngineKind) -> anyhow::Result<()> {
    let engine = build_engine(engine)?;
    let stream = open_input(input)?;
    let config = RivuletConfig::from_env();

    let pack = tokio::task::spawn_blocking(move || CoderPack::inspect(engine.as_ref(), stream))
        .await
        .context("Inspection task failed")?
        .map_err(RivuletError::from)?;

    println!("Format: {}", pack.format_name());
    for track in pack.input().tracks() {
        println!(
            "  #{} {:?} {} {}x{} ({})",
            track.index, track.kind, track.codec_name, track.width, track.height, track.time_base
        );
    }
    let kind = select_provider_kind(pack.codec_name(), &config.chunking.repackage_codecs);
    println!("Video codec: {} -> {} chunks", pack.codec_name(), kind);
    match pack.metadata_track() {
        Some(track) => println!("Metadata track: #{}", track.index),
        None => println!("Metadata track: none"),
    }
    Ok(())
}

/// Write a synthetic `rsim` stream
///
/// # Errors
/// - Invalid key frame interval or the file cannot be written
pub async fn write_simulated_stream(
    out: &Path,
    seconds: u32,
    keyframe_secs: f64,
    codec: &str,
    metadata_every_ms: Option<i64>,
) -> anyhow::Result<()> {
    if !keyframe_secs.is_finite() || keyframe_secs <= 0.0 {
        bail!("key frame interval must be positive, got {keyframe_secs}");
    }
    let keyframe_ms = (keyframe_secs * 1000.0).round() as i64;
    let mut stream = SyntheticStream::new(i64::from(seconds) * 1000)
        .with_codec(codec)
        .with_keyframe_interval(keyframe_ms.max(1));
    if let Some(interval) = metadata_every_ms {
        stream = stream.with_metadata_every(interval);
    }

    let bytes = stream.to_bytes();
    tokio::fs::write(out, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!(
        "Wrote {} video packets ({} bytes) to {}",
        stream.video_packet_count(),
        bytes.len(),
        out.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_config_rejects_bad_target() {
        assert!(chunking_config(Some(0.0)).is_err());
        assert!(chunking_config(Some(f64::NAN)).is_err());
        let config = chunking_config(Some(2.5)).unwrap();
        assert_eq!(config.chunking.target_duration, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_simulate_then_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let stream_path = dir.path().join("input.rsim");
        write_simulated_stream(&stream_path, 12, 4.0, "h264", None)
            .await
            .unwrap();

        let out = dir.path().join("chunks");
        let options = ChunkOptions {
            target_secs: Some(5.0),
            category: "cam".to_string(),
            start_ms: Some(0),
            end_ms: None,
            discard_partial: false,
            extension: "rsim".to_string(),
        };
        chunk_stream(&stream_path, &out, options, EngineKind::Sim)
            .await
            .unwrap();

        let entries = DirectoryChunkSink::new(&out).list("cam").await.unwrap();
        let spans: Vec<_> = entries.iter().map(|e| (e.start_ms, e.end_ms)).collect();
        assert_eq!(spans, vec![(0, 8000), (8000, 12_000)]);
        assert!(out.join("cam").join("0-8000.rsim").exists());
    }
}
