//! Chunk provider selection
//!
//! The strategy is a pure function of the video codec name. Repackaged
//! chunks are written in a container picked from an explicit per-codec
//! table; codecs missing from the table mirror the input container.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::repackaging::RepackagingChunkProvider;
use super::transcoding::TranscodingChunkProvider;
use super::{
    ChunkError, ChunkProvider, ProviderKind, ProviderRun, ProviderSession, VideoChunkConsumer,
};
use crate::config::{ChunkingConfig, DecodeConfig, RivuletConfig};
use crate::decode::{CoderPack, FramePool, MetadataContentHandler};
use crate::engine::{ContainerFormat, MediaEngine};
use crate::input::InputStream;

/// Picks repackaging when `codec` is in `repackage_codecs`, transcoding
/// otherwise. Matching ignores ASCII case.
pub fn select_provider_kind(codec: &str, repackage_codecs: &[String]) -> ProviderKind {
    if repackage_codecs
        .iter()
        .any(|c| c.eq_ignore_ascii_case(codec))
    {
        ProviderKind::Repackaging
    } else {
        ProviderKind::Transcoding
    }
}

/// Output container for repackaged chunks of one codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerChoice {
    /// Same container family as the input
    Mirror,
    Force(ContainerFormat),
}

/// Per-codec output container table for repackaged chunks
#[derive(Debug)]
pub struct ContainerPolicy {
    choices: HashMap<String, ContainerChoice>,
    warned: Mutex<HashSet<String>>,
}

impl Default for ContainerPolicy {
    fn default() -> Self {
        let mut choices = HashMap::new();
        // Flash video codecs only play back reliably from FLV
        for codec in ["flv1", "vp6", "vp6f", "vp6a"] {
            choices.insert(codec.to_string(), ContainerChoice::Force(ContainerFormat::Flv));
        }
        // MPEG-1/2 elementary streams go into a transport stream
        for codec in ["mpeg1video", "mpeg2video"] {
            choices.insert(
                codec.to_string(),
                ContainerChoice::Force(ContainerFormat::MpegTs),
            );
        }
        for codec in ["h264", "hevc", "mpeg4", "vp8", "vp9", "av1"] {
            choices.insert(codec.to_string(), ContainerChoice::Mirror);
        }
        Self {
            choices,
            warned: Mutex::new(HashSet::new()),
        }
    }
}

impl ContainerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `codec`
    pub fn with_choice(mut self, codec: &str, choice: ContainerChoice) -> Self {
        self.choices.insert(codec.to_ascii_lowercase(), choice);
        self
    }

    pub fn choice_for(&self, codec: &str) -> Option<&ContainerChoice> {
        self.choices.get(&codec.to_ascii_lowercase())
    }

    /// Output container for `codec` read from a container whose demuxer is
    /// `demuxer_name`. A codec without an entry mirrors the input and is
    /// warned about once.
    pub fn resolve(&self, codec: &str, demuxer_name: &str) -> ContainerFormat {
        match self.choice_for(codec) {
            Some(ContainerChoice::Force(format)) => format.clone(),
            Some(ContainerChoice::Mirror) => ContainerFormat::from_demuxer_name(demuxer_name),
            None => {
                if self.warned.lock().insert(codec.to_ascii_lowercase()) {
                    warn!(
                        "No container policy for codec '{}', mirroring input container '{}'",
                        codec, demuxer_name
                    );
                }
                ContainerFormat::from_demuxer_name(demuxer_name)
            }
        }
    }
}

/// A provider picked by the factory
pub enum SelectedProvider {
    Repackaging(RepackagingChunkProvider),
    Transcoding(TranscodingChunkProvider),
}

impl ChunkProvider for SelectedProvider {
    fn kind(&self) -> ProviderKind {
        match self {
            SelectedProvider::Repackaging(_) => ProviderKind::Repackaging,
            SelectedProvider::Transcoding(_) => ProviderKind::Transcoding,
        }
    }

    fn provide_chunks(
        &mut self,
        consumer: &mut dyn VideoChunkConsumer,
        metadata: Arc<dyn MetadataContentHandler>,
    ) -> Result<ProviderRun, ChunkError> {
        match self {
            SelectedProvider::Repackaging(provider) => provider.provide_chunks(consumer, metadata),
            SelectedProvider::Transcoding(provider) => provider.provide_chunks(consumer, metadata),
        }
    }
}

impl std::fmt::Debug for SelectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectedProvider::Repackaging(provider) => f
                .debug_tuple("Repackaging")
                .field(provider.format())
                .finish(),
            SelectedProvider::Transcoding(_) => f.write_str("Transcoding"),
        }
    }
}

/// Builds chunk providers over a shared engine and frame pool
pub struct ChunkProviderFactory {
    engine: Arc<dyn MediaEngine>,
    pool: Arc<FramePool>,
    chunking: ChunkingConfig,
    decode: DecodeConfig,
    policy: ContainerPolicy,
    failovers: AtomicUsize,
}

impl ChunkProviderFactory {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        pool: Arc<FramePool>,
        chunking: ChunkingConfig,
        decode: DecodeConfig,
    ) -> Self {
        Self {
            engine,
            pool,
            chunking,
            decode,
            policy: ContainerPolicy::default(),
            failovers: AtomicUsize::new(0),
        }
    }

    pub fn from_config(
        engine: Arc<dyn MediaEngine>,
        pool: Arc<FramePool>,
        config: &RivuletConfig,
    ) -> Self {
        Self::new(engine, pool, config.chunking.clone(), config.decode.clone())
    }

    pub fn with_policy(mut self, policy: ContainerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn chunking_config(&self) -> &ChunkingConfig {
        &self.chunking
    }

    pub fn policy(&self) -> &ContainerPolicy {
        &self.policy
    }

    pub fn select_kind(&self, codec: &str) -> ProviderKind {
        select_provider_kind(codec, &self.chunking.repackage_codecs)
    }

    /// Inspects `stream` and builds the provider its video codec calls for
    ///
    /// # Errors
    /// - `ChunkError::Setup` - no video track, or the decoder could not be
    ///   opened
    pub fn create_provider(
        &self,
        stream: InputStream,
        stream_start_ms: i64,
    ) -> Result<SelectedProvider, ChunkError> {
        let pack = CoderPack::inspect(self.engine.as_ref(), stream).map_err(ChunkError::Setup)?;
        let kind = self.select_kind(pack.codec_name());
        info!(
            "Selected {} for {} ({})",
            kind,
            pack.input_handle().label(),
            pack.codec_name()
        );
        self.build(kind, pack, stream_start_ms)
    }

    /// Same as [`create_provider`](Self::create_provider) for an already
    /// inspected stream, with the strategy forced to `kind`
    ///
    /// # Errors
    /// - `ChunkError::Setup` - the decoder refused the coder pack
    pub fn build(
        &self,
        kind: ProviderKind,
        pack: CoderPack,
        stream_start_ms: i64,
    ) -> Result<SelectedProvider, ChunkError> {
        match kind {
            ProviderKind::Repackaging => {
                let format = self.policy.resolve(pack.codec_name(), pack.format_name());
                let session = ProviderSession::new(
                    Arc::clone(&self.engine),
                    pack,
                    stream_start_ms,
                    self.chunking.clone(),
                );
                Ok(SelectedProvider::Repackaging(RepackagingChunkProvider::new(
                    session, format,
                )))
            }
            ProviderKind::Transcoding => {
                let session = ProviderSession::new(
                    Arc::clone(&self.engine),
                    pack,
                    stream_start_ms,
                    self.chunking.clone(),
                );
                self.transcoding(session)
            }
        }
    }

    /// Replaces a failed repackaging provider with a transcoding provider
    /// over the same opened input, picking up at the packet after the one
    /// that failed. The failed provider's unfinished chunk is re-encoded
    /// from that point under the same start time.
    ///
    /// Returns `Ok(None)` when `failed` was already transcoding.
    ///
    /// # Errors
    /// - `ChunkError::Setup` - the decoder refused the coder pack
    pub fn create_failover_provider(
        &self,
        failed: SelectedProvider,
    ) -> Result<Option<SelectedProvider>, ChunkError> {
        match failed {
            SelectedProvider::Transcoding(_) => {
                warn!("Transcoding provider failed, no failover left");
                Ok(None)
            }
            SelectedProvider::Repackaging(provider) => {
                let mut session = provider.into_session();
                session.timeline.discard_open_content();
                self.failovers.fetch_add(1, Ordering::SeqCst);
                info!(
                    "Failing over {} to transcoding at {} bytes read",
                    session.pack.input_handle().label(),
                    session.pack.bytes_read()
                );
                self.transcoding(session).map(Some)
            }
        }
    }

    /// Failover providers created so far
    pub fn failovers_created(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }

    fn transcoding(&self, session: ProviderSession) -> Result<SelectedProvider, ChunkError> {
        let provider = TranscodingChunkProvider::new(session, Arc::clone(&self.pool), &self.decode)?;
        Ok(SelectedProvider::Transcoding(provider))
    }
}
