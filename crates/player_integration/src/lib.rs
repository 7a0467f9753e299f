use async_trait::async_trait;
use shared::domain::StreamProtocol;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSource {
    pub protocol: StreamProtocol,
    pub url: String,
}

/// Video decoder/renderer the streaming session drives. Decoding itself lives
/// behind this seam.
#[async_trait]
pub trait PlayerBackend: Send + Sync {
    async fn attach(&self, source: PlaybackSource) -> anyhow::Result<()>;
    async fn detach(&self) -> anyhow::Result<()>;
    async fn current_source(&self) -> Option<PlaybackSource>;
    /// Whether playback of `protocol` happens inside this backend. `udp`
    /// streams are consumed by an external receiver.
    fn plays(&self, protocol: StreamProtocol) -> bool;
}

pub struct MissingPlayer;

#[async_trait]
impl PlayerBackend for MissingPlayer {
    async fn attach(&self, source: PlaybackSource) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "no player backend available for {} stream {}",
            source.protocol,
            source.url
        ))
    }

    async fn detach(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn current_source(&self) -> Option<PlaybackSource> {
        None
    }

    fn plays(&self, _protocol: StreamProtocol) -> bool {
        false
    }
}

/// Player that only tracks which source would be on screen. Used by the
/// command-line front end, where rendering is left to an external viewer.
pub struct HeadlessPlayer {
    current: Mutex<Option<PlaybackSource>>,
}

impl HeadlessPlayer {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl Default for HeadlessPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlayerBackend for HeadlessPlayer {
    async fn attach(&self, source: PlaybackSource) -> anyhow::Result<()> {
        info!(
            "player: attach protocol={} url={}",
            source.protocol, source.url
        );
        *self.current.lock().await = Some(source);
        Ok(())
    }

    async fn detach(&self) -> anyhow::Result<()> {
        if self.current.lock().await.take().is_some() {
            info!("player: detach");
        }
        Ok(())
    }

    async fn current_source(&self) -> Option<PlaybackSource> {
        self.current.lock().await.clone()
    }

    fn plays(&self, protocol: StreamProtocol) -> bool {
        matches!(protocol, StreamProtocol::Hls | StreamProtocol::Rtsp)
    }
}
