use skadi_proto::channel::Channel;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

const REMOVAL_BACKLOG: usize = 256;

/// The tracked channel list.  Removals are broadcast so the registry can
/// close sessions of channels that are no longer tracked.
pub struct ChannelStore {
    channels: RwLock<Vec<Channel>>,
    removed_tx: broadcast::Sender<Channel>,
}

impl ChannelStore {
    pub fn new(initial: impl IntoIterator<Item = Channel>) -> Self {
        Self::with_capacity(initial, REMOVAL_BACKLOG)
    }

    /// `backlog` removals may queue per subscriber before it lags.
    pub fn with_capacity(initial: impl IntoIterator<Item = Channel>, backlog: usize) -> Self {
        let mut channels: Vec<Channel> = Vec::new();
        for channel in initial {
            if !channel.name().is_empty() && !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        let (removed_tx, _) = broadcast::channel(backlog);
        Self {
            channels: RwLock::new(channels),
            removed_tx,
        }
    }

    pub fn subscribe_removals(&self) -> broadcast::Receiver<Channel> {
        self.removed_tx.subscribe()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.channels.read().await.clone()
    }

    /// Returns false if the channel was already tracked.
    pub async fn add(&self, channel: Channel) -> bool {
        let mut channels = self.channels.write().await;
        if channel.name().is_empty() || channels.contains(&channel) {
            return false;
        }
        info!("Tracking channel {}", channel);
        channels.push(channel);
        true
    }

    /// Returns false if the channel was not tracked.
    pub async fn remove(&self, channel: &Channel) -> bool {
        let mut channels = self.channels.write().await;
        let Some(pos) = channels.iter().position(|c| c == channel) else {
            return false;
        };
        let removed = channels.remove(pos);
        info!("No longer tracking channel {}", removed);
        let _ = self.removed_tx.send(removed);
        true
    }
}
