/// SessionRegistry: single owner of the channel → session map.
///
/// Every mutation arrives as a `RegistryEvent` on one mpsc channel: open and
/// close requests from the HTTP API and CLI, channel removals from the store,
/// and `SessionEnded` from each session's monitor task.  Only the loop in
/// `SessionRegistry::run` touches the map, so a forced close and a natural
/// exit can never both remove an entry.
///
/// Natural exit is compare-and-remove: the entry goes away only if its
/// session id matches the one that ended.  A stale `SessionEnded` for a
/// channel that has since been reopened is ignored.
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use skadi_proto::channel::{Channel, StreamQuality};
use skadi_proto::config::PlayerConfig;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::ProcessSession;
use crate::status::StatusSink;
use crate::store::ChannelStore;

// ── RegistryEvent ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RegistryEvent {
    Open {
        channel: Channel,
        quality: StreamQuality,
    },
    Close(Channel),
    /// Channels dropped from the tracked set; their sessions are force-closed.
    ChannelsRemoved(Vec<Channel>),
    /// Sent exactly once by a session monitor when its process is gone.
    SessionEnded { channel: Channel, session_id: u64 },
    ListSessions(oneshot::Sender<Vec<Channel>>),
    Shutdown,
}

/// Cloneable front door used by everything outside the registry loop.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub fn new(tx: mpsc::Sender<RegistryEvent>) -> Self {
        Self { tx }
    }

    pub async fn open(&self, channel: Channel, quality: StreamQuality) -> anyhow::Result<()> {
        self.send(RegistryEvent::Open { channel, quality }).await
    }

    pub async fn close(&self, channel: Channel) -> anyhow::Result<()> {
        self.send(RegistryEvent::Close(channel)).await
    }

    /// Channels with a live session, sorted by name.
    pub async fn sessions(&self) -> anyhow::Result<Vec<Channel>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryEvent::ListSessions(reply_tx)).await?;
        Ok(reply_rx.await?)
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(RegistryEvent::Shutdown).await
    }

    async fn send(&self, event: RegistryEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("session registry is not running"))
    }
}

// ── SessionRegistry ───────────────────────────────────────────────────────────

pub struct SessionRegistry {
    player: PlayerConfig,
    sessions: HashMap<Channel, ProcessSession>,
    status: StatusSink,
    /// Handed to every session so its monitor can report `SessionEnded`.
    event_tx: mpsc::Sender<RegistryEvent>,
    next_session_id: u64,
}

impl SessionRegistry {
    pub fn new(
        player: PlayerConfig,
        status: StatusSink,
        event_tx: mpsc::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            player,
            sessions: HashMap::new(),
            status,
            event_tx,
            next_session_id: 1,
        }
    }

    /// Start a session for `channel` unless one is already live.  Never fails;
    /// every outcome is reported through the status sink.
    pub fn open(&mut self, channel: Channel, quality: &StreamQuality) {
        if self.is_open(&channel) {
            self.status
                .update(format!("channel {} is already open", channel));
            return;
        }

        self.status
            .update(format!("opening channel {} ({}) ...", channel, quality.quality));

        let id = self.next_session_id;
        self.next_session_id += 1;

        match ProcessSession::start(
            id,
            channel.clone(),
            quality,
            &self.player,
            self.status.clone(),
            self.event_tx.clone(),
        ) {
            Ok(session) => {
                info!("Registry: session {} opened for {}", id, channel);
                self.sessions.insert(channel, session);
            }
            Err(e) => {
                warn!("Registry: could not open {}: {}", channel, e);
                self.status.update(format!("failed to open stream: {}", e));
            }
        }
    }

    /// Force-close the session for `channel`.  Returns false if there was none.
    pub fn close(&mut self, channel: &Channel) -> bool {
        match self.sessions.remove(channel) {
            Some(mut session) => {
                info!("Registry: closing session {} for {}", session.id(), channel);
                session.close_stream();
                true
            }
            None => {
                debug!("Registry: close for {} ignored, no session", channel);
                false
            }
        }
    }

    pub fn channels_removed(&mut self, channels: &[Channel]) {
        for channel in channels {
            if self.close(channel) {
                info!("Registry: {} was removed, session closed", channel);
            }
        }
    }

    /// Compare-and-remove on natural exit.  Returns true if an entry was removed.
    pub fn session_ended(&mut self, channel: &Channel, session_id: u64) -> bool {
        match self.sessions.get(channel) {
            Some(current) if current.id() == session_id => {
                self.sessions.remove(channel);
                info!("Registry: session {} for {} ended", session_id, channel);
                true
            }
            Some(current) => {
                debug!(
                    "Registry: stale end of session {} for {} (current is {})",
                    session_id,
                    channel,
                    current.id()
                );
                false
            }
            None => {
                debug!(
                    "Registry: session {} for {} already removed",
                    session_id, channel
                );
                false
            }
        }
    }

    pub fn is_open(&self, channel: &Channel) -> bool {
        self.sessions.contains_key(channel)
    }

    pub fn open_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.sessions.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run the registry loop until `Shutdown`.  The registry keeps a sender
    /// for its sessions, so the channel never closes on its own.  All remaining
    /// sessions are killed and reaped on the way out.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<RegistryEvent>) {
        info!("Registry: starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("Registry: event channel closed, shutting down");
                    break;
                }
                Some(RegistryEvent::Shutdown) => {
                    info!("Registry: shutdown requested");
                    break;
                }
                Some(RegistryEvent::Open { channel, quality }) => {
                    self.open(channel, &quality);
                }
                Some(RegistryEvent::Close(channel)) => {
                    self.close(&channel);
                }
                Some(RegistryEvent::ChannelsRemoved(channels)) => {
                    self.channels_removed(&channels);
                }
                Some(RegistryEvent::SessionEnded {
                    channel,
                    session_id,
                }) => {
                    self.session_ended(&channel, session_id);
                }
                Some(RegistryEvent::ListSessions(reply)) => {
                    let _ = reply.send(self.open_channels());
                }
            }
        }

        // Monitors of the sessions killed below must not block on a full channel.
        event_rx.close();
        self.shutdown_all().await;
    }

    async fn shutdown_all(&mut self) {
        if self.is_empty() {
            return;
        }
        info!("Registry: closing {} session(s)", self.len());
        for (_, session) in self.sessions.drain() {
            session.terminate().await;
        }
    }
}

/// Forward channel-removal notifications into the registry loop.
///
/// If the forwarder falls behind the store's broadcast, the channels tracked
/// at the last notification but gone now are closed in one batch.  The task
/// ends once the store is dropped.
pub async fn forward_removals(
    store: &Arc<ChannelStore>,
    event_tx: mpsc::Sender<RegistryEvent>,
) -> JoinHandle<()> {
    let mut removed_rx = store.subscribe_removals();
    let mut known = store.channels().await;
    let store: Weak<ChannelStore> = Arc::downgrade(store);

    tokio::spawn(async move {
        loop {
            let removed = match removed_rx.recv().await {
                Ok(channel) => {
                    if let Some(store) = store.upgrade() {
                        known = store.channels().await;
                    }
                    vec![channel]
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Registry: missed {} channel removal notification(s), reconciling",
                        n
                    );
                    let Some(store) = store.upgrade() else { break };
                    let current = store.channels().await;
                    let missed: Vec<Channel> = known
                        .iter()
                        .filter(|c| !current.contains(c))
                        .cloned()
                        .collect();
                    known = current;
                    if missed.is_empty() {
                        continue;
                    }
                    missed
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if event_tx
                .send(RegistryEvent::ChannelsRemoved(removed))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Registry: removal forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collect_status(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[cfg(unix)]
    fn sh_player(script: &str) -> PlayerConfig {
        PlayerConfig {
            executable: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "player".to_string()],
            channel_url_base: "https://stream.example".to_string(),
        }
    }

    async fn next_end(rx: &mut mpsc::Receiver<RegistryEvent>) -> (Channel, u64) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("session should end")
            .expect("event channel open");
        match event {
            RegistryEvent::SessionEnded {
                channel,
                session_id,
            } => (channel, session_id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_double_open_keeps_one_session() {
        let (status, mut status_rx) = StatusSink::channel();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut registry = SessionRegistry::new(sh_player("exec sleep 30"), status, event_tx);
        let channel = Channel::new("examplechannel");

        registry.open(channel.clone(), &StreamQuality::best());
        registry.open(channel.clone(), &StreamQuality::from_token("720p"));

        assert_eq!(registry.len(), 1);
        assert!(registry.is_open(&channel));
        let lines = collect_status(&mut status_rx);
        assert_eq!(lines[0], "opening channel examplechannel (best) ...");
        assert!(lines.contains(&"channel examplechannel is already open".to_string()));

        registry.close(&channel);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_no_entry() {
        let (status, mut status_rx) = StatusSink::channel();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let player = PlayerConfig {
            executable: "/nonexistent/skadi-test-player".to_string(),
            ..PlayerConfig::default()
        };
        let mut registry = SessionRegistry::new(player, status, event_tx);

        registry.open(Channel::new("examplechannel"), &StreamQuality::best());

        assert!(registry.is_empty());
        let lines = collect_status(&mut status_rx);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("failed to open stream: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_removes_entry_and_kills_process() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut registry = SessionRegistry::new(sh_player("exec sleep 30"), status, event_tx);
        let channel = Channel::new("examplechannel");

        registry.open(channel.clone(), &StreamQuality::best());
        assert!(registry.close(&channel));
        assert!(!registry.is_open(&channel));

        // The killed process's monitor still reports once; it no longer matches.
        let (ended, id) = next_end(&mut event_rx).await;
        assert_eq!(ended, channel);
        assert!(!registry.session_ended(&ended, id));
    }

    #[tokio::test]
    async fn test_removing_absent_channel_is_noop() {
        let (status, mut status_rx) = StatusSink::channel();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut registry = SessionRegistry::new(PlayerConfig::default(), status, event_tx);

        registry.channels_removed(&[Channel::new("nobody")]);
        assert!(!registry.close(&Channel::new("nobody")));
        assert!(!registry.session_ended(&Channel::new("nobody"), 42));
        assert!(registry.is_empty());
        assert!(collect_status(&mut status_rx).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_removal_racing_natural_exit() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut registry = SessionRegistry::new(sh_player("exit 0"), status, event_tx);
        let channel = Channel::new("examplechannel");

        registry.open(channel.clone(), &StreamQuality::best());
        registry.channels_removed(&[channel.clone()]);
        assert!(registry.is_empty());

        let (ended, id) = next_end(&mut event_rx).await;
        assert!(!registry.session_ended(&ended, id));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_end_does_not_remove_replacement() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut registry = SessionRegistry::new(sh_player("exec sleep 30"), status, event_tx);
        let channel = Channel::new("examplechannel");

        registry.open(channel.clone(), &StreamQuality::best());
        registry.close(&channel);
        registry.open(channel.clone(), &StreamQuality::best());

        let (ended, first_id) = next_end(&mut event_rx).await;
        assert_eq!(first_id, 1);
        assert!(!registry.session_ended(&ended, first_id));
        assert!(registry.is_open(&channel));

        registry.close(&channel);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_loop_removes_naturally_ended_sessions() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, event_rx) = mpsc::channel(16);
        let registry = SessionRegistry::new(
            sh_player("sleep 1"),
            status,
            event_tx.clone(),
        );
        let handle = RegistryHandle::new(event_tx);
        let task = tokio::spawn(registry.run(event_rx));

        handle
            .open(Channel::new("examplechannel"), StreamQuality::best())
            .await
            .unwrap();
        assert_eq!(
            handle.sessions().await.unwrap(),
            vec![Channel::new("examplechannel")]
        );

        let mut remaining = vec![Channel::new("examplechannel")];
        for _ in 0..100 {
            remaining = handle.sessions().await.unwrap();
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(remaining.is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forwarded_removal_closes_session() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, event_rx) = mpsc::channel(16);
        let store = Arc::new(ChannelStore::new([Channel::new("examplechannel")]));
        let registry =
            SessionRegistry::new(sh_player("exec sleep 30"), status, event_tx.clone());
        let handle = RegistryHandle::new(event_tx.clone());
        let task = tokio::spawn(registry.run(event_rx));
        let forwarder = forward_removals(&store, event_tx).await;

        let channel = Channel::new("examplechannel");
        handle.open(channel.clone(), StreamQuality::best()).await.unwrap();
        assert!(store.remove(&channel).await);

        let mut remaining = vec![channel];
        for _ in 0..50 {
            remaining = handle.sessions().await.unwrap();
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(remaining.is_empty());

        drop(store);
        forwarder.await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lagged_forwarder_still_closes_every_removed_channel() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let store = Arc::new(ChannelStore::with_capacity(
            ["a", "b", "c", "kept"].into_iter().map(Channel::new),
            1,
        ));
        let forwarder = forward_removals(&store, event_tx).await;

        // Removed before the forwarder gets to run, so it lags.
        for name in ["a", "b", "c"] {
            assert!(store.remove(&Channel::new(name)).await);
        }

        let mut closed: Vec<Channel> = Vec::new();
        while !["a", "b", "c"].iter().all(|n| closed.contains(&Channel::new(*n))) {
            let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
                .await
                .expect("removals should be forwarded")
                .expect("forwarder alive");
            match event {
                RegistryEvent::ChannelsRemoved(channels) => closed.extend(channels),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(!closed.contains(&Channel::new("kept")));

        drop(store);
        forwarder.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_with_full_event_channel_completes() {
        let (status, _status_rx) = StatusSink::channel();
        let (event_tx, event_rx) = mpsc::channel(2);
        let registry =
            SessionRegistry::new(sh_player("exec sleep 30"), status, event_tx.clone());
        let handle = RegistryHandle::new(event_tx);
        let task = tokio::spawn(registry.run(event_rx));

        for name in ["one", "two", "three", "four"] {
            handle.open(Channel::new(name), StreamQuality::best()).await.unwrap();
        }
        assert_eq!(handle.sessions().await.unwrap().len(), 4);

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("registry shutdown should not hang")
            .unwrap();
    }

    #[tokio::test]
    async fn test_opening_line_names_the_player_token() {
        let (status, mut status_rx) = StatusSink::channel();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let player = PlayerConfig {
            executable: "/nonexistent/skadi-test-player".to_string(),
            ..PlayerConfig::default()
        };
        let mut registry = SessionRegistry::new(player, status, event_tx);

        registry.open(
            Channel::new("examplechannel"),
            &StreamQuality::new("1080p60 (source)", "source"),
        );

        let lines = collect_status(&mut status_rx);
        assert_eq!(lines[0], "opening channel examplechannel (source) ...");
    }
}
