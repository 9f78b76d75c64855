/// One external player process for one channel.
///
/// ```text
///   ProcessSession::start()
///         │  spawn: executable args... <channel url> <quality>
///         └── monitor task  ← owns the Child
///                ├── stdout/stderr lines → "[channel] text" → StatusSink
///                ├── kill_rx fired       → kill the child, stop reading
///                └── always on exit      → RegistryEvent::SessionEnded
/// ```
///
/// The `ProcessSession` value only keeps the kill sender and the monitor
/// handle.  Dropping it kills the process as well.
use std::process::Stdio;

use skadi_proto::channel::{Channel, StreamQuality};
use skadi_proto::config::PlayerConfig;
use skadi_proto::platform;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::RegistryEvent;
use crate::status::StatusSink;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no player executable configured")]
    NoExecutable,
    #[error("could not start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
}

/// Full argument vector: `[executable, args..., channel url, quality]`.
pub fn command_line(
    player: &PlayerConfig,
    channel: &Channel,
    quality: &StreamQuality,
) -> Vec<String> {
    let mut argv = Vec::with_capacity(player.args.len() + 3);
    argv.push(player.executable.clone());
    argv.extend(player.args.iter().cloned());
    argv.push(channel.build_url(&player.channel_url_base));
    argv.push(quality.quality.clone());
    argv
}

/// Drop one leading `[tag] ` token from a player output line.
pub fn strip_tag(line: &str) -> &str {
    if line.starts_with('[') {
        if let Some(end) = line.find("] ") {
            return &line[end + 2..];
        }
    }
    line
}

pub struct ProcessSession {
    id: u64,
    channel: Channel,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessSession {
    /// Spawn the player and its monitor task.  Nothing is left running when
    /// this returns an error.
    pub fn start(
        id: u64,
        channel: Channel,
        quality: &StreamQuality,
        player: &PlayerConfig,
        status: StatusSink,
        event_tx: mpsc::Sender<RegistryEvent>,
    ) -> Result<Self, LaunchError> {
        if player.executable.trim().is_empty() {
            return Err(LaunchError::NoExecutable);
        }

        let argv = command_line(player, &channel, quality);
        let program = platform::find_player_binary(&argv[0]);
        info!("Spawning player for {}: {:?}", channel, argv);

        let mut child = Command::new(&program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                executable: argv[0].clone(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(LaunchError::Spawn {
                executable: argv[0].clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "player output pipes unavailable",
                ),
            });
        };

        let pid = child.id();
        info!("Player for {} started with PID: {:?}", channel, pid);

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            id,
            channel.clone(),
            child,
            stdout,
            stderr,
            kill_rx,
            status,
            event_tx,
        ));

        Ok(Self {
            id,
            channel,
            pid,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the monitor to kill the process right away.  No grace period.
    pub fn close_stream(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            debug!("Force-closing {} (pid {:?})", self.channel, self.pid);
            let _ = tx.send(());
        }
    }

    /// Kill the process and wait until the monitor has reaped it.
    pub async fn terminate(mut self) {
        self.close_stream();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!("Monitor for {} ended abnormally: {}", self.channel, e);
            }
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.close_stream();
    }
}

/// Monitor task body.  Whatever happens while supervising, exactly one
/// `SessionEnded` is sent for this session id.
async fn monitor<O, E>(
    id: u64,
    channel: Channel,
    mut child: Child,
    stdout: O,
    stderr: E,
    kill_rx: oneshot::Receiver<()>,
    status: StatusSink,
    event_tx: mpsc::Sender<RegistryEvent>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    if let Err(e) = supervise(&channel, &mut child, stdout, stderr, kill_rx, &status).await {
        error!("Error handling player process for {}: {:#}", channel, e);
        // The player may still be running; it must not outlive its session.
        if let Err(e) = child.start_kill() {
            debug!("Player for {} already gone: {}", channel, e);
        }
        let _ = child.wait().await;
    }

    debug!("Session {} for {} terminated", id, channel);
    let _ = event_tx
        .send(RegistryEvent::SessionEnded {
            channel,
            session_id: id,
        })
        .await;
}

async fn supervise<O, E>(
    channel: &Channel,
    child: &mut Child,
    stdout: O,
    stderr: E,
    mut kill_rx: oneshot::Receiver<()>,
    status: &StatusSink,
) -> anyhow::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = BufReader::new(stdout).split(b'\n');
    let mut err = BufReader::new(stderr).split(b'\n');
    let mut out_open = true;
    let mut err_open = true;

    // Sender dropped counts as a kill request too.
    while out_open || err_open {
        tokio::select! {
            biased;
            _ = &mut kill_rx => {
                kill(channel, child).await;
                return Ok(());
            }
            segment = out.next_segment(), if out_open => match segment? {
                Some(raw) => report_line(channel, &raw, status),
                None => out_open = false,
            },
            segment = err.next_segment(), if err_open => match segment? {
                Some(raw) => report_line(channel, &raw, status),
                None => err_open = false,
            },
        }
    }

    tokio::select! {
        biased;
        _ = &mut kill_rx => {
            kill(channel, child).await;
        }
        exit = child.wait() => {
            let exit = exit?;
            info!("Player for {} exited with status: {}", channel, exit);
        }
    }
    Ok(())
}

async fn kill(channel: &Channel, child: &mut Child) {
    info!("Kill requested, force-killing player for {}", channel);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill player for {}: {}", channel, e);
    }
}

fn report_line(channel: &Channel, raw: &[u8], status: &StatusSink) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    debug!("player [{}]: {}", channel, line);
    status.update(format!("[{}] {}", channel, strip_tag(line)));
}
