/// Status-text sink.
///
/// Producers (session monitors, the wakeup listener, the version check, HTTP
/// handlers) hold a cloneable `StatusSink`.  Every line is queued on one
/// unbounded channel; a single pump task drains it into the `StatusWriter`, so
/// the writer never sees two callers at once.
use tokio::sync::mpsc;
use tracing::debug;

/// Presentation-side consumer of status lines.
pub trait StatusWriter: Send + 'static {
    fn update_status_text(&mut self, text: &str);
}

#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: mpsc::UnboundedSender<String>,
}

impl StatusSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn update(&self, text: impl Into<String>) {
        if self.tx.send(text.into()).is_err() {
            debug!("status pump gone, dropping status line");
        }
    }
}

/// Drain queued status lines into `writer` until every sink is dropped.
pub async fn run_pump<W: StatusWriter>(mut rx: mpsc::UnboundedReceiver<String>, mut writer: W) {
    while let Some(text) = rx.recv().await {
        writer.update_status_text(&text);
    }
    debug!("status pump: all sinks closed");
}

/// Prints status lines to stdout with a local timestamp.
#[derive(Debug, Default)]
pub struct ConsoleStatus;

impl StatusWriter for ConsoleStatus {
    fn update_status_text(&mut self, text: &str) {
        println!("{} {}", chrono::Local::now().format("%H:%M:%S"), text);
    }
}
