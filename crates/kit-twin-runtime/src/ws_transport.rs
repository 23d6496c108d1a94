//! WebSocket implementation of [`Transport`].
//!
//! Text frames carry Kit custom messages. A close frame from the server is a
//! stop; a read or write error triggers reconnection up to the configured
//! budget, after which the stream is terminated.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{StreamCallbacks, StreamSettings, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Streams {
    active: Option<ActiveStream>,
    /// Highest generation terminated so far.
    retired: u64,
}

#[derive(Default)]
pub struct WebSocketTransport {
    streams: Mutex<Streams>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new active stream, cancelling the previous one. A connect for
    /// a generation that was already terminated, or is older than the
    /// installed one, is refused.
    fn install(&self, stream: ActiveStream) -> anyhow::Result<()> {
        let mut guard = self
            .streams
            .lock()
            .map_err(|_| anyhow!("transport state poisoned"))?;
        if stream.generation <= guard.retired {
            anyhow::bail!("connection {} was terminated", stream.generation);
        }
        if let Some(current) = guard.active.as_ref() {
            if current.generation > stream.generation {
                anyhow::bail!(
                    "connection {} superseded by {}",
                    stream.generation,
                    current.generation
                );
            }
        }
        if let Some(previous) = guard.active.replace(stream) {
            previous.cancel.cancel();
        }
        Ok(())
    }
}

enum Ended {
    Cancelled,
    Closed,
    Failed(String),
}

async fn open(url: &str, timeout: Duration) -> anyhow::Result<WsStream> {
    let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| anyhow!("timed out connecting to {url}"))??;
    Ok(ws)
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        settings: StreamSettings,
        callbacks: StreamCallbacks,
    ) -> anyhow::Result<()> {
        let url = settings.url();
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        self.install(ActiveStream {
            generation: callbacks.generation(),
            cancel: cancel.clone(),
            outbound: outbound_tx,
        })?;

        let ws = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("connect to {url} cancelled"),
            result = open(&url, settings.connectivity_timeout) => result?,
        };

        info!(%url, generation = callbacks.generation(), "Stream connected");
        callbacks.on_start(true, None);

        tokio::spawn(run_stream(ws, settings, callbacks, outbound_rx, cancel));
        Ok(())
    }

    fn send_message(&self, text: &str) -> anyhow::Result<()> {
        let guard = self
            .streams
            .lock()
            .map_err(|_| anyhow!("transport state poisoned"))?;
        let Some(active) = guard.active.as_ref() else {
            anyhow::bail!("no active stream");
        };
        active
            .outbound
            .send(text.to_string())
            .map_err(|_| anyhow!("stream {} is closed", active.generation))
    }

    fn terminate(&self, generation: u64) {
        let Ok(mut guard) = self.streams.lock() else {
            return;
        };
        guard.retired = guard.retired.max(generation);
        if guard
            .active
            .as_ref()
            .is_some_and(|active| active.generation <= generation)
        {
            if let Some(active) = guard.active.take() {
                debug!(generation = active.generation, "Cancelling stream");
                active.cancel.cancel();
            }
        }
    }
}

async fn run_stream(
    mut ws: WsStream,
    settings: StreamSettings,
    callbacks: StreamCallbacks,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let generation = callbacks.generation();
    let mut reconnects = 0u32;

    loop {
        let (mut sink, mut stream) = ws.split();

        let ended = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Ended::Cancelled;
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break Ended::Failed(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => callbacks.on_custom_message(text.to_string()),
                    Some(Ok(Message::Close(_))) | None => break Ended::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Ended::Failed(e.to_string()),
                },
            }
        };

        match ended {
            Ended::Cancelled => {
                debug!(generation, "Stream cancelled");
                return;
            }
            Ended::Closed => {
                info!(generation, "Stream closed by server");
                callbacks.on_stop();
                return;
            }
            Ended::Failed(error) => {
                warn!(generation, %error, "Stream failed");
                match reconnect(&settings, &callbacks, &cancel, &mut reconnects).await {
                    Some(fresh) => ws = fresh,
                    None => {
                        if !cancel.is_cancelled() {
                            callbacks.on_terminate(Some(error));
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Retry the connection with linear backoff until it succeeds, the budget runs
/// out or the stream is cancelled.
async fn reconnect(
    settings: &StreamSettings,
    callbacks: &StreamCallbacks,
    cancel: &CancellationToken,
    reconnects: &mut u32,
) -> Option<WsStream> {
    let url = settings.url();
    while *reconnects < settings.max_reconnects {
        *reconnects += 1;
        callbacks.on_update(format!(
            "reconnecting ({}/{})",
            reconnects, settings.max_reconnects
        ));

        let backoff = (Duration::from_secs(1) * *reconnects).min(MAX_BACKOFF);
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }

        match open(&url, settings.connectivity_timeout).await {
            Ok(ws) => {
                info!(generation = callbacks.generation(), attempt = *reconnects, "Stream reconnected");
                return Some(ws);
            }
            Err(e) => warn!(generation = callbacks.generation(), attempt = *reconnects, error = %e, "Reconnect failed"),
        }
    }
    None
}
