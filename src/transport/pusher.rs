//! Outbound half of the transport pair

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::frame::{encode_message, write_frame};
use super::parse_url;
use crate::error::Result;
use crate::message::Message;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Dials a peer's pull socket and writes every message queued on the
/// outbound channel
///
/// Dial failures never surface to callers: the push task retries forever with
/// exponential backoff so either peer can restart independently. Messages
/// queued while disconnected sit in the channel; a frame that fails to encode
/// or write is dropped and logged.
pub struct Pusher {
    url: String,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Pusher {
    /// Start the push task for `url`, consuming from `outbox`
    pub fn start(url: &str, outbox: mpsc::Receiver<Message>, max_frame_bytes: usize) -> Result<Self> {
        let addr = parse_url(url)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(push_task(addr, url.to_string(), outbox, shutdown_rx, max_frame_bytes));

        Ok(Self {
            url: url.to_string(),
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Signal the push task to drain queued frames best-effort and exit
    pub fn stop(&mut self) {
        debug!(url = %self.url, "stopping pusher");
        let _ = self.shutdown_tx.send(true);
        self.task.take();
    }
}

impl Drop for Pusher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn push_task(
    addr: String,
    url: String,
    mut outbox: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_bytes: usize,
) {
    debug!(%url, "push task started");
    let mut stream = dial(&addr, &url, &mut shutdown).await;

    loop {
        // A dial aborted by shutdown consumes the watch notification, so
        // check the flag as well as waiting on it.
        if *shutdown.borrow() {
            drain(&mut outbox, &mut stream, &url, max_frame_bytes).await;
            debug!(%url, "push task closing");
            return;
        }

        let message = tokio::select! {
            _ = shutdown.changed() => {
                drain(&mut outbox, &mut stream, &url, max_frame_bytes).await;
                debug!(%url, "push task closing");
                return;
            }
            message = outbox.recv() => match message {
                Some(message) => message,
                None => {
                    debug!(%url, "outbound channel closed, push task exiting");
                    return;
                }
            },
        };

        send_one(&mut stream, &addr, &url, &mut shutdown, &message, max_frame_bytes).await;
    }
}

async fn send_one(
    stream: &mut Option<TcpStream>,
    addr: &str,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
    message: &Message,
    max_frame_bytes: usize,
) {
    let payload = match encode_message(message) {
        Ok(payload) => payload,
        Err(e) => {
            error!(%url, error = %e, ?message, "failed to encode message, dropping");
            return;
        }
    };

    if stream.is_none() {
        *stream = dial(addr, url, shutdown).await;
    }
    let Some(socket) = stream.as_mut() else {
        // Shutdown raced the redial; the frame is lost like any other
        // message sent while disconnected.
        return;
    };

    if let Err(e) = write_frame(socket, &payload, max_frame_bytes).await {
        warn!(%url, error = %e, "failed to send message, reconnecting");
        *stream = None;
    }
}

/// Dial with exponential backoff until connected or shut down
async fn dial(addr: &str, url: &str, shutdown: &mut watch::Receiver<bool>) -> Option<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let attempt = tokio::select! {
            _ = shutdown.changed() => return None,
            attempt = TcpStream::connect(addr) => attempt,
        };

        match attempt {
            Ok(stream) => {
                debug!(%url, "pusher connected");
                return Some(stream);
            }
            Err(e) => {
                warn!(%url, error = %e, retry_in = ?backoff, "can't dial push socket");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Best-effort flush of frames still queued at shutdown
async fn drain(
    outbox: &mut mpsc::Receiver<Message>,
    stream: &mut Option<TcpStream>,
    url: &str,
    max_frame_bytes: usize,
) {
    let Some(socket) = stream.as_mut() else {
        return;
    };
    while let Ok(message) = outbox.try_recv() {
        let Ok(payload) = encode_message(&message) else {
            continue;
        };
        if write_frame(socket, &payload, max_frame_bytes).await.is_err() {
            warn!(%url, "drain interrupted by send failure");
            return;
        }
    }
}
