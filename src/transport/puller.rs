//! Inbound half of the transport pair

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame::{decode_message, read_frame};
use super::parse_url;
use crate::error::Result;
use crate::message::Message;

/// Listens at a pull URL and publishes every decoded message onto the
/// inbound channel
///
/// Any number of peers may push into one puller; each accepted connection
/// gets its own read task fanning into the shared inbox. Undecodable frames
/// are logged and discarded, never propagated.
pub struct Puller {
    url: String,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Puller {
    /// Bind `url` and start accepting pushers
    pub async fn start(url: &str, inbox: mpsc::Sender<Message>, max_frame_bytes: usize) -> Result<Self> {
        let addr = parse_url(url)?;
        let listener = TcpListener::bind(&addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_task(listener, url.to_string(), inbox, shutdown_rx, max_frame_bytes));

        Ok(Self {
            url: url.to_string(),
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Stop accepting and close all read tasks
    pub fn stop(&mut self) {
        debug!(url = %self.url, "stopping puller");
        let _ = self.shutdown_tx.send(true);
        self.task.take();
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_task(
    listener: TcpListener,
    url: String,
    inbox: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_bytes: usize,
) {
    debug!(%url, "pull task started");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => {
                debug!(%url, "pull task closing");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%url, %peer, "accepted push connection");
                tokio::spawn(read_task(
                    stream,
                    url.clone(),
                    inbox.clone(),
                    shutdown.clone(),
                    max_frame_bytes,
                ));
            }
            Err(e) => {
                warn!(%url, error = %e, "accept failed");
            }
        }
    }
}

async fn read_task(
    mut stream: TcpStream,
    url: String,
    inbox: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_bytes: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(%url, "push peer closed connection");
                return;
            }
            Err(e) => {
                warn!(%url, error = %e, "closing connection after frame error");
                return;
            }
        };

        if payload.is_empty() {
            continue;
        }

        match decode_message(&payload) {
            Ok(message) => {
                if inbox.send(message).await.is_err() {
                    debug!(%url, "inbox closed, read task exiting");
                    return;
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "cannot decode message, discarding frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::MessageType;
    use crate::transport::Pusher;

    #[tokio::test]
    async fn test_pusher_to_puller_roundtrip() {
        let url = "tcp://127.0.0.1:14560";
        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let mut puller = Puller::start(url, inbox_tx, 1024 * 1024).await.unwrap();

        let (outbox_tx, outbox_rx) = mpsc::channel(16);
        let mut pusher = Pusher::start(url, outbox_rx, 1024 * 1024).unwrap();

        let mut message = Message::new(MessageType::Ping);
        message.source_name = "testSource".to_string();
        outbox_tx.send(message).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), inbox_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed");
        assert_eq!(received.msg_type, MessageType::Ping);
        assert_eq!(received.source_name, "testSource");

        pusher.stop();
        puller.stop();
    }

    #[tokio::test]
    async fn test_puller_survives_bad_frames() {
        use tokio::io::AsyncWriteExt;

        let url = "tcp://127.0.0.1:14561";
        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let mut puller = Puller::start(url, inbox_tx, 1024 * 1024).await.unwrap();

        // First connection delivers garbage that is a valid frame but not a
        // valid message; the frame is discarded without killing the puller.
        let mut stream = TcpStream::connect("127.0.0.1:14561").await.unwrap();
        let frame = crate::transport::encode_frame(b"not json", 1024).unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        // A well-formed message still comes through on a fresh connection
        let (outbox_tx, outbox_rx) = mpsc::channel(16);
        let mut pusher = Pusher::start(url, outbox_rx, 1024 * 1024).unwrap();
        outbox_tx.send(Message::new(MessageType::Ping)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), inbox_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed");
        assert_eq!(received.msg_type, MessageType::Ping);

        pusher.stop();
        puller.stop();
    }

    #[tokio::test]
    async fn test_pusher_retries_until_listener_appears() {
        let url = "tcp://127.0.0.1:14562";

        // Pusher first, listener later: the queued message must survive the
        // dial retries and arrive once the puller binds.
        let (outbox_tx, outbox_rx) = mpsc::channel(16);
        let mut pusher = Pusher::start(url, outbox_rx, 1024 * 1024).unwrap();
        outbox_tx.send(Message::new(MessageType::Ping)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let mut puller = Puller::start(url, inbox_tx, 1024 * 1024).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(10), inbox_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed");
        assert_eq!(received.msg_type, MessageType::Ping);

        pusher.stop();
        puller.stop();
    }
}
