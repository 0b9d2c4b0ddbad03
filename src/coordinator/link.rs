//! Coordinator-side representation of a connected source

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{Message, MessageType, Object, transaction_uid};
use crate::transport::Pusher;

/// One registered source: its identity, owned objects, liveness state and
/// the outbound queue reaching its pull socket
///
/// Closing the link stops the pusher, which closes the queue; there is
/// exactly one queue per registered source.
pub(crate) struct SourceLink {
    pub source_name: String,
    pub url: String,
    pub objects: Vec<Object>,
    pub last_ping: Instant,
    outbox: mpsc::Sender<Message>,
    pusher: Pusher,
}

impl SourceLink {
    /// Open the outbound pusher to the source's pull socket
    pub fn connect(source_name: &str, url: &str, channel_buffer: usize, max_frame_bytes: usize) -> Result<Self> {
        let (outbox_tx, outbox_rx) = mpsc::channel(channel_buffer);
        let pusher = Pusher::start(url, outbox_rx, max_frame_bytes)?;

        Ok(Self {
            source_name: source_name.to_string(),
            url: url.to_string(),
            objects: Vec::new(),
            last_ping: Instant::now(),
            outbox: outbox_tx,
            pusher,
        })
    }

    /// Build a message addressed to this source with a fresh transaction UID
    pub fn new_message(&self, msg_type: MessageType) -> Message {
        let mut message = Message::new(msg_type);
        message.transaction_uid = transaction_uid();
        message.source_name = self.source_name.clone();
        message.destination = self.url.clone();
        message
    }

    /// Queue a message for delivery to the source
    pub async fn send(&self, message: Message) -> Result<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| Error::Transport(format!("outbound channel to ({}) closed", self.url)))
    }

    /// Stop the pusher and drop the queue
    pub fn close(mut self) {
        debug!(source = %self.source_name, url = %self.url, "closing source link");
        self.pusher.stop();
    }
}
