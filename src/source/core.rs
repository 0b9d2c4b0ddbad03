//! Source endpoint implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::SourceHandler;
use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, Object, transaction_uid};
use crate::transaction::TransactionMap;
use crate::transport::{Puller, Pusher};

/// A source endpoint serving part of the data model to one coordinator
///
/// `name` must be unique among all sources connected to the coordinator at
/// `coordinator_url`; the coordinator pushes requests back to `pull_url`.
pub struct Source {
    shared: Arc<SourceShared>,
    outbox_rx: Option<mpsc::Receiver<Message>>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    pusher: Option<Pusher>,
    puller: Option<Puller>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct SourceShared {
    name: String,
    coordinator_url: String,
    pull_url: String,
    config: SourceConfig,
    outbox: mpsc::Sender<Message>,
    acks: TransactionMap,
    handler: RwLock<Option<Arc<dyn SourceHandler>>>,
    objects: Mutex<Vec<Object>>,
    registered: AtomicBool,
    last_ping: Mutex<Instant>,
}

impl Source {
    pub fn new(name: impl Into<String>, coordinator_url: impl Into<String>, pull_url: impl Into<String>) -> Self {
        Self::with_config(name, coordinator_url, pull_url, SourceConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        coordinator_url: impl Into<String>,
        pull_url: impl Into<String>,
        config: SourceConfig,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(config.channel_buffer);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.channel_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(SourceShared {
                name: name.into(),
                coordinator_url: coordinator_url.into(),
                pull_url: pull_url.into(),
                config,
                outbox: outbox_tx,
                acks: TransactionMap::new(),
                handler: RwLock::new(None),
                objects: Mutex::new(Vec::new()),
                registered: AtomicBool::new(false),
                last_ping: Mutex::new(Instant::now()),
            }),
            outbox_rx: Some(outbox_rx),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            pusher: None,
            puller: None,
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    /// Install (or replace) the application handler
    pub fn set_handler(&self, handler: Arc<dyn SourceHandler>) {
        let mut slot = self.shared.handler.write().expect("handler lock poisoned");
        *slot = Some(handler);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    /// Open the pusher to the coordinator and the puller at the source's own
    /// inbound URL, then start the dispatch and ping tasks
    pub async fn connect(&mut self) -> Result<()> {
        let outbox_rx = self
            .outbox_rx
            .take()
            .ok_or_else(|| Error::Transport("source already connected".to_string()))?;

        let pusher = Pusher::start(&self.shared.coordinator_url, outbox_rx, self.shared.config.max_frame_bytes)?;
        let puller = match Puller::start(
            &self.shared.pull_url,
            self.inbox_tx.clone(),
            self.shared.config.max_frame_bytes,
        )
        .await
        {
            Ok(puller) => puller,
            Err(e) => {
                let mut pusher = pusher;
                pusher.stop();
                return Err(e);
            }
        };

        *self.shared.last_ping.lock().expect("ping lock poisoned") = Instant::now();

        let inbox_rx = self.inbox_rx.take().expect("inbox receiver taken twice");
        self.tasks
            .push(tokio::spawn(dispatch_task(self.shared.clone(), inbox_rx, self.shutdown_rx.clone())));
        self.tasks
            .push(tokio::spawn(ping_task(self.shared.clone(), self.shutdown_rx.clone())));

        self.pusher = Some(pusher);
        self.puller = Some(puller);
        info!(name = %self.shared.name, pull_url = %self.shared.pull_url, "source connected");
        Ok(())
    }

    /// Unregister best-effort if registered, then stop all tasks
    pub async fn disconnect(&mut self) {
        if self.is_registered() {
            if let Err(e) = self.unregister().await {
                warn!(name = %self.shared.name, error = %e, "best-effort unregister failed");
            }
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(mut pusher) = self.pusher.take() {
            pusher.stop();
        }
        if let Some(mut puller) = self.puller.take() {
            puller.stop();
        }
        self.tasks.clear();
        info!(name = %self.shared.name, "source disconnected");
    }

    /// Claim ownership of `objects` with the coordinator
    pub async fn register(&self, objects: Vec<Object>) -> Result<()> {
        self.shared.register(objects).await
    }

    /// Release all owned objects
    pub async fn unregister(&self) -> Result<()> {
        self.shared.registered.store(false, Ordering::SeqCst);
        let message = self.shared.new_message(MessageType::Unregister);
        self.shared.request(message).await?;
        Ok(())
    }

    /// Replace the owned object set; objects absent from `objects` are
    /// dropped from the coordinator's registry
    pub async fn update_objects(&self, objects: Vec<Object>) -> Result<()> {
        *self.shared.objects.lock().expect("objects lock poisoned") = objects.clone();
        let mut message = self.shared.new_message(MessageType::UpdateObjects);
        message.objects = objects;
        self.shared.request(message).await?;
        Ok(())
    }

    /// Read objects through the coordinator, including ones owned by other
    /// sources
    pub async fn get_objects(&self, objects: Vec<Object>) -> Result<Vec<Object>> {
        let mut message = self.shared.new_message(MessageType::Get);
        message.objects = objects;
        let reply = self.shared.request(message).await?;
        Ok(reply.objects)
    }

    /// Write one object through the coordinator
    pub async fn set_object(&self, object: Object) -> Result<()> {
        let mut message = self.shared.new_message(MessageType::Set);
        message.objects = vec![object];
        self.shared.request(message).await?;
        Ok(())
    }

    /// Enumerate registered objects under the given paths
    pub async fn list_objects(&self, objects: Vec<Object>) -> Result<Vec<Object>> {
        let mut message = self.shared.new_message(MessageType::List);
        message.objects = objects;
        let reply = self.shared.request(message).await?;
        Ok(reply.objects)
    }

    /// Append a row to a dynamic list through the coordinator, returning the
    /// new row's name
    pub async fn add_row(&self, object: Object) -> Result<String> {
        let mut message = self.shared.new_message(MessageType::AddRow);
        message.objects = vec![object];
        let reply = self.shared.request(message).await?;
        let row = reply
            .objects
            .first()
            .map(|object| object.name.clone())
            .unwrap_or_default();
        Ok(row)
    }

    /// Delete a dynamic list row through the coordinator
    pub async fn delete_row(&self, object: Object) -> Result<()> {
        let mut message = self.shared.new_message(MessageType::DeleteRow);
        message.objects = vec![object];
        self.shared.request(message).await?;
        Ok(())
    }
}

impl SourceShared {
    fn new_message(&self, msg_type: MessageType) -> Message {
        let mut message = Message::new(msg_type);
        message.transaction_uid = transaction_uid();
        message.source_name = self.name.clone();
        message.source = self.pull_url.clone();
        message.destination = self.coordinator_url.clone();
        message
    }

    fn handler(&self) -> Option<Arc<dyn SourceHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| Error::Transport(format!("outbound channel to ({}) closed", self.coordinator_url)))
    }

    /// Send a request and block until its Ack/Nack or the deadline
    async fn request(&self, message: Message) -> Result<Message> {
        let uid = message.transaction_uid.to_string();
        self.send(message).await?;
        let reply = self.acks.wait_for(&uid, self.config.ack_timeout()).await?;
        match reply.msg_type {
            MessageType::Ack => Ok(reply),
            MessageType::Nack => Err(Error::Nack(reply.error)),
            other => Err(Error::Protocol(u32::from(other))),
        }
    }

    async fn register(&self, objects: Vec<Object>) -> Result<()> {
        *self.objects.lock().expect("objects lock poisoned") = objects.clone();
        let mut message = self.new_message(MessageType::Register);
        message.objects = objects;

        // On any failure, including a timed-out Ack, the source stays
        // unregistered; the ping task or the caller retries.
        self.request(message).await?;
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn update_ping(&self) {
        *self.last_ping.lock().expect("ping lock poisoned") = Instant::now();
    }

    fn since_last_ping(&self) -> std::time::Duration {
        self.last_ping.lock().expect("ping lock poisoned").elapsed()
    }

    async fn respond_ack(&self, request: &Message, objects: Vec<Object>) {
        let mut reply = self.new_message(MessageType::Ack);
        reply.transaction_uid = request.transaction_uid;
        reply.objects = objects;
        if let Err(e) = self.send(reply).await {
            error!(name = %self.name, error = %e, "failed to send ack");
        }
    }

    async fn respond_nack(&self, request: &Message, error: &str) {
        let mut reply = self.new_message(MessageType::Nack);
        reply.transaction_uid = request.transaction_uid;
        reply.error = error.to_string();
        if let Err(e) = self.send(reply).await {
            error!(name = %self.name, error = %e, "failed to send nack");
        }
    }

    async fn handle_set(&self, request: Message) {
        let Some(handler) = self.handler() else {
            self.respond_nack(&request, "source handler not set").await;
            return;
        };
        match handler.set_objects(request.objects.clone()).await {
            Ok(()) => self.respond_ack(&request, Vec::new()).await,
            Err(e) => self.respond_nack(&request, &e.to_string()).await,
        }
    }

    async fn handle_get(&self, request: Message) {
        let Some(handler) = self.handler() else {
            self.respond_nack(&request, "source handler not set").await;
            return;
        };
        let names: Vec<String> = request.objects.iter().map(|object| object.name.clone()).collect();
        match handler.get_objects(&names).await {
            Ok(objects) => self.respond_ack(&request, objects).await,
            Err(e) => self.respond_nack(&request, &e.to_string()).await,
        }
    }

    async fn handle_add_row(&self, request: Message) {
        let Some(handler) = self.handler() else {
            self.respond_nack(&request, "source handler not set").await;
            return;
        };
        if request.objects.len() != 1 {
            let error = format!("invalid number of objects ({}) in add row", request.objects.len());
            self.respond_nack(&request, &error).await;
            return;
        }
        match handler.add_row(request.objects[0].clone()).await {
            Ok(row) => self.respond_ack(&request, vec![Object::named(row)]).await,
            Err(e) => self.respond_nack(&request, &e.to_string()).await,
        }
    }

    async fn handle_delete_row(&self, request: Message) {
        let Some(handler) = self.handler() else {
            self.respond_nack(&request, "source handler not set").await;
            return;
        };
        if request.objects.len() != 1 {
            let error = format!("invalid number of objects ({}) in delete row", request.objects.len());
            self.respond_nack(&request, &error).await;
            return;
        }
        match handler.delete_row(request.objects[0].clone()).await {
            Ok(()) => self.respond_ack(&request, Vec::new()).await,
            Err(e) => self.respond_nack(&request, &e.to_string()).await,
        }
    }
}

/// Reads the inbox and routes each message; handler work is spawned so a
/// slow handler never blocks ack correlation
async fn dispatch_task(shared: Arc<SourceShared>, mut inbox: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                debug!(name = %shared.name, "exiting source dispatch task");
                return;
            }
            message = inbox.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        match message.msg_type {
            MessageType::Ack | MessageType::Nack => {
                shared.acks.insert(&message.transaction_uid.to_string(), message);
            }
            MessageType::Set => {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_set(message).await });
            }
            MessageType::Get => {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_get(message).await });
            }
            MessageType::AddRow => {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_add_row(message).await });
            }
            MessageType::DeleteRow => {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_delete_row(message).await });
            }
            MessageType::Ping => {
                shared.update_ping();
                let reply = shared.new_message(MessageType::Ping);
                if let Err(e) = shared.send(reply).await {
                    warn!(name = %shared.name, error = %e, "failed to reply to ping");
                }
            }
            other => {
                debug!(name = %shared.name, ?other, "ignoring unexpected message");
            }
        }
    }
}

/// Re-registers with the current object set when the coordinator stops
/// pinging; this is the sole recovery path after a coordinator restart
async fn ping_task(shared: Arc<SourceShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(name = %shared.name, "exiting source ping task");
                return;
            }
            _ = tokio::time::sleep(shared.config.ping_check_period()) => {}
        }

        let silence = shared.since_last_ping();
        if silence > shared.config.ping_timeout() {
            warn!(name = %shared.name, ?silence, "no ping from coordinator, re-registering");
            let objects = shared.objects.lock().expect("objects lock poisoned").clone();
            if let Err(e) = shared.register(objects).await {
                error!(name = %shared.name, error = %e, "failed to re-register");
            } else {
                shared.update_ping();
            }
        }
    }
}
