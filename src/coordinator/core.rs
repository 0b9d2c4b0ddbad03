//! Coordinator endpoint implementation
//!
//! One dispatch task drains the inbound channel. Registry mutations
//! (Register, Unregister, UpdateObjects, Ping bookkeeping) run inline so
//! they apply in arrival order; requests that block on downstream
//! acknowledgements run on per-request tasks holding the registry for their
//! full duration, so a source asking for its own objects can never deadlock
//! the dispatch loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::CoordinatorHandler;
use super::link::SourceLink;
use super::registry::Registry;
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, Object, ObjectAccess};
use crate::transaction::TransactionMap;
use crate::transport::Puller;

/// The broker endpoint aggregating all sources into one data model
pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    puller: Option<Puller>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct CoordinatorShared {
    url: String,
    config: CoordinatorConfig,
    handler: RwLock<Option<Arc<dyn CoordinatorHandler>>>,
    registry: Mutex<Registry>,
    acks: TransactionMap,
}

impl Coordinator {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, CoordinatorConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: CoordinatorConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.channel_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(CoordinatorShared {
                url: url.into(),
                config,
                handler: RwLock::new(None),
                registry: Mutex::new(Registry::new()),
                acks: TransactionMap::new(),
            }),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            puller: None,
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    /// Install (or replace) the notification handler
    pub fn set_handler(&self, handler: Arc<dyn CoordinatorHandler>) {
        let mut slot = self.shared.handler.write().expect("handler lock poisoned");
        *slot = Some(handler);
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Bind the pull socket and start the dispatch and supervision tasks
    pub async fn start(&mut self) -> Result<()> {
        let puller = Puller::start(&self.shared.url, self.inbox_tx.clone(), self.shared.config.max_frame_bytes).await?;

        let inbox_rx = self
            .inbox_rx
            .take()
            .ok_or_else(|| Error::Transport("coordinator already started".to_string()))?;
        self.tasks
            .push(tokio::spawn(dispatch_task(self.shared.clone(), inbox_rx, self.shutdown_rx.clone())));
        self.tasks
            .push(tokio::spawn(supervise_task(self.shared.clone(), self.shutdown_rx.clone())));

        self.puller = Some(puller);
        info!(url = %self.shared.url, "coordinator started");
        Ok(())
    }

    /// Stop dispatch, supervision and the pull socket
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut puller) = self.puller.take() {
            puller.stop();
        }
        self.tasks.clear();
        info!(url = %self.shared.url, "coordinator stopped");
    }

    /// Read the named objects from their owning sources
    ///
    /// Names are grouped per owning source and the groups queried
    /// concurrently; results concatenate and failures accumulate.
    pub async fn get(&self, object_names: &[String]) -> (Vec<Object>, Vec<Error>) {
        let registry = self.shared.registry.lock().await;
        self.shared.get_locked(&registry, object_names).await
    }

    /// Write one object through its owning source
    pub async fn set(&self, object: Object) -> Result<()> {
        let registry = self.shared.registry.lock().await;
        self.shared.set_locked(&registry, object).await
    }

    /// Append a row to the dynamic list owning `object`'s path, returning
    /// the new row name
    pub async fn add_row(&self, object: Object) -> Result<String> {
        let registry = self.shared.registry.lock().await;
        self.shared.add_row_locked(&registry, object).await
    }

    /// Delete the row named by `object` from its owning dynamic list
    pub async fn delete_row(&self, object: Object) -> Result<()> {
        let registry = self.shared.registry.lock().await;
        self.shared.delete_row_locked(&registry, object).await
    }

    /// Enumerate registered objects at `path` without querying any source
    pub async fn list(&self, path: &str) -> Result<Vec<Object>> {
        let registry = self.shared.registry.lock().await;
        registry.list(path)
    }

    /// Names of all registered exact objects
    pub async fn object_names(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().await;
        registry.objects.keys().cloned().collect()
    }

    /// Names of all registered dynamic list prefixes
    pub async fn dynamic_list_names(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().await;
        registry.dynamic_lists.keys().cloned().collect()
    }

    /// Names of all connected sources
    pub async fn source_names(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().await;
        registry.sources.keys().cloned().collect()
    }
}

impl CoordinatorShared {
    fn handler(&self) -> Option<Arc<dyn CoordinatorHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    /// Send `message` to the source and block until its Ack/Nack
    async fn request_source(&self, link: &SourceLink, mut message: Message) -> Result<Message> {
        message.source = self.url.clone();
        let uid = message.transaction_uid.to_string();
        link.send(message).await?;
        let reply = self.acks.wait_for(&uid, self.config.ack_timeout()).await?;
        match reply.msg_type {
            MessageType::Ack => Ok(reply),
            MessageType::Nack => Err(Error::Nack(reply.error)),
            other => Err(Error::Protocol(u32::from(other))),
        }
    }

    async fn respond_ack(&self, link: &SourceLink, request: &Message, objects: Vec<Object>) {
        let mut reply = link.new_message(MessageType::Ack);
        reply.transaction_uid = request.transaction_uid;
        reply.source = self.url.clone();
        reply.objects = objects;
        if let Err(e) = link.send(reply).await {
            error!(source = %link.source_name, error = %e, "failed to send ack");
        }
    }

    async fn respond_nack(&self, link: &SourceLink, request: &Message, error: &str, objects: Vec<Object>) {
        let mut reply = link.new_message(MessageType::Nack);
        reply.transaction_uid = request.transaction_uid;
        reply.source = self.url.clone();
        reply.error = error.to_string();
        reply.objects = objects;
        if let Err(e) = link.send(reply).await {
            error!(source = %link.source_name, error = %e, "failed to send nack");
        }
    }

    /// Tear a link down once its queued frames have had time to flush
    fn close_after_drain(&self, link: SourceLink) {
        let delay = self.config.drain_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            link.close();
        });
    }

    async fn get_locked(&self, registry: &Registry, object_names: &[String]) -> (Vec<Object>, Vec<Error>) {
        let mut grouped: HashMap<String, Vec<Object>> = HashMap::new();
        let mut errors = Vec::new();

        for name in object_names {
            match registry.route(name) {
                Ok(route) => grouped.entry(route.owner).or_default().push(route.object),
                Err(e) => errors.push(e),
            }
        }

        let requests = grouped
            .into_iter()
            .map(|(source_name, objects)| self.get_from_source(registry, source_name, objects));
        let mut objects = Vec::new();
        for result in futures::future::join_all(requests).await {
            match result {
                Ok(mut got) => objects.append(&mut got),
                Err(e) => errors.push(e),
            }
        }

        (objects, errors)
    }

    async fn get_from_source(
        &self,
        registry: &Registry,
        source_name: String,
        objects: Vec<Object>,
    ) -> Result<Vec<Object>> {
        let link = registry
            .sources
            .get(&source_name)
            .ok_or_else(|| Error::SourceNotFound(source_name.clone()))?;

        let mut message = link.new_message(MessageType::Get);
        message.objects = objects;
        let reply = self.request_source(link, message).await?;
        Ok(reply.objects)
    }

    async fn set_locked(&self, registry: &Registry, object: Object) -> Result<()> {
        let route = registry.route(&object.name)?;

        // Direct exact entries declared read-only never reach the source;
        // dynamic rows are forwarded and left to the source handler.
        if !route.via_dynamic && route.object.access == ObjectAccess::ReadOnly {
            return Err(Error::ReadOnly(object.name.clone()));
        }

        let link = registry
            .sources
            .get(&route.owner)
            .ok_or_else(|| Error::SourceNotFound(route.owner.clone()))?;

        debug!(name = %object.name, source = %route.owner, "forwarding set");
        let mut message = link.new_message(MessageType::Set);
        message.objects = vec![object.clone()];
        self.request_source(link, message)
            .await
            .map_err(|e| match e {
                Error::Nack(error) => Error::Nack(format!("failed to set object {}: {error}", object.name)),
                other => other,
            })?;
        Ok(())
    }

    async fn add_row_locked(&self, registry: &Registry, object: Object) -> Result<String> {
        let route = registry.route(&object.name)?;
        if !route.via_dynamic {
            return Err(Error::ObjectNotFound(object.name.clone()));
        }

        let link = registry
            .sources
            .get(&route.owner)
            .ok_or_else(|| Error::SourceNotFound(route.owner.clone()))?;

        debug!(name = %object.name, source = %route.owner, "forwarding add row");
        let mut message = link.new_message(MessageType::AddRow);
        message.objects = vec![object.clone()];
        let reply = self
            .request_source(link, message)
            .await
            .map_err(|e| match e {
                Error::Nack(error) => Error::Nack(format!("failed to add row {}: {error}", object.name)),
                other => other,
            })?;

        Ok(reply
            .objects
            .first()
            .map(|row| row.name.clone())
            .unwrap_or_default())
    }

    async fn delete_row_locked(&self, registry: &Registry, object: Object) -> Result<()> {
        let route = registry.route(&object.name)?;
        if !route.via_dynamic {
            return Err(Error::ObjectNotFound(object.name.clone()));
        }

        let link = registry
            .sources
            .get(&route.owner)
            .ok_or_else(|| Error::SourceNotFound(route.owner.clone()))?;

        debug!(name = %object.name, source = %route.owner, "forwarding delete row");
        let mut message = link.new_message(MessageType::DeleteRow);
        message.objects = vec![object.clone()];
        self.request_source(link, message)
            .await
            .map_err(|e| match e {
                Error::Nack(error) => Error::Nack(format!("failed to delete row {}: {error}", object.name)),
                other => other,
            })?;
        Ok(())
    }

    async fn register_source(&self, registry: &mut MutexGuard<'_, Registry>, message: Message) {
        let source_name = message.source_name.clone();
        info!(source = %source_name, url = %message.source, "registering source");

        let existing_url = registry.sources.get(&source_name).map(|link| link.url.clone());
        match existing_url {
            Some(url) if url == message.source => {
                self.reregister_source(registry, message).await;
            }
            Some(_) => {
                // A different peer is squatting on the name; refuse without
                // disturbing the incumbent.
                let error = format!("error source name ({source_name}) already exists");
                warn!(source = %source_name, url = %message.source, "{error}");
                match SourceLink::connect(
                    &source_name,
                    &message.source,
                    self.config.channel_buffer,
                    self.config.max_frame_bytes,
                ) {
                    Ok(link) => {
                        self.respond_nack(&link, &message, &error, Vec::new()).await;
                        self.close_after_drain(link);
                    }
                    Err(e) => {
                        error!(source = %source_name, error = %e, "failed to connect to refused peer");
                    }
                }
            }
            None => {
                self.register_new_source(registry, message).await;
            }
        }
    }

    async fn register_new_source(&self, registry: &mut MutexGuard<'_, Registry>, message: Message) {
        let source_name = message.source_name.clone();

        let mut link = match SourceLink::connect(
            &source_name,
            &message.source,
            self.config.channel_buffer,
            self.config.max_frame_bytes,
        ) {
            Ok(link) => link,
            Err(e) => {
                error!(source = %source_name, url = %message.source, error = %e, "failed to connect to source");
                return;
            }
        };

        if let Err(e) = registry.validate_add(&message.objects, None) {
            let error = format!("failed to add objects for {source_name}: {e}");
            error!(source = %source_name, "{error}");
            self.respond_nack(&link, &message, &error, Vec::new()).await;
            self.close_after_drain(link);
            return;
        }

        registry.install(&source_name, &message.objects);
        link.objects = message.objects.clone();
        link.last_ping = Instant::now();

        self.respond_ack(&link, &message, Vec::new()).await;
        registry.sources.insert(source_name.clone(), link);
        info!(source = %source_name, objects = message.objects.len(), "registered source");

        self.notify_registered(&source_name, &message.objects).await;
    }

    /// Same name, same URL: swap the object set, keep the link and its
    /// ping state
    async fn reregister_source(&self, registry: &mut MutexGuard<'_, Registry>, message: Message) {
        let source_name = message.source_name.clone();
        info!(source = %source_name, "re-registering source");

        if let Err(e) = registry.validate_add(&message.objects, Some(&source_name)) {
            let error = format!("failed to add objects for {source_name}: {e}");
            error!(source = %source_name, "{error}");
            if let Some(link) = registry.sources.get(&source_name) {
                self.respond_nack(link, &message, &error, Vec::new()).await;
            }
            return;
        }

        let old_objects = registry
            .sources
            .get(&source_name)
            .map(|link| link.objects.clone())
            .unwrap_or_default();
        registry.remove_owned(&old_objects);
        registry.install(&source_name, &message.objects);

        if let Some(link) = registry.sources.get_mut(&source_name) {
            link.objects = message.objects.clone();
            link.last_ping = Instant::now();
        }
        if let Some(link) = registry.sources.get(&source_name) {
            self.respond_ack(link, &message, Vec::new()).await;
        }

        self.notify_registered(&source_name, &message.objects).await;
    }

    async fn unregister_source(&self, registry: &mut MutexGuard<'_, Registry>, message: Message) {
        let source_name = message.source_name.clone();
        if !registry.sources.contains_key(&source_name) {
            warn!(source = %source_name, "unregister for unknown source, ignoring");
            return;
        }

        info!(source = %source_name, "unregistering source");
        let link = self.remove_source(registry, &source_name).await;

        // Let the peer know it is gone before tearing down its queue
        self.respond_ack(&link, &message, Vec::new()).await;
        self.close_after_drain(link);
    }

    /// Detach a source: fire the callback, drop its objects, return the link
    async fn remove_source(&self, registry: &mut MutexGuard<'_, Registry>, source_name: &str) -> SourceLink {
        let link = registry
            .sources
            .remove(source_name)
            .expect("remove_source caller must check existence");

        self.notify_unregistered(source_name, &link.objects).await;
        registry.remove_owned(&link.objects);
        link
    }

    async fn update_objects_source(&self, registry: &mut MutexGuard<'_, Registry>, message: Message) {
        let source_name = message.source_name.clone();
        if !registry.sources.contains_key(&source_name) {
            error!(source = %source_name, "received update for non-existent source");
            return;
        }

        match registry.validate_update(&source_name, &message.objects) {
            Err(e) => {
                error!(source = %source_name, error = %e, "refusing object update");
                if let Some(link) = registry.sources.get(&source_name) {
                    self.respond_nack(link, &message, &e.to_string(), Vec::new()).await;
                }
            }
            Ok(plan) => {
                registry.apply_update(&source_name, &plan);
                if let Some(link) = registry.sources.get(&source_name) {
                    self.respond_ack(link, &message, Vec::new()).await;
                }
                info!(
                    source = %source_name,
                    objects = plan.incoming.len(),
                    deleted = plan.deleted.len(),
                    "updated source objects"
                );
                self.notify_update(&source_name, &plan.incoming, &plan.deleted).await;
            }
        }
    }

    fn handle_ping(&self, registry: &mut MutexGuard<'_, Registry>, message: &Message) {
        match registry.sources.get_mut(&message.source_name) {
            Some(link) => link.last_ping = Instant::now(),
            None => debug!(source = %message.source_name, "ping from unknown source"),
        }
    }

    async fn notify_registered(&self, source_name: &str, objects: &[Object]) {
        if let Some(handler) = self.handler()
            && let Err(e) = handler.registered(source_name, objects).await
        {
            error!(source = %source_name, error = %e, "registered callback failed");
        }
    }

    async fn notify_unregistered(&self, source_name: &str, objects: &[Object]) {
        if let Some(handler) = self.handler()
            && let Err(e) = handler.unregistered(source_name, objects).await
        {
            error!(source = %source_name, error = %e, "unregistered callback failed");
        }
    }

    async fn notify_update(&self, source_name: &str, objects: &[Object], deleted: &HashMap<String, Object>) {
        if let Some(handler) = self.handler()
            && let Err(e) = handler.update_objects(source_name, objects, deleted).await
        {
            error!(source = %source_name, error = %e, "update callback failed");
        }
    }
}

/// Reads the inbound channel and routes messages; see the module docs for
/// the inline-versus-spawned split
async fn dispatch_task(shared: Arc<CoordinatorShared>, mut inbox: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                debug!(url = %shared.url, "exiting coordinator dispatch task");
                return;
            }
            message = inbox.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        match message.msg_type {
            MessageType::Register => {
                let mut registry = shared.registry.lock().await;
                shared.register_source(&mut registry, message).await;
            }
            MessageType::Unregister => {
                let mut registry = shared.registry.lock().await;
                shared.unregister_source(&mut registry, message).await;
            }
            MessageType::UpdateObjects => {
                let mut registry = shared.registry.lock().await;
                shared.update_objects_source(&mut registry, message).await;
            }
            MessageType::Ack | MessageType::Nack => {
                shared.acks.insert(&message.transaction_uid.to_string(), message);
            }
            MessageType::Ping => {
                let mut registry = shared.registry.lock().await;
                shared.handle_ping(&mut registry, &message);
            }
            MessageType::Get => {
                let shared = shared.clone();
                tokio::spawn(async move { handle_client_get(shared, message).await });
            }
            MessageType::Set => {
                let shared = shared.clone();
                tokio::spawn(async move { handle_client_set(shared, message).await });
            }
            MessageType::List => {
                let shared = shared.clone();
                tokio::spawn(async move { handle_client_list(shared, message).await });
            }
            MessageType::AddRow => {
                let shared = shared.clone();
                tokio::spawn(async move { handle_client_add_row(shared, message).await });
            }
            MessageType::DeleteRow => {
                let shared = shared.clone();
                tokio::spawn(async move { handle_client_delete_row(shared, message).await });
            }
        }
    }
}

/// Liveness supervision: evict silent sources, ping the rest
async fn supervise_task(shared: Arc<CoordinatorShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(url = %shared.url, "exiting coordinator ping task");
                return;
            }
            _ = tokio::time::sleep(shared.config.ping_period()) => {}
        }

        let mut registry = shared.registry.lock().await;
        let now = Instant::now();

        let stale: Vec<String> = registry
            .sources
            .iter()
            .filter(|(_, link)| now.duration_since(link.last_ping) > shared.config.eviction_timeout())
            .map(|(name, _)| name.clone())
            .collect();
        for source_name in stale {
            let lag = now.duration_since(registry.sources[&source_name].last_ping);
            warn!(source = %source_name, ?lag, "removing source, last ping too old");
            let link = shared.remove_source(&mut registry, &source_name).await;
            shared.close_after_drain(link);
        }

        for link in registry.sources.values() {
            let mut ping = link.new_message(MessageType::Ping);
            ping.source = shared.url.clone();
            if let Err(e) = link.send(ping).await {
                warn!(source = %link.source_name, error = %e, "failed to queue ping");
            }
        }
    }
}

async fn handle_client_get(shared: Arc<CoordinatorShared>, message: Message) {
    let registry = shared.registry.lock().await;
    let Some(link) = registry.sources.get(&message.source_name) else {
        error!(source = %message.source_name, "get from unregistered source, ignoring");
        return;
    };

    if message.objects.is_empty() {
        shared
            .respond_nack(link, &message, "invalid get request with empty objects list", Vec::new())
            .await;
        return;
    }

    let names: Vec<String> = message.objects.iter().map(|object| object.name.clone()).collect();
    let (objects, errors) = shared.get_locked(&registry, &names).await;
    if !errors.is_empty() {
        let error = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        shared
            .respond_nack(link, &message, &format!("failed to get objects with {error}"), Vec::new())
            .await;
        return;
    }

    shared.respond_ack(link, &message, objects).await;
}

async fn handle_client_set(shared: Arc<CoordinatorShared>, message: Message) {
    let registry = shared.registry.lock().await;
    let Some(link) = registry.sources.get(&message.source_name) else {
        error!(source = %message.source_name, "set from unregistered source, ignoring");
        return;
    };

    if message.objects.is_empty() {
        shared
            .respond_nack(link, &message, "invalid set request with empty objects list", Vec::new())
            .await;
        return;
    }

    // Every object is attempted; failures only shape the reply
    let mut errors = Vec::new();
    let mut failed = Vec::new();
    for object in &message.objects {
        if let Err(e) = shared.set_locked(&registry, object.clone()).await {
            errors.push(e.to_string());
            failed.push(object.clone());
        }
    }

    if errors.is_empty() {
        shared.respond_ack(link, &message, Vec::new()).await;
    } else {
        shared
            .respond_nack(link, &message, &errors.join("; "), failed)
            .await;
    }
}

async fn handle_client_list(shared: Arc<CoordinatorShared>, message: Message) {
    let registry = shared.registry.lock().await;
    let Some(link) = registry.sources.get(&message.source_name) else {
        error!(source = %message.source_name, "list from unregistered source, ignoring");
        return;
    };

    if message.objects.is_empty() {
        shared
            .respond_nack(link, &message, "invalid list request with empty objects list", Vec::new())
            .await;
        return;
    }

    let mut collected = Vec::new();
    for object in &message.objects {
        match registry.list(&object.name) {
            Ok(mut objects) => collected.append(&mut objects),
            Err(e) => {
                shared
                    .respond_nack(link, &message, &format!("failed to list objects with {e}"), Vec::new())
                    .await;
                return;
            }
        }
    }

    shared.respond_ack(link, &message, collected).await;
}

async fn handle_client_add_row(shared: Arc<CoordinatorShared>, message: Message) {
    let registry = shared.registry.lock().await;
    let Some(link) = registry.sources.get(&message.source_name) else {
        error!(source = %message.source_name, "add row from unregistered source, ignoring");
        return;
    };

    if message.objects.len() != 1 {
        let error = format!("invalid number of objects ({}) in add row", message.objects.len());
        shared.respond_nack(link, &message, &error, Vec::new()).await;
        return;
    }

    match shared.add_row_locked(&registry, message.objects[0].clone()).await {
        Ok(row) => shared.respond_ack(link, &message, vec![Object::named(row)]).await,
        Err(e) => shared.respond_nack(link, &message, &e.to_string(), Vec::new()).await,
    }
}

async fn handle_client_delete_row(shared: Arc<CoordinatorShared>, message: Message) {
    let registry = shared.registry.lock().await;
    let Some(link) = registry.sources.get(&message.source_name) else {
        error!(source = %message.source_name, "delete row from unregistered source, ignoring");
        return;
    };

    if message.objects.len() != 1 {
        let error = format!("invalid number of objects ({}) in delete row", message.objects.len());
        shared.respond_nack(link, &message, &error, Vec::new()).await;
        return;
    }

    match shared.delete_row_locked(&registry, message.objects[0].clone()).await {
        Ok(()) => shared.respond_ack(link, &message, Vec::new()).await,
        Err(e) => shared.respond_nack(link, &message, &e.to_string(), Vec::new()).await,
    }
}
