//! Per-view lifecycle manager.
//!
//! One [`LiveViewManager`] drives one joined view topic. It owns the view's
//! context, the last tree sent to the client and the component registry, and
//! turns each inbound message into the outbound messages to send, in order.
//!
//! ```text
//!             ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!  message ──►│ callback  │──►│ render + │──►│ effects  │──►│ reply /  │
//!             │ (on clone)│   │ resolve +│   │ (flash,  │   │ push     │
//!             └───────────┘   │ diff     │   │  pubsub) │   └────┬─────┘
//!                             └──────────┘   └──────────┘        │
//!                                                                ▼
//!                                          temp sweep, then navigation,
//!                                          then queued infos (FIFO)
//! ```
//!
//! A cycle commits as a whole. A failing callback or component leaves the
//! context, uploads, component state and stored tree untouched and produces
//! no message for that cycle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tessera_core::{diff, Cid, Parts, PushEvent};

use crate::component::{self, ComponentRegistry};
use crate::connection::{Channel, Inbound};
use crate::error::LiveError;
use crate::flash::{FlashStore, MemoryFlashStore, CLEAR_FLASH_EVENT};
use crate::params::url_params;
use crate::protocol::{
    AllowUploadPayload, Envelope, EventPayload, JoinPayload, LivePatchPayload, MessageKind,
    ProgressPayload,
};
use crate::pubsub::{BroadcastHub, PubSub};
use crate::session::{JsonSessionVerifier, Session, SessionVerifier};
use crate::socket::{ComponentSocket, Effects, LiveSocket, Navigation, TempReset};
use crate::upload::{FileStager, TempDirStager, UploadError, Uploads};
use crate::view::{Event, LiveView, RenderMeta};

/// External collaborators shared by every view of a server.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionVerifier>,
    pub pubsub: Arc<dyn PubSub>,
    pub flash: Arc<dyn FlashStore>,
    pub stager: Arc<dyn FileStager>,
}

impl Services {
    /// In-process collaborators: JSON sessions, a fresh broadcast hub, memory
    /// flash and staging under the OS temp dir.
    pub fn in_memory(pubsub_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(JsonSessionVerifier),
            pubsub: Arc::new(BroadcastHub::new(pubsub_capacity)),
            flash: Arc::new(MemoryFlashStore::new()),
            stager: Arc::new(TempDirStager::in_temp_dir()),
        }
    }
}

enum Stage<V: LiveView> {
    Unjoined,
    Joined(Box<Joined<V>>),
    Left,
}

struct Joined<V: LiveView> {
    ctx: V::Context,
    session: Session,
    url: String,
    flash: BTreeMap<String, String>,
    uploads: Uploads,
    /// Last top-level tree sent, without `c`, `t` and `e`.
    previous: Parts,
    registry: ComponentRegistry,
    title: Option<String>,
    pending_title: Option<String>,
    temp_resets: BTreeMap<String, TempReset<V::Context>>,
    subscriptions: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// A callback's results, not yet part of the view's state.
struct Outcome<V: LiveView> {
    ctx: V::Context,
    uploads: Uploads,
    url: Option<String>,
    effects: Effects<V::Info, V::Context>,
}

/// Committed state displaced while a cycle renders.
struct Checkpoint<V: LiveView> {
    ctx: V::Context,
    uploads: Uploads,
    url: String,
    flash: BTreeMap<String, String>,
    pending_title: Option<String>,
}

impl<V: LiveView> Joined<V> {
    fn meta(&self) -> RenderMeta<'_> {
        RenderMeta {
            url: &self.url,
            csrf_token: &self.session.csrf_token,
            flash: &self.flash,
            uploads: &self.uploads,
        }
    }

    /// Make a callback's results visible to render, keeping what they replace.
    fn install(
        &mut self,
        ctx: V::Context,
        uploads: Uploads,
        url: Option<String>,
        effects: &mut Effects<V::Info, V::Context>,
    ) -> Checkpoint<V> {
        let checkpoint = Checkpoint {
            ctx: std::mem::replace(&mut self.ctx, ctx),
            uploads: std::mem::replace(&mut self.uploads, uploads),
            url: match url {
                Some(url) => std::mem::replace(&mut self.url, url),
                None => self.url.clone(),
            },
            flash: self.flash.clone(),
            pending_title: self.pending_title.clone(),
        };
        if let Some(title) = effects.title.take() {
            self.pending_title = Some(title);
        }
        for (key, message) in &effects.flash {
            self.flash.insert(key.clone(), message.clone());
        }
        checkpoint
    }

    fn restore(&mut self, checkpoint: Checkpoint<V>) {
        self.ctx = checkpoint.ctx;
        self.uploads = checkpoint.uploads;
        self.url = checkpoint.url;
        self.flash = checkpoint.flash;
        self.pending_title = checkpoint.pending_title;
    }

    fn attach_title(&mut self, parts: &mut Parts) {
        if let Some(title) = self.pending_title.take() {
            if self.title.as_ref() != Some(&title) {
                parts.title = Some(title.clone());
                self.title = Some(title);
            }
        }
    }

    fn sweep(&mut self) {
        for reset in self.temp_resets.values() {
            reset(&mut self.ctx);
        }
    }
}

enum Call<I> {
    /// `handle_params` for a new URL.
    Params(String),
    Event(Event),
    Info(I),
}

/// Work left over after a reply: navigation first, then infos in order.
struct Deferred<I> {
    navigation: Option<Navigation>,
    infos: VecDeque<I>,
}

impl<I> Default for Deferred<I> {
    fn default() -> Self {
        Self {
            navigation: None,
            infos: VecDeque::new(),
        }
    }
}

impl<I> Deferred<I> {
    fn merge(&mut self, next: Deferred<I>) {
        if next.navigation.is_some() {
            self.navigation = next.navigation;
        }
        self.infos.extend(next.infos);
    }
}

/// Lifecycle of one view on one topic.
pub struct LiveViewManager<V: LiveView> {
    view: Arc<V>,
    topic: String,
    services: Services,
    queue: mpsc::Sender<Inbound>,
    stage: Stage<V>,
}

impl<V: LiveView> LiveViewManager<V> {
    /// `queue` receives deliveries from subscriptions and timers.
    pub fn new(view: Arc<V>, topic: impl Into<String>, services: Services, queue: mpsc::Sender<Inbound>) -> Self {
        Self {
            view,
            topic: topic.into(),
            services,
            queue,
            stage: Stage::Unjoined,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.stage, Stage::Joined(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.stage, Stage::Left)
    }

    pub fn context(&self) -> Option<&V::Context> {
        match &self.stage {
            Stage::Joined(joined) => Some(&joined.ctx),
            _ => None,
        }
    }

    pub fn component_count(&self) -> usize {
        match &self.stage {
            Stage::Joined(joined) => joined.registry.len(),
            _ => 0,
        }
    }

    pub fn uploads(&self) -> Option<&Uploads> {
        match &self.stage {
            Stage::Joined(joined) => Some(&joined.uploads),
            _ => None,
        }
    }

    fn joined(&self) -> Result<&Joined<V>, LiveError> {
        match &self.stage {
            Stage::Joined(joined) => Ok(joined),
            _ => Err(LiveError::NotJoined),
        }
    }

    fn joined_mut(&mut self) -> Result<&mut Joined<V>, LiveError> {
        match &mut self.stage {
            Stage::Joined(joined) => Ok(joined),
            _ => Err(LiveError::NotJoined),
        }
    }

    // ── Operations ───────────────────────────────────────────

    /// Verify the session, mount, resolve params and reply with the full tree.
    pub async fn join(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        if !matches!(self.stage, Stage::Unjoined) {
            return Err(LiveError::AlreadyJoined);
        }
        let payload: JoinPayload = request.payload_as()?;
        let url = payload
            .location()
            .ok_or_else(|| LiveError::Malformed("join without url".into()))?
            .to_string();
        let session = self.services.sessions.verify(&payload.session)?;
        if !session.matches_csrf(payload.csrf_token().unwrap_or_default()) {
            return Err(LiveError::CsrfMismatch);
        }
        let flash = self.services.flash.get_all(&session.csrf_token).await;

        let mut uploads = Uploads::default();
        let mut socket = LiveSocket::new(&self.topic, &mut uploads);
        let mounted = self.view.mount(&payload.params, &session, &mut socket).await;
        let effects = socket.into_effects();
        let ctx = mounted.map_err(LiveError::Callback)?;

        self.stage = Stage::Joined(Box::new(Joined {
            ctx,
            session,
            url: url.clone(),
            flash,
            uploads,
            previous: Parts::default(),
            registry: ComponentRegistry::default(),
            title: None,
            pending_title: None,
            temp_resets: BTreeMap::new(),
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        }));

        match self.finish_join(request, effects, url).await {
            Ok(out) => {
                info!("View joined on {} ({} components)", self.topic, self.component_count());
                Ok(out)
            }
            Err(e) => {
                self.leave().await;
                Err(e)
            }
        }
    }

    async fn finish_join(
        &mut self,
        request: &Envelope,
        mount_effects: Effects<V::Info, V::Context>,
        url: String,
    ) -> Result<Vec<Envelope>, LiveError> {
        let mut outcome = self.invoke(Call::Params(url)).await?;
        outcome.effects = mount_effects.then(outcome.effects);
        let (rendered, deferred) = self.commit(outcome, true).await?;

        let mut out = vec![Envelope::rendered(request, &rendered)?];
        self.sweep();
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    /// Run a client event on the view or on the component it targets.
    pub async fn event(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: EventPayload = request.payload_as()?;
        let event = Event::from(payload);
        debug!("Event '{}' on {} (target {:?})", event.name, self.topic, event.target);

        let target = event.target;
        let (parts, deferred) = match target {
            Some(cid) => self.component_cycle(cid, event).await?,
            None if event.name == CLEAR_FLASH_EVENT => {
                self.clear_flash(&event).await?;
                self.rerender().await?
            }
            None => self.cycle(Call::Event(event)).await?,
        };

        let mut out = vec![Envelope::diff_reply(request, &parts)?];
        self.sweep();
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    /// Client-side navigation within the same view.
    pub async fn live_patch(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: LivePatchPayload = request.payload_as()?;
        let (parts, deferred) = self.cycle(Call::Params(payload.url)).await?;

        let mut out = vec![Envelope::diff_reply(request, &parts)?];
        self.sweep();
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    /// Deliver a JSON-encoded info from pub/sub or a timer.
    pub async fn deliver(&mut self, payload: Value) -> Result<Vec<Envelope>, LiveError> {
        let info: V::Info = serde_json::from_value(payload)
            .map_err(|e| LiveError::Malformed(format!("info for {}: {e}", self.topic)))?;
        self.info(info).await
    }

    /// Run `handle_info` and push the resulting diff, if any.
    pub async fn info(&mut self, info: V::Info) -> Result<Vec<Envelope>, LiveError> {
        let (parts, deferred) = self.cycle(Call::Info(info)).await?;
        let mut out = Vec::new();
        self.push_diff(&parts, &mut out);
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    /// Validate announced upload entries and hand out their tokens.
    pub async fn allow_upload(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: AllowUploadPayload = request.payload_as()?;
        let upload_ref = payload.upload_ref;
        let joined = self.joined_mut()?;

        let mut response = match joined.uploads.register(&upload_ref, payload.entries) {
            Ok(tokens) => {
                let config = joined
                    .uploads
                    .by_ref(&upload_ref)
                    .map(|u| u.client_config())
                    .unwrap_or(Value::Null);
                json!({ "ref": upload_ref, "config": config, "entries": tokens })
            }
            Err(UploadError::UnknownUpload(r)) => return Err(UploadError::UnknownUpload(r).into()),
            Err(e) => {
                warn!("Upload {upload_ref} rejected on {}: {e}", self.topic);
                let entry = e.entry_ref().unwrap_or(upload_ref.as_str()).to_string();
                json!({ "ref": upload_ref, "error": [[entry, e.reason()]] })
            }
        };

        let (parts, deferred) = self.rerender().await?;
        response["diff"] = serde_json::to_value(&parts)
            .map_err(|e| LiveError::Malformed(format!("diff encoding: {e}")))?;

        let mut out = vec![Envelope::ok(request, response)];
        self.sweep();
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    /// Record client-reported progress; a named progress event also runs
    /// `handle_event`.
    pub async fn progress(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: ProgressPayload = request.payload_as()?;
        let joined = self.joined_mut()?;
        joined
            .uploads
            .set_progress(&payload.upload_ref, &payload.entry_ref, payload.progress)?;

        let (parts, deferred) = match payload.event {
            Some(name) => {
                let value = json!({
                    "ref": payload.upload_ref,
                    "entry_ref": payload.entry_ref,
                    "progress": payload.progress,
                });
                self.cycle(Call::Event(Event::new(name, value))).await?
            }
            None => self.rerender().await?,
        };

        let mut out = vec![Envelope::diff_reply(request, &parts)?];
        self.sweep();
        self.drain(deferred, &mut out).await;
        Ok(out)
    }

    pub fn owns_upload(&self, token: &str) -> bool {
        match &self.stage {
            Stage::Joined(joined) => joined.uploads.owns_token(token),
            _ => false,
        }
    }

    /// Stage one binary chunk for the entry holding `token`. The entry only
    /// counts the bytes once the stager has written them.
    pub async fn receive_chunk(&mut self, token: &str, data: &[u8]) -> Result<(), LiveError> {
        let Stage::Joined(joined) = &mut self.stage else {
            return Err(LiveError::NotJoined);
        };
        let limit = joined
            .uploads
            .chunk_limit(token)
            .ok_or_else(|| UploadError::UnknownToken(token.to_string()))?;
        if data.len() > limit {
            return Err(UploadError::ChunkTooLarge(data.len()).into());
        }
        let len = data.len() as u64;
        joined.uploads.check_chunk(token, len)?;

        let staged = self
            .services
            .stager
            .append(token, data)
            .await
            .map_err(UploadError::Io)?;
        joined.uploads.record_chunk(token, len, staged)?;
        Ok(())
    }

    /// Stop timers and subscriptions and run `shutdown`. Safe to call twice.
    pub async fn leave(&mut self) {
        let Stage::Joined(mut joined) = std::mem::replace(&mut self.stage, Stage::Left) else {
            return;
        };
        for task in &joined.tasks {
            task.abort();
        }
        for task in joined.tasks.drain(..) {
            let _ = task.await;
        }
        for topic in &joined.subscriptions {
            self.services.pubsub.unsubscribe(topic).await;
        }
        self.view.shutdown(&mut joined.ctx).await;

        for token in joined.uploads.pending_tokens() {
            if let Err(e) = self.services.stager.remove(&token).await {
                warn!("Failed to remove staged upload {token}: {e}");
            }
        }
        info!("View left {} ({} components)", self.topic, joined.registry.len());
    }

    // ── Cycle internals ──────────────────────────────────────

    /// Run one view callback on copies of the context and uploads.
    async fn invoke(&mut self, call: Call<V::Info>) -> Result<Outcome<V>, LiveError> {
        let joined = self.joined()?;
        let mut ctx = joined.ctx.clone();
        let mut uploads = joined.uploads.clone();
        let mut socket = LiveSocket::new(&self.topic, &mut uploads);

        let (result, url) = match call {
            Call::Params(url) => {
                let params = url_params(&url)?;
                let result = self.view.handle_params(&params, &url, &mut ctx, &mut socket).await;
                (result, Some(url))
            }
            Call::Event(event) => (self.view.handle_event(event, &mut ctx, &mut socket).await, None),
            Call::Info(info) => (self.view.handle_info(info, &mut ctx, &mut socket).await, None),
        };
        let effects = socket.into_effects();
        result.map_err(LiveError::Callback)?;
        Ok(Outcome { ctx, uploads, url, effects })
    }

    async fn cycle(&mut self, call: Call<V::Info>) -> Result<(Parts, Deferred<V::Info>), LiveError> {
        let outcome = self.invoke(call).await?;
        self.commit(outcome, false).await
    }

    /// Render a callback's results; keep them only if rendering succeeds,
    /// then apply the effects that reach outside the view.
    async fn commit(
        &mut self,
        outcome: Outcome<V>,
        full: bool,
    ) -> Result<(Parts, Deferred<V::Info>), LiveError> {
        let Outcome { ctx, uploads, url, mut effects } = outcome;
        let checkpoint = self.joined_mut()?.install(ctx, uploads, url, &mut effects);

        let events = std::mem::take(&mut effects.events);
        let (parts, parent_infos) = match self.render_view(full, events).await {
            Ok(rendered) => rendered,
            Err(e) => {
                self.joined_mut()?.restore(checkpoint);
                return Err(e);
            }
        };

        let mut deferred = self.apply_effects(effects).await;
        deferred.infos.extend(self.decode_infos(parent_infos));
        Ok((parts, deferred))
    }

    /// Re-render after a change that ran no view callback.
    async fn rerender(&mut self) -> Result<(Parts, Deferred<V::Info>), LiveError> {
        let (parts, parent_infos) = self.render_view(false, Vec::new()).await?;
        let infos = self.decode_infos(parent_infos);
        Ok((parts, Deferred { infos, ..Deferred::default() }))
    }

    async fn component_cycle(&mut self, cid: Cid, event: Event) -> Result<(Parts, Deferred<V::Info>), LiveError> {
        let joined = self.joined_mut()?;
        let mut socket = ComponentSocket::default();
        if let Err(e) = joined.registry.handle_event(cid, event, &mut socket).await {
            joined.registry.rollback();
            return Err(e);
        }

        let mut parts = Parts::default();
        parts.components = joined.registry.take_patches();
        parts.events = socket.events;
        let infos = self.decode_infos(socket.parent_infos);
        Ok((parts, Deferred { infos, ..Deferred::default() }))
    }

    /// Render the view, resolve components and produce the tree to send:
    /// the full tree when `full`, otherwise the diff against the last one.
    async fn render_view(&mut self, full: bool, mut events: Vec<PushEvent>) -> Result<(Parts, Vec<Value>), LiveError> {
        let view = self.view.clone();
        let joined = self.joined_mut()?;
        let template = view.render(&joined.ctx, &joined.meta());

        let mut socket = ComponentSocket::default();
        let resolved = match component::resolve(template, &mut joined.registry, &mut socket).await {
            Ok(template) => template,
            Err(e) => {
                joined.registry.rollback();
                return Err(e);
            }
        };

        let tree = resolved.to_parts();
        let mut parts = if full { tree.clone() } else { diff(&joined.previous, &tree) };
        joined.previous = tree;
        parts.components = joined.registry.take_patches();
        joined.attach_title(&mut parts);
        events.extend(socket.events);
        parts.events = events;
        Ok((parts, socket.parent_infos))
    }

    /// Apply the effects of a committed callback that reach outside the view.
    async fn apply_effects(&mut self, effects: Effects<V::Info, V::Context>) -> Deferred<V::Info> {
        let Effects {
            navigation,
            flash,
            infos,
            subscriptions,
            broadcasts,
            timers,
            temp_resets,
            ..
        } = effects;
        let deferred = Deferred {
            navigation,
            infos: infos.into(),
        };
        let Stage::Joined(joined) = &mut self.stage else {
            return deferred;
        };

        for (key, message) in flash {
            self.services
                .flash
                .put(&joined.session.csrf_token, &key, &message)
                .await;
        }
        for (key, reset) in temp_resets {
            if joined.temp_resets.insert(key.clone(), reset).is_some() {
                debug!("{} replaced temporary reset '{key}'", self.topic);
            }
        }

        for topic in subscriptions {
            if joined.subscriptions.contains(&topic) {
                continue;
            }
            let rx = self.services.pubsub.subscribe(&topic).await;
            joined
                .tasks
                .push(spawn_forwarder(rx, self.topic.clone(), self.queue.clone()));
            debug!("{} subscribed to '{topic}'", self.topic);
            joined.subscriptions.push(topic);
        }
        for (topic, payload) in broadcasts {
            let receivers = self.services.pubsub.broadcast(&topic, payload).await;
            debug!("{} broadcast to '{topic}' reached {receivers} subscribers", self.topic);
        }
        for (period, payload) in timers {
            joined
                .tasks
                .push(spawn_timer(period, payload, self.topic.clone(), self.queue.clone()));
        }
        deferred
    }

    async fn clear_flash(&mut self, event: &Event) -> Result<(), LiveError> {
        let store = self.services.flash.clone();
        let joined = self.joined_mut()?;
        let keys: Vec<String> = match event.get_str("key") {
            Some(key) => vec![key.to_string()],
            None => joined.flash.keys().cloned().collect(),
        };
        for key in keys {
            store.clear(&joined.session.csrf_token, &key).await;
            joined.flash.remove(&key);
        }
        Ok(())
    }

    fn decode_infos(&self, values: Vec<Value>) -> VecDeque<V::Info> {
        values
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("Dropping component message for {}: {e}", self.topic);
                    None
                }
            })
            .collect()
    }

    fn sweep(&mut self) {
        if let Stage::Joined(joined) = &mut self.stage {
            joined.sweep();
        }
    }

    fn push_diff(&mut self, parts: &Parts, out: &mut Vec<Envelope>) {
        if !parts.is_empty() {
            match Envelope::diff_push(&self.topic, parts) {
                Ok(envelope) => out.push(envelope),
                Err(e) => error!("Failed to encode diff for {}: {e}", self.topic),
            }
        }
        self.sweep();
    }

    /// Run deferred navigation and queued infos until none are left.
    async fn drain(&mut self, mut deferred: Deferred<V::Info>, out: &mut Vec<Envelope>) {
        loop {
            if !self.is_joined() {
                return;
            }
            if let Some(navigation) = deferred.navigation.take() {
                match navigation {
                    Navigation::Patch(to) => {
                        out.push(Envelope::live_patch(&self.topic, &to));
                        match self.cycle(Call::Params(to)).await {
                            Ok((parts, next)) => {
                                self.push_diff(&parts, out);
                                deferred.merge(next);
                            }
                            Err(e) => error!("handle_params failed on {}: {e}", self.topic),
                        }
                    }
                    Navigation::Redirect(to) => {
                        out.push(Envelope::live_redirect(&self.topic, &to));
                        self.leave().await;
                    }
                    Navigation::External(to) => {
                        out.push(Envelope::redirect(&self.topic, &to));
                        self.leave().await;
                    }
                }
                continue;
            }

            let Some(info) = deferred.infos.pop_front() else {
                return;
            };
            match self.cycle(Call::Info(info)).await {
                Ok((parts, next)) => {
                    self.push_diff(&parts, out);
                    deferred.merge(next);
                }
                Err(e) => error!("handle_info failed on {}: {e}", self.topic),
            }
        }
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Value>>,
    topic: String,
    queue: mpsc::Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let inbound = Inbound::Info {
                        topic: topic.clone(),
                        payload: payload.as_ref().clone(),
                    };
                    if queue.send(inbound).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{topic} lagged behind its subscription, {skipped} messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_timer(period: Duration, payload: Value, topic: String, queue: mpsc::Sender<Inbound>) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let inbound = Inbound::Info {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            if queue.send(inbound).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl<V: LiveView> Channel for LiveViewManager<V> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn is_closed(&self) -> bool {
        LiveViewManager::is_closed(self)
    }

    fn owns_upload(&self, token: &str) -> bool {
        LiveViewManager::owns_upload(self, token)
    }

    async fn join(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        LiveViewManager::join(self, request).await
    }

    async fn handle(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        match request.kind() {
            MessageKind::Event => self.event(request).await,
            MessageKind::LivePatch => self.live_patch(request).await,
            MessageKind::AllowUpload => self.allow_upload(request).await,
            MessageKind::Progress => self.progress(request).await,
            other => Err(LiveError::Malformed(format!("unexpected {other:?} on {}", self.topic))),
        }
    }

    async fn deliver(&mut self, payload: Value) -> Result<Vec<Envelope>, LiveError> {
        LiveViewManager::deliver(self, payload).await
    }

    async fn receive_chunk(&mut self, token: &str, data: &[u8]) -> Result<(), LiveError> {
        LiveViewManager::receive_chunk(self, token, data).await
    }

    async fn leave(&mut self) {
        LiveViewManager::leave(self).await
    }
}
