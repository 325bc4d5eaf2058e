//! Topic multiplexing for one socket.
//!
//! A socket carries any number of view topics (`lv:*`), upload topics
//! (`lvu:*`) and the `phoenix` heartbeat topic. [`Connection`] owns every
//! channel joined on the socket and routes each inbound item to it:
//!
//! ```text
//!  reader task ──┐
//!  pub/sub  ─────┼──► mpsc<Inbound> ──► Connection ──┬──► lv:a  (LiveViewManager)
//!  timers  ──────┘       (FIFO)                      ├──► lv:b
//!                                                    └──► lvu:0 ──► owner of token
//! ```
//!
//! Everything a socket receives funnels through one queue, so a view never
//! sees a message while it is still producing the reply to the previous one.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::LiveError;
use crate::manager::Services;
use crate::protocol::{Envelope, JoinPayload, MessageKind, UploadJoinPayload, PHOENIX_TOPIC, UPLOAD_TOPIC_PREFIX};
use crate::router::Router;
use crate::server::Counters;
use crate::upload::ChunkFrame;

/// One item on a socket's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// JSON-encoded info for the view on `topic`, from pub/sub or a timer.
    Info { topic: String, payload: Value },
    Closed,
}

/// A joined topic, as seen by the connection.
#[async_trait]
pub trait Channel: Send {
    fn topic(&self) -> &str;

    fn is_closed(&self) -> bool;

    fn owns_upload(&self, token: &str) -> bool;

    async fn join(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError>;

    /// Any non-join, non-leave message addressed to this topic.
    async fn handle(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError>;

    async fn deliver(&mut self, payload: Value) -> Result<Vec<Envelope>, LiveError>;

    async fn receive_chunk(&mut self, token: &str, data: &[u8]) -> Result<(), LiveError>;

    async fn leave(&mut self);
}

/// Channels joined on one socket.
pub struct Connection {
    router: Arc<Router>,
    services: Services,
    channels: HashMap<String, Box<dyn Channel>>,
    /// Upload topic → (owning view topic, entry token)
    upload_topics: HashMap<String, (String, String)>,
    queue: mpsc::Sender<Inbound>,
    counters: Arc<Counters>,
}

impl Connection {
    pub(crate) fn new(
        router: Arc<Router>,
        services: Services,
        queue: mpsc::Sender<Inbound>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            router,
            services,
            channels: HashMap::new(),
            upload_topics: HashMap::new(),
            queue,
            counters,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.channels.contains_key(topic)
    }

    /// Process one queued item and return the frames to send, in order.
    pub async fn handle(&mut self, inbound: Inbound) -> Vec<Envelope> {
        let result = match inbound {
            Inbound::Text(text) => {
                self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                match Envelope::decode(&text) {
                    Ok(envelope) => {
                        let topic = envelope.topic.clone();
                        self.dispatch(envelope).await.map_err(|e| (topic, e))
                    }
                    Err(e) => Err(("text frame".to_string(), e.into())),
                }
            }
            Inbound::Binary(bytes) => {
                self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                match ChunkFrame::decode(&bytes) {
                    Ok(frame) => {
                        let topic = frame.topic.clone();
                        self.chunk(frame).await.map_err(|e| (topic, e))
                    }
                    Err(e) => Err(("binary frame".to_string(), e.into())),
                }
            }
            Inbound::Info { topic, payload } => match self.channels.get_mut(&topic) {
                Some(channel) => channel.deliver(payload).await.map_err(|e| (topic, e)),
                None => {
                    debug!("Dropping info for departed topic {topic}");
                    Ok(Vec::new())
                }
            },
            Inbound::Closed => Ok(Vec::new()),
        };
        self.prune();

        result.unwrap_or_else(|(topic, error)| {
            self.record(&topic, &error);
            Vec::new()
        })
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<Vec<Envelope>, LiveError> {
        match envelope.kind() {
            MessageKind::Heartbeat if envelope.topic == PHOENIX_TOPIC => {
                trace!("Heartbeat");
                Ok(vec![Envelope::ok(&envelope, json!({}))])
            }
            MessageKind::Join if envelope.topic.starts_with(UPLOAD_TOPIC_PREFIX) => self.join_upload(&envelope),
            MessageKind::Join => self.join_view(&envelope).await,
            MessageKind::Leave => Ok(self.leave(&envelope).await),
            _ => match self.channels.get_mut(&envelope.topic) {
                Some(channel) => channel.handle(&envelope).await,
                None => Err(LiveError::UnknownTopic(envelope.topic)),
            },
        }
    }

    async fn join_view(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: JoinPayload = request.payload_as()?;
        let url = payload
            .location()
            .ok_or_else(|| LiveError::Malformed("join without url".into()))?;
        let factory = self.router.resolve(url)?;

        // a rejoin replaces the previous channel on the topic
        if let Some(mut previous) = self.channels.remove(&request.topic) {
            debug!("Rejoin on {}; leaving previous view", request.topic);
            previous.leave().await;
        }

        let mut channel = factory.create(&request.topic, self.services.clone(), self.queue.clone());
        let out = channel.join(request).await?;
        if !channel.is_closed() {
            self.channels.insert(request.topic.clone(), channel);
        }
        Ok(out)
    }

    fn join_upload(&mut self, request: &Envelope) -> Result<Vec<Envelope>, LiveError> {
        let payload: UploadJoinPayload = request.payload_as()?;
        let owner = self
            .channels
            .values()
            .find(|channel| channel.owns_upload(&payload.token))
            .map(|channel| channel.topic().to_string())
            .ok_or_else(|| LiveError::UnknownTopic(request.topic.clone()))?;
        debug!("Upload topic {} joined for {owner}", request.topic);
        self.upload_topics
            .insert(request.topic.clone(), (owner, payload.token));
        Ok(vec![Envelope::ok(request, json!({}))])
    }

    async fn leave(&mut self, request: &Envelope) -> Vec<Envelope> {
        if self.upload_topics.remove(&request.topic).is_none() {
            match self.channels.remove(&request.topic) {
                Some(mut channel) => channel.leave().await,
                None => debug!("Leave for unjoined topic {}", request.topic),
            }
        }
        vec![Envelope::ok(request, json!({}))]
    }

    async fn chunk(&mut self, frame: ChunkFrame) -> Result<Vec<Envelope>, LiveError> {
        let (owner, token) = self
            .upload_topics
            .get(&frame.topic)
            .cloned()
            .ok_or_else(|| LiveError::UnknownTopic(frame.topic.clone()))?;
        let channel = self
            .channels
            .get_mut(&owner)
            .ok_or(LiveError::UnknownTopic(owner.clone()))?;
        channel.receive_chunk(&token, &frame.data).await?;

        let request = Envelope::new(frame.join_ref, frame.msg_ref, frame.topic, frame.event, Value::Null);
        Ok(vec![Envelope::ok(&request, json!({}))])
    }

    /// Drop channels that closed themselves and the upload topics they owned.
    fn prune(&mut self) {
        let before = self.channels.len();
        self.channels.retain(|_, channel| !channel.is_closed());
        if self.channels.len() != before {
            let channels = &self.channels;
            self.upload_topics
                .retain(|_, (owner, _)| channels.contains_key(owner));
        }
    }

    fn record(&self, topic: &str, error: &LiveError) {
        if error.is_callback() {
            self.counters.callback_failures.fetch_add(1, Ordering::Relaxed);
            error!("Callback failed on {topic}: {error}");
        } else {
            self.counters.dropped_messages.fetch_add(1, Ordering::Relaxed);
            warn!("Dropped message on {topic}: {error}");
        }
    }

    /// Leave every channel; called once the socket is gone.
    pub async fn shutdown(&mut self) {
        let count = self.channels.len();
        for (_, mut channel) in self.channels.drain() {
            channel.leave().await;
        }
        self.upload_topics.clear();
        if count > 0 {
            info!("Connection closed; left {count} views");
        }
    }
}
