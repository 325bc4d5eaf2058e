//! Side-channel handed to callbacks.
//!
//! Callbacks never touch the connection directly. They record what they want
//! to happen on a [`LiveSocket`] (or a [`ComponentSocket`] inside nested
//! components) and the manager applies it once the callback returns
//! successfully. Recorded effects of a failed callback are discarded.

use std::marker::PhantomData;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use tessera_core::PushEvent;

use crate::upload::{ConsumedEntry, Upload, UploadConfig, UploadEntry, Uploads};
use crate::view::LiveView;

/// Context reset run after every successful reply.
pub(crate) type TempReset<C> = Box<dyn Fn(&mut C) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Navigation {
    /// Same view, new URL: `handle_params` runs again.
    Patch(String),
    /// Another view: the client rejoins.
    Redirect(String),
    /// Full page load.
    External(String),
}

/// Effects recorded during one callback.
pub(crate) struct Effects<I, C> {
    pub title: Option<String>,
    pub events: Vec<PushEvent>,
    pub navigation: Option<Navigation>,
    pub flash: Vec<(String, String)>,
    pub infos: Vec<I>,
    pub subscriptions: Vec<String>,
    pub broadcasts: Vec<(String, Value)>,
    pub timers: Vec<(Duration, Value)>,
    pub temp_resets: Vec<(String, TempReset<C>)>,
}

impl<I, C> Effects<I, C> {
    /// Effects of `self` followed by those of a later callback.
    pub fn then(mut self, later: Self) -> Self {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.navigation.is_some() {
            self.navigation = later.navigation;
        }
        self.events.extend(later.events);
        self.flash.extend(later.flash);
        self.infos.extend(later.infos);
        self.subscriptions.extend(later.subscriptions);
        self.broadcasts.extend(later.broadcasts);
        self.timers.extend(later.timers);
        self.temp_resets.extend(later.temp_resets);
        self
    }
}

impl<I, C> Default for Effects<I, C> {
    fn default() -> Self {
        Self {
            title: None,
            events: Vec::new(),
            navigation: None,
            flash: Vec::new(),
            infos: Vec::new(),
            subscriptions: Vec::new(),
            broadcasts: Vec::new(),
            timers: Vec::new(),
            temp_resets: Vec::new(),
        }
    }
}

/// Per-callback handle for a top-level view.
pub struct LiveSocket<'a, V: LiveView + ?Sized> {
    topic: &'a str,
    uploads: &'a mut Uploads,
    effects: Effects<V::Info, V::Context>,
    _view: PhantomData<fn(&V)>,
}

impl<'a, V: LiveView + ?Sized> LiveSocket<'a, V> {
    pub(crate) fn new(topic: &'a str, uploads: &'a mut Uploads) -> Self {
        Self {
            topic,
            uploads,
            effects: Effects::default(),
            _view: PhantomData,
        }
    }

    pub(crate) fn into_effects(self) -> Effects<V::Info, V::Context> {
        self.effects
    }

    /// Channel topic of this view.
    pub fn topic(&self) -> &str {
        self.topic
    }

    pub fn page_title(&mut self, title: impl Into<String>) {
        self.effects.title = Some(title.into());
    }

    /// Queue a client-side event delivered with the next diff.
    pub fn push_event(&mut self, event: impl Into<String>, payload: Value) {
        self.effects.events.push(PushEvent::new(event, payload));
    }

    /// Change the URL without remounting; `handle_params` runs with it.
    pub fn push_patch(&mut self, to: impl Into<String>) {
        self.effects.navigation = Some(Navigation::Patch(to.into()));
    }

    /// Navigate to another view over the same connection.
    pub fn push_redirect(&mut self, to: impl Into<String>) {
        self.effects.navigation = Some(Navigation::Redirect(to.into()));
    }

    /// Full page navigation.
    pub fn redirect(&mut self, to: impl Into<String>) {
        self.effects.navigation = Some(Navigation::External(to.into()));
    }

    pub fn put_flash(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.effects.flash.push((key.into(), message.into()));
    }

    /// Deliver `info` to this view's `handle_info` after the current reply.
    pub fn send_info(&mut self, info: V::Info) {
        self.effects.infos.push(info);
    }

    pub fn subscribe(&mut self, topic: impl Into<String>) {
        self.effects.subscriptions.push(topic.into());
    }

    /// Publish `info` to every subscriber of `topic`, this view included.
    pub fn broadcast(&mut self, topic: impl Into<String>, info: &V::Info) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_value(info)?;
        self.effects.broadcasts.push((topic.into(), payload));
        Ok(())
    }

    /// Deliver `info` every `period` until the view leaves.
    pub fn repeat(&mut self, period: Duration, info: &V::Info) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_value(info)?;
        self.effects.timers.push((period, payload));
        Ok(())
    }

    /// Register a reset applied to the context after every successful reply.
    /// A later registration under the same `key` replaces the earlier one.
    pub fn temp_assign(&mut self, key: impl Into<String>, reset: impl Fn(&mut V::Context) + Send + Sync + 'static) {
        self.effects.temp_resets.push((key.into(), Box::new(reset)));
    }

    pub fn allow_upload(&mut self, name: &str, config: UploadConfig) -> &Upload {
        self.uploads.allow(name, config)
    }

    pub fn uploaded_entries(&self, name: &str) -> &[UploadEntry] {
        self.uploads.get(name).map(|u| u.entries.as_slice()).unwrap_or_default()
    }

    /// Take the completed entries of `name`; their staged files now belong to the caller.
    pub fn consume_uploaded_entries(&mut self, name: &str) -> Vec<ConsumedEntry> {
        self.uploads.consume(name)
    }

    pub fn cancel_upload(&mut self, name: &str, entry_ref: &str) -> Option<UploadEntry> {
        self.uploads.cancel(name, entry_ref)
    }
}

/// Per-callback handle for a nested component.
#[derive(Debug, Default)]
pub struct ComponentSocket {
    pub(crate) events: Vec<PushEvent>,
    pub(crate) parent_infos: Vec<Value>,
}

impl ComponentSocket {
    pub fn push_event(&mut self, event: impl Into<String>, payload: Value) {
        self.events.push(PushEvent::new(event, payload));
    }

    /// Send a message to the owning view's `handle_info`.
    pub fn send_parent_info<T: Serialize>(&mut self, info: &T) -> Result<(), serde_json::Error> {
        self.parent_infos.push(serde_json::to_value(info)?);
        Ok(())
    }
}
