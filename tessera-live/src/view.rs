//! Application-facing view contract.
//!
//! A view is a stateless handler; everything it remembers between cycles
//! lives in its [`LiveView::Context`], which the manager owns and clones
//! before each callback so a failing callback leaves the last good state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use tessera_core::{Cid, Template};

use crate::error::CallbackResult;
use crate::params::{parse_query, Params};
use crate::protocol::EventPayload;
use crate::session::Session;
use crate::socket::LiveSocket;
use crate::upload::{Upload, Uploads};

/// A client event routed to a view or component.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    /// Binding kind reported by the client (`click`, `form`, `keyup`, ...).
    pub kind: String,
    pub value: Value,
    pub target: Option<Cid>,
}

impl Event {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            value,
            target: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        // form bindings send an url-encoded body
        let value = match payload.value {
            Value::String(body) if payload.kind == "form" => Value::Object(parse_query(&body)),
            other => other,
        };
        Self {
            name: payload.event,
            kind: payload.kind,
            value,
            target: payload.cid,
        }
    }
}

/// Read-only connection data available while rendering.
#[derive(Debug, Clone, Copy)]
pub struct RenderMeta<'a> {
    pub url: &'a str,
    pub csrf_token: &'a str,
    pub flash: &'a BTreeMap<String, String>,
    pub uploads: &'a Uploads,
}

impl<'a> RenderMeta<'a> {
    pub fn flash(&self, key: &str) -> Option<&'a str> {
        self.flash.get(key).map(String::as_str)
    }

    pub fn upload(&self, name: &str) -> Option<&'a Upload> {
        self.uploads.get(name)
    }
}

/// A server-rendered view.
#[async_trait]
pub trait LiveView: Send + Sync + 'static {
    /// Per-connection state.
    type Context: Clone + Send + 'static;

    /// Server-side messages: self-sends, pub/sub payloads, timer ticks and
    /// messages from nested components. Pub/sub and timers carry them as JSON.
    type Info: Serialize + DeserializeOwned + Send + 'static;

    async fn mount(
        &self,
        params: &Params,
        session: &Session,
        socket: &mut LiveSocket<'_, Self>,
    ) -> CallbackResult<Self::Context>;

    /// Called after mount and on every navigation with the URL's query params.
    async fn handle_params(
        &self,
        _params: &Params,
        _url: &str,
        _ctx: &mut Self::Context,
        _socket: &mut LiveSocket<'_, Self>,
    ) -> CallbackResult<()> {
        Ok(())
    }

    fn render(&self, ctx: &Self::Context, meta: &RenderMeta<'_>) -> Template;

    async fn handle_event(
        &self,
        event: Event,
        ctx: &mut Self::Context,
        socket: &mut LiveSocket<'_, Self>,
    ) -> CallbackResult<()>;

    async fn handle_info(
        &self,
        _info: Self::Info,
        _ctx: &mut Self::Context,
        _socket: &mut LiveSocket<'_, Self>,
    ) -> CallbackResult<()> {
        Ok(())
    }

    /// Called once when the view leaves or its connection closes.
    async fn shutdown(&self, _ctx: &mut Self::Context) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(kind: &str, value: Value) -> EventPayload {
        EventPayload {
            kind: kind.into(),
            event: "save".into(),
            value,
            cid: Some(3),
        }
    }

    #[test]
    fn test_form_event_is_decoded() {
        let event = Event::from(payload("form", json!("name=Ada+L&city=K%C3%B6ln&age=36")));
        assert_eq!(event.get_str("name"), Some("Ada L"));
        assert_eq!(event.get_str("city"), Some("Köln"));
        assert_eq!(event.get_str("age"), Some("36"));
        assert_eq!(event.target, Some(3));
    }

    #[test]
    fn test_click_event_keeps_value() {
        let event = Event::from(payload("click", json!({"id": 1})));
        assert_eq!(event.get("id"), Some(&json!(1)));
        assert_eq!(event.kind, "click");

        let raw = Event::from(payload("keyup", json!("a=b")));
        assert_eq!(raw.value, json!("a=b"));
    }

    #[test]
    fn test_render_meta_lookups() {
        let mut flash = BTreeMap::new();
        flash.insert("info".to_string(), "Saved".to_string());
        let uploads = Uploads::default();
        let meta = RenderMeta {
            url: "/",
            csrf_token: "t",
            flash: &flash,
            uploads: &uploads,
        };
        assert_eq!(meta.flash("info"), Some("Saved"));
        assert!(meta.flash("error").is_none());
        assert!(meta.upload("avatar").is_none());
    }
}
