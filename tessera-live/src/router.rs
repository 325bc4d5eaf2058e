//! Path → view routing.
//!
//! A join names the page URL; the router strips scheme, host and query and
//! looks the path up in an exact-match table. The query string is not part of
//! the match; it reaches the view through `handle_params`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{Channel, Inbound};
use crate::error::LiveError;
use crate::manager::{LiveViewManager, Services};
use crate::params::url_path;
use crate::view::LiveView;

/// Creates a fresh channel for a view topic.
pub trait ViewFactory: Send + Sync {
    fn create(&self, topic: &str, services: Services, queue: mpsc::Sender<Inbound>) -> Box<dyn Channel>;
}

struct ViewRoute<V: LiveView> {
    view: Arc<V>,
}

impl<V: LiveView> ViewFactory for ViewRoute<V> {
    fn create(&self, topic: &str, services: Services, queue: mpsc::Sender<Inbound>) -> Box<dyn Channel> {
        Box::new(LiveViewManager::new(self.view.clone(), topic, services, queue))
    }
}

/// Exact-path routing table shared by every connection of a server.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn ViewFactory>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `view` at `path`. A later route for the same path replaces it.
    pub fn route<V: LiveView>(mut self, path: impl Into<String>, view: V) -> Self {
        let path = path.into();
        if self
            .routes
            .insert(path.clone(), Arc::new(ViewRoute { view: Arc::new(view) }))
            .is_some()
        {
            log::warn!("Route {path} registered twice; keeping the last view");
        }
        self
    }

    /// Factory for the view mounted at `url`'s path.
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn ViewFactory>, LiveError> {
        let path = url_path(url)?;
        self.routes
            .get(&path)
            .cloned()
            .ok_or(LiveError::UnknownRoute(path))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackResult;
    use crate::params::Params;
    use crate::session::Session;
    use crate::socket::LiveSocket;
    use crate::view::{Event, RenderMeta};
    use async_trait::async_trait;
    use tessera_core::{html, Template};

    struct Hello;

    #[async_trait]
    impl LiveView for Hello {
        type Context = ();
        type Info = ();

        async fn mount(&self, _params: &Params, _session: &Session, _socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
            Ok(())
        }

        fn render(&self, _ctx: &(), _meta: &RenderMeta<'_>) -> Template {
            html!("<p>hello</p>")
        }

        async fn handle_event(&self, _event: Event, _ctx: &mut (), _socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_ignores_host_and_query() {
        let router = Router::new().route("/hello", Hello);
        assert!(router.resolve("http://localhost:4001/hello?x=1#top").is_ok());
        assert!(router.resolve("/hello").is_ok());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_unknown_route() {
        let router = Router::new().route("/hello", Hello);
        assert!(matches!(router.resolve("/nope"), Err(LiveError::UnknownRoute(p)) if p == "/nope"));
        assert!(matches!(router.resolve("/hello/extra"), Err(LiveError::UnknownRoute(_))));
    }

    #[tokio::test]
    async fn test_factory_creates_unjoined_channel() {
        let router = Router::new().route("/hello", Hello);
        let (tx, _rx) = mpsc::channel(4);
        let factory = router.resolve("/hello").unwrap();
        let channel = factory.create("lv:1", Services::in_memory(4), tx);
        assert_eq!(channel.topic(), "lv:1");
        assert!(!channel.is_closed());
    }
}
