//! Stateful nested components.
//!
//! A view embeds a component with [`live_component_with_id`]. The first time a
//! given (component type, id) pair shows up in a render, the component is
//! mounted and assigned a handle (`cid`); later renders reuse the record and
//! only run `update`. The rendered template keeps a placeholder holding the
//! cid while the component's own tree travels under `c`.
//!
//! ```text
//!   render()                  resolve()                        lower
//! ┌──────────────┐        ┌──────────────────────┐        ┌──────────────┐
//! │ Component(   │ ─────► │ registry             │ ─────► │ "0": 1       │
//! │  Counter,"a")│        │  (Counter,"a") → 1   │        │ "c": {1: ..} │
//! └──────────────┘        └──────────────────────┘        └──────────────┘
//! ```
//!
//! Components embedded with [`live_component`] have no id: they are mounted,
//! updated and rendered from scratch every time and inlined into the parent.
//!
//! Records live until the connection closes. A component's state is
//! snapshotted the first time a cycle touches it; a failed cycle puts the
//! snapshot back.

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use log::{debug, warn};

use tessera_core::{diff, Cid, ComponentRef, Dynamic, Parts, Template};

use crate::error::{CallbackResult, LiveError};
use crate::socket::ComponentSocket;
use crate::view::Event;

/// Guard against components that embed themselves.
const MAX_NESTING: usize = 64;

/// A nested unit with its own state and event handling.
#[async_trait]
pub trait LiveComponent: Send + Sync + 'static {
    type Context: Clone + Send + 'static;
    type Props: Send + 'static;

    async fn mount(&self, socket: &mut ComponentSocket) -> CallbackResult<Self::Context>;

    /// Runs after mount and on every later render of the parent.
    async fn update(
        &self,
        props: Self::Props,
        ctx: &mut Self::Context,
        socket: &mut ComponentSocket,
    ) -> CallbackResult<()>;

    fn render(&self, ctx: &Self::Context) -> Template;

    async fn handle_event(
        &self,
        _event: Event,
        _ctx: &mut Self::Context,
        _socket: &mut ComponentSocket,
    ) -> CallbackResult<()> {
        Ok(())
    }
}

/// Identity of a stateful component within a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    type_id: TypeId,
    id: String,
}

impl ComponentKey {
    pub fn of<C: LiveComponent>(id: impl Into<String>) -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Embed a stateless component: rendered afresh and inlined on every render.
pub fn live_component<C: LiveComponent>(component: C, props: C::Props) -> Dynamic {
    embed(ComponentCall {
        component,
        key: None,
        props,
    })
}

/// Embed a stateful component identified by `id` among components of its type.
pub fn live_component_with_id<C: LiveComponent>(
    component: C,
    id: impl Into<String>,
    props: C::Props,
) -> Dynamic {
    embed(ComponentCall {
        component,
        key: Some(ComponentKey::of::<C>(id)),
        props,
    })
}

fn embed<C: LiveComponent>(call: ComponentCall<C>) -> Dynamic {
    Dynamic::Component(ComponentRef::new(
        type_name::<C>(),
        PendingCall(Box::new(call)),
    ))
}

// ── Type erasure ─────────────────────────────────────────────

struct PendingCall(Box<dyn ErasedCall>);

struct ComponentCall<C: LiveComponent> {
    component: C,
    key: Option<ComponentKey>,
    props: C::Props,
}

trait ErasedCall: Send {
    fn key(&self) -> Option<ComponentKey>;

    /// Mount, then update with the props.
    fn mount<'a>(
        self: Box<Self>,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<Box<dyn ErasedComponent>>>;

    fn update<'a>(
        self: Box<Self>,
        instance: &'a mut dyn ErasedComponent,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<()>>;

    /// Mount, update and render without keeping the instance.
    fn render_once<'a>(self: Box<Self>, socket: &'a mut ComponentSocket) -> BoxFuture<'a, CallbackResult<Template>>;
}

impl<C: LiveComponent> ErasedCall for ComponentCall<C> {
    fn key(&self) -> Option<ComponentKey> {
        self.key.clone()
    }

    fn mount<'a>(
        self: Box<Self>,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<Box<dyn ErasedComponent>>> {
        Box::pin(async move {
            let ComponentCall { component, props, .. } = *self;
            let component = Arc::new(component);
            let mut ctx = component.mount(socket).await?;
            component.update(props, &mut ctx, socket).await?;
            Ok(Box::new(Mounted { component, ctx }) as Box<dyn ErasedComponent>)
        })
    }

    fn update<'a>(
        self: Box<Self>,
        instance: &'a mut dyn ErasedComponent,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<()>> {
        Box::pin(async move {
            let ComponentCall { props, .. } = *self;
            let Some(mounted) = instance.as_any_mut().downcast_mut::<Mounted<C>>() else {
                return Err(format!("component record is not a {}", type_name::<C>()).into());
            };
            mounted.component.update(props, &mut mounted.ctx, socket).await
        })
    }

    fn render_once<'a>(self: Box<Self>, socket: &'a mut ComponentSocket) -> BoxFuture<'a, CallbackResult<Template>> {
        Box::pin(async move {
            let ComponentCall { component, props, .. } = *self;
            let mut ctx = component.mount(socket).await?;
            component.update(props, &mut ctx, socket).await?;
            Ok(component.render(&ctx))
        })
    }
}

trait ErasedComponent: Send {
    fn render(&self) -> Template;

    fn snapshot(&self) -> Box<dyn ErasedComponent>;

    fn handle_event<'a>(
        &'a mut self,
        event: Event,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<()>>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Mounted<C: LiveComponent> {
    component: Arc<C>,
    ctx: C::Context,
}

impl<C: LiveComponent> ErasedComponent for Mounted<C> {
    fn render(&self) -> Template {
        self.component.render(&self.ctx)
    }

    fn snapshot(&self) -> Box<dyn ErasedComponent> {
        Box::new(Mounted {
            component: self.component.clone(),
            ctx: self.ctx.clone(),
        })
    }

    fn handle_event<'a>(
        &'a mut self,
        event: Event,
        socket: &'a mut ComponentSocket,
    ) -> BoxFuture<'a, CallbackResult<()>> {
        Box::pin(async move { self.component.handle_event(event, &mut self.ctx, socket).await })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ── Registry ─────────────────────────────────────────────────

struct MountedComponent {
    key: ComponentKey,
    instance: Box<dyn ErasedComponent>,
    /// Tree the client holds; `None` until first flushed.
    baseline: Option<Parts>,
    current: Option<Parts>,
}

/// Per-connection table of stateful components.
pub(crate) struct ComponentRegistry {
    records: BTreeMap<Cid, MountedComponent>,
    by_key: HashMap<ComponentKey, Cid>,
    /// Components rendered in the cycle in progress.
    rendered: BTreeSet<Cid>,
    /// Instances as they were before the cycle in progress changed them.
    saved: BTreeMap<Cid, Box<dyn ErasedComponent>>,
    next_cid: Cid,
    depth: usize,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_key: HashMap::new(),
            rendered: BTreeSet::new(),
            saved: BTreeMap::new(),
            next_cid: 1,
            depth: 0,
        }
    }
}

impl ComponentRegistry {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn cid_of(&self, key: &ComponentKey) -> Option<Cid> {
        self.by_key.get(key).copied()
    }

    #[cfg(test)]
    pub fn contains(&self, cid: Cid) -> bool {
        self.records.contains_key(&cid)
    }

    /// Snapshot `cid` before the current cycle first changes it.
    fn save(&mut self, cid: Cid) -> Result<(), LiveError> {
        let record = self.records.get(&cid).ok_or(LiveError::UnknownComponent(cid))?;
        self.saved.entry(cid).or_insert_with(|| record.instance.snapshot());
        Ok(())
    }

    async fn resolve_component(
        &mut self,
        reference: ComponentRef,
        socket: &mut ComponentSocket,
    ) -> Result<Dynamic, LiveError> {
        let label = reference.label();
        let call = match reference.into_payload().downcast::<PendingCall>() {
            Ok(call) => call.0,
            Err(_) => {
                warn!("Embedded unit '{label}' is not a live component; rendering nothing");
                return Ok(Dynamic::Text(String::new()));
            }
        };
        if self.depth >= MAX_NESTING {
            return Err(LiveError::Callback(
                format!("component '{label}' nested deeper than {MAX_NESTING} levels").into(),
            ));
        }

        self.depth += 1;
        let result = self.render_call(call, label, socket).await;
        self.depth -= 1;
        result
    }

    async fn render_call(
        &mut self,
        call: Box<dyn ErasedCall>,
        label: &'static str,
        socket: &mut ComponentSocket,
    ) -> Result<Dynamic, LiveError> {
        let Some(key) = call.key() else {
            let template = call.render_once(socket).await.map_err(LiveError::Callback)?;
            let template = resolve(template, self, socket).await?;
            return Ok(Dynamic::Template(template));
        };

        let cid = match self.by_key.get(&key).copied() {
            Some(cid) => {
                self.save(cid)?;
                let record = self.records.get_mut(&cid).ok_or(LiveError::UnknownComponent(cid))?;
                call.update(record.instance.as_mut(), socket)
                    .await
                    .map_err(LiveError::Callback)?;
                cid
            }
            None => {
                let instance = call.mount(socket).await.map_err(LiveError::Callback)?;
                let cid = self.next_cid;
                self.next_cid += 1;
                debug!("Mounted component {label} '{}' as cid {cid}", key.id());
                self.by_key.insert(key.clone(), cid);
                self.records.insert(
                    cid,
                    MountedComponent {
                        key,
                        instance,
                        baseline: None,
                        current: None,
                    },
                );
                cid
            }
        };

        self.render_record(cid, socket).await?;
        Ok(Dynamic::Placeholder(cid))
    }

    async fn render_record(&mut self, cid: Cid, socket: &mut ComponentSocket) -> Result<(), LiveError> {
        let template = self
            .records
            .get(&cid)
            .ok_or(LiveError::UnknownComponent(cid))?
            .instance
            .render();
        let template = resolve(template, self, socket).await?;
        if let Some(record) = self.records.get_mut(&cid) {
            record.current = Some(template.to_parts());
            self.rendered.insert(cid);
        }
        Ok(())
    }

    /// Run a targeted event on `cid` and re-render that component.
    pub async fn handle_event(
        &mut self,
        cid: Cid,
        event: Event,
        socket: &mut ComponentSocket,
    ) -> Result<(), LiveError> {
        self.save(cid)?;
        let record = self.records.get_mut(&cid).ok_or(LiveError::UnknownComponent(cid))?;
        record
            .instance
            .handle_event(event, socket)
            .await
            .map_err(LiveError::Callback)?;
        self.render_record(cid, socket).await
    }

    /// Trees to send under `c` for this cycle; the client is then assumed
    /// to hold them and the cycle's component state is kept.
    pub fn take_patches(&mut self) -> BTreeMap<Cid, Parts> {
        self.saved.clear();
        let mut patches = BTreeMap::new();
        for cid in std::mem::take(&mut self.rendered) {
            let Some(record) = self.records.get_mut(&cid) else {
                continue;
            };
            let Some(current) = record.current.clone() else {
                continue;
            };
            match &record.baseline {
                None => {
                    patches.insert(cid, current.clone());
                }
                Some(baseline) => {
                    let patch = diff(baseline, &current);
                    if !patch.is_empty() {
                        patches.insert(cid, patch);
                    }
                }
            }
            record.baseline = Some(current);
        }
        patches
    }

    /// Undo a failed cycle: state and renders go back to the last
    /// committed ones. Components mounted during it are dropped; their cids
    /// are not reused.
    pub fn rollback(&mut self) {
        for (cid, instance) in std::mem::take(&mut self.saved) {
            if let Some(record) = self.records.get_mut(&cid) {
                record.instance = instance;
            }
        }
        for cid in std::mem::take(&mut self.rendered) {
            if let Some(record) = self.records.get_mut(&cid) {
                record.current = record.baseline.clone();
            }
        }
        let before = self.records.len();
        self.records.retain(|_, record| record.baseline.is_some());
        if self.records.len() != before {
            let records = &self.records;
            self.by_key.retain(|_, cid| records.contains_key(cid));
            debug!("Dropped {} components mounted in a failed cycle", before - self.records.len());
        }
        self.depth = 0;
    }

    /// Keys of every live component, in cid order.
    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = (Cid, &ComponentKey)> {
        self.records.iter().map(|(cid, record)| (*cid, &record.key))
    }
}

/// Replace every component reference in `template` with a placeholder
/// (stateful) or its inlined render (stateless).
pub(crate) fn resolve<'a>(
    template: Template,
    registry: &'a mut ComponentRegistry,
    socket: &'a mut ComponentSocket,
) -> BoxFuture<'a, Result<Template, LiveError>> {
    Box::pin(async move {
        let (statics, dynamics) = template.into_parts();
        let mut resolved = Vec::with_capacity(dynamics.len());
        for value in dynamics {
            resolved.push(resolve_dynamic(value, registry, socket).await?);
        }
        Ok(Template::new(statics, resolved))
    })
}

fn resolve_dynamic<'a>(
    value: Dynamic,
    registry: &'a mut ComponentRegistry,
    socket: &'a mut ComponentSocket,
) -> BoxFuture<'a, Result<Dynamic, LiveError>> {
    Box::pin(async move {
        match value {
            Dynamic::Template(template) => Ok(Dynamic::Template(resolve(template, registry, socket).await?)),
            Dynamic::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_dynamic(item, registry, socket).await?);
                }
                Ok(Dynamic::List(resolved))
            }
            Dynamic::Component(reference) => registry.resolve_component(reference, socket).await,
            other => Ok(other),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::html;

    struct Counter;

    #[async_trait]
    impl LiveComponent for Counter {
        type Context = i64;
        type Props = i64;

        async fn mount(&self, _socket: &mut ComponentSocket) -> CallbackResult<i64> {
            Ok(0)
        }

        async fn update(&self, start: i64, ctx: &mut i64, _socket: &mut ComponentSocket) -> CallbackResult<()> {
            if *ctx == 0 {
                *ctx = start;
            }
            Ok(())
        }

        fn render(&self, ctx: &i64) -> Template {
            html!("<b>{}</b>", *ctx)
        }

        async fn handle_event(&self, event: Event, ctx: &mut i64, socket: &mut ComponentSocket) -> CallbackResult<()> {
            match event.name.as_str() {
                "inc" => *ctx += 1,
                "boom" => {
                    *ctx += 100;
                    return Err("boom".into());
                }
                _ => {}
            }
            socket.push_event("counted", json!({"n": *ctx}));
            Ok(())
        }
    }

    /// Shows its props; rejects negative ones after taking them.
    struct Gauge;

    #[async_trait]
    impl LiveComponent for Gauge {
        type Context = i64;
        type Props = i64;

        async fn mount(&self, _socket: &mut ComponentSocket) -> CallbackResult<i64> {
            Ok(0)
        }

        async fn update(&self, level: i64, ctx: &mut i64, _socket: &mut ComponentSocket) -> CallbackResult<()> {
            *ctx = level;
            if level < 0 {
                return Err("negative level".into());
            }
            Ok(())
        }

        fn render(&self, ctx: &i64) -> Template {
            html!("<meter>{}</meter>", *ctx)
        }
    }

    fn gauges(g: i64, h: i64) -> Template {
        html!(
            "{}{}",
            live_component_with_id(Gauge, "g", g),
            live_component_with_id(Gauge, "h", h)
        )
    }

    /// Wraps a counter; exercises nesting.
    struct Panel;

    #[async_trait]
    impl LiveComponent for Panel {
        type Context = ();
        type Props = &'static str;

        async fn mount(&self, _socket: &mut ComponentSocket) -> CallbackResult<()> {
            Ok(())
        }

        async fn update(&self, _props: &'static str, _ctx: &mut (), _socket: &mut ComponentSocket) -> CallbackResult<()> {
            Ok(())
        }

        fn render(&self, _ctx: &()) -> Template {
            html!("<section>{}</section>", live_component_with_id(Counter, "inner", 5))
        }
    }

    async fn render(registry: &mut ComponentRegistry, template: Template) -> Parts {
        let mut socket = ComponentSocket::default();
        resolve(template, registry, &mut socket).await.unwrap().to_parts()
    }

    #[tokio::test]
    async fn test_same_key_same_handle() {
        let mut registry = ComponentRegistry::default();
        let first = render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 1))).await;
        registry.take_patches();
        let second = render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 9))).await;

        assert_eq!(first.get(0), second.get(0));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.cid_of(&ComponentKey::of::<Counter>("a")), Some(1));
    }

    #[tokio::test]
    async fn test_distinct_keys_distinct_handles() {
        let mut registry = ComponentRegistry::default();
        let parts = render(
            &mut registry,
            html!(
                "{}{}",
                live_component_with_id(Counter, "a", 1),
                live_component_with_id(Counter, "b", 2)
            ),
        )
        .await;

        assert_eq!(serde_json::to_value(&parts).unwrap(), json!({"0": 1, "1": 2, "s": ["", "", ""]}));
        let patches = registry.take_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[&1].get(0), Some(&tessera_core::Part::from("1")));
        assert_eq!(patches[&2].get(0), Some(&tessera_core::Part::from("2")));
    }

    #[tokio::test]
    async fn test_stateless_component_is_inlined() {
        let mut registry = ComponentRegistry::default();
        let parts = render(&mut registry, html!("<div>{}</div>", live_component(Counter, 4))).await;

        assert_eq!(
            serde_json::to_value(&parts).unwrap(),
            json!({"0": {"0": "4", "s": ["<b>", "</b>"]}, "s": ["<div>", "</div>"]})
        );
        assert_eq!(registry.len(), 0);
        assert!(registry.take_patches().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_component_not_patched() {
        let mut registry = ComponentRegistry::default();
        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 1))).await;
        assert_eq!(registry.take_patches().len(), 1);

        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 1))).await;
        assert!(registry.take_patches().is_empty());
    }

    #[tokio::test]
    async fn test_event_patches_only_target() {
        let mut registry = ComponentRegistry::default();
        render(
            &mut registry,
            html!(
                "{}{}",
                live_component_with_id(Counter, "a", 1),
                live_component_with_id(Counter, "b", 1)
            ),
        )
        .await;
        registry.take_patches();

        let mut socket = ComponentSocket::default();
        registry.handle_event(2, Event::new("inc", json!({})), &mut socket).await.unwrap();
        let patches = registry.take_patches();

        assert_eq!(patches.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(serde_json::to_value(&patches[&2]).unwrap(), json!({"0": "2"}));
        assert_eq!(socket.events.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let mut registry = ComponentRegistry::default();
        let mut socket = ComponentSocket::default();
        let err = registry.handle_event(42, Event::new("inc", json!({})), &mut socket).await;
        assert!(matches!(err, Err(LiveError::UnknownComponent(42))));
    }

    #[tokio::test]
    async fn test_failed_event_rolls_back() {
        let mut registry = ComponentRegistry::default();
        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 3))).await;
        registry.take_patches();

        let mut socket = ComponentSocket::default();
        let err = registry.handle_event(1, Event::new("boom", json!({})), &mut socket).await;
        assert!(err.as_ref().is_err_and(LiveError::is_callback));
        registry.rollback();
        assert!(registry.take_patches().is_empty());
        assert!(registry.contains(1));

        // the state the failed handler touched is gone too
        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 3))).await;
        assert!(registry.take_patches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_restores_every_component() {
        let mut registry = ComponentRegistry::default();
        render(&mut registry, gauges(1, 2)).await;
        registry.take_patches();

        let mut socket = ComponentSocket::default();
        let err = resolve(gauges(5, -1), &mut registry, &mut socket).await;
        assert!(err.is_err_and(|e| e.is_callback()));
        registry.rollback();

        render(&mut registry, gauges(1, 2)).await;
        assert!(registry.take_patches().is_empty());

        render(&mut registry, gauges(4, 2)).await;
        let patches = registry.take_patches();
        assert_eq!(serde_json::to_value(&patches).unwrap(), json!({"1": {"0": "4"}}));
    }

    #[tokio::test]
    async fn test_rollback_drops_fresh_mounts() {
        let mut registry = ComponentRegistry::default();
        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 1))).await;
        registry.rollback();

        assert_eq!(registry.len(), 0);
        render(&mut registry, html!("{}", live_component_with_id(Counter, "a", 1))).await;
        // handles are never reused
        assert_eq!(registry.cid_of(&ComponentKey::of::<Counter>("a")), Some(2));
    }

    #[tokio::test]
    async fn test_nested_components() {
        let mut registry = ComponentRegistry::default();
        let parts = render(&mut registry, html!("{}", live_component_with_id(Panel, "p", "x"))).await;
        assert_eq!(parts.get(0), Some(&tessera_core::Part::Cid(1)));

        let patches = registry.take_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[&1].get(0), Some(&tessera_core::Part::Cid(2)));
        assert_eq!(registry.keys().map(|(_, k)| k.id().to_string()).collect::<Vec<_>>(), vec!["p", "inner"]);
    }

    #[tokio::test]
    async fn test_components_in_lists() {
        let mut registry = ComponentRegistry::default();
        let items: Vec<Dynamic> = ["x", "y"]
            .iter()
            .map(|id| live_component_with_id(Counter, *id, 0))
            .collect();
        let parts = render(&mut registry, html!("<ul>{}</ul>", items)).await;
        assert_eq!(serde_json::to_value(&parts).unwrap()["0"], json!({"d": [[1], [2]]}));
    }
}
