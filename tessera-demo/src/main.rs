//! Tessera demo — a counter page served as a live view.
//!
//! Mounts `/counter` with a stateful stepper component and a clock driven by
//! a recurring timer. Bind address comes from `TESSERA_BIND`.

use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use tessera_core::{html, Template};
use tessera_live::{
    live_component_with_id, CallbackResult, ComponentSocket, Event, LiveComponent, LiveServer, LiveSocket, LiveView,
    Params, RenderMeta, Router, ServerConfig, Session,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CounterMsg {
    Tick,
    Step(i64),
}

#[derive(Debug, Clone, Default)]
struct Counter {
    count: i64,
    uptime: u64,
}

struct CounterView;

#[async_trait]
impl LiveView for CounterView {
    type Context = Counter;
    type Info = CounterMsg;

    async fn mount(&self, _params: &Params, _session: &Session, socket: &mut LiveSocket<'_, Self>) -> CallbackResult<Counter> {
        socket.page_title("Counter");
        socket.repeat(Duration::from_secs(1), &CounterMsg::Tick)?;
        Ok(Counter::default())
    }

    async fn handle_params(
        &self,
        params: &Params,
        _url: &str,
        counter: &mut Counter,
        _socket: &mut LiveSocket<'_, Self>,
    ) -> CallbackResult<()> {
        if let Some(start) = params.get("start").and_then(|v| v.as_str()) {
            counter.count = start.parse()?;
        }
        Ok(())
    }

    fn render(&self, counter: &Counter, meta: &RenderMeta<'_>) -> Template {
        html!(
            "<main><h1>{}</h1><button phx-click=\"inc\">+</button><button phx-click=\"dec\">-</button>{}{}{}<footer>up {}s</footer></main>",
            counter.count,
            live_component_with_id(Stepper, "small", 1),
            live_component_with_id(Stepper, "large", 10),
            meta.flash("info").map(|message| html!("<p class=\"flash\">{}</p>", message)),
            counter.uptime
        )
    }

    async fn handle_event(&self, event: Event, counter: &mut Counter, socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
        match event.name.as_str() {
            "inc" => counter.count += 1,
            "dec" => counter.count -= 1,
            "reset" => {
                counter.count = 0;
                socket.put_flash("info", "Counter reset");
            }
            other => log::debug!("Ignoring event {other}"),
        }
        Ok(())
    }

    async fn handle_info(&self, msg: CounterMsg, counter: &mut Counter, _socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
        match msg {
            CounterMsg::Tick => counter.uptime += 1,
            CounterMsg::Step(by) => counter.count += by,
        }
        Ok(())
    }
}

/// Button that adds a fixed step to the page's counter and remembers how
/// often it was pressed.
struct Stepper;

#[derive(Debug, Default, Clone)]
struct StepperState {
    step: i64,
    presses: u32,
}

#[async_trait]
impl LiveComponent for Stepper {
    type Context = StepperState;
    type Props = i64;

    async fn mount(&self, _socket: &mut ComponentSocket) -> CallbackResult<StepperState> {
        Ok(StepperState::default())
    }

    async fn update(&self, step: i64, state: &mut StepperState, _socket: &mut ComponentSocket) -> CallbackResult<()> {
        state.step = step;
        Ok(())
    }

    fn render(&self, state: &StepperState) -> Template {
        html!(
            "<button phx-click=\"step\">+{}</button><small>{} presses</small>",
            state.step,
            state.presses
        )
    }

    async fn handle_event(&self, _event: Event, state: &mut StepperState, socket: &mut ComponentSocket) -> CallbackResult<()> {
        state.presses += 1;
        socket.send_parent_info(&CounterMsg::Step(state.step))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: std::env::var("TESSERA_BIND").unwrap_or_else(|_| ServerConfig::default().bind_addr),
        ..ServerConfig::default()
    };
    info!("Starting Tessera demo on {}...", config.bind_addr);

    let router = Router::new().route("/counter", CounterView);
    LiveServer::new(config, router).run().await
}
