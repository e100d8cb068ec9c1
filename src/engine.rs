use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{self, Config},
    mode::PresentationMode,
    server::{CodeServer, ServerState},
    store::SecretStore,
    sync::{CodeView, EntryId, Refresh, ViewSnapshot},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Periodic timer, typically once a second while the menu is open.
    Tick,
    /// The user picked an entry in the list.
    EntryActivated(EntryId),
    ToggleMode,
    /// A secret was added to the store behind the engine's back.
    SecretAdded,
    /// The user typed a new port.
    PortChanged(String),
    RestartServer,
    StopServer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The list changed and should be redrawn.
    Refreshed(Refresh),
    CopyToClipboard(String),
    EntryRemoved(String),
    ModeChanged(PresentationMode),
    /// A message for the user.
    Notice(String),
    ConfigRejected(String),
    ServerStarted(SocketAddr),
    ServerStopped,
    ServerFailed(String),
}

pub struct Engine {
    view: Arc<CodeView>,
    server: CodeServer,
    config: Config,
}

impl Engine {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>, config: Config) -> Self {
        let view = Arc::new(CodeView::new(store, clock));
        let server = CodeServer::new(view.clone());

        Self {
            view,
            server,
            config,
        }
    }

    /// First render, plus the server when `auto_start` is set.
    pub fn startup(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(refresh) = self.view.poll() {
            effects.push(Effect::Refreshed(refresh));
        }
        if self.config.server.auto_start {
            effects.push(self.restart_server());
        }

        effects
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        debug!(?event, "handling event");

        match event {
            Event::Tick => self
                .view
                .poll()
                .map(Effect::Refreshed)
                .into_iter()
                .collect(),
            Event::EntryActivated(id) => self.activate(id),
            Event::ToggleMode => {
                let switch = self.view.toggle_mode();
                info!(mode = %switch.mode, "presentation mode changed");

                let mut effects = vec![Effect::ModeChanged(switch.mode)];
                if let Some(notice) = switch.notice {
                    effects.push(Effect::Notice(notice.to_string()));
                }
                effects
            }
            Event::SecretAdded => {
                self.view.invalidate();
                Vec::new()
            }
            Event::PortChanged(input) => match config::parse_port(&input) {
                Ok(port) => {
                    self.config.server.port = port;
                    vec![self.restart_server()]
                }
                Err(e) => {
                    warn!(input = %input, "rejected port: {e}");
                    vec![Effect::ConfigRejected(e.to_string())]
                }
            },
            Event::RestartServer => vec![self.restart_server()],
            Event::StopServer => {
                if self.server.state() == ServerState::Stopped {
                    return Vec::new();
                }
                self.server.stop();
                vec![Effect::ServerStopped]
            }
        }
    }

    fn activate(&mut self, id: EntryId) -> Vec<Effect> {
        let Some(entry) = self.view.resolve(id) else {
            debug!(%id, "activated entry no longer exists");
            return Vec::new();
        };

        match self.view.mode() {
            PresentationMode::Copy => match entry.code {
                Ok(code) => vec![Effect::CopyToClipboard(code.to_string())],
                Err(e) => vec![Effect::Notice(format!("{}: {e}", entry.label))],
            },
            PresentationMode::Delete => match self.view.store().remove(&entry.label) {
                Ok(()) => {
                    info!(label = %entry.label, "secret deleted");
                    self.view.invalidate();

                    let mut effects = vec![Effect::EntryRemoved(entry.label)];
                    if let Some(refresh) = self.view.poll() {
                        effects.push(Effect::Refreshed(refresh));
                    }
                    effects
                }
                Err(e) => vec![Effect::Notice(e.to_string())],
            },
        }
    }

    fn restart_server(&mut self) -> Effect {
        let port = self.config.server.port;

        match self.server.start(port) {
            Ok(addr) => Effect::ServerStarted(addr),
            Err(e) => Effect::ServerFailed(e.to_string()),
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.view.snapshot()
    }

    pub fn view(&self) -> &Arc<CodeView> {
        &self.view
    }

    pub fn mode(&self) -> PresentationMode {
        self.view.mode()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_state(&self) -> ServerState {
        self.server.state()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.addr()
    }

    /// Address shown in the menu for opening the endpoint in a browser.
    pub fn server_url(&self) -> String {
        self.config.server.url()
    }

    /// The countdown line above the list.
    pub fn expiry_text(&self) -> String {
        format!("Expires in {}s", self.view.window().seconds_remaining)
    }
}
