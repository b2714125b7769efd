//! The handsfree backend proper
//!
//! Owns the bus connection and everything hanging off it. Construction
//! acquires the system bus, installs a passive message filter, subscribes
//! to the manager's signals, serves the agent object, and fires one
//! asynchronous Register request; a failure at the first step means the
//! caller simply runs without handsfree support.
//!
//! Teardown is explicit and unconditional best-effort: outstanding calls
//! are drained first so no stale reply callback can fire, then Unregister
//! goes out (reply ignored) if we ever got registered, then filter,
//! matches, agent object and card registry are released.

use std::sync::{Arc, Mutex};

use futures::future::Abortable;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use zbus::fdo::DBusProxy;
use zbus::zvariant::ObjectPath;
use zbus::{Connection, MatchRule, MessageStream, OwnedMatchRule};

use crate::agent::{AgentCore, HandsfreeAgent, TrustedPeer};
use crate::cards::CardRegistry;
use crate::config::BackendConfig;
use crate::pending::PendingCalls;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to acquire bus connection: {0}")]
    Bus(#[source] zbus::Error),
    #[error("failed to subscribe to manager signals: {0}")]
    Subscriptions(#[source] zbus::Error),
    #[error("failed to serve agent object: {0}")]
    Agent(#[source] zbus::Error),
    #[error("invalid agent path in config: {0}")]
    Config(#[source] zbus::zvariant::Error),
}

/// The handsfree audio backend
///
/// An owned value with explicit construct/shutdown; whoever manages device
/// discovery holds it. There is no ambient global.
pub struct HfBackend {
    connection: Connection,
    config: BackendConfig,
    pending: Arc<PendingCalls>,
    trusted: TrustedPeer,
    cards: Arc<Mutex<CardRegistry>>,
    rules: Vec<OwnedMatchRule>,
    filter: JoinHandle<()>,
}

impl HfBackend {
    /// Connect to the system bus and bring the backend up
    ///
    /// An `Err` here is not fatal to the server: it means running without
    /// handsfree support. Nothing is left behind on failure.
    pub async fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let connection = Connection::system().await.map_err(BackendError::Bus)?;
        Self::with_connection(connection, config).await
    }

    /// Bring the backend up on an existing connection
    pub async fn with_connection(
        connection: Connection,
        config: BackendConfig,
    ) -> Result<Self, BackendError> {
        ObjectPath::try_from(config.agent_path.as_str()).map_err(BackendError::Config)?;

        let trusted = TrustedPeer::new();

        // Passive filter: observes every message, validates the sender and
        // always defers to the regular dispatch paths. Dynamic card
        // tracking would hook in here.
        let filter = tokio::spawn(passive_filter(
            MessageStream::from(&connection),
            trusted.clone(),
        ));

        let rules = match signal_rules(&config) {
            Ok(rules) => rules,
            Err(e) => {
                filter.abort();
                return Err(BackendError::Subscriptions(e));
            }
        };
        let dbus = match DBusProxy::new(&connection).await {
            Ok(proxy) => proxy,
            Err(e) => {
                filter.abort();
                return Err(BackendError::Subscriptions(e));
            }
        };
        for rule in &rules {
            if let Err(e) = dbus.add_match_rule(rule.clone().into()).await {
                filter.abort();
                return Err(BackendError::Subscriptions(e.into()));
            }
        }

        let core = AgentCore::new(trusted.clone());
        if let Err(e) = connection
            .object_server()
            .at(config.agent_path.as_str(), HandsfreeAgent::new(core))
            .await
        {
            for rule in &rules {
                let _ = dbus.remove_match_rule(rule.clone().into()).await;
            }
            filter.abort();
            return Err(BackendError::Agent(e));
        }

        let backend = Self {
            connection,
            config,
            pending: Arc::new(PendingCalls::new()),
            trusted,
            cards: Arc::new(Mutex::new(CardRegistry::new())),
            rules,
            filter,
        };
        backend.register();
        Ok(backend)
    }

    /// Send the asynchronous Register request, advertised codecs attached
    ///
    /// The reply callback records the granting peer as the trusted sender.
    /// A fault is logged and left alone: the backend keeps running but
    /// rejects all inbound calls until some future successful registration.
    /// There is no automatic retry.
    fn register(&self) {
        let (id, registration) = self.pending.track("Register");
        let connection = self.connection.clone();
        let config = self.config.clone();
        let trusted = self.trusted.clone();
        let pending = Arc::clone(&self.pending);

        let call = async move {
            let reply = match ObjectPath::try_from(config.agent_path.as_str()) {
                Ok(agent_path) => {
                    connection
                        .call_method(
                            Some(config.service.as_str()),
                            config.manager_path.as_str(),
                            Some(config.manager_interface.as_str()),
                            "Register",
                            &(agent_path, config.codecs.clone()),
                        )
                        .await
                }
                Err(e) => Err(zbus::Error::Variant(e)),
            };
            match reply {
                Ok(message) => match message.header().sender() {
                    Some(sender) => {
                        info!(peer = %sender, "registered as a handsfree audio agent");
                        trusted.record(sender.as_str());
                        // TODO: enumerate the manager's existing
                        // HandsfreeAudioCard objects now that it knows us
                    }
                    None => warn!("Register reply carried no sender, trust stays unset"),
                },
                Err(zbus::Error::MethodError(fault, text, _)) => {
                    error!(
                        fault = %fault,
                        message = text.as_deref().unwrap_or(""),
                        "failed to register as a handsfree audio agent"
                    );
                }
                Err(e) => {
                    error!(error = %e, "failed to register as a handsfree audio agent");
                }
            }
            // Contract: the reply path releases its own record.
            pending.complete(id);
        };
        tokio::spawn(async move {
            let _ = Abortable::new(call, registration).await;
        });
    }

    /// The unique bus name of the service that granted our registration
    pub fn trusted_peer(&self) -> Option<String> {
        self.trusted.get()
    }

    /// Outstanding asynchronous bus calls
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// The card registry (populated once card tracking lands)
    pub fn cards(&self) -> Arc<Mutex<CardRegistry>> {
        Arc::clone(&self.cards)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Tear the backend down
    ///
    /// Failures on this path are logged and swallowed; destruction always
    /// completes.
    pub async fn shutdown(self) {
        let outstanding = self.pending.drain();
        if outstanding > 0 {
            debug!(outstanding, "aborted outstanding bus calls");
        }

        if let Some(peer) = self.trusted.get() {
            self.unregister(&peer).await;
            self.trusted.clear();
        }

        match DBusProxy::new(&self.connection).await {
            Ok(dbus) => {
                for rule in &self.rules {
                    if let Err(e) = dbus.remove_match_rule(rule.clone().into()).await {
                        debug!(error = %e, "failed to remove signal match");
                    }
                }
            }
            Err(e) => debug!(error = %e, "failed to reach bus daemon during teardown"),
        }

        self.filter.abort();

        if let Err(e) = self
            .connection
            .object_server()
            .remove::<HandsfreeAgent, _>(self.config.agent_path.as_str())
            .await
        {
            debug!(error = %e, "failed to remove agent object");
        }

        self.cards.lock().expect("card registry poisoned").clear();
        info!("handsfree backend shut down");
    }

    /// Best-effort Unregister; the reply is not awaited
    async fn unregister(&self, peer: &str) {
        let agent_path = match ObjectPath::try_from(self.config.agent_path.as_str()) {
            Ok(path) => path,
            Err(_) => return,
        };
        let message = zbus::message::Message::method_call(
            self.config.manager_path.as_str(),
            "Unregister",
        )
        .and_then(|b| b.destination(peer))
        .and_then(|b| b.interface(self.config.manager_interface.as_str()))
        .and_then(|b| b.build(&(agent_path,)));
        match message {
            Ok(message) => {
                if let Err(e) = self.connection.send(&message).await {
                    debug!(error = %e, "unregister send failed");
                } else {
                    debug!(peer, "sent unregister");
                }
            }
            Err(e) => debug!(error = %e, "failed to build unregister message"),
        }
    }
}

/// The three signal patterns the backend listens for: manager name
/// ownership changes, card added, card removed
fn signal_rules(config: &BackendConfig) -> Result<Vec<OwnedMatchRule>, zbus::Error> {
    let owner_changed = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender("org.freedesktop.DBus")?
        .interface("org.freedesktop.DBus")?
        .member("NameOwnerChanged")?
        .arg(0, config.service.as_str())?
        .build();
    let card_added = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(config.service.as_str())?
        .interface(config.manager_interface.as_str())?
        .member("CardAdded")?
        .build();
    let card_removed = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(config.service.as_str())?
        .interface(config.manager_interface.as_str())?
        .member("CardRemoved")?
        .build();
    Ok(vec![
        owner_changed.into(),
        card_added.into(),
        card_removed.into(),
    ])
}

/// Watches every inbound message, checks the sender, and defers
///
/// Deliberately handles nothing: regular dispatch (the object server, the
/// signal matches) owns the messages. This is where dynamic card tracking
/// would live.
async fn passive_filter(mut stream: MessageStream, trusted: TrustedPeer) {
    while let Some(message) = stream.next().await {
        let Ok(message) = message else {
            continue;
        };
        let header = message.header();
        let sender = header.sender().map(|s| s.as_str());
        if !(trusted.matches(sender) || sender == Some("org.freedesktop.DBus")) {
            continue;
        }
        trace!(
            sender = sender.unwrap_or("<none>"),
            member = header.member().map(|m| m.as_str()).unwrap_or(""),
            "observed bus message"
        );
    }
}
