//! The handsfree audio agent object
//!
//! The agent is the callable object the telephony manager hands audio
//! connections to. Authorization and dispatch live in [`AgentCore`], which
//! knows nothing about the bus so the whole contract is testable without
//! one; [`HandsfreeAgent`] is the thin bus-facing shim that extracts the
//! sender from the message header and delegates.
//!
//! Only the bus peer that granted our registration is trusted. Every other
//! sender — including everyone, before a registration has ever succeeded —
//! is answered with `org.ofono.Error.NotAllowed`. A trusted sender gets
//! `org.ofono.Error.NotImplemented` from the default handoff: the real
//! SCO/codec handoff is an explicit extension point, not a silent success.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use zbus::message::Header;
use zbus::zvariant::{OwnedFd, OwnedObjectPath};

/// The document every Introspect query receives, regardless of state
pub const AGENT_INTROSPECTION_XML: &str = "\
<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"
 \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">
<node>
  <interface name=\"org.freedesktop.DBus.Introspectable\">
    <method name=\"Introspect\">
      <arg direction=\"out\" type=\"s\" />
    </method>
  </interface>
  <interface name=\"org.ofono.HandsfreeAudioAgent\">
    <method name=\"Release\">
    </method>
    <method name=\"NewConnection\">
      <arg direction=\"in\" type=\"o\" name=\"card_path\" />
      <arg direction=\"in\" type=\"h\" name=\"sco_fd\" />
      <arg direction=\"in\" type=\"y\" name=\"codec\" />
    </method>
  </interface>
</node>";

/// Faults the agent answers with, named under the manager's error prefix
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.ofono.Error")]
pub enum AgentError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NotAllowed(String),
    NotImplemented(String),
}

impl AgentError {
    fn not_allowed() -> Self {
        AgentError::NotAllowed("Operation is not allowed by this sender".to_string())
    }

    fn not_implemented() -> Self {
        AgentError::NotImplemented("Operation is not implemented".to_string())
    }
}

/// The bus identity allowed to call the agent
///
/// Recorded from the Register reply; cleared only by explicit teardown.
/// Shared between the backend (writer) and the agent (reader).
#[derive(Debug, Clone, Default)]
pub struct TrustedPeer(Arc<RwLock<Option<String>>>);

impl TrustedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: impl Into<String>) {
        let name = name.into();
        debug!(peer = %name, "trusted peer recorded");
        *self.0.write().expect("trusted-peer slot poisoned") = Some(name);
    }

    pub fn clear(&self) {
        *self.0.write().expect("trusted-peer slot poisoned") = None;
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().expect("trusted-peer slot poisoned").clone()
    }

    /// A sender matches only when an identity is recorded and equal;
    /// an unset slot trusts nobody
    pub fn matches(&self, sender: Option<&str>) -> bool {
        match (&*self.0.read().expect("trusted-peer slot poisoned"), sender) {
            (Some(trusted), Some(sender)) => trusted == sender,
            _ => false,
        }
    }
}

/// Extension point for the actual audio handoff
///
/// Swapping in a real implementation must not touch sender validation or
/// dispatch; only this trait.
pub trait ConnectionHandoff: Send + Sync {
    fn new_connection(
        &self,
        card_path: &OwnedObjectPath,
        sco_fd: OwnedFd,
        codec: u8,
    ) -> Result<(), AgentError>;
}

/// Default handoff: explicitly unimplemented
pub struct StubHandoff;

impl ConnectionHandoff for StubHandoff {
    fn new_connection(
        &self,
        card_path: &OwnedObjectPath,
        _sco_fd: OwnedFd,
        codec: u8,
    ) -> Result<(), AgentError> {
        warn!(card = %card_path, codec, "audio handoff not implemented");
        Err(AgentError::not_implemented())
    }
}

/// Authorization and dispatch for inbound agent calls, bus-independent
pub struct AgentCore {
    trusted: TrustedPeer,
    handoff: Box<dyn ConnectionHandoff>,
}

impl AgentCore {
    pub fn new(trusted: TrustedPeer) -> Self {
        Self::with_handoff(trusted, Box::new(StubHandoff))
    }

    pub fn with_handoff(trusted: TrustedPeer, handoff: Box<dyn ConnectionHandoff>) -> Self {
        Self { trusted, handoff }
    }

    fn authorize(&self, sender: Option<&str>) -> Result<(), AgentError> {
        if self.trusted.matches(sender) {
            Ok(())
        } else {
            warn!(sender = sender.unwrap_or("<none>"), "rejecting untrusted sender");
            Err(AgentError::not_allowed())
        }
    }

    pub fn new_connection(
        &self,
        sender: Option<&str>,
        card_path: &OwnedObjectPath,
        sco_fd: OwnedFd,
        codec: u8,
    ) -> Result<(), AgentError> {
        self.authorize(sender)?;
        debug!(card = %card_path, codec, "connection handoff offered");
        self.handoff.new_connection(card_path, sco_fd, codec)
    }

    pub fn release(&self, sender: Option<&str>) -> Result<(), AgentError> {
        self.authorize(sender)?;
        Err(AgentError::not_implemented())
    }

    /// Static capability document; identical regardless of prior state
    pub fn introspect(&self) -> &'static str {
        AGENT_INTROSPECTION_XML
    }
}

/// Bus-facing agent shim
pub struct HandsfreeAgent {
    core: AgentCore,
}

impl HandsfreeAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }
}

#[zbus::interface(name = "org.ofono.HandsfreeAudioAgent")]
impl HandsfreeAgent {
    fn new_connection(
        &self,
        #[zbus(header)] header: Header<'_>,
        card_path: OwnedObjectPath,
        sco_fd: OwnedFd,
        codec: u8,
    ) -> Result<(), AgentError> {
        let sender = header.sender().map(|s| s.as_str().to_owned());
        self.core
            .new_connection(sender.as_deref(), &card_path, sco_fd, codec)
    }

    fn release(&self, #[zbus(header)] header: Header<'_>) -> Result<(), AgentError> {
        let sender = header.sender().map(|s| s.as_str().to_owned());
        self.core.release(sender.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_fd() -> OwnedFd {
        let file = std::fs::File::open("/dev/null").expect("open /dev/null");
        OwnedFd::from(std::os::fd::OwnedFd::from(file))
    }

    fn card_path() -> OwnedObjectPath {
        OwnedObjectPath::try_from("/hfp/card0").unwrap()
    }

    #[test]
    fn nobody_is_trusted_before_registration() {
        let core = AgentCore::new(TrustedPeer::new());
        assert!(matches!(
            core.release(Some(":1.42")),
            Err(AgentError::NotAllowed(_))
        ));
        assert!(matches!(
            core.new_connection(Some(":1.42"), &card_path(), stub_fd(), 0x01),
            Err(AgentError::NotAllowed(_))
        ));
        assert!(matches!(
            core.release(None),
            Err(AgentError::NotAllowed(_))
        ));
    }

    #[test]
    fn only_the_granting_peer_is_trusted() {
        let trusted = TrustedPeer::new();
        let core = AgentCore::new(trusted.clone());
        trusted.record(":1.7");

        // wrong sender rejected
        assert!(matches!(
            core.new_connection(Some(":1.8"), &card_path(), stub_fd(), 0x01),
            Err(AgentError::NotAllowed(_))
        ));
        // right sender reaches the stub, which is explicit about itself
        assert!(matches!(
            core.new_connection(Some(":1.7"), &card_path(), stub_fd(), 0x01),
            Err(AgentError::NotImplemented(_))
        ));
        assert!(matches!(
            core.release(Some(":1.7")),
            Err(AgentError::NotImplemented(_))
        ));
    }

    #[test]
    fn clearing_the_peer_revokes_trust() {
        let trusted = TrustedPeer::new();
        let core = AgentCore::new(trusted.clone());
        trusted.record(":1.7");
        trusted.clear();
        assert!(matches!(
            core.release(Some(":1.7")),
            Err(AgentError::NotAllowed(_))
        ));
    }

    #[test]
    fn introspection_is_static() {
        let trusted = TrustedPeer::new();
        let core = AgentCore::new(trusted.clone());
        let before = core.introspect();
        trusted.record(":1.7");
        let _ = core.release(Some(":1.7"));
        trusted.clear();
        assert_eq!(before, core.introspect());
        assert!(before.contains("org.ofono.HandsfreeAudioAgent"));
        assert!(before.contains("NewConnection"));
    }

    #[test]
    fn custom_handoff_replaces_stub_only() {
        struct AcceptingHandoff;
        impl ConnectionHandoff for AcceptingHandoff {
            fn new_connection(
                &self,
                _card_path: &OwnedObjectPath,
                _sco_fd: OwnedFd,
                _codec: u8,
            ) -> Result<(), AgentError> {
                Ok(())
            }
        }
        let trusted = TrustedPeer::new();
        let core = AgentCore::with_handoff(trusted.clone(), Box::new(AcceptingHandoff));

        // authorization still applies in front of the handoff
        assert!(matches!(
            core.new_connection(Some(":1.9"), &card_path(), stub_fd(), 0x01),
            Err(AgentError::NotAllowed(_))
        ));
        trusted.record(":1.9");
        assert!(core
            .new_connection(Some(":1.9"), &card_path(), stub_fd(), 0x01)
            .is_ok());
    }
}
