//! Memoized tri-state facts about what a server supports.
//!
//! A capability starts out `Unknown`. It only becomes `No` after an explicit
//! probe failed (a rejected command, or a FEAT reply that did not list it).

use crate::core_server::server::Server;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Resume2GbBug,
    Resume4GbBug,
    SystCommand,
    FeatCommand,
    ClntCommand,
    Utf8Command,
    MlsdCommand,
    OptsMlstCommand,
    MfmtCommand,
    MdtmCommand,
    SizeCommand,
    ModeZSupport,
    TvfsSupport,
    ListHiddenSupport,
    RestStream,
    EpsvCommand,
    AuthTlsCommand,
    AuthSslCommand,
    PretCommand,
    TimezoneOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityValue {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    value: CapabilityValue,
    text: Option<String>,
    number: Option<i64>,
}

#[derive(Debug, Default)]
pub struct ServerCapabilities {
    servers: HashMap<Server, HashMap<Capability, Entry>>,
}

impl ServerCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, server: &Server, capability: Capability) -> Option<&Entry> {
        self.servers.get(server)?.get(&capability)
    }

    pub fn get(&self, server: &Server, capability: Capability) -> CapabilityValue {
        self.entry(server, capability)
            .map(|e| e.value)
            .unwrap_or_default()
    }

    pub fn get_text(&self, server: &Server, capability: Capability) -> (CapabilityValue, Option<String>) {
        match self.entry(server, capability) {
            Some(e) => (e.value, e.text.clone()),
            None => (CapabilityValue::Unknown, None),
        }
    }

    pub fn get_number(&self, server: &Server, capability: Capability) -> (CapabilityValue, Option<i64>) {
        match self.entry(server, capability) {
            Some(e) => (e.value, e.number),
            None => (CapabilityValue::Unknown, None),
        }
    }

    pub fn set(&mut self, server: &Server, capability: Capability, value: CapabilityValue) {
        let entry = self
            .servers
            .entry(server.clone())
            .or_default()
            .entry(capability)
            .or_default();
        entry.value = value;
        if value != CapabilityValue::Yes {
            entry.text = None;
            entry.number = None;
        }
    }

    pub fn set_text(&mut self, server: &Server, capability: Capability, value: CapabilityValue, text: &str) {
        self.set(server, capability, value);
        if let Some(entry) = self.servers.get_mut(server).and_then(|m| m.get_mut(&capability)) {
            entry.text = Some(text.to_string());
        }
    }

    pub fn set_number(&mut self, server: &Server, capability: Capability, value: CapabilityValue, number: i64) {
        self.set(server, capability, value);
        if let Some(entry) = self.servers.get_mut(server).and_then(|m| m.get_mut(&capability)) {
            entry.number = Some(number);
        }
    }

    /// Marks every listed capability that is still `Unknown` as `No`.
    pub fn conclude_unknown(&mut self, server: &Server, capabilities: &[Capability]) {
        for &capability in capabilities {
            if self.get(server, capability) == CapabilityValue::Unknown {
                self.set(server, capability, CapabilityValue::No);
            }
        }
    }
}
