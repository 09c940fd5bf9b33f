// Server identity, remote paths and memoized per-server facts

pub mod capabilities;
pub mod server;
pub mod server_path;

pub use capabilities::{Capability, CapabilityValue, ServerCapabilities};
pub use server::{Charset, LogonType, PasvMode, Protocol, Server, ServerType};
pub use server_path::ServerPath;
