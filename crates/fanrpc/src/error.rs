//! Crate-level errors surfaced by the call pipeline.

use crate::discovery;
use crate::transport;

#[derive(Debug)]
pub enum Error {
    /// No local or remote endpoint serves this name.
    NoSuchEndpoint(String),
    /// The service exists but has no such method.
    MethodNotFound { service: String, method: String },
    /// The calling context was used before it was entered.
    ContextNotEntered,
    /// A service name was empty or had an empty segment.
    InvalidName(String),
    /// No binding is registered for the `transport` connection parameter.
    UnknownBinding(String),
    /// The runtime this object belongs to has been dropped.
    RuntimeGone,
    Discovery(discovery::Error),
    Transport(transport::Error),
    Lifecycle(fanvisor::Error),
    /// A local handler failed.
    Handler(anyhow::Error),
    Config(String),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchEndpoint(name) => write!(f, "No endpoint found for '{}'", name),
            Self::MethodNotFound { service, method } => {
                write!(f, "Service '{}' has no method '{}'", service, method)
            }
            Self::ContextNotEntered => write!(f, "Context must be entered before making calls"),
            Self::InvalidName(name) => write!(f, "Invalid service name: {:?}", name),
            Self::UnknownBinding(name) => write!(f, "No transport binding named '{}'", name),
            Self::RuntimeGone => write!(f, "Runtime has been dropped"),
            Self::Discovery(e) => write!(f, "Discovery error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Lifecycle(e) => write!(f, "Lifecycle error: {}", e),
            Self::Handler(e) => write!(f, "Handler failed: {:#}", e),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<discovery::Error> for Error {
    fn from(e: discovery::Error) -> Self {
        Self::Discovery(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<fanvisor::Error> for Error {
    fn from(e: fanvisor::Error) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
