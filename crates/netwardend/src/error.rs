use std::fmt;
use std::io;

/// Broad classification of an error, driving retry/propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Retried with backoff: kernel EAGAIN, lease negotiation timeout, carrier flap.
    Transient,
    /// Surfaced, not retried: malformed policy, unknown device type, bad address.
    Configuration,
    /// Surfaced: non-privileged caller.
    Authorization,
    /// Surfaced and backed off: out of file descriptors, netlink buffer full.
    ResourceExhaustion,
    /// Terminates the daemon.
    Fatal,
}

/// A stable, user-visible error name, as returned over RPC and written by
/// `check --write-dbus-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Name {
    UnresolvableHostname,
    UnreachableAddress,
    DeviceUnknown,
    PolicyInvalid,
    LeaseUnavailable,
    PermissionDenied,
    NotFound,
    Io,
    Other,
}

impl Name {
    pub fn as_str(self) -> &'static str {
        match self {
            Name::UnresolvableHostname => "UnresolvableHostname",
            Name::UnreachableAddress => "UnreachableAddress",
            Name::DeviceUnknown => "DeviceUnknown",
            Name::PolicyInvalid => "PolicyInvalid",
            Name::LeaseUnavailable => "LeaseUnavailable",
            Name::PermissionDenied => "PermissionDenied",
            Name::NotFound => "NotFound",
            Name::Io => "Io",
            Name::Other => "Other",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub kind: Kind,
    pub name: Name,
    message: String,
}

impl Error {
    pub fn new(kind: Kind, name: Name, message: impl Into<String>) -> Self {
        Error {
            kind,
            name,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::new(Kind::Transient, Name::Other, message)
    }

    pub fn configuration(name: Name, message: impl Into<String>) -> Self {
        Error::new(Kind::Configuration, name, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Error::new(Kind::Fatal, Name::Other, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(Kind::Configuration, Name::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == Kind::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Kind::Transient
            }
            io::ErrorKind::PermissionDenied => Kind::Authorization,
            io::ErrorKind::NotFound => Kind::Configuration,
            _ => Kind::Fatal,
        };
        let name = match e.kind() {
            io::ErrorKind::PermissionDenied => Name::PermissionDenied,
            io::ErrorKind::NotFound => Name::NotFound,
            _ => Name::Io,
        };
        Error::new(kind, name, e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::EAGAIN | nix::Error::EINTR => Kind::Transient,
            nix::Error::EMFILE | nix::Error::ENFILE | nix::Error::ENOBUFS => {
                Kind::ResourceExhaustion
            }
            nix::Error::EPERM | nix::Error::EACCES => Kind::Authorization,
            _ => Kind::Fatal,
        };
        Error::new(kind, Name::Io, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
