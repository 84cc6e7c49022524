//! Transport faults and their one-line normalisation.
//!
//! Adapters report failures as [`TransportFault`] values. A fault may wrap
//! other faults (a hostname resolving to several addresses that all refuse,
//! an error with a source chain); [`TransportFault::normalized`] flattens the
//! tree into a single `"; "`-delimited string, prefixing every entry that
//! carries a `code` with it.

use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub code: Option<String>,
    pub message: String,
    pub causes: Vec<TransportFault>,
}

impl TransportFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Several independent failures reported as one (e.g. every resolved
    /// address of a host refused the connection).
    pub fn aggregate(message: impl Into<String>, causes: Vec<TransportFault>) -> Self {
        Self {
            code: None,
            message: message.into(),
            causes,
        }
    }

    pub fn from_io(e: &io::Error) -> Self {
        Self {
            code: io_code(e.kind()).map(str::to_string),
            message: e.to_string(),
            causes: Vec::new(),
        }
    }

    /// Build a fault from an arbitrary error, keeping its source chain as
    /// nested causes.
    pub fn from_error(e: &(dyn Error + 'static)) -> Self {
        let mut fault = match e.downcast_ref::<io::Error>() {
            Some(io_err) => Self::from_io(io_err),
            None => Self::new(e.to_string()),
        };
        if let Some(source) = e.source() {
            fault.causes.push(Self::from_error(source));
        }
        fault
    }

    /// Flatten into one delimited line.
    pub fn normalized(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        self.collect(&mut parts);
        parts.dedup();
        parts.join("; ")
    }

    fn collect(&self, parts: &mut Vec<String>) {
        let message = self.message.trim();
        if !message.is_empty() {
            match &self.code {
                Some(code) if !message.starts_with(code.as_str()) => {
                    parts.push(format!("{code}: {message}"));
                }
                _ => parts.push(message.to_string()),
            }
        } else if let Some(code) = &self.code {
            parts.push(code.clone());
        }
        for cause in &self.causes {
            cause.collect(parts);
        }
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl From<io::Error> for TransportFault {
    fn from(e: io::Error) -> Self {
        Self::from_io(&e)
    }
}

/// POSIX-style code for the common socket/device failures.
fn io_code(kind: io::ErrorKind) -> Option<&'static str> {
    let code = match kind {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::AddrInUse => "EADDRINUSE",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::UnexpectedEof => "EOF",
        _ => return None,
    };
    Some(code)
}
