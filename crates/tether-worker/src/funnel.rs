//! Structured failure reports for the parent.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tether_frame::Envelope;
use tracing::debug;

use crate::channel::{MessageChannel, SendCompletion};
use crate::error::ValidationError;

/// The `{name, message, stack}` triple the parent expects in an `error`
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl ErrorReport {
    pub fn new(
        name: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Build a report from an error value.
    ///
    /// `name` is the error's type name without its module path. `stack` lists
    /// the error followed by its `source()` chain, one cause per line.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let name = short_type_name::<E>();
        let message = err.to_string();
        let mut stack = format!("{name}: {message}");
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = write!(stack, "\n    caused by: {cause}");
            source = cause.source();
        }
        Self {
            name,
            message,
            stack,
        }
    }

    /// Build a report from a panic payload. `context` names what was running.
    pub fn from_panic(payload: &(dyn Any + Send), context: &str) -> Self {
        let message = panic_message(payload);
        let mut stack = format!("Panic: {message}\n    in {context}");
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            let _ = write!(stack, "\n{backtrace}");
        }
        Self {
            name: "Panic".to_string(),
            message,
            stack,
        }
    }

    /// A report must carry a non-blank name and message.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() || self.message.trim().is_empty() {
            return Err(ValidationError::ErrorReport);
        }
        Ok(())
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(&self.name, &self.message, &self.stack)
    }
}

fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    if full.starts_with("dyn ") {
        return "Error".to_string();
    }
    let base = full.split('<').next().unwrap_or(full);
    match base.rsplit("::").next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "Error".to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::new()
    };
    if message.trim().is_empty() {
        "explicit panic".to_string()
    } else {
        message
    }
}

/// Forwards failure reports to the parent over the shared channel.
#[derive(Debug, Clone)]
pub struct ExceptionFunnel {
    channel: MessageChannel,
}

impl ExceptionFunnel {
    pub fn new(channel: MessageChannel) -> Self {
        Self { channel }
    }

    /// Send `report` as an `error` envelope. An invalid report is rejected
    /// locally and nothing is sent.
    pub fn report_error(&self, report: &ErrorReport) -> SendCompletion {
        if let Err(err) = report.validate() {
            debug!(error = %err, "error report rejected");
            return SendCompletion::failed(err);
        }
        self.channel.send(report.to_envelope())
    }
}
