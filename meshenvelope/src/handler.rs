//! Typed command dispatch.
//!
//! Commands stay string-indexed on the wire, but handlers are trait
//! objects behind a registry rather than bare callables: unknown commands
//! fall through to an optional fallback, and every dispatch produces a
//! response or error envelope for the caller.

use std::collections::HashMap;

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::error::{EnvelopeError, Result};

/// A command implementation on the gateway side.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, request: &Envelope) -> Result<Bytes>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Envelope) -> Result<Bytes> + Send + Sync,
{
    fn handle(&self, request: &Envelope) -> Result<Bytes> {
        self(request)
    }
}

/// Registry mapping command names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
    fallback: Option<Box<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Box<dyn CommandHandler>) {
        self.handlers.insert(command.into(), handler);
    }

    /// Handler invoked for commands with no registered handler.
    pub fn set_fallback(&mut self, handler: Box<dyn CommandHandler>) {
        self.fallback = Some(handler);
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Run the handler for a request and wrap the outcome as a response
    /// or error envelope, correlated by the request id.
    pub fn dispatch(&self, request: &Envelope) -> Envelope {
        let handler = self
            .handlers
            .get(&request.command)
            .or(self.fallback.as_ref());
        match handler {
            Some(handler) => match handler.handle(request) {
                Ok(data) => Envelope::response(request, data),
                Err(err) => {
                    tracing::warn!(command = %request.command, %err, "handler failed");
                    Envelope::error_reply(request, err.to_string())
                }
            },
            None => {
                let err = EnvelopeError::UnknownCommand(request.command.clone());
                Envelope::error_reply(request, err.to_string())
            }
        }
    }
}
