//! Message handler abstraction.
//!
//! Several handlers may share one topic. Each checks the envelope `type` first
//! and returns immediately when the message is not for it; [`Typed`] packages that
//! check together with the body decode.

use std::marker::PhantomData;

use async_trait::async_trait;

use atlas_core::{Classified, ErrorKind, OperationContext};

use crate::buffer::MessageBuffer;
use crate::envelope::{Envelope, MessageBody, RawEnvelope};

/// What the consumer runtime should do with the handler afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep the handler registered.
    Continue,
    /// Remove the handler (one-shot handlers).
    Unregister,
}

/// Failure of one handler invocation, classified for logging and redelivery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Only transient failures are worth another delivery.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl<E> From<E> for HandlerError
where
    E: Classified + core::fmt::Display,
{
    fn from(value: E) -> Self {
        Self::new(value.kind(), value.to_string())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &RawEnvelope,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Handler over a decoded body sum type.
#[async_trait]
pub trait TypedHandler<B: MessageBody>: Send + Sync {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: Envelope<B>,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Adapts a [`TypedHandler`] to the raw [`Handler`] interface.
pub struct Typed<B, H> {
    name: String,
    inner: H,
    _body: PhantomData<fn() -> B>,
}

impl<B, H> Typed<B, H>
where
    B: MessageBody,
    H: TypedHandler<B>,
{
    pub fn new(name: impl Into<String>, inner: H) -> Self {
        Self {
            name: name.into(),
            inner,
            _body: PhantomData,
        }
    }
}

#[async_trait]
impl<B, H> Handler for Typed<B, H>
where
    B: MessageBody,
    H: TypedHandler<B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &RawEnvelope,
        buffer: &mut MessageBuffer,
    ) -> Result<HandlerOutcome, HandlerError> {
        if !envelope.is::<B>() {
            return Ok(HandlerOutcome::Continue);
        }
        let typed = envelope.decode::<B>()?;
        self.inner.handle(ctx, typed, buffer).await
    }
}
