use async_trait::async_trait;
use rsm_core::{Payload, Result};

use crate::session::SessionContext;

/// Server-side request processing.
///
/// Returning `Some` writes the payload back to the requesting peer; `None`
/// treats the request as fire-and-forget. An `Err` is logged and counted,
/// and the session keeps serving.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, session: &SessionContext, payload: Payload) -> Result<Option<Payload>>;
}

/// Replies with the request unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, _session: &SessionContext, payload: Payload) -> Result<Option<Payload>> {
        Ok(Some(payload))
    }
}

/// Adapts a synchronous closure
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&SessionContext, Payload) -> Result<Option<Payload>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&SessionContext, Payload) -> Result<Option<Payload>> + Send + Sync,
{
    async fn handle(&self, session: &SessionContext, payload: Payload) -> Result<Option<Payload>> {
        (self.f)(session, payload)
    }
}
