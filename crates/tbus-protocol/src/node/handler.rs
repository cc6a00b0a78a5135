use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::Node;
use crate::message::Message;

/// Answers sync requests for one topic. The returned bytes become the
/// response payload; an error becomes an `error` response.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle(&self, node: Node, message: Message) -> anyhow::Result<Vec<u8>>;
}

/// Consumes async messages for one topic. Errors are logged.
#[async_trait]
pub trait AsyncHandler: Send + Sync {
    async fn handle(&self, node: Node, message: Message) -> anyhow::Result<()>;
}

/// A registered handler, tagged by the kind of traffic it accepts.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<dyn SyncHandler>),
    Async(Arc<dyn AsyncHandler>),
}

impl Handler {
    /// Wrap an async closure as a sync-request handler.
    pub fn sync_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        Handler::Sync(Arc::new(SyncFn(f)))
    }

    /// Wrap an async closure as an async-message handler.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Handler::Async(Arc::new(AsyncFn(f)))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

struct SyncFn<F>(F);

#[async_trait]
impl<F, Fut> SyncHandler for SyncFn<F>
where
    F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, node: Node, message: Message) -> anyhow::Result<Vec<u8>> {
        (self.0)(node, message).await
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> AsyncHandler for AsyncFn<F>
where
    F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, node: Node, message: Message) -> anyhow::Result<()> {
        (self.0)(node, message).await
    }
}
