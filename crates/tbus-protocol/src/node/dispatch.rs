use std::sync::Arc;

use tokio::sync::mpsc;

use super::connection::BrokerConnection;
use super::{Handler, Node};
use crate::error::TbusError;
use crate::message::Message;
use crate::topics;

/// One inbound request or async message queued for the sequential worker.
pub(super) struct Inbound {
    connection: Arc<BrokerConnection>,
    message: Message,
}

impl Node {
    /// Route one frame read from a broker. Responses complete their waiter
    /// inline; everything else goes to a handler.
    pub(super) fn dispatch(&self, connection: &Arc<BrokerConnection>, message: Message) {
        if let Some(token) = message.sync_response_token() {
            let token = token.to_string();
            self.inner.metrics.sync_responses_received.inc();
            if !self.inner.pending.complete(&token, message) {
                tracing::warn!("response for unknown token {token}");
            }
            return;
        }

        match &self.inner.sequential {
            Some(queue) => {
                let inbound = Inbound {
                    connection: connection.clone(),
                    message,
                };
                if queue.send(inbound).is_err() {
                    tracing::warn!("handler queue of {} is closed", self.name());
                }
            }
            None => {
                let node = self.clone();
                let connection = connection.clone();
                tokio::spawn(async move { node.handle_inbound(&connection, message).await });
            }
        }
    }

    /// Handle queued messages one at a time, in arrival order.
    pub(super) async fn run_sequential(self, mut queue: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = queue.recv() => next,
            };
            let Some(Inbound { connection, message }) = next else {
                break;
            };
            self.handle_inbound(&connection, message).await;
        }
    }

    async fn handle_inbound(&self, connection: &BrokerConnection, message: Message) {
        if message.is_sync_request() {
            self.answer(connection, message).await;
        } else {
            self.consume(message).await;
        }
    }

    async fn answer(&self, connection: &BrokerConnection, request: Message) {
        self.inner.metrics.incoming_sync_requests.inc();
        let name = self.name();
        let response = match self.inner.handlers.get(request.topic()) {
            Some(Handler::Sync(handler)) => match handler.handle(self.clone(), request.clone()).await {
                Ok(payload) => Message::new_response(&request, request.topic(), name, payload),
                Err(e) => {
                    tracing::warn!("handler for {} failed: {e:#}", request.topic());
                    Message::new_response(&request, topics::ERROR, name, format!("{e:#}"))
                }
            },
            _ => {
                let e = TbusError::NoHandler {
                    topic: request.topic().to_string(),
                };
                tracing::warn!("request from {}: {e}", request.origin());
                Message::new_response(&request, topics::ERROR, name, e.to_string())
            }
        };

        match self.send_on(connection, &response).await {
            Ok(()) => self.inner.metrics.outgoing_sync_responses.inc(),
            Err(e) => tracing::warn!("response on {} not delivered: {e}", request.topic()),
        }
    }

    async fn consume(&self, message: Message) {
        self.inner.metrics.incoming_async_messages.inc();
        let topic = message.topic().to_string();
        match self.inner.handlers.get(&topic) {
            Some(Handler::Async(handler)) => {
                if let Err(e) = handler.handle(self.clone(), message).await {
                    tracing::warn!("async handler for {topic} failed: {e:#}");
                }
            }
            _ => tracing::warn!("no async handler for {topic}, dropping message"),
        }
    }
}
