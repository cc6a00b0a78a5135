use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::TbusError;
use crate::message::Message;

type Table = HashMap<String, oneshot::Sender<Message>>;

/// Sync requests this node is waiting on, keyed by request token.
#[derive(Clone, Default)]
pub(crate) struct PendingResponses {
    table: Arc<Mutex<Table>>,
}

/// One registered wait. Dropping it deregisters the token, so every exit
/// path of a sync call cleans up after itself.
pub(crate) struct PendingResponse {
    token: String,
    receiver: oneshot::Receiver<Message>,
    table: Arc<Mutex<Table>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: &str) -> Result<PendingResponse, TbusError> {
        let mut table = lock(&self.table);
        if table.contains_key(token) {
            return Err(TbusError::DuplicateToken {
                token: token.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        table.insert(token.to_string(), tx);
        Ok(PendingResponse {
            token: token.to_string(),
            receiver: rx,
            table: self.table.clone(),
        })
    }

    /// Hand `response` to its waiter. `false` if nobody waits on `token`.
    pub fn complete(&self, token: &str, response: Message) -> bool {
        match lock(&self.table).remove(token) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Wake every waiter with a closed channel.
    pub fn clear(&self) {
        lock(&self.table).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }
}

impl PendingResponse {
    /// Wait for the response. Errors with [`TbusError::Shutdown`] if the
    /// table was cleared.
    pub async fn wait(&mut self) -> Result<Message, TbusError> {
        (&mut self.receiver).await.map_err(|_| TbusError::Shutdown)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.token);
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}
