use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::TbusError;
use crate::message::Message;

struct OpenRequest {
    origin: String,
    response: oneshot::Sender<Message>,
}

/// Sync requests in flight through the broker, keyed by request token.
///
/// The first response for a token wins and removes the entry; any later
/// response for the same token is reported as unknown.
#[derive(Default)]
pub(crate) struct SyncRequests {
    open: Mutex<HashMap<String, OpenRequest>>,
}

impl SyncRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request. Fails if `token` is already open.
    pub fn open(&self, token: &str, origin: &str) -> Result<oneshot::Receiver<Message>, TbusError> {
        let mut open = self.lock();
        if open.contains_key(token) {
            return Err(TbusError::DuplicateToken {
                token: token.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        open.insert(
            token.to_string(),
            OpenRequest {
                origin: origin.to_string(),
                response: tx,
            },
        );
        Ok(rx)
    }

    /// Deliver the response for `token`. Returns the requesting node's name.
    pub fn complete(&self, token: &str, response: Message) -> Result<String, TbusError> {
        let request = self.lock().remove(token).ok_or_else(|| TbusError::UnknownToken {
            token: token.to_string(),
        })?;
        // The waiter may have timed out between removal and send.
        let _ = request.response.send(response);
        Ok(request.origin)
    }

    /// Forget a request without answering it.
    pub fn cancel(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Drop every open request; waiters observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let mut open = self.lock();
        let count = open.len();
        open.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenRequest>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_response_wins() {
        let requests = SyncRequests::new();
        let rx = requests.open("tok", "b").unwrap();

        let request = Message::new_sync("orders", "b", "ping", "tok");
        let first = Message::new_response(&request, "orders", "a", "first");
        let second = Message::new_response(&request, "orders", "c", "second");

        assert_eq!(requests.complete("tok", first).unwrap(), "b");
        assert!(matches!(
            requests.complete("tok", second),
            Err(TbusError::UnknownToken { .. })
        ));
        assert_eq!(rx.await.unwrap().payload_str(), "first");
        assert_eq!(requests.len(), 0);
    }

    #[test]
    fn duplicate_token_rejected_while_open() {
        let requests = SyncRequests::new();
        let _rx = requests.open("tok", "a").unwrap();
        assert!(matches!(
            requests.open("tok", "b"),
            Err(TbusError::DuplicateToken { .. })
        ));
        assert!(requests.cancel("tok"));
        assert!(requests.open("tok", "b").is_ok());
    }

    #[test]
    fn concurrent_duplicates_yield_one_success() {
        let requests = Arc::new(SyncRequests::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let requests = requests.clone();
                std::thread::spawn(move || requests.open("same", &format!("n{i}")).ok())
            })
            .collect();
        let receivers: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(receivers.len(), 1);
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_closes_waiters() {
        let requests = SyncRequests::new();
        let rx = requests.open("tok", "a").unwrap();
        assert_eq!(requests.fail_all(), 1);
        assert!(rx.await.is_err());
    }
}
