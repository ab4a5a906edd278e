use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use super::response::Response;

/// Continuation that delivers the response of one invocation.
///
/// Cloneable so a transport can move it into a spawned task; the first
/// `respond` wins and every later one is dropped with a warning.
#[derive(Debug, Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

#[derive(Debug)]
struct ResponderInner {
    invocation_id: u64,
    tx: Mutex<Option<oneshot::Sender<Response>>>,
}

impl Responder {
    /// Creates a responder and the receiver its response arrives on.
    #[must_use]
    pub fn channel(invocation_id: u64) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            inner: Arc::new(ResponderInner {
                invocation_id,
                tx: Mutex::new(Some(tx)),
            }),
        };
        (responder, rx)
    }

    /// Delivers `response`. Returns `false` if a response was already delivered.
    pub fn respond(&self, response: Response) -> bool {
        let Some(tx) = self.inner.tx.lock().take() else {
            warn!(
                invocation_id = self.inner.invocation_id,
                status = response.status(),
                "response already delivered, dropping"
            );
            return false;
        };
        // The caller may have gone away (timeout); delivery still counts.
        let _ = tx.send(response);
        true
    }

    #[must_use]
    pub fn is_responded(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    #[must_use]
    pub fn invocation_id(&self) -> u64 {
        self.inner.invocation_id
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::invocation::InvocationError;

    #[tokio::test]
    async fn first_response_wins() {
        let (responder, rx) = Responder::channel(7);
        let clone = responder.clone();

        assert!(responder.respond(Response::ok(json!(1))));
        assert!(!clone.respond(Response::fail(InvocationError::Overloaded)));
        assert!(clone.is_responded());

        let resp = rx.await.unwrap();
        assert_eq!(resp.into_result().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn dropping_all_clones_closes_the_channel() {
        let (responder, rx) = Responder::channel(1);
        let clone = responder.clone();
        drop(responder);
        drop(clone);
        assert!(rx.await.is_err());
    }

    #[test]
    fn respond_after_receiver_dropped_still_counts() {
        let (responder, rx) = Responder::channel(3);
        drop(rx);
        assert!(responder.respond(Response::ok(json!(null))));
        assert!(responder.is_responded());
        assert_eq!(responder.invocation_id(), 3);
    }
}
