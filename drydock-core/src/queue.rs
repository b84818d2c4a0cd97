//! Write queue between request handlers and the single writer.
//!
//! Each element carries a request context, the transformers to apply,
//! and a single-use result channel. The writer drains ready elements
//! into one batch so concurrent submissions coalesce into one push.

use crate::transform::{Actor, Transformer};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of the element channel.
const QUEUE_CAPACITY: usize = 128;

/// Per-request context: who is acting, and when to give up.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub author: Actor,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(author: Actor) -> Self {
        Self {
            author,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(author: Actor, cancellation: CancellationToken) -> Self {
        Self {
            author,
            cancellation,
        }
    }
}

/// A queued transformer batch with its result channel.
pub(crate) struct Element {
    pub ctx: RequestContext,
    pub transformers: Vec<Arc<dyn Transformer>>,
    pub result: oneshot::Sender<crate::Result<()>>,
}

/// Sending half of the write queue.
#[derive(Clone)]
pub(crate) struct WriteQueue {
    tx: mpsc::Sender<Element>,
}

impl WriteQueue {
    pub fn new() -> (Self, mpsc::Receiver<Element>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Enqueue a batch; the returned receiver resolves once the writer
    /// has pushed the batch or failed it.
    pub async fn add(
        &self,
        ctx: RequestContext,
        transformers: Vec<Arc<dyn Transformer>>,
    ) -> oneshot::Receiver<crate::Result<()>> {
        let (result, rx) = oneshot::channel();
        let element = Element {
            ctx,
            transformers,
            result,
        };
        if let Err(mpsc::error::SendError(element)) = self.tx.send(element).await {
            let _ = element
                .result
                .send(Err(crate::Error::Internal("writer has stopped".to_string())));
        }
        rx
    }
}
