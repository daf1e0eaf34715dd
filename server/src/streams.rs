//! Pending-stream bookkeeping for streaming executions.
//!
//! Each streaming execute allocates a bounded event queue keyed by
//! `(session_id, exec_id)`. The execution runs on its own task and produces
//! `output` events through the kernel's output callback, then exactly one
//! `result` and one `done` event. The queue entry lingers for a short grace
//! period after `done` so a client re-connecting on the same key still gets
//! a definite answer, then it is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crucible_core::OutputCallback;
use crucible_core::SessionRegistry;
use crucible_protocol::ExecutionResult;
use crucible_protocol::OutputEvent;
use crucible_protocol::stream_path;

/// Bound on queued events per execution. The producer drops events once the
/// consumer is gone; it never blocks the execution indefinitely.
const QUEUE_CAPACITY: usize = 256;

/// How long a finished stream stays addressable after `done`.
const DONE_GRACE: Duration = Duration::from_secs(5);

pub enum StreamEvent {
    Output(OutputEvent),
    Result(Box<ExecutionResult>),
    Done,
}

struct StreamEntry {
    receiver: Option<mpsc::Receiver<StreamEvent>>,
}

/// Process-local map of in-flight execution streams, owned by the API.
#[derive(Default)]
pub struct StreamRegistry {
    pending: Mutex<HashMap<(String, String), StreamEntry>>,
}

impl StreamRegistry {
    /// Starts a streaming execution and returns its stream URL. The
    /// execution itself is detached; its lifecycle is observable only
    /// through the event queue.
    pub fn begin(
        self: &Arc<Self>,
        registry: Arc<SessionRegistry>,
        session_id: String,
        exec_id: String,
        code: String,
    ) -> String {
        let key = (session_id.clone(), exec_id.clone());
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), StreamEntry { receiver: Some(rx) });

        let streams = self.clone();
        let url = stream_path(&session_id, &exec_id);
        tokio::spawn(async move {
            let output_tx = tx.clone();
            let on_output: Arc<OutputCallback> = Arc::new(move |stream, text: &str| {
                // Called from the kernel thread; the queue being full or
                // closed must never stall the execution.
                let _ = output_tx.try_send(StreamEvent::Output(OutputEvent {
                    stream,
                    text: text.to_string(),
                }));
            });

            let result = match registry
                .execute(&session_id, &exec_id, &code, Some(on_output))
                .await
            {
                Ok(result) => result,
                Err(err) => ExecutionResult::failure(&exec_id, &code, err.to_string()),
            };

            // A consumer that connected will drain these; if none ever
            // does and the queue is saturated, give up after the send
            // deadline rather than leaking the task.
            let deadline = Duration::from_secs(300);
            let _ = tokio::time::timeout(
                deadline,
                tx.send(StreamEvent::Result(Box::new(result))),
            )
            .await;
            let _ = tokio::time::timeout(deadline, tx.send(StreamEvent::Done)).await;

            tokio::time::sleep(DONE_GRACE).await;
            streams
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            debug!("discarded stream state for {}/{}", key.0, key.1);
        });
        url
    }

    /// Hands the queue's consumer end to the SSE response. Each queue has
    /// exactly one consumer; a second take on the same key behaves like an
    /// unknown key.
    pub fn take_receiver(
        &self,
        session_id: &str,
        exec_id: &str,
    ) -> Option<mpsc::Receiver<StreamEvent>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(session_id.to_string(), exec_id.to_string()))
            .and_then(|entry| entry.receiver.take())
    }
}
