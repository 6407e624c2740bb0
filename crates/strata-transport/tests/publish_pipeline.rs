use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strata_core::{same_message, Message, MessageError, RawMessage, SharedMessage, TransportError};
use strata_transport::memory::MemorySink;
use strata_transport::{AsyncMessageSink, KeyFn, TransportSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

struct Publisher {
    sink: Arc<TransportSink<MemorySink>>,
    cancel: CancellationToken,
    messages: Option<mpsc::Sender<SharedMessage>>,
    confirmations: mpsc::Receiver<SharedMessage>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl Publisher {
    fn start(sink: TransportSink<MemorySink>) -> Self {
        Self::with_confirmation_capacity(sink, 16)
    }

    fn with_confirmation_capacity(sink: TransportSink<MemorySink>, capacity: usize) -> Self {
        let sink = Arc::new(sink);
        let cancel = CancellationToken::new();
        let (messages, messages_rx) = mpsc::channel(16);
        let (confirmations_tx, confirmations) = mpsc::channel(capacity);

        let task = tokio::spawn({
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            async move {
                sink.publish_messages(cancel, confirmations_tx, messages_rx)
                    .await
            }
        });

        Self {
            sink,
            cancel,
            messages: Some(messages),
            confirmations,
            task,
        }
    }

    fn backend(&self) -> &MemorySink {
        self.sink.backend()
    }

    async fn send(&self, message: &SharedMessage) {
        self.messages
            .as_ref()
            .expect("input still open")
            .send(Arc::clone(message))
            .await
            .expect("publish call should be reading");
    }

    fn close_input(&mut self) {
        self.messages = None;
    }

    async fn confirmation(&mut self) -> SharedMessage {
        tokio::time::timeout(WAIT, self.confirmations.recv())
            .await
            .expect("confirmation should arrive")
            .expect("confirmation channel should stay open")
    }

    async fn wait_for_published(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.backend().published().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("records should reach the producer");
    }

    async fn finish(self) -> Result<(), TransportError> {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("publish call should end")
            .expect("publish task should not panic")
    }
}

#[derive(Debug)]
struct Traced {
    inner: SharedMessage,
}

impl Message for Traced {
    fn data(&self) -> Result<Bytes, MessageError> {
        self.inner.data()
    }

    fn original(&self) -> Option<&dyn Message> {
        Some(&*self.inner)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_input_drains_confirmations_and_flushes() {
    let mut publisher = Publisher::start(TransportSink::new(MemorySink::new(), "events"));

    let sent: Vec<SharedMessage> = ["a", "b", ""].into_iter().map(RawMessage::shared).collect();
    for message in &sent {
        publisher.send(message).await;
    }
    publisher.close_input();

    let mut confirmed = Vec::new();
    for _ in 0..sent.len() {
        confirmed.push(publisher.confirmation().await);
    }
    for message in &sent {
        assert!(confirmed.iter().any(|c| same_message(&**c, &**message)));
    }

    let sink = Arc::clone(&publisher.sink);
    publisher.finish().await.expect("closed input is a clean exit");
    let published = sink.backend().published();
    assert_eq!(published.len(), 3);
    assert!(published[2].payload.is_empty());
    assert_eq!(sink.backend().flushes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn confirmations_follow_broker_order() {
    let mut publisher = Publisher::start(TransportSink::new(MemorySink::manual(), "events"));
    let sent: Vec<SharedMessage> = ["0", "1", "2"].into_iter().map(RawMessage::shared).collect();
    for message in &sent {
        publisher.send(message).await;
    }
    publisher.wait_for_published(3).await;

    for seq in [2, 0, 1] {
        assert!(publisher.backend().confirm(seq));
        let confirmed = publisher.confirmation().await;
        assert!(same_message(&*confirmed, &*sent[seq]));
    }

    publisher.close_input();
    publisher.finish().await.expect("clean exit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_delivery_aborts_and_still_flushes() {
    let publisher = Publisher::start(TransportSink::new(MemorySink::manual(), "events"));
    publisher.send(&RawMessage::shared("too big")).await;
    publisher.send(&RawMessage::shared("fine")).await;
    publisher.wait_for_published(2).await;

    assert!(publisher.backend().reject(0, "message too large"));
    let sink = Arc::clone(&publisher.sink);
    let err = publisher.finish().await.expect_err("rejection is fatal");
    assert_eq!(err.to_string(), "message too large");
    assert_eq!(sink.backend().flushes(), 1);
    assert_eq!(sink.backend().unconfirmed(), vec![1], "second stays unconfirmed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_failure_wins_over_flush_failure() {
    let sink = MemorySink::new();
    sink.fail_next_enqueue("queue full");
    sink.fail_next_flush("flush timed out");
    let publisher = Publisher::start(TransportSink::new(sink, "events"));
    publisher.send(&RawMessage::shared("x")).await;

    let err = publisher.finish().await.expect_err("enqueue failure surfaces");
    assert_eq!(err.to_string(), "queue full");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_failure_after_clean_run_is_returned() {
    let sink = MemorySink::new();
    sink.fail_next_flush("flush timed out");
    let mut publisher = Publisher::start(TransportSink::new(sink, "events"));
    publisher.close_input();

    let err = publisher.finish().await.expect_err("flush failure surfaces");
    assert_eq!(err.to_string(), "flush timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_leaves_pending_unconfirmed() {
    let mut publisher = Publisher::start(TransportSink::new(MemorySink::manual(), "events"));
    publisher.send(&RawMessage::shared("pending")).await;
    publisher.wait_for_published(1).await;

    publisher.cancel.cancel();
    let sink = Arc::clone(&publisher.sink);
    assert!(publisher.confirmations.try_recv().is_err());
    publisher.finish().await.expect("cancellation is a clean exit");
    assert_eq!(sink.backend().unconfirmed(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_skips_the_flush() {
    let sink = MemorySink::manual();
    sink.fail_next_flush("flush timed out");
    let publisher = Publisher::start(TransportSink::new(sink, "events"));
    publisher.send(&RawMessage::shared("in flight")).await;
    publisher.wait_for_published(1).await;

    publisher.cancel.cancel();
    let sink = Arc::clone(&publisher.sink);
    publisher
        .finish()
        .await
        .expect("cancellation is a clean exit even with a failing flush");
    assert_eq!(sink.backend().flushes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejection_aborts_while_the_reader_lags() {
    let publisher =
        Publisher::with_confirmation_capacity(TransportSink::new(MemorySink::manual(), "events"), 1);
    for payload in ["0", "1", "2"] {
        publisher.send(&RawMessage::shared(payload)).await;
    }
    publisher.wait_for_published(3).await;

    // Nobody reads confirmations: 0 fills the channel and 1 waits for room.
    assert!(publisher.backend().confirm(0));
    assert!(publisher.backend().confirm(1));
    assert!(publisher.backend().reject(2, "message too large"));

    let err = publisher
        .finish()
        .await
        .expect_err("rejection surfaces without waiting for the reader");
    assert_eq!(err.to_string(), "message too large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_function_sees_the_unwrapped_original() {
    let key_fn: KeyFn = Arc::new(|message: &dyn Message| {
        if message.original().is_some() {
            Bytes::from_static(b"decorator")
        } else {
            Bytes::from_static(b"original")
        }
    });
    let mut publisher =
        Publisher::start(TransportSink::new(MemorySink::new(), "events").with_key_fn(key_fn));

    let decorated: SharedMessage = Arc::new(Traced {
        inner: Arc::new(Traced {
            inner: RawMessage::shared("payload"),
        }),
    });
    publisher.send(&decorated).await;

    let confirmed = publisher.confirmation().await;
    assert!(
        same_message(&*confirmed, &*decorated),
        "the caller's message is confirmed, not the original"
    );
    let published = publisher.backend().published();
    let record = &published[0];
    assert_eq!(record.key, Some(Bytes::from_static(b"original")));
    assert_eq!(record.payload, Bytes::from_static(b"payload"));

    publisher.close_input();
    publisher.finish().await.expect("clean exit");
}

#[tokio::test]
async fn status_and_close_follow_the_connection() {
    let sink = TransportSink::new(MemorySink::new(), "events");
    assert!(sink.status().await.expect("status").working);

    sink.close().expect("first close succeeds");
    let err = sink.close().expect_err("second close fails");
    assert!(err.to_string().contains("client is already closed"));
    assert!(!sink.status().await.expect("status").working);
}
