use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use strata_core::{Message, RawMessage, SharedMessage, Status};
use strata_transport::{AsyncMessageSink, AsyncMessageSource, KeyFn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Keys each message by its first `len` payload bytes.
pub fn key_prefix(len: usize) -> KeyFn {
    Arc::new(move |message: &dyn Message| {
        message
            .data()
            .map(|data| data.slice(..len.min(data.len())))
            .unwrap_or_default()
    })
}

/// Writes each consumed payload to `out` as a line and acknowledges it.
///
/// Stops after `max` messages, on cancellation, or when the source ends.
/// Returns how many messages were written.
pub async fn consume<S, W>(
    source: Arc<S>,
    max: Option<usize>,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<usize>
where
    S: AsyncMessageSource + 'static,
    W: Write,
{
    let scope = cancel.child_token();
    let (messages_tx, mut messages_rx) = mpsc::channel::<SharedMessage>(CHANNEL_CAPACITY);
    let (acks_tx, acks_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let consuming = tokio::spawn({
        let scope = scope.clone();
        async move { source.consume_messages(scope, messages_tx, acks_rx).await }
    });

    let mut consumed = 0;
    let written = loop {
        if max.is_some_and(|max| consumed >= max) {
            break Ok(());
        }
        let message = tokio::select! {
            _ = scope.cancelled() => break Ok(()),
            message = messages_rx.recv() => match message {
                Some(message) => message,
                None => break Ok(()),
            },
        };
        if let Err(err) = write_payload(out, message.as_ref()) {
            break Err(err);
        }
        consumed += 1;
        if acks_tx.send(message).await.is_err() {
            debug!("consume call ended before acknowledgement");
            break Ok(());
        }
    };

    scope.cancel();
    consuming
        .await
        .context("consume task failed")?
        .context("consume failed")?;
    written?;
    info!(consumed, "consume finished");
    Ok(consumed)
}

fn write_payload<W: Write>(out: &mut W, message: &dyn Message) -> Result<()> {
    let payload = message.data().context("reading payload")?;
    writeln!(out, "{}", String::from_utf8_lossy(&payload)).context("writing payload")?;
    out.flush().context("writing payload")
}

/// Publishes every line of `input` and counts broker confirmations.
pub async fn publish<K, R>(sink: Arc<K>, input: R, cancel: CancellationToken) -> Result<usize>
where
    K: AsyncMessageSink + 'static,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (messages_tx, messages_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (confirmations_tx, mut confirmations_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let publishing = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sink.publish_messages(cancel, confirmations_tx, messages_rx)
                .await
        }
    });
    let reading = tokio::spawn(feed_lines(input, messages_tx, cancel.clone()));

    let mut confirmed = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            confirmation = confirmations_rx.recv() => match confirmation {
                Some(_) => confirmed += 1,
                None => break,
            },
        }
    }

    let read = reading.await.context("input task failed")??;
    publishing
        .await
        .context("publish task failed")?
        .context("publish failed")?;
    if read != confirmed {
        warn!(read, confirmed, "not every line was confirmed");
    }
    info!(confirmed, "publish finished");
    Ok(confirmed)
}

async fn feed_lines<R>(
    input: R,
    messages: mpsc::Sender<SharedMessage>,
    cancel: CancellationToken,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut read = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("reading input")?,
        };
        let Some(line) = line else {
            break;
        };
        let message = RawMessage::shared(Bytes::from(line));
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = messages.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        read += 1;
    }
    Ok(read)
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub source: Status,
    pub sink: Status,
}

pub async fn status<S, K>(source: &S, sink: &K) -> Result<StatusReport>
where
    S: AsyncMessageSource,
    K: AsyncMessageSink,
{
    Ok(StatusReport {
        source: source.status().await.context("source status")?,
        sink: sink.status().await.context("sink status")?,
    })
}
