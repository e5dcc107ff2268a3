//! Live message streams.
//!
//! A [`MessageStream`] owns a background task that reads `imsg watch`
//! output, normalizes each line and pushes it into a bounded channel. The
//! task owns the subprocess and kills it on every exit path: cancellation,
//! the receiver going away, a read failure or the process ending.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{truncate_chars, Result};
use crate::metrics::MetricsCollector;
use crate::models::Message;
use crate::normalizer::MessageNormalizer;
use crate::process::{parse_ndjson_line, LineStream};

const CHANNEL_CAPACITY: usize = 64;

/// A cancellable stream of messages from a watched thread.
///
/// Dropping the stream also stops the watch; [`MessageStream::cancel`]
/// additionally waits until the subprocess has been reaped.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::Receiver<Result<Message>>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl MessageStream {
    /// Start pumping `lines` into a new stream. Records without a chat id
    /// are attributed to `thread_id`.
    #[must_use]
    pub fn spawn(lines: LineStream, normalizer: MessageNormalizer, thread_id: i64) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let pid = lines.id();
        let task = tokio::spawn(pump(lines, normalizer, thread_id, tx, cancel_rx));

        Self {
            rx,
            cancel: Some(cancel_tx),
            task: Some(task),
            pid,
        }
    }

    /// Next message. `None` once the watch has ended. A failure of the
    /// underlying process arrives as a final `Err`.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        self.rx.recv().await
    }

    /// OS process id of the watch subprocess.
    #[must_use]
    pub const fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the watch and wait until the subprocess is gone. Messages not
    /// yet received are discarded.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        // A pump blocked on a full channel only wakes once sends fail.
        self.rx.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Watch task ended abnormally");
            }
        }
    }
}

async fn pump(
    mut lines: LineStream,
    normalizer: MessageNormalizer,
    thread_id: i64,
    tx: mpsc::Sender<Result<Message>>,
    mut cancel: oneshot::Receiver<()>,
) {
    let metrics = MetricsCollector::default();
    metrics.watch_started();
    debug!(thread_id, pid = ?lines.id(), "Watch started");

    'watch: loop {
        tokio::select! {
            _ = &mut cancel => {
                debug!(thread_id, "Watch cancelled");
                break;
            }
            () = tx.closed() => {
                debug!(thread_id, "Watch receiver dropped");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some((line_no, line))) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let records = match parse_ndjson_line(lines.tool(), line_no, line) {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(error = %e, line = %truncate_chars(line, 100), "Watch NDJSON parse error");
                            metrics.record_lines_skipped(lines.tool(), 1);
                            continue;
                        },
                    };
                    for record in &records {
                        let mut message = normalizer.message(record);
                        if message.chat_id == 0 {
                            message.chat_id = thread_id;
                        }
                        metrics.record_watch_message();
                        if tx.send(Ok(message)).await.is_err() {
                            break 'watch;
                        }
                    }
                },
                Ok(None) => {
                    debug!(thread_id, "Watch output closed");
                    if let Err(e) = lines.finish().await {
                        let _ = tx.send(Err(e)).await;
                    }
                    metrics.watch_stopped();
                    return;
                },
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                },
            },
        }
    }

    lines.terminate().await;
    metrics.watch_stopped();
}
