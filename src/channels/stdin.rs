//! Stdin source — one JSON-encoded [`RawMessage`] per line.

use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::channels::MessageStream;
use crate::pipeline::types::RawMessage;

/// Reads JSON lines from stdin (or any async reader) until EOF.
pub struct StdinSource;

impl StdinSource {
    /// Stream messages from the process's stdin.
    pub fn start() -> MessageStream {
        Self::from_reader(tokio::io::stdin())
    }

    /// Stream messages from `reader`. Malformed lines are logged and skipped.
    pub fn from_reader<R>(reader: R) -> MessageStream
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut line_no = 0u64;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        line_no += 1;
                        let Some(msg) = parse_line(&line, line_no) else {
                            continue;
                        };
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading input: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!(lines = line_no, "Input source closed");
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Box::pin(stream)
    }
}

fn parse_line(line: &str, line_no: u64) -> Option<RawMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<RawMessage>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(line = line_no, error = %e, "Skipping malformed input line");
            None
        }
    }
}
