//! Output capture raced against a wall-clock deadline.
//!
//! Buffers live outside the racing future, so whatever was read before the
//! deadline survives when the read is abandoned.

use crate::runtime::{OutputChunk, OutputStream, RuntimeError};
use futures::StreamExt;
use shellbox_core::CapturedOutput;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug)]
struct StreamBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl StreamBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    // Decoded once at the end: a frame boundary may split a UTF-8 sequence.
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Drain `output`, then await `exit`, unless `deadline` passes first.
///
/// On deadline the stream is dropped mid-read and `timed_out` is set; the
/// caller is responsible for stopping the container. A frame that cannot be
/// decoded ends the read with a warning and the exit status still decides
/// the result. Only a failed `exit` is an error.
pub async fn capture_with_deadline<F>(
    output: OutputStream,
    exit: F,
    deadline: Instant,
    max_output_bytes: usize,
) -> Result<CapturedOutput, RuntimeError>
where
    F: Future<Output = Result<Option<i64>, RuntimeError>>,
{
    let mut stdout = StreamBuffer::new(max_output_bytes);
    let mut stderr = StreamBuffer::new(max_output_bytes);

    let finished = {
        // The stream moves into the drain future: it is closed before the
        // exit wait, and also when the deadline drops the future.
        let drain = async {
            let mut output = output;
            while let Some(item) = output.next().await {
                match item {
                    Ok(OutputChunk::Stdout(bytes)) => stdout.push(&bytes),
                    Ok(OutputChunk::Stderr(bytes)) => stderr.push(&bytes),
                    Err(error) => {
                        warn!(error = %error, "unreadable output frame, discarding rest of stream");
                        break;
                    }
                }
            }
            drop(output);
            exit.await
        };

        tokio::select! {
            result = drain => Some(result),
            () = tokio::time::sleep_until(deadline) => None,
        }
    };

    let (exit_code, timed_out) = match finished {
        Some(result) => (result?, false),
        None => {
            debug!("capture deadline reached before container exit");
            (None, true)
        }
    };

    let truncated = stdout.truncated || stderr.truncated;
    Ok(CapturedOutput {
        stdout: stdout.into_text(),
        stderr: stderr.into_text(),
        exit_code,
        timed_out,
        truncated,
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    fn chunks(items: Vec<Result<OutputChunk, RuntimeError>>) -> OutputStream {
        Box::pin(stream::iter(items))
    }

    fn out(text: &'static str) -> Result<OutputChunk, RuntimeError> {
        Ok(OutputChunk::Stdout(Bytes::from_static(text.as_bytes())))
    }

    fn err(text: &'static str) -> Result<OutputChunk, RuntimeError> {
        Ok(OutputChunk::Stderr(Bytes::from_static(text.as_bytes())))
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test(start_paused = true)]
    async fn demultiplexes_streams() {
        let captured = capture_with_deadline(
            chunks(vec![out("a"), err("oops\n"), out("b\n")]),
            async { Ok(Some(0)) },
            in_secs(5),
            1024,
        )
        .await
        .unwrap();

        assert_eq!(captured.stdout, "ab\n");
        assert_eq!(captured.stderr, "oops\n");
        assert_eq!(captured.exit_code, Some(0));
        assert!(!captured.timed_out);
        assert!(!captured.truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_partial_output() {
        let output: OutputStream = Box::pin(stream::iter(vec![out("progress\n")]).chain(stream::pending()));
        let captured = capture_with_deadline(
            output,
            futures::future::pending(),
            in_secs(2),
            1024,
        )
        .await
        .unwrap();

        assert!(captured.timed_out);
        assert_eq!(captured.stdout, "progress\n");
        assert_eq!(captured.exit_code, None);
        assert!(!captured.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_wait_counts_against_deadline() {
        let captured = capture_with_deadline(
            chunks(vec![out("done\n")]),
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Some(0))
            },
            in_secs(1),
            1024,
        )
        .await
        .unwrap();
        assert!(captured.timed_out);
        assert_eq!(captured.stdout, "done\n");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_not_fatal() {
        let captured = capture_with_deadline(
            chunks(vec![
                out("before\n"),
                Err(RuntimeError::operation("attach", "bad frame header")),
                out("after\n"),
            ]),
            async { Ok(Some(0)) },
            in_secs(5),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(captured.stdout, "before\n");
        assert!(captured.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_closes_stream_before_exit_wait() {
        // The exit only resolves once the stream (holding the sender) is gone.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let output: OutputStream = Box::pin(
            stream::iter(vec![
                out("before\n"),
                Err(RuntimeError::operation("attach", "bad frame header")),
            ])
            .chain(stream::pending())
            .inspect(move |_| {
                let _ = &tx;
            }),
        );
        let captured = capture_with_deadline(
            output,
            async move {
                let _ = rx.await;
                Ok(Some(3))
            },
            in_secs(5),
            1024,
        )
        .await
        .unwrap();

        assert!(!captured.timed_out);
        assert_eq!(captured.exit_code, Some(3));
        assert_eq!(captured.stdout, "before\n");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_failure_is_an_error() {
        let result = capture_with_deadline(
            chunks(vec![out("x")]),
            async { Err(RuntimeError::operation("wait", "connection reset")) },
            in_secs(5),
            1024,
        )
        .await;
        assert_eq!(
            result.unwrap_err(),
            RuntimeError::operation("wait", "connection reset")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn output_is_capped_per_stream() {
        let captured = capture_with_deadline(
            chunks(vec![out("0123456789"), out("abcdef"), err("e")]),
            async { Ok(Some(0)) },
            in_secs(5),
            12,
        )
        .await
        .unwrap();
        assert!(captured.truncated);
        assert_eq!(captured.stdout, format!("0123456789ab{TRUNCATION_MARKER}"));
        assert_eq!(captured.stderr, "e");
    }

    #[tokio::test(start_paused = true)]
    async fn split_utf8_sequence_is_reassembled() {
        let snowman = "\u{2603}".as_bytes();
        let captured = capture_with_deadline(
            chunks(vec![
                Ok(OutputChunk::Stdout(Bytes::copy_from_slice(&snowman[..1]))),
                Ok(OutputChunk::Stdout(Bytes::copy_from_slice(&snowman[1..]))),
            ]),
            async { Ok(Some(0)) },
            in_secs(5),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(captured.stdout, "\u{2603}");
    }
}
