//! Interactive loops over a line reader and a writer. `main` wires them to
//! stdin and stdout; tests feed them buffers.

use std::future::Future;
use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tracing::{error, warn};

use crate::cli::Format;
use crate::client::ConsumedMessage;
use crate::consumer::{Consumer, SubscriptionReport};
use crate::producer::{Dispatch, Producer, ProducerExt, Record, Text};
use crate::utils::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Messages acknowledged or queued.
    pub sent: u64,
    /// Messages rejected while the session ran.
    pub failed: u64,
}

/// Prompt for records until an empty name (or line, for `Format::Raw`) or
/// end of input, sending each through `producer`. A failed message is
/// reported to `output` and the loop carries on.
pub async fn produce_lines<R, W>(
    producer: &dyn Producer,
    format: Format,
    input: R,
    output: &mut W,
) -> Result<SessionSummary, Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut summary = SessionSummary::default();

    loop {
        let outcome = match format {
            Format::Json => {
                let Some(name) = prompt(&mut lines, output, "\nEnter Name: ").await? else {
                    break;
                };
                if name.is_empty() {
                    break;
                }
                let Some(message) = prompt(&mut lines, output, "Enter Message: ").await? else {
                    break;
                };
                producer.publish(&Record::new(name, message)).await
            }
            Format::Raw => {
                let Some(line) = prompt(&mut lines, output, "Enter message: ").await? else {
                    break;
                };
                if line.is_empty() {
                    break;
                }
                producer.publish(&Text(line)).await
            }
        };

        let reply = match outcome {
            Ok(Dispatch::Delivered(receipt)) => {
                summary.sent += 1;
                format!(
                    "Message was saved to partition: {}. Message offset is: {}.\n",
                    receipt.partition, receipt.offset
                )
            }
            Ok(Dispatch::Enqueued) => {
                summary.sent += 1;
                "Message queued for delivery.\n".to_string()
            }
            Err(e) => {
                summary.failed += 1;
                warn!(error = %e, "message not stored");
                format!("Failed to store your data: {e}\n")
            }
        };
        output.write_all(reply.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(summary)
}

async fn prompt<R, W>(
    lines: &mut Lines<R>,
    output: &mut W,
    text: &str,
) -> Result<Option<String>, Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}

/// Print every payload of `topic` to `output` until a line (or end of input)
/// arrives on `input`, or `stop` completes. Partition failures are logged as
/// they happen.
pub async fn consume_until<R, W, S>(
    consumer: &Consumer,
    topic: &str,
    input: R,
    mut output: W,
    stop: S,
) -> Result<SubscriptionReport, Error>
where
    R: AsyncBufRead + Unpin,
    W: Write + Send + 'static,
    S: Future<Output = ()>,
{
    writeln!(output, "--Hit enter to quit--")?;
    output.flush()?;

    let mut subscription = consumer
        .subscribe(topic, move |message: ConsumedMessage| {
            let printed = writeln!(output, "{}", String::from_utf8_lossy(&message.payload))
                .and_then(|()| output.flush());
            if let Err(e) = printed {
                error!(error = %e, offset = message.offset, "failed to print message");
            }
        })
        .await?;

    let mut errors = subscription.take_errors();
    let mut lines = input.lines();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = lines.next_line() => break,
            Some(failure) = async {
                match errors.as_mut() {
                    Some(errors) => errors.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                error!(
                    topic = %failure.topic,
                    partition = failure.partition,
                    error = %failure.error,
                    "partition consumer failed"
                );
            }
        }
    }

    subscription.shutdown().await
}
