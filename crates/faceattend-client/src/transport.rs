//! Line transports between the detection channel and the extractor.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const LINE_BUFFER: usize = 16;

/// Client side of an extractor connection: outbound request lines and
/// inbound message lines. The connection is closed when `inbound` ends.
pub struct Transport {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Extractor side of an in-memory transport.
pub struct ExtractorEnd {
    pub requests: mpsc::Receiver<String>,
    pub messages: mpsc::Sender<String>,
}

impl Transport {
    /// Connected in-memory pair, for hosts that embed the extractor
    /// in-process and for tests.
    pub fn in_memory() -> (Transport, ExtractorEnd) {
        let (out_tx, out_rx) = mpsc::channel(LINE_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINE_BUFFER);
        (
            Transport {
                outbound: out_tx,
                inbound: in_rx,
            },
            ExtractorEnd {
                requests: out_rx,
                messages: in_tx,
            },
        )
    }
}

/// Extractor running as a child process speaking JSON lines on stdio.
pub struct ExtractorProcess;

impl ExtractorProcess {
    /// Spawn `program` with `args`. The child is killed as soon as the
    /// inbound receiver is dropped, whether or not it is writing.
    pub fn spawn(program: &str, args: &[String]) -> std::io::Result<Transport> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("extractor stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("extractor stdout not captured"))?;

        tracing::info!(program, pid = ?child.id(), "extractor process started");

        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINE_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINE_BUFFER);

        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    tracing::warn!(error = %e, "extractor stdin closed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let read = tokio::select! {
                    read = lines.next_line() => read,
                    _ = in_tx.closed() => {
                        // Nobody will read the extractor again.
                        kill_child(&mut child).await;
                        break;
                    }
                };
                match read {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        if in_tx.send(line).await.is_err() {
                            kill_child(&mut child).await;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "extractor stdout read failed");
                        break;
                    }
                }
            }
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "extractor process exited"),
                Err(e) => tracing::warn!(error = %e, "extractor process wait failed"),
            }
        });

        Ok(Transport {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill extractor process");
    }
}
