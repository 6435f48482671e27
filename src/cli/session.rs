//! `intake-relay session`: run one session fed from stdin.
//!
//! Each non-blank stdin line is one data packet body. End of input, or
//! Ctrl-C, is treated as the participant disconnecting.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::core::IntakePipeline;
use crate::domain::{DataPacket, Participant};
use crate::session::SessionAggregator;

/// Packets buffered between the stdin reader and the session
const PACKET_BUFFER: usize = 64;

pub async fn run_session(
    cfg: &ResolvedConfig,
    participant_id: Option<String>,
    identity: Option<String>,
) -> Result<()> {
    let pipeline = Arc::new(IntakePipeline::from_config(cfg));
    let aggregator = SessionAggregator::new(pipeline, cfg.session.clone());
    let session_id = aggregator.session_id();

    let participant = (participant_id.is_some() || identity.is_some()).then(|| Participant {
        sid: participant_id,
        identity,
    });

    let (tx, rx) = mpsc::channel::<DataPacket>(PACKET_BUFFER);

    let reader = tokio::spawn(forward_lines(
        tokio::io::stdin(),
        tokio::signal::ctrl_c(),
        participant,
        tx,
    ));

    let summary = aggregator.run(rx).await;

    reader
        .await
        .context("stdin reader task failed")?
        .context("Failed to read packets from stdin")?;

    eprintln!();
    eprintln!("[Session {} ended]", session_id);
    eprintln!("  Events applied:   {}", summary.events_applied);
    eprintln!("  Events dropped:   {}", summary.events_dropped);
    eprintln!("  Snapshots sent:   {}", summary.delivered);
    eprintln!("  Snapshots queued: {}", summary.queued + summary.queue_failed);
    eprintln!("  Flush passes:     {}", summary.flushes);
    eprintln!("  Redelivered:      {}", summary.redelivered);
    if summary.requeued > 0 {
        eprintln!("  Queued at exit:   {}", summary.requeued);
    }
    if summary.unfinished > 0 {
        eprintln!("  Still running:    {}", summary.unfinished);
    }

    Ok(())
}

/// Forward each non-blank line of `input` as a packet until end of input,
/// `shutdown` completes, or the session stops receiving.
async fn forward_lines<R, S, T>(
    input: R,
    shutdown: S,
    participant: Option<Participant>,
    tx: mpsc::Sender<DataPacket>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    S: Future<Output = T>,
{
    let mut lines = BufReader::new(input).lines();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let mut packet = DataPacket::new(line);
                packet.participant = participant.clone();
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted, ending session");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_forwards_non_blank_lines_with_participant() {
        let input: &[u8] = b"{\"a\": 1}\n\n   \n{\"b\": 2}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let participant = Participant::new("PA_1", "jane");

        forward_lines(input, std::future::pending::<()>(), Some(participant.clone()), tx)
            .await
            .unwrap();

        let mut bodies = Vec::new();
        while let Some(packet) = rx.recv().await {
            assert_eq!(packet.participant.as_ref(), Some(&participant));
            bodies.push(String::from_utf8(packet.data).unwrap());
        }
        assert_eq!(bodies, vec![r#"{"a": 1}"#, r#"{"b": 2}"#]);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_reader() {
        // The write half stays open, so the reader never sees end of input
        let (_writer, reader) = tokio::io::duplex(64);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (tx, _rx) = mpsc::channel(8);

        let forwarding = tokio::spawn(forward_lines(reader, stop_rx, None, tx));
        tokio::task::yield_now().await;
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), forwarding)
            .await
            .expect("reader should stop on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_survives_many_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (tx, mut rx) = mpsc::channel(64);

        let forwarding = tokio::spawn(forward_lines(reader, stop_rx, None, tx));

        for n in 0..20 {
            writer.write_all(format!("{{\"n\": {}}}\n", n).as_bytes()).await.unwrap();
        }
        for _ in 0..20 {
            rx.recv().await.unwrap();
        }

        // One shutdown future serves every loop iteration
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), forwarding)
            .await
            .expect("reader should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}
