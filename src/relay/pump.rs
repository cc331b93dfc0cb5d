//! Byte Pumps
//!
//! One pump per direction of a proxied connection. Each pump reads into a
//! fixed-size buffer and immediately writes the chunk out, preserving order
//! and byte-exactness. The upstream pump (target to client) additionally
//! honors drop mode: while the shared flag is set it keeps reading, so the
//! remote peer's send buffer never stalls, but discards what it read instead
//! of forwarding it. Discarded bytes are gone for good; clearing the flag
//! only lets data read afterwards through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::trace;

/// Why a pump loop ended
#[derive(Debug)]
pub enum PumpEnd {
    /// The read side reached end-of-stream
    Eof,
    /// A read or write failed
    Error(std::io::Error),
    /// Pair teardown or relay shutdown
    Cancelled,
}

/// Totals for one finished pump
#[derive(Debug)]
pub struct PumpOutcome {
    pub bytes_forwarded: u64,
    pub bytes_discarded: u64,
    pub end: PumpEnd,
}

/// Forward bytes client-to-target until EOF, error, or cancellation.
///
/// The reader and writer halves are owned by this pump and dropped (closing
/// their sockets' sides) when it returns; the caller signals the peer pump.
pub async fn run_downstream<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    mut pair_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut forwarded: u64 = 0;

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    return PumpOutcome {
                        bytes_forwarded: forwarded,
                        bytes_discarded: 0,
                        end: PumpEnd::Eof,
                    }
                }
                Ok(n) => {
                    if let Err(e) = write_chunk(&mut writer, &buf[..n]).await {
                        return PumpOutcome {
                            bytes_forwarded: forwarded,
                            bytes_discarded: 0,
                            end: PumpEnd::Error(e),
                        };
                    }
                    forwarded += n as u64;
                }
                Err(e) => {
                    return PumpOutcome {
                        bytes_forwarded: forwarded,
                        bytes_discarded: 0,
                        end: PumpEnd::Error(e),
                    }
                }
            },
            _ = pair_rx.recv() => {
                return PumpOutcome {
                    bytes_forwarded: forwarded,
                    bytes_discarded: 0,
                    end: PumpEnd::Cancelled,
                }
            }
            _ = shutdown_rx.recv() => {
                return PumpOutcome {
                    bytes_forwarded: forwarded,
                    bytes_discarded: 0,
                    end: PumpEnd::Cancelled,
                }
            }
        }
    }
}

/// Forward bytes target-to-client, discarding while the drop flag is set.
///
/// The flag is checked after every read; a chunk read while blocked is
/// discarded and the pump sleeps `drop_poll_interval` before reading again.
/// A toggle mid-chunk only affects chunks read after the toggle is observed.
pub async fn run_upstream<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    blocked: Arc<AtomicBool>,
    drop_poll_interval: Duration,
    mut pair_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut forwarded: u64 = 0;
    let mut discarded: u64 = 0;

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    return PumpOutcome {
                        bytes_forwarded: forwarded,
                        bytes_discarded: discarded,
                        end: PumpEnd::Eof,
                    }
                }
                Ok(n) => {
                    if blocked.load(Ordering::Relaxed) {
                        discarded += n as u64;
                        trace!("Drop mode: discarded {} bytes", n);
                        tokio::time::sleep(drop_poll_interval).await;
                        continue;
                    }

                    if let Err(e) = write_chunk(&mut writer, &buf[..n]).await {
                        return PumpOutcome {
                            bytes_forwarded: forwarded,
                            bytes_discarded: discarded,
                            end: PumpEnd::Error(e),
                        };
                    }
                    forwarded += n as u64;
                }
                Err(e) => {
                    return PumpOutcome {
                        bytes_forwarded: forwarded,
                        bytes_discarded: discarded,
                        end: PumpEnd::Error(e),
                    }
                }
            },
            _ = pair_rx.recv() => {
                return PumpOutcome {
                    bytes_forwarded: forwarded,
                    bytes_discarded: discarded,
                    end: PumpEnd::Cancelled,
                }
            }
            _ = shutdown_rx.recv() => {
                return PumpOutcome {
                    bytes_forwarded: forwarded,
                    bytes_discarded: discarded,
                    end: PumpEnd::Cancelled,
                }
            }
        }
    }
}

/// Write one chunk and flush it, so no data sits buffered in the relay
async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}
