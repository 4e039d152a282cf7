//! Default read/write loops between local storage and the transport.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::storage::{LocalReader, LocalWriter};
use crate::watcher::BoxedStream;
use crate::{TransferError, Xfer};

pub(crate) enum PumpIo {
    Socket(BoxedStream),
    Hooks,
}

pub(crate) enum LocalIo {
    Source(LocalReader),
    Sink(LocalWriter),
}

enum Outcome {
    Completed,
    Remote(TransferError),
    Local(TransferError),
    Cancelled,
}

/// Body of a transfer's watcher task.
pub(crate) async fn run(xfer: Arc<Xfer>, io: PumpIo, local: LocalIo, token: CancellationToken) {
    let outcome = match local {
        LocalIo::Sink(sink) => receive(&xfer, io, sink, &token).await,
        LocalIo::Source(source) => send(&xfer, io, source, &token).await,
    };
    // The socket and local file are closed by now; release the registration
    // so teardown does not wait on this task.
    xfer.watcher_finished();

    match outcome {
        Outcome::Completed => xfer.end().await,
        Outcome::Remote(e) => {
            let e = match e {
                TransferError::Io(io) => TransferError::Remote(io.to_string()),
                other => other,
            };
            xfer.fail(e).await;
        }
        Outcome::Local(e) => {
            let e = match e {
                TransferError::Io(io) => TransferError::Local(io.to_string()),
                other => other,
            };
            xfer.fail(e).await;
        }
        Outcome::Cancelled => trace!(key = %xfer.key(), "pump stopped by teardown"),
    }
}

async fn receive(
    xfer: &Arc<Xfer>,
    mut io: PumpIo,
    mut sink: LocalWriter,
    token: &CancellationToken,
) -> Outcome {
    let mut buf = vec![0u8; xfer.chunk_size()];
    loop {
        let (size, done) = (xfer.size(), xfer.bytes_sent());
        if size > 0 && done >= size {
            break;
        }
        let want = if size > 0 {
            buf.len().min((size - done) as usize)
        } else {
            buf.len()
        };

        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled,
            read = read_remote(xfer, &mut io, &mut buf[..want]) => read,
        };
        let n = match read {
            Ok(n) if n > want => {
                return Outcome::Local(TransferError::Local(format!(
                    "transport reported {n} bytes for a {want} byte buffer"
                )));
            }
            Ok(n) => n,
            Err(e) => return classify(e),
        };
        if n == 0 {
            if size == 0 {
                debug!(key = %xfer.key(), bytes = done, "end of stream, size was unknown");
                xfer.set_completed(true);
                break;
            }
            return Outcome::Remote(TransferError::Remote(format!(
                "connection closed after {done} of {size} bytes"
            )));
        }

        if let Err(e) = sink.write_all(&buf[..n]).await {
            return Outcome::Local(e.into());
        }
        xfer.record_progress(n);
        trace!(key = %xfer.key(), n, "chunk received");

        if let Err(e) = ack(xfer, &buf[..n]).await {
            return classify(e);
        }
    }

    if let Err(e) = sink.shutdown().await {
        return Outcome::Local(e.into());
    }
    Outcome::Completed
}

async fn send(
    xfer: &Arc<Xfer>,
    mut io: PumpIo,
    mut source: LocalReader,
    token: &CancellationToken,
) -> Outcome {
    let mut buf = vec![0u8; xfer.chunk_size()];
    loop {
        let (size, done) = (xfer.size(), xfer.bytes_sent());
        if size > 0 && done >= size {
            break;
        }

        let n = match source.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => return Outcome::Local(e.into()),
        };
        if n == 0 {
            if size > 0 {
                return Outcome::Local(TransferError::Local(format!(
                    "local file ended after {done} of {size} bytes"
                )));
            }
            xfer.set_completed(true);
            break;
        }
        // A file that grew since the offer is truncated to the announced size.
        let n = if size > 0 {
            n.min((size - done) as usize)
        } else {
            n
        };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled,
            written = write_remote(xfer, &mut io, &buf[..n]) => written,
        };
        if let Err(e) = written {
            return classify(e);
        }
        xfer.record_progress(n);
        trace!(key = %xfer.key(), n, "chunk sent");

        if let Err(e) = ack(xfer, &buf[..n]).await {
            return classify(e);
        }
    }

    if let PumpIo::Socket(stream) = &mut io {
        if let Err(e) = stream.shutdown().await {
            debug!(key = %xfer.key(), error = %e, "socket shutdown failed after last chunk");
        }
    }
    Outcome::Completed
}

/// Transport errors blame the peer unless the error says otherwise.
fn classify(e: TransferError) -> Outcome {
    match e {
        TransferError::Cancelled => Outcome::Cancelled,
        e if e.is_remote_fault() => Outcome::Remote(e),
        e => Outcome::Local(e),
    }
}

async fn read_remote(
    xfer: &Arc<Xfer>,
    io: &mut PumpIo,
    buf: &mut [u8],
) -> Result<usize, TransferError> {
    match io {
        PumpIo::Socket(stream) => Ok(stream.read(buf).await?),
        PumpIo::Hooks => {
            let ops = xfer.ops().ok_or(TransferError::Cancelled)?;
            ops.read(xfer, buf).await
        }
    }
}

async fn write_remote(xfer: &Arc<Xfer>, io: &mut PumpIo, data: &[u8]) -> Result<(), TransferError> {
    match io {
        PumpIo::Socket(stream) => {
            stream.write_all(data).await?;
            Ok(())
        }
        PumpIo::Hooks => {
            let ops = xfer.ops().ok_or(TransferError::Cancelled)?;
            let mut offset = 0;
            while offset < data.len() {
                let written = ops.write(xfer, &data[offset..]).await?;
                if written == 0 {
                    return Err(TransferError::Remote("transport accepted no data".into()));
                }
                offset += written;
            }
            Ok(())
        }
    }
}

async fn ack(xfer: &Arc<Xfer>, data: &[u8]) -> Result<(), TransferError> {
    match xfer.ops() {
        Some(ops) => ops.ack(xfer, data).await,
        None => Ok(()),
    }
}
