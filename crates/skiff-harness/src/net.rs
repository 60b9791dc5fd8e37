//! Running sessions over a byte stream.
//!
//! Frames are self-delimiting: a fixed header carrying the payload length,
//! then the payload. These helpers work on any tokio stream; the tests use
//! turmoil's simulated TCP.

use std::io;

use skiff_core::{Environment, Session, SessionAction, SessionState};
use skiff_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &Frame) -> io::Result<()> {
    let mut buf = Vec::with_capacity(frame.wire_len());
    frame.encode(&mut buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    stream.write_all(&buf).await
}

/// Read one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Frame> {
    let mut buf = vec![0u8; FrameHeader::SIZE];
    stream.read_exact(&mut buf).await?;

    let header = FrameHeader::from_bytes(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let payload_size = header.payload_size() as usize;

    if payload_size > 0 {
        buf.resize(FrameHeader::SIZE + payload_size, 0);
        stream.read_exact(&mut buf[FrameHeader::SIZE..]).await?;
    }

    Frame::decode(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Write every frame in `actions` and collect delivered chunks.
pub async fn execute<W: AsyncWrite + Unpin>(
    stream: &mut W,
    actions: Vec<SessionAction>,
    delivered: &mut Vec<Vec<u8>>,
) -> io::Result<()> {
    for action in actions {
        match action {
            SessionAction::SendFrame(frame) => write_frame(stream, &frame).await?,
            SessionAction::DeliverChunk { plaintext, .. } => delivered.push(plaintext),
            SessionAction::StateChanged { from, to } => debug!(?from, ?to, "state changed"),
            SessionAction::Status(_) => {},
        }
    }
    Ok(())
}

/// Feed frames from `stream` into `session` until it reaches `target` or a
/// terminal state.
///
/// Rejected frames are logged and skipped; a fatal error has already moved
/// the session to `Failed` and queued the Abort.
pub async fn pump_until<S, E>(
    stream: &mut S,
    session: &mut Session<E>,
    target: SessionState,
    delivered: &mut Vec<Vec<u8>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Environment,
{
    while session.state() != target && !session.state().is_terminal() {
        let frame = read_frame(stream).await?;
        match session.handle_frame(&frame) {
            Ok(actions) => execute(stream, actions, delivered).await?,
            Err(err) => warn!(error = %err, "frame rejected"),
        }
    }
    Ok(())
}

/// Receive a file: answer the handshake and deliver chunks until the session
/// ends. Returns the delivered chunks.
pub async fn receive_file<S, E>(stream: &mut S, session: &mut Session<E>) -> io::Result<Vec<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Environment,
{
    let mut delivered = Vec::new();
    let actions = session.start()?;
    execute(stream, actions, &mut delivered).await?;
    pump_until(stream, session, SessionState::Completed, &mut delivered).await?;
    stream.flush().await?;
    Ok(delivered)
}

/// Send `file` in batches of `batch_size` chunks and wait for the receipt.
pub async fn send_file<S, E, P>(
    stream: &mut S,
    session: &mut Session<E>,
    file: &[P],
    batch_size: usize,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Environment,
    P: AsRef<[u8]> + Sync,
{
    let mut unused = Vec::new();
    let actions = session.start()?;
    execute(stream, actions, &mut unused).await?;
    pump_until(stream, session, SessionState::Transferring, &mut unused).await?;

    for batch in file.chunks(batch_size.max(1)) {
        let actions = session.send_chunks(batch)?;
        execute(stream, actions, &mut unused).await?;
    }
    let actions = session.finish()?;
    execute(stream, actions, &mut unused).await?;

    pump_until(stream, session, SessionState::Completed, &mut unused).await?;
    if session.state() != SessionState::Completed {
        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "transfer did not complete"));
    }
    Ok(())
}
