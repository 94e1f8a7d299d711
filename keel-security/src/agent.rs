//! Descriptor handoff over a unix-domain socket
//!
//! The runtime sends the `hello` frame with the notification descriptor
//! attached as `SCM_RIGHTS` ancillary data. [`AgentConnection`] is the
//! agent's end: it receives the handoff, reads notifications and sends
//! verdicts.

#![allow(unsafe_code)]

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use keel_core::{Error, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};
use tracing::debug;

use crate::notify::notification_id_valid;
use crate::protocol::{
    AgentCodec, AgentMessage, RuntimeCodec, RuntimeMessage, SessionMetadata, Verdict,
};

const RECV_CHUNK: usize = 64 * 1024;

/// Send the `hello` frame for `metadata` with `listener` attached.
///
/// The stream must be in blocking mode.
///
/// # Errors
/// Returns error if the frame cannot be encoded or sent
pub fn send_handoff(
    stream: &StdUnixStream,
    listener: BorrowedFd<'_>,
    metadata: &SessionMetadata,
) -> Result<()> {
    let mut frame = BytesMut::new();
    RuntimeCodec::new().encode(RuntimeMessage::Hello(metadata.clone()), &mut frame)?;
    let fds = [listener.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = loop {
        match sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(&frame)],
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Ok(sent) => break sent,
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(Error::System(e)),
        }
    };

    // The descriptor travelled with the first byte; the rest is plain data
    if sent < frame.len() {
        let mut rest = stream;
        rest.write_all(&frame[sent..])?;
    }

    debug!(container_id = %metadata.id, bytes = frame.len(), "Sent listener handoff");
    Ok(())
}

/// What the agent receives at the start of a session.
///
/// The runtime alone receives and answers notifications on the descriptor.
/// The agent's copy only supports [`Handoff::id_valid`]; notifications and
/// answers travel as frames.
#[derive(Debug)]
pub struct Handoff {
    listener: OwnedFd,
    /// Container description
    pub metadata: SessionMetadata,
}

impl Handoff {
    /// Whether the kernel still waits on notification `id`
    ///
    /// # Errors
    /// Returns [`Error::System`] for failures other than a stale id
    pub fn id_valid(&self, id: u64) -> Result<bool> {
        notification_id_valid(self.listener.as_fd(), id)
    }
}

/// Receive the handoff on a blocking stream. Returns the handoff and the
/// bytes already read past the `hello` frame.
///
/// # Errors
/// Returns [`Error::Protocol`] if the first frame is not `hello` or carries
/// no descriptor
pub fn receive_handoff(stream: &StdUnixStream) -> Result<(Handoff, BytesMut)> {
    let mut codec = AgentCodec::new();
    let mut chunk = vec![0u8; RECV_CHUNK];
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);

    let (received, listener) = loop {
        let mut iov = [IoSliceMut::new(&mut chunk)];
        let flags = MsgFlags::MSG_CMSG_CLOEXEC;
        match recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), flags) {
            Ok(msg) => {
                let mut listener = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            // SAFETY: SCM_RIGHTS installed a fresh descriptor we now own
                            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                            if listener.is_none() {
                                listener = Some(owned);
                            }
                        }
                    }
                }
                break (msg.bytes, listener);
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(Error::System(e)),
        }
    };

    let listener = listener.ok_or_else(|| Error::Protocol {
        message: "hello frame carried no descriptor".to_string(),
    })?;
    let mut buf = BytesMut::from(&chunk[..received]);

    let mut reader = stream;
    let hello = loop {
        if let Some(message) = codec.decode(&mut buf)? {
            break message;
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::Protocol {
                message: "stream ended before the hello frame".to_string(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let RuntimeMessage::Hello(metadata) = hello else {
        return Err(Error::Protocol {
            message: "first frame was not hello".to_string(),
        });
    };

    debug!(container_id = %metadata.id, pid = %metadata.pid, "Received listener handoff");
    Ok((Handoff { listener, metadata }, buf))
}

/// Agent side of a session
#[derive(Debug)]
pub struct AgentConnection {
    framed: Framed<UnixStream, AgentCodec>,
}

impl AgentConnection {
    /// Receive the handoff on an accepted connection and switch it to async
    /// mode. Blocks until the `hello` frame arrives; must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    /// Returns error if the handoff is malformed or the stream cannot be
    /// registered
    pub fn accept(stream: StdUnixStream) -> Result<(Handoff, Self)> {
        let (handoff, leftover) = receive_handoff(&stream)?;
        stream.set_nonblocking(true)?;

        let mut parts = FramedParts::new::<AgentMessage>(
            UnixStream::from_std(stream)?,
            AgentCodec::new(),
        );
        parts.read_buf = leftover;

        Ok((
            handoff,
            Self {
                framed: Framed::from_parts(parts),
            },
        ))
    }

    /// Next runtime message (`notification` or `closed`); `None` when the
    /// runtime hangs up
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] for a malformed frame
    pub async fn next_message(&mut self) -> Result<Option<RuntimeMessage>> {
        self.framed.next().await.transpose()
    }

    /// Send a verdict
    ///
    /// # Errors
    /// Returns error if the runtime is gone
    pub async fn send_verdict(&mut self, verdict: Verdict) -> Result<()> {
        self.framed.send(AgentMessage::Verdict(verdict)).await
    }
}
