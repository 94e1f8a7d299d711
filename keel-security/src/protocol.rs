//! Agent wire protocol
//!
//! Every message is a frame: a 4-byte big-endian payload length followed by
//! a JSON payload of at most [`MAX_FRAME_LEN`] bytes.
//!
//! Runtime to agent: `hello` (sent once, together with the descriptor),
//! then `notification` and finally `closed`. Agent to runtime: `verdict`.

use bytes::{Bytes, BytesMut};
use keel_core::config::MAX_ERRNO;
use keel_core::{ContainerId, Error, ProcessId, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::notify::{Notification, Response};

/// Largest accepted payload
pub const MAX_FRAME_LEN: usize = 1 << 20;

const HEADER_LEN: usize = 4;

/// OCI version reported in session metadata
pub const OCI_VERSION: &str = "1.0.2";

/// Container description sent with the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// OCI runtime-spec version
    pub oci_version: String,
    /// Container ID
    pub id: ContainerId,
    /// Container init process
    pub pid: ProcessId,
    /// Bundle directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<PathBuf>,
    /// Opaque string from the container's seccomp profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_metadata: Option<String>,
    /// Container annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl SessionMetadata {
    /// Metadata with only the required fields
    #[must_use]
    pub fn new(id: ContainerId, pid: ProcessId) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id,
            pid,
            bundle: None,
            listener_metadata: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// What the agent decided for one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerdictAction {
    /// Run the syscall unmodified
    Continue,
    /// Skip the syscall and return `value`
    Return {
        /// Return value
        value: i64,
    },
    /// Fail the syscall with `errno`
    Errno {
        /// Positive errno
        errno: i32,
    },
    /// Deliver `SIGSYS` to the task and fail the syscall with `ENOSYS`
    Trap,
}

/// Agent decision for notification `id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Notification id
    pub id: u64,
    /// Decision
    pub action: VerdictAction,
}

impl Verdict {
    /// Kernel response for this verdict. The `SIGSYS` of a trap is sent by
    /// the caller.
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] for an errno outside `1..=MAX_ERRNO`
    pub fn response(&self) -> Result<Response> {
        Ok(match self.action {
            VerdictAction::Continue => Response::continue_syscall(self.id),
            VerdictAction::Return { value } => Response::value(self.id, value),
            VerdictAction::Errno { errno } if (1..=MAX_ERRNO).contains(&errno) => {
                Response::errno(self.id, errno)
            }
            VerdictAction::Errno { errno } => {
                return Err(Error::Protocol {
                    message: format!(
                        "verdict for {} carries errno {errno}, outside 1..={MAX_ERRNO}",
                        self.id
                    ),
                });
            }
            VerdictAction::Trap => Response::errno(self.id, libc::ENOSYS),
        })
    }
}

/// Runtime to agent messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeMessage {
    /// First frame, sent with the descriptor
    Hello(SessionMetadata),
    /// A syscall awaits a verdict
    Notification(Notification),
    /// The session ended; no further frames follow
    Closed {
        /// Why the session ended
        reason: String,
    },
}

/// Agent to runtime messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Decision for one notification
    Verdict(Verdict),
}

/// JSON frames over [`LengthDelimitedCodec`]: decodes `D`, encodes `E`
#[derive(Debug)]
pub struct JsonCodec<D, E> {
    frames: LengthDelimitedCodec,
    _messages: PhantomData<fn(E) -> D>,
}

/// Runtime end: reads verdicts, writes notifications
pub type RuntimeCodec = JsonCodec<AgentMessage, RuntimeMessage>;

/// Agent end: reads notifications, writes verdicts
pub type AgentCodec = JsonCodec<RuntimeMessage, AgentMessage>;

impl<D, E> JsonCodec<D, E> {
    /// Codec with the protocol's header and size limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .big_endian()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _messages: PhantomData,
        }
    }
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => Error::Protocol {
            message: format!("bad frame: {e}"),
        },
        _ => Error::Io(e),
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>> {
        let Some(payload) = self.frames.decode(src).map_err(frame_error)? else {
            return Ok(None);
        };
        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| Error::Protocol {
                message: format!("malformed frame: {e}"),
            })
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<D>> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Protocol {
                message: format!("stream ended inside a frame ({} bytes buffered)", buf.len()),
            }),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = Error;

    fn encode(&mut self, message: E, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&message).map_err(|e| Error::Protocol {
            message: format!("cannot encode frame: {e}"),
        })?;
        self.frames.encode(Bytes::from(payload), dst).map_err(frame_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn verdict(id: u64, action: VerdictAction) -> AgentMessage {
        AgentMessage::Verdict(Verdict { id, action })
    }

    fn frame(message: AgentMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        AgentCodec::new().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn verdict_wire_format() {
        let json = serde_json::to_string(&verdict(3, VerdictAction::Errno { errno: 13 })).unwrap();
        assert_eq!(json, r#"{"type":"verdict","id":3,"action":{"type":"errno","errno":13}}"#);

        let parsed: AgentMessage =
            serde_json::from_str(r#"{"type":"verdict","id":4,"action":{"type":"continue"}}"#)
                .unwrap();
        assert_eq!(parsed, verdict(4, VerdictAction::Continue));
    }

    #[test]
    fn verdict_responses() {
        let v = Verdict { id: 1, action: VerdictAction::Trap };
        assert_eq!(v.response().unwrap().error, -libc::ENOSYS);

        let v = Verdict { id: 2, action: VerdictAction::Return { value: -5 } };
        assert_eq!(v.response().unwrap(), Response::value(2, -5));

        let v = Verdict { id: 3, action: VerdictAction::Errno { errno: MAX_ERRNO } };
        assert_eq!(v.response().unwrap(), Response::errno(3, MAX_ERRNO));
    }

    #[test]
    fn errno_outside_kernel_range_rejected() {
        for errno in [0, -1, i32::MIN, MAX_ERRNO + 1, i32::MAX] {
            let v = Verdict { id: 9, action: VerdictAction::Errno { errno } };
            assert!(matches!(v.response(), Err(Error::Protocol { .. })), "{errno}");
        }
    }

    #[test]
    fn metadata_uses_oci_names() {
        let id = ContainerId::new("c1").unwrap();
        let mut metadata = SessionMetadata::new(id, ProcessId::from_raw(42));
        metadata.listener_metadata = Some("policy=strict".into());
        let json = serde_json::to_value(&RuntimeMessage::Hello(metadata)).unwrap();

        assert_eq!(json["type"], "hello");
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["id"], "c1");
        assert_eq!(json["listenerMetadata"], "policy=strict");
        assert!(json.get("bundle").is_none());
    }

    #[test]
    fn decoder_waits_for_whole_frame() {
        let frame = frame(verdict(7, VerdictAction::Continue));
        let mut codec = RuntimeCodec::new();
        let mut buf = BytesMut::new();

        for byte in &frame[..frame.len() - 1] {
            buf.extend_from_slice(std::slice::from_ref(byte));
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(verdict(7, VerdictAction::Continue)));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_handles_back_to_back_frames() {
        let mut codec = RuntimeCodec::new();
        let mut buf = frame(verdict(1, VerdictAction::Trap));
        buf.extend_from_slice(&frame(verdict(2, VerdictAction::Continue)));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(verdict(1, VerdictAction::Trap)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(verdict(2, VerdictAction::Continue)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_oversized_and_malformed() {
        let mut buf = BytesMut::from(&u32::MAX.to_be_bytes()[..]);
        assert!(matches!(RuntimeCodec::new().decode(&mut buf), Err(Error::Protocol { .. })));

        let mut buf = BytesMut::from(&3u32.to_be_bytes()[..]);
        buf.extend_from_slice(b"{x}");
        assert!(matches!(RuntimeCodec::new().decode(&mut buf), Err(Error::Protocol { .. })));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let closed = RuntimeMessage::Closed { reason: "x".repeat(MAX_FRAME_LEN) };
        let mut buf = BytesMut::new();
        let result = RuntimeCodec::new().encode(closed, &mut buf);
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[tokio::test]
    async fn framed_over_stream() {
        let (a, b) = tokio::io::duplex(16);
        let mut writer = FramedWrite::new(a, RuntimeCodec::new());
        let mut reader = FramedRead::new(b, AgentCodec::new());

        let send = tokio::spawn(async move {
            let closed = RuntimeMessage::Closed { reason: "container exited".into() };
            writer.send(closed).await.unwrap();
        });

        let received = reader.next().await.unwrap().unwrap();
        assert_eq!(received, RuntimeMessage::Closed { reason: "container exited".into() });
        send.await.unwrap();

        // Writer dropped: clean end of stream
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_protocol_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FramedRead::new(b, RuntimeCodec::new());
        a.write_all(&[0, 0, 0, 10, b'{']).await.unwrap();
        drop(a);

        assert!(matches!(reader.next().await, Some(Err(Error::Protocol { .. }))));
    }
}
