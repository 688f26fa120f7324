//! Browser native-messaging framing: a 4-byte length in native byte order followed by UTF-8
//! JSON. Messages to the browser are capped at 1 MiB, messages from it at 64 MiB.

use std::io::{self, ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::{MessageEnvelope, Payload, RpcResponse};
use crate::relay::Route;

pub const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;
pub const MAX_INBOUND_FRAME: usize = 64 * 1024 * 1024;

/// Host-to-extension frame: the route tells the extension which hop to replay it on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEnvelope {
    pub route: Route,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMessagingCodec;

impl NativeMessagingCodec {
    pub fn encode<T: Serialize>(&self, message: &T) -> BridgeResult<Vec<u8>> {
        let body = serde_json::to_vec(message)?;
        if body.len() > MAX_OUTBOUND_FRAME {
            return Err(BridgeError::ValidationError(format!(
                "outbound message is {} bytes, limit is {}",
                body.len(),
                MAX_OUTBOUND_FRAME
            )));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream between frames.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> BridgeResult<Option<Value>> {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_ne_bytes(header) as usize;
        if len > MAX_INBOUND_FRAME {
            // Drain the body so the next header lines up.
            let skipped = io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
            if skipped < len as u64 {
                return Err(BridgeError::TransportClosed);
            }
            return Err(BridgeError::MalformedEnvelope(format!(
                "inbound frame of {} bytes exceeds limit",
                len
            )));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let value = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;
        Ok(Some(value))
    }

    /// Feed every frame to `sink` until EOF or until `sink` returns false.
    ///
    /// A frame with a bad body has been consumed in full, so it is logged and skipped. Any
    /// other error means the stream can no longer be trusted and ends the loop.
    pub fn pump_frames<R, F>(&self, reader: &mut R, mut sink: F) -> BridgeResult<()>
    where
        R: Read,
        F: FnMut(Value) -> bool,
    {
        loop {
            match self.read_frame(reader) {
                Ok(Some(frame)) => {
                    if !sink(frame) {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(BridgeError::MalformedEnvelope(reason)) => {
                    log::warn!("skipping unreadable frame: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a routed envelope. A response too large for one frame is replaced by an error
    /// response with the same id so the waiting page call settles.
    pub fn write_routed<W: Write>(&self, writer: &mut W, routed: &RoutedEnvelope) -> BridgeResult<()> {
        let frame = match (self.encode(routed), &routed.envelope.payload) {
            (Ok(frame), _) => frame,
            (Err(e @ BridgeError::ValidationError(_)), Payload::Response(response)) => {
                log::warn!("response {} does not fit in a frame: {}", response.id, e);
                let replacement = RoutedEnvelope {
                    route: routed.route,
                    envelope: MessageEnvelope::response(
                        RpcResponse::error(response.id.clone(), e.to_rpc_error()),
                        routed.envelope.origin.clone(),
                    ),
                };
                self.encode(&replacement)?
            }
            (Err(e), _) => return Err(e),
        };
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_frame<W: Write, T: Serialize>(&self, writer: &mut W, message: &T) -> BridgeResult<()> {
        let frame = self.encode(message)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}
