use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tungstenite::protocol::frame::{
    coding::{Control, Data, OpCode as WireOpCode},
    Frame as WireFrame, FrameHeader,
};

use crate::error::{HttpError, Result};

pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl TryFrom<WireOpCode> for OpCode {
    type Error = HttpError;

    fn try_from(code: WireOpCode) -> Result<Self> {
        Ok(match code {
            WireOpCode::Data(Data::Continue) => OpCode::Continuation,
            WireOpCode::Data(Data::Text) => OpCode::Text,
            WireOpCode::Data(Data::Binary) => OpCode::Binary,
            WireOpCode::Control(Control::Close) => OpCode::Close,
            WireOpCode::Control(Control::Ping) => OpCode::Ping,
            WireOpCode::Control(Control::Pong) => OpCode::Pong,
            other => {
                return Err(HttpError::protocol(format!(
                    "reserved websocket opcode {:#x}",
                    u8::from(other)
                )))
            }
        })
    }
}

impl From<OpCode> for WireOpCode {
    fn from(code: OpCode) -> Self {
        match code {
            OpCode::Continuation => WireOpCode::Data(Data::Continue),
            OpCode::Text => WireOpCode::Data(Data::Text),
            OpCode::Binary => WireOpCode::Data(Data::Binary),
            OpCode::Close => WireOpCode::Control(Control::Close),
            OpCode::Ping => WireOpCode::Control(Control::Ping),
            OpCode::Pong => WireOpCode::Control(Control::Pong),
        }
    }
}

impl OpCode {
    #[inline]
    pub(crate) fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) fin: bool,
    pub(crate) rsv: u8,
    pub(crate) opcode: OpCode,
    /// Masking key the frame arrived with. The payload is kept as received.
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload: Bytes,
}

impl Frame {
    pub(crate) fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub(crate) fn close(code: Option<u16>, reason: &str) -> Result<Self> {
        let payload = match code {
            Some(code) => {
                if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
                    return Err(HttpError::Configuration("close reason too long".into()));
                }
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(code);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
            None => Bytes::new(),
        };
        Ok(Self::new(OpCode::Close, payload))
    }

    /// Status code and reason carried by a close frame.
    pub(crate) fn close_reason(&self) -> Result<(Option<u16>, String)> {
        match self.payload.len() {
            0 => Ok((None, String::new())),
            1 => Err(HttpError::protocol("close frame with a one byte payload")),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
                Ok((Some(code), reason))
            }
        }
    }
}

fn wire_error(e: tungstenite::Error) -> HttpError {
    HttpError::protocol(format!("websocket framing: {e}"))
}

/// Serialise `frame`, masking the payload when `mask` is given.
pub(crate) fn encode(frame: &Frame, mask: Option<[u8; 4]>) -> Result<Bytes> {
    let header = FrameHeader {
        is_final: frame.fin,
        rsv1: frame.rsv & 0x4 != 0,
        rsv2: frame.rsv & 0x2 != 0,
        rsv3: frame.rsv & 0x1 != 0,
        opcode: frame.opcode.into(),
        mask,
    };
    let mut dst = Vec::with_capacity(frame.payload.len() + 14);
    WireFrame::from_payload(header, frame.payload.clone().into())
        .format(&mut dst)
        .map_err(wire_error)?;
    Ok(dst.into())
}

/// A fresh random masking key.
#[inline]
pub(crate) fn mask_key() -> [u8; 4] {
    fastrand::u32(..).to_be_bytes()
}

/// Decode one frame from the front of `buf`, or `None` if more bytes are needed.
pub(crate) fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let mut cursor = Cursor::new(&buf[..]);
    let Some((header, len)) = FrameHeader::parse(&mut cursor).map_err(wire_error)? else {
        return Ok(None);
    };
    let offset = cursor.position() as usize;
    let opcode = OpCode::try_from(header.opcode)?;

    if opcode.is_control() && (!header.is_final || len > MAX_CONTROL_PAYLOAD as u64) {
        return Err(HttpError::protocol("fragmented or oversized control frame"));
    }
    if len > max_payload as u64 {
        return Err(HttpError::protocol(format!(
            "frame of {len} bytes exceeds the {max_payload} byte limit"
        )));
    }
    let len = len as usize;
    if buf.len() < offset + len {
        return Ok(None);
    }

    buf.advance(offset);
    let payload = buf.split_to(len).freeze();
    Ok(Some(Frame {
        fin: header.is_final,
        rsv: (header.rsv1 as u8) << 2 | (header.rsv2 as u8) << 1 | header.rsv3 as u8,
        opcode,
        mask: header.mask,
        payload,
    }))
}
