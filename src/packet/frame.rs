//! Typed frames carried inside inner packets
//!
//! Every frame is encoded as a one-byte type followed by a length-prefixed
//! body, so decoders skip frame types they do not understand.

use super::varint::{
    get_var_bytes, get_var_str, get_var_uint, put_var_bytes, put_var_uint, var_bytes_len,
    var_uint_len,
};
use super::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire identifiers of the known frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    ConnectionClose = 0x01,
    ConnectionNewAddress = 0x02,
    ConnectionMaxData = 0x03,
    ConnectionDataBlocked = 0x04,
    ConnectionMaxStreamId = 0x05,
    ConnectionStreamIdBlocked = 0x06,
    ConnectionAssetDetails = 0x07,
    StreamClose = 0x10,
    StreamMoney = 0x11,
    StreamMaxMoney = 0x12,
    StreamMoneyBlocked = 0x13,
    StreamData = 0x14,
    StreamMaxData = 0x15,
    StreamDataBlocked = 0x16,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<FrameType> {
        match value {
            0x01 => Some(FrameType::ConnectionClose),
            0x02 => Some(FrameType::ConnectionNewAddress),
            0x03 => Some(FrameType::ConnectionMaxData),
            0x04 => Some(FrameType::ConnectionDataBlocked),
            0x05 => Some(FrameType::ConnectionMaxStreamId),
            0x06 => Some(FrameType::ConnectionStreamIdBlocked),
            0x07 => Some(FrameType::ConnectionAssetDetails),
            0x10 => Some(FrameType::StreamClose),
            0x11 => Some(FrameType::StreamMoney),
            0x12 => Some(FrameType::StreamMaxMoney),
            0x13 => Some(FrameType::StreamMoneyBlocked),
            0x14 => Some(FrameType::StreamData),
            0x15 => Some(FrameType::StreamMaxData),
            0x16 => Some(FrameType::StreamDataBlocked),
            _ => None,
        }
    }
}

/// Error codes carried by ConnectionClose and StreamClose frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0x01,
    InternalError = 0x02,
    FlowControlError = 0x03,
    StreamIdError = 0x04,
    StreamStateError = 0x05,
    ProtocolViolation = 0x06,
    ApplicationError = 0x07,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> ErrorCode {
        match value {
            0x01 => ErrorCode::NoError,
            0x03 => ErrorCode::FlowControlError,
            0x04 => ErrorCode::StreamIdError,
            0x05 => ErrorCode::StreamStateError,
            0x06 => ErrorCode::ProtocolViolation,
            0x07 => ErrorCode::ApplicationError,
            // Unknown codes degrade to InternalError rather than failing
            // the whole packet.
            _ => ErrorCode::InternalError,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectionClose {
        code: ErrorCode,
        message: String,
    },
    ConnectionNewAddress {
        source_account: String,
    },
    ConnectionMaxData {
        max_offset: u64,
    },
    ConnectionDataBlocked {
        max_offset: u64,
    },
    ConnectionMaxStreamId {
        max_stream_id: u64,
    },
    ConnectionStreamIdBlocked {
        max_stream_id: u64,
    },
    ConnectionAssetDetails {
        source_asset_code: String,
        source_asset_scale: u8,
    },
    StreamClose {
        stream_id: u64,
        code: ErrorCode,
        message: String,
    },
    StreamMoney {
        stream_id: u64,
        shares: u64,
    },
    StreamMaxMoney {
        stream_id: u64,
        receive_max: u64,
        total_received: u64,
    },
    StreamMoneyBlocked {
        stream_id: u64,
        send_max: u64,
        total_sent: u64,
    },
    StreamData {
        stream_id: u64,
        offset: u64,
        data: Bytes,
    },
    StreamMaxData {
        stream_id: u64,
        max_offset: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        max_offset: u64,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectionClose { .. } => FrameType::ConnectionClose,
            Frame::ConnectionNewAddress { .. } => FrameType::ConnectionNewAddress,
            Frame::ConnectionMaxData { .. } => FrameType::ConnectionMaxData,
            Frame::ConnectionDataBlocked { .. } => FrameType::ConnectionDataBlocked,
            Frame::ConnectionMaxStreamId { .. } => FrameType::ConnectionMaxStreamId,
            Frame::ConnectionStreamIdBlocked { .. } => FrameType::ConnectionStreamIdBlocked,
            Frame::ConnectionAssetDetails { .. } => FrameType::ConnectionAssetDetails,
            Frame::StreamClose { .. } => FrameType::StreamClose,
            Frame::StreamMoney { .. } => FrameType::StreamMoney,
            Frame::StreamMaxMoney { .. } => FrameType::StreamMaxMoney,
            Frame::StreamMoneyBlocked { .. } => FrameType::StreamMoneyBlocked,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamMaxData { .. } => FrameType::StreamMaxData,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
        }
    }

    /// The stream this frame addresses, if it is stream-scoped.
    pub fn stream_id(&self) -> Option<u64> {
        match *self {
            Frame::StreamClose { stream_id, .. }
            | Frame::StreamMoney { stream_id, .. }
            | Frame::StreamMaxMoney { stream_id, .. }
            | Frame::StreamMoneyBlocked { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamMaxData { stream_id, .. }
            | Frame::StreamDataBlocked { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }

    /// True for frames that move value or bytes, as opposed to pure
    /// control signalling.
    pub fn carries_value_or_data(&self) -> bool {
        matches!(self, Frame::StreamMoney { .. } | Frame::StreamData { .. })
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::ConnectionClose { message, .. } => 1 + var_bytes_len(message.as_bytes()),
            Frame::ConnectionNewAddress { source_account } => {
                var_bytes_len(source_account.as_bytes())
            }
            Frame::ConnectionMaxData { max_offset }
            | Frame::ConnectionDataBlocked { max_offset } => var_uint_len(*max_offset),
            Frame::ConnectionMaxStreamId { max_stream_id }
            | Frame::ConnectionStreamIdBlocked { max_stream_id } => var_uint_len(*max_stream_id),
            Frame::ConnectionAssetDetails {
                source_asset_code, ..
            } => var_bytes_len(source_asset_code.as_bytes()) + 1,
            Frame::StreamClose {
                stream_id, message, ..
            } => var_uint_len(*stream_id) + 1 + var_bytes_len(message.as_bytes()),
            Frame::StreamMoney { stream_id, shares } => {
                var_uint_len(*stream_id) + var_uint_len(*shares)
            }
            Frame::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => var_uint_len(*stream_id) + var_uint_len(*receive_max) + var_uint_len(*total_received),
            Frame::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => var_uint_len(*stream_id) + var_uint_len(*send_max) + var_uint_len(*total_sent),
            Frame::StreamData {
                stream_id,
                offset,
                data,
            } => var_uint_len(*stream_id) + var_uint_len(*offset) + var_bytes_len(data),
            Frame::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Frame::StreamDataBlocked {
                stream_id,
                max_offset,
            } => var_uint_len(*stream_id) + var_uint_len(*max_offset),
        }
    }

    /// Total encoded size: type byte, body length prefix, body.
    pub fn encoded_len(&self) -> usize {
        let body = self.body_len();
        1 + var_uint_len(body as u64) + body
    }

    /// Append this frame's wire encoding.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.frame_type() as u8);
        put_var_uint(buf, self.body_len() as u64);

        match self {
            Frame::ConnectionClose { code, message } => {
                buf.put_u8(*code as u8);
                put_var_bytes(buf, message.as_bytes());
            }
            Frame::ConnectionNewAddress { source_account } => {
                put_var_bytes(buf, source_account.as_bytes());
            }
            Frame::ConnectionMaxData { max_offset }
            | Frame::ConnectionDataBlocked { max_offset } => {
                put_var_uint(buf, *max_offset);
            }
            Frame::ConnectionMaxStreamId { max_stream_id }
            | Frame::ConnectionStreamIdBlocked { max_stream_id } => {
                put_var_uint(buf, *max_stream_id);
            }
            Frame::ConnectionAssetDetails {
                source_asset_code,
                source_asset_scale,
            } => {
                put_var_bytes(buf, source_asset_code.as_bytes());
                buf.put_u8(*source_asset_scale);
            }
            Frame::StreamClose {
                stream_id,
                code,
                message,
            } => {
                put_var_uint(buf, *stream_id);
                buf.put_u8(*code as u8);
                put_var_bytes(buf, message.as_bytes());
            }
            Frame::StreamMoney { stream_id, shares } => {
                put_var_uint(buf, *stream_id);
                put_var_uint(buf, *shares);
            }
            Frame::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => {
                put_var_uint(buf, *stream_id);
                put_var_uint(buf, *receive_max);
                put_var_uint(buf, *total_received);
            }
            Frame::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => {
                put_var_uint(buf, *stream_id);
                put_var_uint(buf, *send_max);
                put_var_uint(buf, *total_sent);
            }
            Frame::StreamData {
                stream_id,
                offset,
                data,
            } => {
                put_var_uint(buf, *stream_id);
                put_var_uint(buf, *offset);
                put_var_bytes(buf, data);
            }
            Frame::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Frame::StreamDataBlocked {
                stream_id,
                max_offset,
            } => {
                put_var_uint(buf, *stream_id);
                put_var_uint(buf, *max_offset);
            }
        }
    }

    /// Decode one frame. `Ok(None)` means an unknown frame type was skipped
    /// via its length prefix.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::UnexpectedEof);
        }
        let type_byte = buf.get_u8();
        let body_len = get_var_uint(buf)? as usize;
        if buf.remaining() < body_len {
            return Err(CodecError::UnexpectedEof);
        }
        let mut body = buf.split_to(body_len);

        let Some(frame_type) = FrameType::from_u8(type_byte) else {
            return Ok(None);
        };

        let frame = match frame_type {
            FrameType::ConnectionClose => {
                if body.remaining() < 1 {
                    return Err(CodecError::UnexpectedEof);
                }
                Frame::ConnectionClose {
                    code: ErrorCode::from(body.get_u8()),
                    message: get_var_str(&mut body)?,
                }
            }
            FrameType::ConnectionNewAddress => Frame::ConnectionNewAddress {
                source_account: get_var_str(&mut body)?,
            },
            FrameType::ConnectionMaxData => Frame::ConnectionMaxData {
                max_offset: get_var_uint(&mut body)?,
            },
            FrameType::ConnectionDataBlocked => Frame::ConnectionDataBlocked {
                max_offset: get_var_uint(&mut body)?,
            },
            FrameType::ConnectionMaxStreamId => Frame::ConnectionMaxStreamId {
                max_stream_id: get_var_uint(&mut body)?,
            },
            FrameType::ConnectionStreamIdBlocked => Frame::ConnectionStreamIdBlocked {
                max_stream_id: get_var_uint(&mut body)?,
            },
            FrameType::ConnectionAssetDetails => {
                let source_asset_code = get_var_str(&mut body)?;
                if body.remaining() < 1 {
                    return Err(CodecError::UnexpectedEof);
                }
                Frame::ConnectionAssetDetails {
                    source_asset_code,
                    source_asset_scale: body.get_u8(),
                }
            }
            FrameType::StreamClose => {
                let stream_id = get_var_uint(&mut body)?;
                if body.remaining() < 1 {
                    return Err(CodecError::UnexpectedEof);
                }
                Frame::StreamClose {
                    stream_id,
                    code: ErrorCode::from(body.get_u8()),
                    message: get_var_str(&mut body)?,
                }
            }
            FrameType::StreamMoney => Frame::StreamMoney {
                stream_id: get_var_uint(&mut body)?,
                shares: get_var_uint(&mut body)?,
            },
            FrameType::StreamMaxMoney => Frame::StreamMaxMoney {
                stream_id: get_var_uint(&mut body)?,
                receive_max: get_var_uint(&mut body)?,
                total_received: get_var_uint(&mut body)?,
            },
            FrameType::StreamMoneyBlocked => Frame::StreamMoneyBlocked {
                stream_id: get_var_uint(&mut body)?,
                send_max: get_var_uint(&mut body)?,
                total_sent: get_var_uint(&mut body)?,
            },
            FrameType::StreamData => {
                let stream_id = get_var_uint(&mut body)?;
                let offset = get_var_uint(&mut body)?;
                let data = get_var_bytes(&mut body)?;
                Frame::StreamData {
                    stream_id,
                    offset,
                    data,
                }
            }
            FrameType::StreamMaxData => Frame::StreamMaxData {
                stream_id: get_var_uint(&mut body)?,
                max_offset: get_var_uint(&mut body)?,
            },
            FrameType::StreamDataBlocked => Frame::StreamDataBlocked {
                stream_id: get_var_uint(&mut body)?,
                max_offset: get_var_uint(&mut body)?,
            },
        };

        Ok(Some(frame))
    }
}
