// =============================================================================
// Open API wire codec — length-prefixed protobuf envelope
// =============================================================================
//
// The RPC broker frames every message as a 4-byte big-endian length followed
// by a protobuf `ProtoMessage` envelope:
//
//   field 1 (varint) payloadType
//   field 2 (bytes)  payload        — the inner message, also protobuf
//   field 3 (string) clientMsgId    — echoed back by the server
//
// Only the handful of field shapes the adapter needs are implemented here
// (varint, 64-bit double, length-delimited), which keeps the codec small and
// dependency-free. Unknown fields are skipped, so schema additions on the
// broker side do not break decoding.
// =============================================================================

use std::fmt;

/// Wire types used by the protocol subset.
const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Payload type identifiers for the messages the adapter exchanges.
pub mod payload_type {
    pub const HEARTBEAT_EVENT: u32 = 51;
    pub const APPLICATION_AUTH_REQ: u32 = 2100;
    pub const APPLICATION_AUTH_RES: u32 = 2101;
    pub const ACCOUNT_AUTH_REQ: u32 = 2102;
    pub const ACCOUNT_AUTH_RES: u32 = 2103;
    pub const NEW_ORDER_REQ: u32 = 2106;
    pub const CANCEL_ORDER_REQ: u32 = 2108;
    pub const SYMBOLS_LIST_REQ: u32 = 2114;
    pub const SYMBOLS_LIST_RES: u32 = 2115;
    pub const TRADER_REQ: u32 = 2121;
    pub const TRADER_RES: u32 = 2122;
    pub const RECONCILE_REQ: u32 = 2124;
    pub const RECONCILE_RES: u32 = 2125;
    pub const EXECUTION_EVENT: u32 = 2126;
    pub const ORDER_ERROR_EVENT: u32 = 2132;
    pub const ERROR_RES: u32 = 2142;
    pub const ACCOUNT_LIST_REQ: u32 = 2149;
    pub const ACCOUNT_LIST_RES: u32 = 2150;
}

/// Malformed frame or envelope.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodeError(pub &'static str);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

// =============================================================================
// Writer
// =============================================================================

/// Minimal protobuf message writer.
#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn put_key(&mut self, field: u32, wire: u8) {
        self.put_raw_varint(((field as u64) << 3) | wire as u64);
    }

    fn put_raw_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Unsigned varint field. Zero values are still written; the receiving
    /// side treats presence as intent.
    pub fn varint(&mut self, field: u32, value: u64) -> &mut Self {
        self.put_key(field, WIRE_VARINT);
        self.put_raw_varint(value);
        self
    }

    pub fn int64(&mut self, field: u32, value: i64) -> &mut Self {
        self.varint(field, value as u64)
    }

    /// 64-bit double, little endian.
    pub fn double(&mut self, field: u32, value: f64) -> &mut Self {
        self.put_key(field, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) -> &mut Self {
        self.put_key(field, WIRE_LEN);
        self.put_raw_varint(value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, field: u32, value: &str) -> &mut Self {
        self.bytes(field, value.as_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Decoded field value.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Varint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_u64().map(|v| v as i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Fixed64(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Streaming field reader over one message.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_raw_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(DecodeError("varint truncated"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(DecodeError("varint overflow"));
            }
        }
    }

    /// Next (field number, value) pair, or `None` at end of message.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.read_raw_varint()?;
        let field = (key >> 3) as u32;
        let wire = (key & 0x7) as u8;

        let value = match wire {
            WIRE_VARINT => FieldValue::Varint(self.read_raw_varint()?),
            WIRE_FIXED64 => {
                let end = self.pos + 8;
                let bytes = self
                    .buf
                    .get(self.pos..end)
                    .ok_or(DecodeError("fixed64 truncated"))?;
                self.pos = end;
                FieldValue::Fixed64(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            WIRE_FIXED32 => {
                let end = self.pos + 4;
                let bytes = self
                    .buf
                    .get(self.pos..end)
                    .ok_or(DecodeError("fixed32 truncated"))?;
                self.pos = end;
                FieldValue::Fixed32(u32::from_le_bytes(bytes.try_into().unwrap()))
            }
            WIRE_LEN => {
                let len = self.read_raw_varint()? as usize;
                let end = self.pos + len;
                let bytes = self
                    .buf
                    .get(self.pos..end)
                    .ok_or(DecodeError("length-delimited field truncated"))?;
                self.pos = end;
                FieldValue::Bytes(bytes)
            }
            _ => return Err(DecodeError("unsupported wire type")),
        };
        Ok(Some((field, value)))
    }

    /// Collect all occurrences of one field, decoding order preserved.
    pub fn collect_field(buf: &'a [u8], wanted: u32) -> Result<Vec<FieldValue<'a>>, DecodeError> {
        let mut reader = Self::new(buf);
        let mut out = Vec::new();
        while let Some((field, value)) = reader.next_field()? {
            if field == wanted {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// First occurrence of one field.
    pub fn find_field(buf: &'a [u8], wanted: u32) -> Result<Option<FieldValue<'a>>, DecodeError> {
        let mut reader = Self::new(buf);
        while let Some((field, value)) = reader.next_field()? {
            if field == wanted {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Outer `ProtoMessage` wrapper carried in every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload_type: u32,
    pub payload: Vec<u8>,
    pub client_msg_id: Option<String>,
}

impl Envelope {
    pub fn new(payload_type: u32, payload: Vec<u8>, client_msg_id: Option<String>) -> Self {
        Self {
            payload_type,
            payload,
            client_msg_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.varint(1, self.payload_type as u64);
        w.bytes(2, &self.payload);
        if let Some(id) = &self.client_msg_id {
            w.string(3, id);
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut payload_type = None;
        let mut payload = Vec::new();
        let mut client_msg_id = None;

        let mut reader = MessageReader::new(buf);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => payload_type = value.as_u64().map(|v| v as u32),
                2 => {
                    payload = value
                        .as_bytes()
                        .ok_or(DecodeError("payload has wrong wire type"))?
                        .to_vec()
                }
                3 => client_msg_id = value.as_str().map(str::to_string),
                _ => {}
            }
        }

        Ok(Self {
            payload_type: payload_type.ok_or(DecodeError("envelope missing payloadType"))?,
            payload,
            client_msg_id,
        })
    }

    /// Frame for the wire: 4-byte big-endian length then the envelope.
    pub fn to_frame(&self) -> Vec<u8> {
        let body = self.encode();
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut w = MessageWriter::new();
            w.varint(1, v);
            let buf = w.finish();
            let field = MessageReader::find_field(&buf, 1).unwrap().unwrap();
            assert_eq!(field.as_u64(), Some(v));
        }
    }

    #[test]
    fn double_roundtrip() {
        let mut w = MessageWriter::new();
        w.double(7, 1.0850);
        let buf = w.finish();
        let field = MessageReader::find_field(&buf, 7).unwrap().unwrap();
        assert_eq!(field.as_f64(), Some(1.0850));
    }

    #[test]
    fn string_and_nested_message() {
        let mut inner = MessageWriter::new();
        inner.varint(1, 42).string(2, "EURUSD");
        let inner_buf = inner.finish();

        let mut outer = MessageWriter::new();
        outer.bytes(5, &inner_buf).string(3, "msg-1");
        let buf = outer.finish();

        let nested = MessageReader::find_field(&buf, 5).unwrap().unwrap();
        let nested_buf = nested.as_bytes().unwrap();
        assert_eq!(
            MessageReader::find_field(nested_buf, 1)
                .unwrap()
                .unwrap()
                .as_u64(),
            Some(42)
        );
        assert_eq!(
            MessageReader::find_field(nested_buf, 2)
                .unwrap()
                .unwrap()
                .as_str(),
            Some("EURUSD")
        );
        assert_eq!(
            MessageReader::find_field(&buf, 3).unwrap().unwrap().as_str(),
            Some("msg-1")
        );
    }

    #[test]
    fn repeated_fields_collected_in_order() {
        let mut w = MessageWriter::new();
        w.varint(4, 1).varint(4, 2).varint(9, 99).varint(4, 3);
        let buf = w.finish();
        let values: Vec<u64> = MessageReader::collect_field(&buf, 4)
            .unwrap()
            .iter()
            .filter_map(|v| v.as_u64())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn unknown_fields_skipped() {
        let mut w = MessageWriter::new();
        w.double(11, 2.5).string(12, "ignored").varint(2, 7);
        let buf = w.finish();
        assert_eq!(
            MessageReader::find_field(&buf, 2).unwrap().unwrap().as_u64(),
            Some(7)
        );
    }

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(
            payload_type::ACCOUNT_AUTH_REQ,
            vec![1, 2, 3, 4],
            Some("req-7".to_string()),
        );
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn envelope_without_msg_id() {
        let env = Envelope::new(payload_type::HEARTBEAT_EVENT, Vec::new(), None);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.payload_type, payload_type::HEARTBEAT_EVENT);
        assert!(decoded.client_msg_id.is_none());
    }

    #[test]
    fn frame_carries_length_prefix() {
        let env = Envelope::new(payload_type::TRADER_REQ, vec![9; 10], None);
        let frame = env.to_frame();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(Envelope::decode(&frame[4..]).unwrap(), env);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let env = Envelope::new(payload_type::TRADER_RES, vec![1; 32], Some("x".into()));
        let buf = env.encode();
        assert!(Envelope::decode(&buf[..buf.len() - 5]).is_err());
    }
}
