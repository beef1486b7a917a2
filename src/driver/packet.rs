use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A frame is a 3-byte little-endian payload length, a sequence id byte,
/// then the payload.
const HEADER_LEN: usize = 4;
/// Largest payload one frame can carry
const MAX_PAYLOAD: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a command packet (command byte + argument), sequence 0.
    pub fn command(cmd: u8, arg: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + arg.len());
        payload.put_u8(cmd);
        payload.extend_from_slice(arg);
        Self::new(0, payload.freeze())
    }
}

/// Frames MySQL packets over a byte stream, for use with tokio Framed
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (payload_len, sequence_id) = match src.get(..HEADER_LEN) {
            Some(header) => (
                u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize,
                header[3],
            ),
            None => return Ok(None),
        };

        let frame_len = HEADER_LEN + payload_len;
        if src.len() < frame_len {
            // Hint how much more we need before the next readiness cycle
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        Ok(Some(Packet {
            sequence_id,
            payload: frame.slice(HEADER_LEN..),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        if len > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "payload exceeds maximum packet size",
            ));
        }

        // The top length byte is always zero here, so it can hold the
        // sequence id instead
        let mut header = (len as u32).to_le_bytes();
        header[3] = item.sequence_id;

        dst.reserve(HEADER_LEN + len);
        dst.extend_from_slice(&header);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Command bytes the monitor actually issues
pub mod commands {
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
}

/// Capability flags negotiated with the backend
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested by the monitor's client connections.
    ///
    /// CLIENT_DEPRECATE_EOF is intentionally NOT requested: some backends
    /// advertise it but still send EOF packets, so the result-set reader
    /// always expects the classic EOF framing.
    pub const CLIENT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Parse a length-encoded integer; returns (value, bytes consumed).
pub fn parse_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match data.first()? {
        v @ 0..=0xFA => Some((*v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Parse a length-encoded string; returns (value, bytes consumed).
/// 0xFB encodes SQL NULL, returned as None.
pub fn parse_lenenc_str(data: &[u8]) -> Option<(Option<String>, usize)> {
    if data.first() == Some(&0xFB) {
        return Some((None, 1));
    }
    let (len, header) = parse_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < header + len {
        return None;
    }
    let s = String::from_utf8_lossy(&data[header..header + len]).into_owned();
    Some((Some(s), header + len))
}
