//! Client-side MySQL handshake and generic response packets

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};

/// Cursor over a handshake payload; every read is bounds-checked so a
/// truncated packet surfaces as None instead of a panic.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes up to a NUL (consumed), or everything left when there is none.
    fn until_nul(&mut self) -> &'a [u8] {
        match self.0.iter().position(|&b| b == 0) {
            Some(pos) => {
                let head = &self.0[..pos];
                self.0 = &self.0[pos + 1..];
                head
            }
            None => std::mem::take(&mut self.0),
        }
    }
}

/// Initial handshake packet received from the server
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = Reader(payload);

        let protocol_version = reader.u8()?;
        let server_version = String::from_utf8_lossy(reader.until_nul()).into_owned();
        let connection_id = reader.u32_le()?;

        let mut auth_plugin_data = reader.take(8)?.to_vec();
        reader.take(1)?; // filler

        let caps_low = reader.u16_le()? as u32;
        let _character_set = reader.u8()?;
        let _status_flags = reader.u16_le()?;
        let caps_high = reader.u16_le()? as u32;
        let capability_flags = caps_low | (caps_high << 16);

        let scramble_len = reader.u8()? as usize;
        reader.take(10)?; // reserved

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // Second scramble half: the announced length minus the 8 bytes
            // already read; servers pad this to at least 13 bytes including
            // its trailing NUL
            let tail = reader.take(scramble_len.saturating_sub(8).max(13))?;
            let data = tail
                .iter()
                .position(|&b| b == 0)
                .map_or(tail, |pos| &tail[..pos]);
            auth_plugin_data.extend_from_slice(data);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            let name = reader.until_nul();
            if name.is_empty() {
                "mysql_native_password".to_string()
            } else {
                String::from_utf8_lossy(name).into_owned()
            }
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// Handshake response sent back to the server
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Encode to a packet with the given sequence id
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = &self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// mysql_native_password scramble:
/// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(stage2);
    let scrambled = hasher.finalize();

    stage1
        .iter()
        .zip(scrambled.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Error packet from the server
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub error_message: String,
}

impl ErrPacket {
    /// Parse from payload starting with the 0xFF marker
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 || payload[0] != 0xFF {
            return None;
        }
        let error_code = u16::from_le_bytes([payload[1], payload[2]]);
        let mut rest = &payload[3..];
        // Protocol 4.1 inserts '#' + 5-byte SQL state before the message
        if rest.first() == Some(&b'#') && rest.len() >= 6 {
            rest = &rest[6..];
        }
        let error_message = String::from_utf8_lossy(rest).to_string();
        Some(Self {
            error_code,
            error_message,
        })
    }
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00) && payload.len() >= 7
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plausible MariaDB greeting: 20-byte scramble split 8 + 12,
    /// announced as 21 including the trailing NUL.
    fn sample_greeting() -> Vec<u8> {
        let caps: u32 = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;

        let mut payload = Vec::new();
        payload.push(10);
        payload.extend_from_slice(b"10.6.7-MariaDB\0");
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(b"abcdefgh");
        payload.push(0); // filler
        payload.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        payload.push(0x21); // character set
        payload.extend_from_slice(&2u16.to_le_bytes()); // status flags
        payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        payload.push(21); // scramble length
        payload.extend_from_slice(&[0u8; 10]); // reserved
        payload.extend_from_slice(b"ijklmnopqrst\0");
        payload.extend_from_slice(b"mysql_native_password\0");
        payload
    }

    #[test]
    fn test_parse_initial_handshake() {
        let handshake = InitialHandshake::parse(&sample_greeting()).unwrap();
        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.server_version, "10.6.7-MariaDB");
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.auth_plugin_data, b"abcdefghijklmnopqrst");
        assert_eq!(handshake.auth_plugin_name, "mysql_native_password");
        assert!(handshake.capability_flags & CLIENT_SECURE_CONNECTION != 0);
    }

    #[test]
    fn test_parse_truncated_handshake() {
        let greeting = sample_greeting();
        assert!(InitialHandshake::parse(&greeting[..20]).is_none());
    }

    #[test]
    fn test_auth_response_empty_password() {
        assert!(compute_auth_response("", &[1u8; 20]).is_empty());
    }

    #[test]
    fn test_auth_response_length_and_keying() {
        let nonce = [7u8; 20];
        let a = compute_auth_response("secret", &nonce);
        let b = compute_auth_response("other", &nonce);
        assert_eq!(a.len(), 20);
        assert_eq!(b.len(), 20);
        assert_ne!(a, b);
        // Same inputs must scramble identically
        assert_eq!(a, compute_auth_response("secret", &nonce));
    }

    #[test]
    fn test_err_packet_parse() {
        let mut payload = vec![0xFF, 0x15, 0x04]; // 1045
        payload.extend_from_slice(b"#28000Access denied");
        let err = ErrPacket::parse(&payload).unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_packet_classification() {
        assert!(is_err_packet(&[0xFF, 0, 0]));
        assert!(is_ok_packet(&[0x00, 0, 0, 2, 0, 0, 0]));
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE; 12]));
    }
}
