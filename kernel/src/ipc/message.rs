//! The AMC message type and its wire envelope (spec 4.E, section 6).
//!
//! A [`Message`] lives on the kernel heap between `send` and delivery; once
//! copied into a receiver's delivery pool it is encoded as the fixed wire
//! envelope described in spec section 6 so user space can read it without
//! any kernel-side parsing help.

#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// Maximum length of an AMC service name, in bytes (spec 3, "AMC Service").
pub const SERVICE_NAME_MAX_LEN: usize = 64;

/// Maximum message body length. Spec section 9's open question leaves this
/// as "~32 KiB, a build-time constant"; this core fixes it at exactly 32
/// KiB.
pub const MAX_BODY_LEN: usize = 32 * 1024;

/// Byte offset of `length` within the wire envelope (spec section 6).
pub const ENVELOPE_LENGTH_OFFSET: usize = 0x80;
/// Byte offset of `body` within the wire envelope.
pub const ENVELOPE_BODY_OFFSET: usize = 0x84;
/// Fixed size of the envelope header (source + dest + length).
pub const ENVELOPE_HEADER_LEN: usize = ENVELOPE_BODY_OFFSET;

/// A service name: printable, NUL-padded to [`SERVICE_NAME_MAX_LEN`] bytes
/// on the wire, stored here as an owned, already-validated string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceName(alloc::string::String);

/// A service name failed validation: empty, too long, or contained a
/// non-printable byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidServiceName;

impl ServiceName {
    /// The reserved name routed to the in-kernel handler (spec section 6).
    /// Messages addressed here never enter an inbox.
    pub const CORE: &'static str = "core";

    pub fn new(name: &str) -> Result<Self, InvalidServiceName> {
        if name.is_empty() || name.len() > SERVICE_NAME_MAX_LEN {
            return Err(InvalidServiceName);
        }
        if !name.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(InvalidServiceName);
        }
        Ok(Self(alloc::string::String::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_core(&self) -> bool {
        self.0 == Self::CORE
    }

    /// Write this name into a 64-byte NUL-padded wire field.
    fn write_field(&self, field: &mut [u8; SERVICE_NAME_MAX_LEN]) {
        field.fill(0);
        let bytes = self.0.as_bytes();
        field[..bytes.len()].copy_from_slice(bytes);
    }

    /// Parse a NUL-padded 64-byte wire field back into a name.
    fn read_field(field: &[u8; SERVICE_NAME_MAX_LEN]) -> Result<Self, InvalidServiceName> {
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let s = core::str::from_utf8(&field[..len]).map_err(|_| InvalidServiceName)?;
        Self::new(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-kernel AMC message: immutable once constructed, owned by the
/// kernel heap until delivered, at which point it is encoded into the
/// destination's delivery pool and dropped.
#[derive(Debug, Clone)]
pub struct Message {
    pub source: ServiceName,
    pub dest: ServiceName,
    pub body: Vec<u8>,
}

/// Why a candidate message body was rejected before it became a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTooLarge {
    /// `len` exceeds [`MAX_BODY_LEN`].
    BodyTooLarge { len: usize },
}

impl Message {
    pub fn new(source: ServiceName, dest: ServiceName, body: &[u8]) -> Result<Self, MessageTooLarge> {
        if body.len() > MAX_BODY_LEN {
            return Err(MessageTooLarge::BodyTooLarge { len: body.len() });
        }
        Ok(Self {
            source,
            dest,
            body: Vec::from(body),
        })
    }

    /// Total size of this message once encoded on the wire: the fixed
    /// header plus the body.
    pub fn wire_len(&self) -> usize {
        ENVELOPE_HEADER_LEN + self.body.len()
    }

    /// Encode this message as the spec section 6 wire envelope into `out`.
    /// `out` must be at least [`Message::wire_len`] bytes.
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= self.wire_len(), "amc: delivery pool buffer too small for message");

        let mut source_field = [0u8; SERVICE_NAME_MAX_LEN];
        self.source.write_field(&mut source_field);
        out[0x00..0x40].copy_from_slice(&source_field);

        let mut dest_field = [0u8; SERVICE_NAME_MAX_LEN];
        self.dest.write_field(&mut dest_field);
        out[0x40..0x80].copy_from_slice(&dest_field);

        let len = self.body.len() as u32;
        out[ENVELOPE_LENGTH_OFFSET..ENVELOPE_LENGTH_OFFSET + 4].copy_from_slice(&len.to_le_bytes());

        out[ENVELOPE_BODY_OFFSET..ENVELOPE_BODY_OFFSET + self.body.len()].copy_from_slice(&self.body);
    }

    /// Decode a wire envelope back into a `Message`. Used by tests and by
    /// the `core`-origin synthetic-message path to round-trip through the
    /// same format user space sees.
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidServiceName> {
        let mut source_field = [0u8; SERVICE_NAME_MAX_LEN];
        source_field.copy_from_slice(&buf[0x00..0x40]);
        let mut dest_field = [0u8; SERVICE_NAME_MAX_LEN];
        dest_field.copy_from_slice(&buf[0x40..0x80]);

        let source = ServiceName::read_field(&source_field)?;
        let dest = ServiceName::read_field(&dest_field)?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[ENVELOPE_LENGTH_OFFSET..ENVELOPE_LENGTH_OFFSET + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let body = Vec::from(&buf[ENVELOPE_BODY_OFFSET..ENVELOPE_BODY_OFFSET + len]);
        Ok(Self { source, dest, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_rejects_empty_and_oversized() {
        assert!(ServiceName::new("").is_err());
        let too_long = "x".repeat(SERVICE_NAME_MAX_LEN + 1);
        assert!(ServiceName::new(&too_long).is_err());
        assert!(ServiceName::new(&"x".repeat(SERVICE_NAME_MAX_LEN)).is_ok());
    }

    #[test]
    fn body_over_max_is_rejected() {
        let oversized = alloc::vec![0u8; MAX_BODY_LEN + 1];
        let err = Message::new(
            ServiceName::new("a").unwrap(),
            ServiceName::new("b").unwrap(),
            &oversized,
        )
        .unwrap_err();
        assert_eq!(err, MessageTooLarge::BodyTooLarge { len: MAX_BODY_LEN + 1 });
    }

    #[test]
    fn encode_decode_round_trips() {
        let msg = Message::new(
            ServiceName::new("sender").unwrap(),
            ServiceName::new("receiver").unwrap(),
            b"hello",
        )
        .unwrap();
        let mut buf = [0u8; ENVELOPE_HEADER_LEN + 5];
        msg.encode(&mut buf);

        let decoded = Message::decode(&buf).unwrap();
        assert_eq!(decoded.source.as_str(), "sender");
        assert_eq!(decoded.dest.as_str(), "receiver");
        assert_eq!(decoded.body, b"hello");
    }

    #[test]
    fn core_is_the_reserved_name() {
        let core = ServiceName::new(ServiceName::CORE).unwrap();
        assert!(core.is_core());
    }
}
