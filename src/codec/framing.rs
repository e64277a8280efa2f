//! Prefix framing for the duplicated send paths
//!
//! Reliable messages travel as `[4-byte big-endian length][payload]` over a
//! byte stream; unreliable messages travel as `[4-byte big-endian sequence
//! number][payload]` in a single datagram.
//!
//! Every frame is built once as a [`Bytes`] and a clone is handed to each of
//! the two transport submissions. The clone only bumps the shared refcount,
//! so the backing allocation lives exactly as long as the slowest submission
//! and is freed when the last owner drops, whichever side finishes first.

use bytes::{BufMut, Bytes, BytesMut};

/// Width of the length or sequence prefix.
pub const PREFIX_LEN: usize = 4;

/// Largest payload accepted on a reliable lane.
pub const MAX_RELIABLE_PAYLOAD: usize = 65512;

/// Builds a length-prefixed reliable frame.
///
/// Returns `None` when the payload exceeds [`MAX_RELIABLE_PAYLOAD`]; nothing
/// is allocated in that case.
pub fn encode_reliable(payload: &[u8]) -> Option<Bytes> {
    if payload.len() > MAX_RELIABLE_PAYLOAD {
        return None;
    }
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Some(buf.freeze())
}

/// Builds a sequence-numbered unreliable frame.
pub fn encode_datagram(sequence: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(sequence);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads the big-endian prefix of a frame, length or sequence number alike.
pub fn decode_prefix(data: &[u8]) -> Option<u32> {
    if data.len() < PREFIX_LEN {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Pops one complete message off the front of a reassembly buffer.
///
/// Returns `None` while the buffer holds less than a prefix or less than the
/// announced payload. Callers loop until `None` since one received chunk can
/// complete several messages.
pub fn take_frame(buffer: &mut Vec<u8>) -> Option<Bytes> {
    let length = decode_prefix(buffer)? as usize;
    if buffer.len() < PREFIX_LEN + length {
        return None;
    }
    let message = Bytes::copy_from_slice(&buffer[PREFIX_LEN..PREFIX_LEN + length]);
    buffer.drain(..PREFIX_LEN + length);
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_roundtrip() {
        let frame = encode_reliable(b"hello").unwrap();
        assert_eq!(frame.len(), PREFIX_LEN + 5);
        assert_eq!(decode_prefix(&frame), Some(5));

        let mut buffer = frame.to_vec();
        let message = take_frame(&mut buffer).unwrap();
        assert_eq!(&message[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn reliable_size_boundary() {
        let max = vec![0xAB; MAX_RELIABLE_PAYLOAD];
        assert!(encode_reliable(&max).is_some());

        let over = vec![0xAB; MAX_RELIABLE_PAYLOAD + 1];
        assert!(encode_reliable(&over).is_none());
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let frame = encode_reliable(b"").unwrap();
        let mut buffer = frame.to_vec();
        let message = take_frame(&mut buffer).unwrap();
        assert!(message.is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let frame = encode_reliable(b"abcdef").unwrap();

        let mut buffer = frame[..3].to_vec();
        assert!(take_frame(&mut buffer).is_none());

        buffer.extend_from_slice(&frame[3..7]);
        assert!(take_frame(&mut buffer).is_none());
        assert_eq!(buffer.len(), 7);

        buffer.extend_from_slice(&frame[7..]);
        let message = take_frame(&mut buffer).unwrap();
        assert_eq!(&message[..], b"abcdef");
    }

    #[test]
    fn several_frames_drain_in_order() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&encode_reliable(b"one").unwrap());
        buffer.extend_from_slice(&encode_reliable(b"two").unwrap());
        buffer.extend_from_slice(&encode_reliable(b"three").unwrap());

        assert_eq!(&take_frame(&mut buffer).unwrap()[..], b"one");
        assert_eq!(&take_frame(&mut buffer).unwrap()[..], b"two");
        assert_eq!(&take_frame(&mut buffer).unwrap()[..], b"three");
        assert!(take_frame(&mut buffer).is_none());
    }

    #[test]
    fn datagram_carries_sequence_number() {
        let frame = encode_datagram(7, b"state");
        assert_eq!(decode_prefix(&frame), Some(7));
        assert_eq!(&frame[PREFIX_LEN..], b"state");
    }

    #[test]
    fn cloned_frames_share_the_allocation() {
        let frame = encode_reliable(b"shared").unwrap();
        let twin = frame.clone();
        assert_eq!(frame.as_ptr(), twin.as_ptr());
    }
}
