//! Frame level codec: start/end markers and the 16 bit checksum trailer.
//!
//! A frame on the wire looks like `~<ascii hex body><4 hex checksum>\r`.
//! The checksum is the two's complement of the byte sum of the ASCII body,
//! truncated to 16 bits.

use crate::Error;

pub const START_BYTE: u8 = b'~';
pub const END_BYTE: u8 = b'\r';
/// Smallest frame a battery can produce: markers, 12 header digits and checksum.
pub const MIN_FRAME_LENGTH: usize = 16;
pub const CHECKSUM_LENGTH: usize = 4;

/// Two's complement of the byte sum, modulo 2^16.
pub fn checksum(data: &[u8]) -> u16 {
    let sum = data
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    (!sum).wrapping_add(1)
}

/// Wraps a packet body into a complete frame ready to be sent.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + CHECKSUM_LENGTH + 2);
    frame.push(START_BYTE);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(format!("{:04X}", checksum(payload)).as_bytes());
    frame.push(END_BYTE);
    frame
}

/// Validates a received frame and returns the packet body without markers and checksum.
///
/// Leading noise before the start marker is discarded.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, Error> {
    let start = frame
        .iter()
        .position(|b| *b == START_BYTE)
        .ok_or_else(|| Error::Framing(format!("no start marker in {} bytes", frame.len())))?;
    if start > 0 {
        log::trace!("Dropping {start} bytes of noise before start marker");
    }
    let frame = &frame[start..];

    if frame.len() < MIN_FRAME_LENGTH {
        log::warn!(
            "Invalid frame size - required={} received={}",
            MIN_FRAME_LENGTH,
            frame.len()
        );
        return Err(Error::Framing(format!(
            "frame of {} bytes is shorter than {MIN_FRAME_LENGTH}",
            frame.len()
        )));
    }
    if frame[frame.len() - 1] != END_BYTE {
        return Err(Error::Framing(format!(
            "no end marker, last byte is {:02X}",
            frame[frame.len() - 1]
        )));
    }

    let body = &frame[1..frame.len() - 1];
    if body.contains(&START_BYTE) {
        return Err(Error::Framing("more than one start marker".into()));
    }

    let (payload, trailer) = body.split_at(body.len() - CHECKSUM_LENGTH);
    let received = std::str::from_utf8(trailer)
        .ok()
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::Framing(format!("invalid checksum digits {trailer:02X?}")))?;
    let calculated = checksum(payload);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} frame={:?}",
            String::from_utf8_lossy(frame)
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANALOG_REQUEST: &[u8] = b"20024642E00202";

    #[test]
    fn checksum_of_known_request() {
        // ~20024642E00202FD33\r is the analog value request for the first module
        assert_eq!(checksum(ANALOG_REQUEST), 0xFD33);
        assert_eq!(encode(ANALOG_REQUEST), b"~20024642E00202FD33\r".to_vec());
    }

    #[test]
    fn checksum_wraps_to_sixteen_bits() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xFFFF);
        // 257 * 0xFF == 0xFFFF
        assert_eq!(checksum(&[0xFF; 257]), 0x0001);
    }

    #[test]
    fn decode_returns_encoded_payload() {
        for payload in [
            &b"20024642E00202"[..],
            b"2002460000000000",
            b"200246001096000102030405060708090A0B0C0D0E0F",
        ] {
            assert_eq!(decode(&encode(payload)).unwrap(), payload);
        }
    }

    #[test]
    fn decode_trims_leading_noise() {
        let mut frame = vec![0x00, 0xFF, b'\r'];
        frame.extend(encode(ANALOG_REQUEST));
        assert_eq!(decode(&frame).unwrap(), ANALOG_REQUEST);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let frame = encode(ANALOG_REQUEST);
        // every byte between the start marker and the checksum trailer
        for index in 1..=ANALOG_REQUEST.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                assert!(
                    matches!(decode(&corrupted), Err(Error::Checksum { .. })),
                    "flip of bit {bit} in byte {index} not detected"
                );
            }
        }
    }

    #[test]
    fn framing_errors() {
        assert!(matches!(decode(b"~2002\r"), Err(Error::Framing(_))));
        assert!(matches!(
            decode(b"20024642E00202FD33\r"),
            Err(Error::Framing(_))
        ));

        let mut frame = encode(ANALOG_REQUEST);
        frame.pop();
        assert!(matches!(decode(&frame), Err(Error::Framing(_))));

        let mut frame = encode(ANALOG_REQUEST);
        frame[3] = START_BYTE;
        assert!(matches!(decode(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn checksum_error_carries_both_values() {
        let frame = b"~20024642E00202FD34\r";
        match decode(frame) {
            Err(Error::Checksum {
                calculated,
                received,
            }) => {
                assert_eq!(calculated, 0xFD33);
                assert_eq!(received, 0xFD34);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
