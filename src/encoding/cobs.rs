//! Consistent-Overhead Byte Stuffing.
//!
//! Encoded output contains no zero bytes, so a single `0x00` unambiguously
//! delimits frames on the wire and in log files. The delimiter itself is not
//! part of the encoding; callers append (or prepend) it where their framing
//! needs it.
//!
//! Overhead is one code byte per frame plus one per 254 consecutive
//! non-zero input bytes: `|encode(x)| ≤ |x| + ⌈|x|/254⌉ + 1`.

/// Worst-case encoded size for `len` input bytes, excluding any delimiter.
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Encode `input` into `output`, returning the encoded length.
///
/// Returns `None` if `output` is too small; size it with
/// [`max_encoded_len`].
pub fn encode(input: &[u8], output: &mut [u8]) -> Option<usize> {
    if output.is_empty() {
        return None;
    }
    let mut code_pos = 0;
    let mut write = 1;
    for &byte in input {
        if byte == 0 {
            // Finish the group; the zero itself is implied by the code.
            output[code_pos] = (write - code_pos) as u8;
            code_pos = write;
            if code_pos >= output.len() {
                return None;
            }
            write += 1;
        } else {
            if write - code_pos == 0xFF {
                // 254 data bytes exhaust a group; insert an implicit code.
                output[code_pos] = 0xFF;
                code_pos = write;
                if code_pos >= output.len() {
                    return None;
                }
                write += 1;
            }
            if write >= output.len() {
                return None;
            }
            output[write] = byte;
            write += 1;
        }
    }
    output[code_pos] = (write - code_pos) as u8;
    Some(write)
}

/// Decode `input` (without its trailing delimiter) into `output`, returning
/// the decoded length.
///
/// Returns `None` on structural errors: an embedded zero byte, a group
/// running past the end of input, or `output` too small.
pub fn decode(input: &[u8], output: &mut [u8]) -> Option<usize> {
    let mut read = 0;
    let mut write = 0;
    while read < input.len() {
        let code = input[read];
        read += 1;
        if code == 0 {
            return None;
        }
        let data_len = usize::from(code) - 1;
        if read + data_len > input.len() {
            return None;
        }
        for _ in 0..data_len {
            let byte = input[read];
            read += 1;
            if byte == 0 {
                return None;
            }
            if write >= output.len() {
                return None;
            }
            output[write] = byte;
            write += 1;
        }
        // A maximal group carries no implied zero; any other group does,
        // unless it ends the frame.
        if code != 0xFF && read < input.len() {
            if write >= output.len() {
                return None;
            }
            output[write] = 0;
            write += 1;
        }
    }
    Some(write)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::vec::Vec;

    fn roundtrip(input: &[u8]) {
        let mut encoded = vec![0u8; max_encoded_len(input.len())];
        let encoded_len = encode(input, &mut encoded).unwrap();
        encoded.truncate(encoded_len);

        assert!(
            encoded_len <= input.len() + input.len().div_ceil(254) + 1,
            "length bound violated for input of {} bytes",
            input.len()
        );
        assert!(
            !encoded.contains(&0),
            "encoded output contains a zero byte"
        );

        let mut decoded = vec![0u8; input.len() + 1];
        let decoded_len = decode(&encoded, &mut decoded).unwrap();
        assert_eq!(&decoded[..decoded_len], input);
    }

    #[test]
    fn canonical_vectors() {
        let mut out = [0u8; 16];
        assert_eq!(encode(&[], &mut out), Some(1));
        assert_eq!(out[0], 0x01);

        assert_eq!(encode(&[0x00], &mut out), Some(2));
        assert_eq!(&out[..2], &[0x01, 0x01]);

        assert_eq!(encode(&[0x00, 0x00], &mut out), Some(3));
        assert_eq!(&out[..3], &[0x01, 0x01, 0x01]);

        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33], &mut out), Some(5));
        assert_eq!(&out[..5], &[0x03, 0x11, 0x22, 0x02, 0x33]);

        assert_eq!(encode(&[0x11, 0x00, 0x00, 0x00], &mut out), Some(5));
        assert_eq!(&out[..5], &[0x02, 0x11, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn group_boundary_at_254() {
        // 254 non-zero bytes: a single maximal group, no phantom zero.
        let input: Vec<u8> = (0..254u32).map(|i| (i % 255 + 1) as u8).collect();
        let mut encoded = vec![0u8; max_encoded_len(input.len())];
        let len = encode(&input, &mut encoded).unwrap();
        assert_eq!(len, 255);
        assert_eq!(encoded[0], 0xFF);
        roundtrip(&input);

        // One more byte forces a second group.
        let mut longer = input.clone();
        longer.push(0xAA);
        let len = encode(&longer, &mut encoded).unwrap();
        assert_eq!(len, 257);
        roundtrip(&longer);
    }

    #[test]
    fn roundtrip_lengths_0_to_4096() {
        // Pseudo-random payload with embedded zero runs, every length up to
        // 4096 in coarse steps, plus all short lengths.
        let mut state = 0x12345678u32;
        let mut next = || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        };
        let payload: Vec<u8> = (0..4096).map(|_| next()).collect();

        for len in 0..64 {
            roundtrip(&payload[..len]);
        }
        for len in (64..=4096).step_by(97) {
            roundtrip(&payload[..len]);
        }
        roundtrip(&payload);

        // All zeroes and no zeroes at interesting sizes.
        roundtrip(&vec![0u8; 1000]);
        roundtrip(&vec![0x42u8; 1000]);
    }

    #[test]
    fn decode_rejects_structural_errors() {
        let mut out = [0u8; 64];
        // Embedded zero where a code byte is expected.
        assert_eq!(decode(&[0x02, 0x11, 0x00], &mut out), None);
        // Group runs past end of input.
        assert_eq!(decode(&[0x05, 0x11, 0x22], &mut out), None);
        // Zero inside a group.
        assert_eq!(decode(&[0x03, 0x00, 0x11], &mut out), None);
    }

    #[test]
    fn encode_rejects_short_output() {
        let mut out = [0u8; 4];
        assert_eq!(encode(&[1, 2, 3, 4], &mut out), None);
        assert_eq!(encode(&[0, 0, 0, 0], &mut out), None);
    }
}
