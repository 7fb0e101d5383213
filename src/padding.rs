//! Message padding (spec.md SS4.5 step 3, SS4.6 "Unpad", SS8 property
//! tests): append a single `0x80` terminator, then zero bytes, so the total
//! length is a multiple of `PART_SIZE`.

use crate::error::{Error, Result};

pub const PART_SIZE: usize = 160;

pub fn pad(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + PART_SIZE);
    out.extend_from_slice(input);
    out.push(0x80);

    let remainder = out.len() % PART_SIZE;
    if remainder != 0 {
        out.resize(out.len() + (PART_SIZE - remainder), 0);
    }
    out
}

/// Walk from the end skipping zero bytes; the first non-zero byte must be
/// `0x80`, otherwise the message is corrupt.
pub fn unpad(input: &[u8]) -> Result<Vec<u8>> {
    let mut index = input.len();
    while index > 0 {
        index -= 1;
        if input[index] != 0 {
            if input[index] != 0x80 {
                return Err(Error::InvalidMessage("corrupt padding".into()));
            }
            return Ok(input[..index].to_vec());
        }
    }
    Err(Error::InvalidMessage("corrupt padding".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_empty_input_to_one_part() {
        let padded = pad(&[]);
        assert_eq!(padded.len(), PART_SIZE);
        assert_eq!(padded[0], 0x80);
    }

    #[test]
    fn pad_output_is_always_a_multiple_of_part_size() {
        for len in 0..400 {
            let input = vec![7u8; len];
            assert_eq!(pad(&input).len() % PART_SIZE, 0);
        }
    }

    #[test]
    fn unpad_rejects_all_zero_input() {
        assert!(unpad(&[0u8; 160]).is_err());
    }

    #[test]
    fn unpad_rejects_missing_terminator() {
        let mut bogus = vec![1u8; 160];
        bogus[159] = 0;
        assert!(unpad(&bogus).is_err());
    }

    #[quickcheck_macros::quickcheck]
    fn unpad_pad_round_trips(input: Vec<u8>) -> bool {
        unpad(&pad(&input)).map(|out| out == input).unwrap_or(false)
    }
}
