use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

/// Failure decoding a packed numeric buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packed buffer is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("packed buffer is {0} bytes, not a multiple of 8")]
    Misaligned(usize),
}

/// Decodes a base64 string carrying raw little-endian IEEE-754 doubles.
///
/// Values pass through untouched: NaN and infinities are preserved, ordering
/// follows the byte stream. The decoded byte length must be a multiple of 8.
pub fn decode_packed_doubles(encoded: &str) -> Result<Vec<f64>, DecodeError> {
    let bytes = BASE64.decode(encoded.trim())?;
    if bytes.len() % 8 != 0 {
        return Err(DecodeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(values: &[f64]) -> String {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        BASE64.encode(bytes)
    }

    #[test]
    fn decodes_ordered_doubles() -> anyhow::Result<()> {
        let encoded = pack(&[1.0, -2.5, 1e9]);
        let decoded = decode_packed_doubles(&encoded)?;
        assert_eq!(decoded, vec![1.0, -2.5, 1e9]);
        Ok(())
    }

    #[test]
    fn length_is_bytes_over_eight() -> anyhow::Result<()> {
        let values: Vec<f64> = (0..17).map(|i| i as f64).collect();
        let decoded = decode_packed_doubles(&pack(&values))?;
        assert_eq!(decoded.len(), 17);
        Ok(())
    }

    #[test]
    fn empty_input_decodes_to_empty_sequence() -> anyhow::Result<()> {
        assert!(decode_packed_doubles("")?.is_empty());
        Ok(())
    }

    #[test]
    fn nan_and_infinity_pass_through() -> anyhow::Result<()> {
        let decoded = decode_packed_doubles(&pack(&[f64::NAN, f64::INFINITY]))?;
        assert!(decoded[0].is_nan());
        assert_eq!(decoded[1], f64::INFINITY);
        Ok(())
    }

    #[test]
    fn misaligned_buffer_is_rejected() {
        let encoded = BASE64.encode([1u8, 2, 3]);
        assert_eq!(
            decode_packed_doubles(&encoded),
            Err(DecodeError::Misaligned(3))
        );
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            decode_packed_doubles("not base64!"),
            Err(DecodeError::Base64(_))
        ));
    }
}
