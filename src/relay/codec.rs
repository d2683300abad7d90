//! # Frame Codec
//!
//! Defensive validation of inbound audio frames before they are forwarded
//! upstream, plus the buffer-representation conversion between the client
//! transport (`Bytes`) and the upstream socket (`Vec<u8>`).
//!
//! There is deliberately no resampling, decoding, or content transformation
//! here: the audio format contract (sample rate, encoding) is fixed at
//! upstream connect time and assumed to hold for the whole session. The
//! codec's only job is to keep obviously-broken frames off the wire.

use actix_web::web::Bytes;

use crate::error::{RelayError, RelayResult};

/// Stateless validator/normalizer for inbound audio frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Validate one inbound frame and convert it for the upstream socket.
    ///
    /// ## Validation Checks:
    /// 1. **Non-empty**: zero-length messages carry no audio
    /// 2. **Even length**: frames are 16-bit PCM, so an odd byte count means
    ///    a truncated sample
    /// 3. **Size bound**: frames beyond the configured maximum are rejected
    ///
    /// All failures are `Protocol` errors, the recoverable class. The
    /// caller drops the frame and keeps the session alive.
    pub fn prepare(&self, frame: &Bytes) -> RelayResult<Vec<u8>> {
        if frame.is_empty() {
            return Err(RelayError::Protocol("empty audio frame".to_string()));
        }

        if frame.len() > self.max_frame_bytes {
            return Err(RelayError::Protocol(format!(
                "frame of {} bytes exceeds maximum of {}",
                frame.len(),
                self.max_frame_bytes
            )));
        }

        if frame.len() % 2 != 0 {
            return Err(RelayError::Protocol(
                "frame length must be even for 16-bit samples".to_string(),
            ));
        }

        Ok(frame.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_frame_passes_through_unmodified() {
        let codec = FrameCodec::new(1024 * 1024);
        // 20ms at 16kHz 16-bit mono
        let frame = Bytes::from(vec![0x7Fu8; 640]);
        let prepared = codec.prepare(&frame).unwrap();
        assert_eq!(prepared, frame.to_vec());
    }

    #[test]
    fn test_empty_frame_rejected() {
        let codec = FrameCodec::new(1024 * 1024);
        let err = codec.prepare(&Bytes::new()).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_odd_length_frame_rejected() {
        let codec = FrameCodec::new(1024 * 1024);
        let err = codec.prepare(&Bytes::from(vec![0u8; 641])).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = FrameCodec::new(1024 * 1024);
        let err = codec
            .prepare(&Bytes::from(vec![0u8; 10 * 1024 * 1024]))
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn test_frame_at_exact_limit_passes() {
        let codec = FrameCodec::new(640);
        assert!(codec.prepare(&Bytes::from(vec![0u8; 640])).is_ok());
        assert!(codec.prepare(&Bytes::from(vec![0u8; 642])).is_err());
    }
}
