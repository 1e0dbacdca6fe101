//! Codec for encoding/decoding control-channel frames

use thiserror::Error;

use crate::frames::Frame;
use crate::MAX_FRAME_SIZE;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid body encoding: {0}")]
    InvalidBody(String),
}

/// Encode a frame to one JSON text message
pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode one JSON text message into a frame
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}
