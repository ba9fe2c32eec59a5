//! Image decoding contract and the default passthrough decoder.

use voxseg_types::{DepthImage, RawImage, RgbImage, VoxsegError};

/// Turns transport images into decoded pixel arrays.
///
/// Implementations must be callable from any thread.
pub trait ImageDecoder: Send + Sync {
    /// Decode a colour image into RGB24.
    ///
    /// # Errors
    ///
    /// Returns [`VoxsegError::Decode`] for unsupported encodings or malformed
    /// buffers.
    fn decode_rgb(&self, raw: &RawImage) -> Result<RgbImage, VoxsegError>;

    /// Decode a depth image into metres.
    fn decode_depth(&self, raw: &RawImage) -> Result<DepthImage, VoxsegError>;
}

/// Decoder for uncompressed ROS image encodings.
///
/// | encoding | handled as |
/// |---|---|
/// | `rgb8` | copied as is |
/// | `bgr8` | channel order swapped to RGB |
/// | `mono8` | grey replicated into three channels |
/// | `32FC1` | little-endian `f32` metres |
/// | `16UC1` | little-endian `u16` millimetres |
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecoder;

impl PassthroughDecoder {
    pub fn new() -> Self {
        Self
    }
}

fn check_len(raw: &RawImage, bytes_per_pixel: usize) -> Result<(), VoxsegError> {
    let expected = raw.width as usize * raw.height as usize * bytes_per_pixel;
    if raw.data.len() != expected {
        return Err(VoxsegError::Decode(format!(
            "{} image {}x{} needs {expected} bytes, got {}",
            raw.encoding,
            raw.width,
            raw.height,
            raw.data.len()
        )));
    }
    Ok(())
}

impl ImageDecoder for PassthroughDecoder {
    fn decode_rgb(&self, raw: &RawImage) -> Result<RgbImage, VoxsegError> {
        let data = match raw.encoding.as_str() {
            "rgb8" => {
                check_len(raw, 3)?;
                raw.data.clone()
            }
            "bgr8" => {
                check_len(raw, 3)?;
                raw.data
                    .chunks_exact(3)
                    .flat_map(|px| [px[2], px[1], px[0]])
                    .collect()
            }
            "mono8" => {
                check_len(raw, 1)?;
                raw.data.iter().flat_map(|&g| [g, g, g]).collect()
            }
            other => {
                return Err(VoxsegError::Decode(format!(
                    "unsupported colour encoding {other:?}"
                )));
            }
        };
        RgbImage::new(raw.width, raw.height, data)
            .map_err(|e| VoxsegError::Decode(e.to_string()))
    }

    fn decode_depth(&self, raw: &RawImage) -> Result<DepthImage, VoxsegError> {
        let data = match raw.encoding.as_str() {
            "32FC1" => {
                check_len(raw, 4)?;
                raw.data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            }
            "16UC1" => {
                check_len(raw, 2)?;
                raw.data
                    .chunks_exact(2)
                    .map(|b| f32::from(u16::from_le_bytes([b[0], b[1]])) / 1000.0)
                    .collect()
            }
            other => {
                return Err(VoxsegError::Decode(format!(
                    "unsupported depth encoding {other:?}"
                )));
            }
        };
        DepthImage::new(raw.width, raw.height, data)
            .map_err(|e| VoxsegError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(width: u32, height: u32, encoding: &str, data: Vec<u8>) -> RawImage {
        RawImage {
            width,
            height,
            encoding: encoding.to_string(),
            data,
        }
    }

    #[test]
    fn bgr8_is_swapped_to_rgb() {
        let img = PassthroughDecoder
            .decode_rgb(&raw(2, 1, "bgr8", vec![1, 2, 3, 4, 5, 6]))
            .unwrap();
        assert_eq!(img.pixel(0, 0), Some([3, 2, 1]));
        assert_eq!(img.pixel(1, 0), Some([6, 5, 4]));
    }

    #[test]
    fn rgb8_and_mono8_decode() {
        let img = PassthroughDecoder
            .decode_rgb(&raw(1, 1, "rgb8", vec![9, 8, 7]))
            .unwrap();
        assert_eq!(img.data(), &[9, 8, 7]);
        let grey = PassthroughDecoder
            .decode_rgb(&raw(2, 1, "mono8", vec![10, 20]))
            .unwrap();
        assert_eq!(grey.data(), &[10, 10, 10, 20, 20, 20]);
    }

    #[test]
    fn depth_encodings_decode_to_metres() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.25f32.to_le_bytes());
        bytes.extend_from_slice(&3.0f32.to_le_bytes());
        let depth = PassthroughDecoder
            .decode_depth(&raw(2, 1, "32FC1", bytes))
            .unwrap();
        assert_eq!(depth.data(), &[1.25, 3.0]);

        let depth = PassthroughDecoder
            .decode_depth(&raw(1, 1, "16UC1", 1500u16.to_le_bytes().to_vec()))
            .unwrap();
        assert!((depth.data()[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn truncated_buffer_is_decode_error() {
        let err = PassthroughDecoder
            .decode_rgb(&raw(2, 2, "rgb8", vec![0; 5]))
            .unwrap_err();
        assert!(matches!(err, VoxsegError::Decode(_)));
    }

    #[test]
    fn unsupported_encoding_is_decode_error() {
        assert!(matches!(
            PassthroughDecoder.decode_rgb(&raw(1, 1, "jpeg", vec![0; 3])),
            Err(VoxsegError::Decode(_))
        ));
        assert!(matches!(
            PassthroughDecoder.decode_depth(&raw(1, 1, "rgb8", vec![0; 3])),
            Err(VoxsegError::Decode(_))
        ));
    }
}
