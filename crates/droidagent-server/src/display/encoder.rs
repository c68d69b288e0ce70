use thiserror::Error;

use super::color::rgb_to_i420;

/// Pixel layout an encoder expects as input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb888,
    I420,
}

impl PixelFormat {
    /// Converts a packed RGB888 frame into this layout.
    pub fn convert(self, rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
        match self {
            PixelFormat::Rgb888 => rgb.to_vec(),
            PixelFormat::I420 => rgb_to_i420(rgb, width as usize, height as usize),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub target_bitrate_kbps: u32,
    pub error_resilient: bool,
    pub timebase: (u32, u32),
    pub realtime: bool,
}

impl EncoderConfig {
    pub fn for_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            target_bitrate_kbps: 1_000,
            error_resilient: true,
            timebase: (1, 60),
            realtime: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{0} encoding is not available in this build")]
    Unsupported(&'static str),
    #[error("encoder failed: {0}")]
    Failed(String),
}

/// A configured encoder for one resolution. Each input frame may yield any number of packets.
pub trait Encoder: Send {
    fn input_format(&self) -> PixelFormat;

    fn encode(&mut self, image: &[u8], keyframe: bool) -> Result<Vec<Vec<u8>>, EncodeError>;
}

pub trait EncoderFactory: Send + Sync {
    /// Fails up front when no encoder can ever be created.
    fn check(&self) -> Result<(), EncodeError> {
        Ok(())
    }

    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn Encoder>, EncodeError>;
}

/// Emits every converted frame unchanged as a single packet.
#[derive(Clone, Copy, Debug)]
pub struct RawEncoder {
    format: PixelFormat,
}

impl Encoder for RawEncoder {
    fn input_format(&self) -> PixelFormat {
        self.format
    }

    fn encode(&mut self, image: &[u8], _keyframe: bool) -> Result<Vec<Vec<u8>>, EncodeError> {
        Ok(vec![image.to_vec()])
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RawEncoderFactory(pub PixelFormat);

impl EncoderFactory for RawEncoderFactory {
    fn create(&self, _config: &EncoderConfig) -> Result<Box<dyn Encoder>, EncodeError> {
        Ok(Box::new(RawEncoder { format: self.0 }))
    }
}

/// Stands in for a codec engine that is not linked into the build.
#[cfg_attr(feature = "vp8", allow(dead_code))]
#[derive(Clone, Copy, Debug)]
pub struct UnavailableEncoderFactory(pub &'static str);

impl EncoderFactory for UnavailableEncoderFactory {
    fn check(&self) -> Result<(), EncodeError> {
        Err(EncodeError::Unsupported(self.0))
    }

    fn create(&self, _config: &EncoderConfig) -> Result<Box<dyn Encoder>, EncodeError> {
        Err(EncodeError::Unsupported(self.0))
    }
}
