//! Per-consumer display encoding. Each stream owns a [`DisplayProcessor`] that follows the
//! resolution of the frames it is fed and decides when to emit keyframes.

mod color;
mod encoder;
#[cfg(feature = "vp8")]
mod vp8;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::info;

pub use encoder::{
    EncodeError, Encoder, EncoderConfig, EncoderFactory, PixelFormat, RawEncoderFactory,
};
#[cfg(feature = "vp8")]
pub use vp8::Vp8EncoderFactory;

/// The VP8 engine when the build links libvpx, otherwise a factory that rejects every stream.
pub fn vp8_factory() -> Arc<dyn EncoderFactory> {
    #[cfg(feature = "vp8")]
    {
        Arc::new(Vp8EncoderFactory)
    }
    #[cfg(not(feature = "vp8"))]
    {
        Arc::new(encoder::UnavailableEncoderFactory("VP8"))
    }
}

/// One captured RGB888 screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// One packet sent to a display consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl EncodedFrame {
    fn blank() -> Self {
        Self {
            keyframe: true,
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("frame of {width}x{height} carries {len} bytes")]
    BadFrame { width: u32, height: u32, len: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub struct DisplayProcessor {
    factory: Arc<dyn EncoderFactory>,
    keyframe_interval: Option<Duration>,
    width: u32,
    height: u32,
    encoder: Option<Box<dyn Encoder>>,
    frame_count: u64,
    last_keyframe: Option<Instant>,
}

impl DisplayProcessor {
    /// A zero `keyframe_interval` only forces keyframes after (re)configuration.
    pub fn new(factory: Arc<dyn EncoderFactory>, keyframe_interval: Duration) -> Self {
        Self {
            factory,
            keyframe_interval: (!keyframe_interval.is_zero()).then_some(keyframe_interval),
            width: 0,
            height: 0,
            encoder: None,
            frame_count: 0,
            last_keyframe: None,
        }
    }

    #[cfg(test)]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[cfg(test)]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn reset(&mut self) {
        self.encoder = None;
        self.width = 0;
        self.height = 0;
        self.frame_count = 0;
        self.last_keyframe = None;
    }

    /// Feeds one broadcast value. `None` means no display and yields a single blank keyframe.
    /// A present frame with a zero dimension reconfigures to that size with no encoder and
    /// yields nothing until a real frame arrives.
    pub fn process(
        &mut self,
        frame: Option<&Frame>,
        now: Instant,
    ) -> Result<Vec<EncodedFrame>, DisplayError> {
        let Some(frame) = frame else {
            if self.encoder.is_some() {
                info!("display stream blanked");
            }
            self.reset();
            return Ok(vec![EncodedFrame::blank()]);
        };

        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.data.len() != expected {
            return Err(DisplayError::BadFrame {
                width: frame.width,
                height: frame.height,
                len: frame.data.len(),
            });
        }

        if frame.width == 0 || frame.height == 0 {
            if self.encoder.is_some() || (frame.width, frame.height) != (self.width, self.height) {
                info!(
                    "changing stream resolution to {}x{}",
                    frame.width, frame.height
                );
            }
            self.reset();
            self.width = frame.width;
            self.height = frame.height;
            return Ok(Vec::new());
        }

        if self.encoder.is_none() || (frame.width, frame.height) != (self.width, self.height) {
            info!(
                "changing stream resolution to {}x{}",
                frame.width, frame.height
            );
            self.reset();
            let config = EncoderConfig::for_size(frame.width, frame.height);
            self.encoder = Some(self.factory.create(&config)?);
            self.width = frame.width;
            self.height = frame.height;
        }

        let keyframe = self.frame_count == 0
            || match (self.keyframe_interval, self.last_keyframe) {
                (Some(interval), Some(last)) => now.saturating_duration_since(last) > interval,
                (Some(_), None) => true,
                (None, _) => false,
            };

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(Vec::new());
        };
        let image = encoder
            .input_format()
            .convert(&frame.data, frame.width, frame.height);
        let packets = encoder.encode(&image, keyframe)?;

        self.frame_count += 1;
        if keyframe {
            self.last_keyframe = Some(now);
        }

        Ok(packets
            .into_iter()
            .map(|data| EncodedFrame {
                keyframe,
                width: self.width,
                height: self.height,
                data,
            })
            .collect())
    }
}
