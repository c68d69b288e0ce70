//! VP8 through libvpx. Built with the `vp8` feature.

use std::{mem::MaybeUninit, os::raw::c_ulong, ptr, slice};

use vpx_sys::{
    vpx_codec_cx_pkt_kind, vpx_codec_destroy, vpx_codec_enc_cfg_t, vpx_codec_enc_config_default,
    vpx_codec_enc_init_ver, vpx_codec_encode, vpx_codec_err_t, vpx_codec_get_cx_data,
    vpx_codec_iter_t, vpx_codec_vp8_cx, vpx_codec_ctx_t, vpx_enc_frame_flags_t, vpx_image_t,
    vpx_img_fmt, vpx_img_wrap, VPX_ENCODER_ABI_VERSION,
};

use super::encoder::{EncodeError, Encoder, EncoderConfig, EncoderFactory, PixelFormat};

const FORCE_KEYFRAME: vpx_enc_frame_flags_t = 1;
const DEADLINE_REALTIME: c_ulong = 1;
const DEADLINE_GOOD_QUALITY: c_ulong = 1_000_000;

fn vpx_result(err: vpx_codec_err_t, what: &str) -> Result<(), EncodeError> {
    if err == vpx_codec_err_t::VPX_CODEC_OK {
        Ok(())
    } else {
        Err(EncodeError::Failed(format!("{what}: {err:?}")))
    }
}

pub struct Vp8Encoder {
    // Boxed so libvpx keeps a stable address for the context.
    ctx: Box<vpx_codec_ctx_t>,
    width: u32,
    height: u32,
    deadline: c_ulong,
    pts: i64,
}

// The context is only reached through `&mut self`.
unsafe impl Send for Vp8Encoder {}

impl Vp8Encoder {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncodeError> {
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(EncodeError::Failed(format!(
                "VP8 needs even dimensions, got {}x{}",
                config.width, config.height
            )));
        }

        // SAFETY: both structs are plain C data that libvpx fills in; the context is only kept
        // (and later destroyed) once init succeeded.
        unsafe {
            let iface = vpx_codec_vp8_cx();
            let mut cfg = MaybeUninit::<vpx_codec_enc_cfg_t>::zeroed();
            vpx_result(
                vpx_codec_enc_config_default(iface, cfg.as_mut_ptr(), 0),
                "default config",
            )?;
            let mut cfg = cfg.assume_init();
            cfg.g_w = config.width;
            cfg.g_h = config.height;
            cfg.rc_target_bitrate = config.target_bitrate_kbps;
            cfg.g_error_resilient = u32::from(config.error_resilient) as _;
            cfg.g_timebase.num = config.timebase.0 as _;
            cfg.g_timebase.den = config.timebase.1 as _;
            cfg.g_lag_in_frames = 0;

            let mut ctx: Box<vpx_codec_ctx_t> = Box::new(std::mem::zeroed());
            vpx_result(
                vpx_codec_enc_init_ver(&mut *ctx, iface, &cfg, 0, VPX_ENCODER_ABI_VERSION as _),
                "encoder init",
            )?;

            Ok(Self {
                ctx,
                width: config.width,
                height: config.height,
                deadline: if config.realtime {
                    DEADLINE_REALTIME
                } else {
                    DEADLINE_GOOD_QUALITY
                },
                pts: 0,
            })
        }
    }

    fn image_len(&self) -> usize {
        let (w, h) = (self.width as usize, self.height as usize);
        w * h + 2 * (w / 2) * (h / 2)
    }
}

impl Encoder for Vp8Encoder {
    fn input_format(&self) -> PixelFormat {
        PixelFormat::I420
    }

    fn encode(&mut self, image: &[u8], keyframe: bool) -> Result<Vec<Vec<u8>>, EncodeError> {
        if image.len() < self.image_len() {
            return Err(EncodeError::Failed(format!(
                "I420 image of {} bytes is short for {}x{}",
                image.len(),
                self.width,
                self.height
            )));
        }
        let flags = if keyframe { FORCE_KEYFRAME } else { 0 };

        let mut packets = Vec::new();
        // SAFETY: `image` outlives the encode call and libvpx only reads through the wrapped
        // planes; packet buffers are copied out before the next call into the context.
        unsafe {
            let mut img = MaybeUninit::<vpx_image_t>::zeroed();
            let wrapped = vpx_img_wrap(
                img.as_mut_ptr(),
                vpx_img_fmt::VPX_IMG_FMT_I420,
                self.width,
                self.height,
                1,
                image.as_ptr() as *mut u8,
            );
            if wrapped.is_null() {
                return Err(EncodeError::Failed("cannot wrap I420 image".into()));
            }
            vpx_result(
                vpx_codec_encode(&mut *self.ctx, wrapped, self.pts, 1, flags, self.deadline),
                "encode",
            )?;

            let mut iter: vpx_codec_iter_t = ptr::null();
            loop {
                let pkt = vpx_codec_get_cx_data(&mut *self.ctx, &mut iter);
                if pkt.is_null() {
                    break;
                }
                if (*pkt).kind == vpx_codec_cx_pkt_kind::VPX_CODEC_CX_FRAME_PKT {
                    let frame = &(*pkt).data.frame;
                    let data = slice::from_raw_parts(frame.buf as *const u8, frame.sz as usize);
                    packets.push(data.to_vec());
                }
            }
        }
        self.pts += 1;
        Ok(packets)
    }
}

impl Drop for Vp8Encoder {
    fn drop(&mut self) {
        // SAFETY: the context was initialised in `new`.
        unsafe {
            vpx_codec_destroy(&mut *self.ctx);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Vp8EncoderFactory;

impl EncoderFactory for Vp8EncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn Encoder>, EncodeError> {
        Ok(Box::new(Vp8Encoder::new(config)?))
    }
}
