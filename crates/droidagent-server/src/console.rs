//! Client for the emulator's own gRPC console: status, touch injection, screenshots, shutdown.

use std::{ffi::CString, io, ptr, time::Duration};

use droidagent_proto::android::emulation::control::{
    emulator_controller_client::EmulatorControllerClient, image_format::ImgFormat,
    image_transport::TransportChannel, touch::EventExpiration, vm_run_state::RunState,
    Image, ImageFormat, ImageTransport, Touch, TouchEvent, VmRunState,
};
use tonic::{transport::Channel, Code, Streaming};
use tracing::{debug, info};

use crate::display::Frame;
use crate::emulator::EmulatorError;

const SHM_HANDLE: &str = "droidagent-video";
const TOUCH_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_RETRY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TouchInput {
    pub identifier: u32,
    pub x: u32,
    pub y: u32,
    pub pressure: u32,
    pub touch_major: u32,
    pub touch_minor: u32,
}

impl From<TouchInput> for Touch {
    fn from(t: TouchInput) -> Self {
        Touch {
            x: t.x as i32,
            y: t.y as i32,
            identifier: t.identifier as i32,
            pressure: t.pressure as i32,
            touch_major: t.touch_major as i32,
            touch_minor: t.touch_minor as i32,
            expiration: EventExpiration::NeverExpire as i32,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Console {
    client: EmulatorControllerClient<Channel>,
}

impl Console {
    /// Dials the console and polls `getStatus` until it answers. `Unavailable` is retried
    /// indefinitely; callers bound the wait.
    pub(crate) async fn connect(addr: &str) -> Result<Self, EmulatorError> {
        let channel = Channel::from_shared(format!("http://{addr}"))
            .map_err(|e| EmulatorError::Config(format!("invalid console address {addr}: {e}")))?
            .connect_lazy();
        let mut client = EmulatorControllerClient::new(channel);

        loop {
            match client.get_status(()).await {
                Ok(resp) => {
                    info!("emulator {}", resp.into_inner().version);
                    break;
                }
                Err(status) if status.code() == Code::Unavailable => {
                    tokio::time::sleep(STATUS_RETRY).await;
                }
                Err(status) => return Err(status.into()),
            }
        }
        Ok(Self { client })
    }

    pub(crate) async fn send_touch(&self, touch: TouchInput) -> Result<(), EmulatorError> {
        let mut client = self.client.clone();
        let event = TouchEvent {
            touches: vec![touch.into()],
            display: 0,
        };
        match tokio::time::timeout(TOUCH_TIMEOUT, client.send_touch(event)).await {
            Ok(result) => result.map(|_| ()).map_err(Into::into),
            Err(_) => Err(EmulatorError::Console(tonic::Status::deadline_exceeded(
                "touch forwarding timed out",
            ))),
        }
    }

    pub(crate) async fn request_exit(&self) -> Result<(), EmulatorError> {
        let mut client = self.client.clone();
        client
            .set_vm_state(VmRunState {
                state: RunState::Shutdown as i32,
            })
            .await?;
        Ok(())
    }

    /// Opens a screenshot stream of the given size. Pixels arrive through the shared memory
    /// mapping unless the console inlines them in the reply.
    pub(crate) async fn stream_frames(
        &self,
        width: u32,
        height: u32,
    ) -> Result<FrameStream, EmulatorError> {
        let shm = SharedMemory::open(SHM_HANDLE, frame_len(width, height)?)
            .map_err(EmulatorError::SharedMemory)?;

        let mut client = self.client.clone();
        let images = client
            .stream_screenshot(ImageFormat {
                format: ImgFormat::Rgb888 as i32,
                width,
                height,
                display: 0,
                transport: Some(ImageTransport {
                    channel: TransportChannel::Mmap as i32,
                    handle: SHM_HANDLE.into(),
                }),
            })
            .await?
            .into_inner();

        Ok(FrameStream {
            images,
            shm,
            width,
            height,
        })
    }
}

pub(crate) struct FrameStream {
    images: Streaming<Image>,
    shm: SharedMemory,
    width: u32,
    height: u32,
}

impl FrameStream {
    /// Next captured frame, or `None` once the console ends the stream.
    pub(crate) async fn next(&mut self) -> Result<Option<Frame>, EmulatorError> {
        let Some(image) = self.images.message().await? else {
            debug!("screenshot stream ended");
            return Ok(None);
        };
        let data = if image.image.is_empty() {
            self.shm.snapshot()
        } else {
            image.image
        };
        Ok(Some(Frame {
            width: self.width,
            height: self.height,
            data,
        }))
    }
}

fn frame_len(width: u32, height: u32) -> Result<usize, EmulatorError> {
    let len = width as usize * height as usize * 3;
    if len == 0 {
        return Err(EmulatorError::Config(format!(
            "display size {width}x{height} is empty"
        )));
    }
    Ok(len)
}

/// Read-only mapping of a POSIX shared memory object the emulator writes frames into.
struct SharedMemory {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is read-only and owned for the lifetime of the struct.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    fn open(name: &str, len: usize) -> io::Result<Self> {
        let cname = CString::new(format!("/{name}")).map_err(io::Error::other)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(err);
        }
        Ok(Self { ptr, len })
    }

    fn snapshot(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }.to_vec()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
