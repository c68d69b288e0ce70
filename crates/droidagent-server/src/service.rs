use std::{
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use droidagent_adb::{
    AdbClient, AdbError, DirectoryEntry as AdbEntry, FileStat as AdbStat, PullStream,
    ShellEvent, ShellKind, ShellReader, ShellRequest as AdbShellRequest, ShellWriter, StatResult,
};
use droidagent_proto::droidagent::v1::{
    agent_controller_server::AgentController, directory_entry, input_request,
    push_file_request, shell_output_response::Channel as OutputChannel, shell_request,
    shell_response, shell_start_request::ShellType, stat_file_response,
    stream_display_request::Format, AgentState, DirectoryEntry, DisplayFrame, FileStat,
    InputRequest, ListDirectoryRequest, ListDirectoryResponse, PullFileRequest, PullFileResponse,
    PushFileRequest, ShellExitResponse, ShellOutputResponse, ShellRequest, ShellResponse,
    StartEmulatorRequest, StatFileRequest, StatFileResponse, StopEmulatorRequest,
    StreamDisplayRequest, SysLogEntry,
};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::broadcaster::Listener;
use crate::console::TouchInput;
use crate::controller::ControlPlane;
use crate::display::{
    vp8_factory, DisplayProcessor, EncoderFactory, Frame, PixelFormat, RawEncoderFactory,
};
use crate::emulator::{HardwareProfile, LaunchOptions};
use crate::status::{adb_status, display_status};
use crate::syslog::SysLog;

const STREAM_BUFFER: usize = 256;
const MAX_FPS_LIMIT: u32 = 1_000;

#[derive(Clone)]
pub(crate) struct Svc {
    plane: ControlPlane,
    adb: AdbClient,
    syslog: SysLog,
}

impl Svc {
    pub(crate) fn new(plane: ControlPlane, adb: AdbClient, syslog: SysLog) -> Self {
        Self { plane, adb, syslog }
    }
}

fn encoder_factory(format: Format) -> Arc<dyn EncoderFactory> {
    match format {
        Format::Rgb888 => Arc::new(RawEncoderFactory(PixelFormat::Rgb888)),
        Format::I420 => Arc::new(RawEncoderFactory(PixelFormat::I420)),
        Format::Vp8 => vp8_factory(),
    }
}

fn proto_stat(stat: &AdbStat) -> FileStat {
    FileStat {
        dev: stat.dev,
        ino: stat.ino,
        mode: stat.mode,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        size: stat.size,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
    }
}

fn proto_entry(entry: &AdbEntry) -> DirectoryEntry {
    let stat = match &entry.stat {
        StatResult::Stat(stat) => directory_entry::Stat::StatValue(proto_stat(stat)),
        StatResult::Error(code) => directory_entry::Stat::StatError(*code),
    };
    DirectoryEntry {
        name: entry.name.clone(),
        stat: Some(stat),
    }
}

async fn stream_state_impl(
    mut states: Listener<AgentState>,
    tx: mpsc::Sender<Result<AgentState, Status>>,
) {
    loop {
        let state = match states.wait_or_cancel(tx.closed()).await {
            Ok(state) => state,
            Err(err) => {
                debug!("stopping state stream: {err}");
                return;
            }
        };
        if tx.send(Ok(state)).await.is_err() {
            return;
        }
    }
}

async fn stream_display_impl(
    mut frames: Listener<Option<Arc<Frame>>>,
    mut processor: DisplayProcessor,
    max_fps: u32,
    tx: mpsc::Sender<Result<DisplayFrame, Status>>,
) {
    let mut ticker = (max_fps > 0).then(|| {
        let mut ticker = interval(Duration::from_secs(1) / max_fps.min(MAX_FPS_LIMIT));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => return,
            }
        }

        let frame = match frames.wait_or_cancel(tx.closed()).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("stopping display stream: {err}");
                return;
            }
        };

        let packets = match processor.process(frame.as_deref(), Instant::now()) {
            Ok(packets) => packets,
            Err(err) => {
                warn!("display stream failed: {err}");
                let _ = tx.send(Err(display_status(err))).await;
                return;
            }
        };
        for packet in packets {
            let msg = DisplayFrame {
                keyframe: packet.keyframe,
                width: packet.width,
                height: packet.height,
                data: packet.data,
            };
            if tx.send(Ok(msg)).await.is_err() {
                return;
            }
        }
    }
}

type SysLogStream = Pin<Box<dyn Stream<Item = Result<SysLogEntry, Status>> + Send>>;

/// Serves the listener's own bounded queue so its drop policy applies directly to the client.
fn syslog_stream(lines: mpsc::Receiver<String>) -> SysLogStream {
    Box::pin(ReceiverStream::new(lines).map(|line| Ok(SysLogEntry { line })))
}

enum ShellInput {
    Client(Result<Option<ShellRequest>, Status>),
    Device(Result<ShellEvent, AdbError>),
}

/// Runs one shell session: a task reading client requests and a task reading device output feed
/// the loop below. Whichever side fails first ends the session and both tasks are torn down.
async fn shell_session(
    mut requests: Streaming<ShellRequest>,
    mut reader: ShellReader<TcpStream>,
    mut writer: ShellWriter<TcpStream>,
    tx: mpsc::Sender<Result<ShellResponse, Status>>,
) {
    let (events_tx, mut events) = mpsc::channel(16);

    let client_tx = events_tx.clone();
    let client = tokio::spawn(async move {
        loop {
            let msg = requests.message().await;
            let done = !matches!(msg, Ok(Some(_)));
            if client_tx.send(ShellInput::Client(msg)).await.is_err() || done {
                return;
            }
        }
    });

    let device = tokio::spawn(async move {
        loop {
            let event = reader.recv().await;
            let done = !matches!(event, Ok(ShellEvent::Stdout(_) | ShellEvent::Stderr(_)));
            if events_tx.send(ShellInput::Device(event)).await.is_err() || done {
                return;
            }
        }
    });

    let result = run_shell(&mut events, &mut writer, &tx).await;
    client.abort();
    device.abort();

    if let Err(status) = result {
        warn!("error while processing shell: {}", status.message());
        let _ = tx.send(Err(status)).await;
    }
}

async fn run_shell(
    events: &mut mpsc::Receiver<ShellInput>,
    writer: &mut ShellWriter<TcpStream>,
    tx: &mpsc::Sender<Result<ShellResponse, Status>>,
) -> Result<(), Status> {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
            _ = tx.closed() => return Ok(()),
        };

        let response = match event {
            ShellInput::Client(Ok(Some(request))) => {
                match request.message {
                    Some(shell_request::Message::Stdin(stdin)) => {
                        writer.write_stdin(&stdin.data).await.map_err(adb_status)?;
                        if stdin.close {
                            writer.close_stdin().await.map_err(adb_status)?;
                        }
                    }
                    Some(shell_request::Message::Resize(size)) => {
                        writer
                            .resize(size.rows, size.cols, size.width, size.height)
                            .await
                            .map_err(adb_status)?;
                    }
                    _ => return Err(Status::invalid_argument("unknown request")),
                }
                continue;
            }
            ShellInput::Client(Ok(None)) => {
                debug!("shell client finished sending");
                continue;
            }
            ShellInput::Client(Err(status)) => return Err(status),
            ShellInput::Device(Ok(ShellEvent::Stdout(data))) => {
                shell_response::Message::Output(ShellOutputResponse {
                    channel: OutputChannel::Out as i32,
                    data,
                })
            }
            ShellInput::Device(Ok(ShellEvent::Stderr(data))) => {
                shell_response::Message::Output(ShellOutputResponse {
                    channel: OutputChannel::Err as i32,
                    data,
                })
            }
            ShellInput::Device(Ok(ShellEvent::Exit(code))) => {
                let exit = ShellResponse {
                    message: Some(shell_response::Message::Exit(ShellExitResponse {
                        code: code as u32,
                    })),
                };
                let _ = tx.send(Ok(exit)).await;
                return Ok(());
            }
            ShellInput::Device(Ok(ShellEvent::Exited)) => return Ok(()),
            ShellInput::Device(Err(err)) => return Err(adb_status(err)),
        };

        let msg = ShellResponse {
            message: Some(response),
        };
        if tx.send(Ok(msg)).await.is_err() {
            return Ok(());
        }
    }
}

async fn pull_file_impl(
    mut stream: PullStream<TcpStream>,
    tx: mpsc::Sender<Result<PullFileResponse, Status>>,
) {
    loop {
        let chunk = tokio::select! {
            chunk = stream.recv() => chunk,
            _ = tx.closed() => return,
        };
        let msg = match chunk {
            Ok(Some(data)) => PullFileResponse { data, last: false },
            Ok(None) => {
                let _ = tx
                    .send(Ok(PullFileResponse {
                        data: Vec::new(),
                        last: true,
                    }))
                    .await;
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(adb_status(err))).await;
                return;
            }
        };
        if tx.send(Ok(msg)).await.is_err() {
            return;
        }
    }
}

#[tonic::async_trait]
impl AgentController for Svc {
    type StreamStateStream = ReceiverStream<Result<AgentState, Status>>;

    async fn stream_state(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::StreamStateStream>, Status> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(stream_state_impl(self.plane.states(), tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn start_emulator(
        &self,
        request: Request<StartEmulatorRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        if req.lcd_width == 0 || req.lcd_height == 0 {
            return Err(Status::invalid_argument("lcd_width and lcd_height are required"));
        }
        let options = LaunchOptions {
            profile: HardwareProfile {
                ram_size_mb: req.ram_size,
                core_count: req.core_count,
                lcd_density: req.lcd_density,
                lcd_width: req.lcd_width,
                lcd_height: req.lcd_height,
            },
            root_adb: req.root_adb,
        };
        info!(
            "start requested: {}MB, {} cores, {}x{}@{}",
            req.ram_size, req.core_count, req.lcd_width, req.lcd_height, req.lcd_density
        );
        self.plane.start(options).await?;
        Ok(Response::new(()))
    }

    async fn stop_emulator(
        &self,
        request: Request<StopEmulatorRequest>,
    ) -> Result<Response<()>, Status> {
        self.plane.stop(request.into_inner().force_exit).await?;
        Ok(Response::new(()))
    }

    type StreamDisplayStream = ReceiverStream<Result<DisplayFrame, Status>>;

    async fn stream_display(
        &self,
        request: Request<StreamDisplayRequest>,
    ) -> Result<Response<Self::StreamDisplayStream>, Status> {
        let req = request.into_inner();
        let format = Format::try_from(req.format)
            .map_err(|_| Status::invalid_argument("unknown display format"))?;
        let factory = encoder_factory(format);
        factory
            .check()
            .map_err(|err| Status::unimplemented(err.to_string()))?;

        let processor = DisplayProcessor::new(
            factory,
            Duration::from_millis(u64::from(req.keyframe_interval)),
        );
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(stream_display_impl(
            self.plane.frames(),
            processor,
            req.max_fps,
            tx,
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type StreamSysLogStream = SysLogStream;

    async fn stream_sys_log(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::StreamSysLogStream>, Status> {
        Ok(Response::new(syslog_stream(self.syslog.listen())))
    }

    async fn send_input(&self, request: Request<InputRequest>) -> Result<Response<()>, Status> {
        match request.into_inner().event {
            Some(input_request::Event::Touch(touch)) => {
                self.plane
                    .send_input(TouchInput {
                        identifier: touch.identifier,
                        x: touch.x,
                        y: touch.y,
                        pressure: touch.pressure,
                        touch_major: touch.touch_major,
                        touch_minor: touch.touch_minor,
                    })
                    .await?;
                Ok(Response::new(()))
            }
            None => Err(Status::invalid_argument("no request given")),
        }
    }

    type OpenShellStream = ReceiverStream<Result<ShellResponse, Status>>;

    async fn open_shell(
        &self,
        request: Request<Streaming<ShellRequest>>,
    ) -> Result<Response<Self::OpenShellStream>, Status> {
        self.plane.require_running().await?;
        let mut requests = request.into_inner();

        let start = match requests.message().await? {
            Some(ShellRequest {
                message: Some(shell_request::Message::Start(start)),
            }) => start,
            _ => {
                return Err(Status::invalid_argument(
                    "stream must begin with a start request",
                ))
            }
        };
        let kind = match ShellType::try_from(start.shell_type) {
            Ok(ShellType::Raw) => ShellKind::Raw,
            Ok(ShellType::Pty) => ShellKind::Pty,
            Err(_) => return Err(Status::invalid_argument("unknown shell type")),
        };
        let shell = AdbShellRequest {
            kind,
            command: start.command,
            term: start.term_type,
        };
        debug!("opening shell: {}", shell.service());

        let (reader, writer) = self.adb.open_shell(&shell).await.map_err(adb_status)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(shell_session(requests, reader, writer, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn list_directory(
        &self,
        request: Request<ListDirectoryRequest>,
    ) -> Result<Response<ListDirectoryResponse>, Status> {
        self.plane.require_running().await?;
        let req = request.into_inner();
        let entries = self
            .adb
            .list_directory(&req.path)
            .await
            .map_err(adb_status)?;
        Ok(Response::new(ListDirectoryResponse {
            entries: entries.iter().map(proto_entry).collect(),
        }))
    }

    async fn stat_file(
        &self,
        request: Request<StatFileRequest>,
    ) -> Result<Response<StatFileResponse>, Status> {
        self.plane.require_running().await?;
        let req = request.into_inner();
        let stat = match self
            .adb
            .stat(&req.path, req.follow_links)
            .await
            .map_err(adb_status)?
        {
            StatResult::Stat(stat) => stat_file_response::Stat::StatValue(proto_stat(&stat)),
            StatResult::Error(code) => stat_file_response::Stat::StatError(code),
        };
        Ok(Response::new(StatFileResponse { stat: Some(stat) }))
    }

    type PullFileStream = ReceiverStream<Result<PullFileResponse, Status>>;

    async fn pull_file(
        &self,
        request: Request<PullFileRequest>,
    ) -> Result<Response<Self::PullFileStream>, Status> {
        self.plane.require_running().await?;
        let req = request.into_inner();
        let stream = self.adb.pull(&req.path).await.map_err(adb_status)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pull_file_impl(stream, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn push_file(
        &self,
        request: Request<Streaming<PushFileRequest>>,
    ) -> Result<Response<()>, Status> {
        self.plane.require_running().await?;
        let mut requests = request.into_inner();

        let start = match requests.message().await? {
            Some(PushFileRequest {
                message: Some(push_file_request::Message::Start(start)),
            }) => start,
            _ => {
                return Err(Status::invalid_argument(
                    "stream must begin with a start request",
                ))
            }
        };
        let mut stream = self
            .adb
            .push(&start.path, start.mode)
            .await
            .map_err(adb_status)?;

        loop {
            let msg = requests
                .message()
                .await?
                .ok_or_else(|| Status::aborted("push stream ended before completion"))?;
            match msg.message {
                Some(push_file_request::Message::Data(data)) => {
                    stream.send(&data.data).await.map_err(adb_status)?;
                }
                Some(push_file_request::Message::End(end)) => {
                    stream.finish(end.mtime).await.map_err(adb_status)?;
                    info!("pushed {}", start.path);
                    return Ok(Response::new(()));
                }
                _ => return Err(Status::invalid_argument("unknown request")),
            }
        }
    }
}
