use std::{path::PathBuf, time::UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use droidagent_proto::droidagent::v1::{
    agent_controller_client::AgentControllerClient, agent_state, directory_entry, input_request,
    push_file_request, shell_output_response, shell_request, shell_response,
    shell_start_request::ShellType, stat_file_response, stream_display_request, FileStat,
    InputRequest, ListDirectoryRequest, PullFileRequest, PushFileData, PushFileEnd,
    PushFileRequest, PushFileStart, ShellRequest, ShellResizeRequest, ShellStartRequest,
    ShellStdinRequest, StartEmulatorRequest, StatFileRequest, StopEmulatorRequest,
    StreamDisplayRequest, TouchEvent,
};
use droidagent_util::{client_addr, now_millis};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;

const PUSH_CHUNK: usize = 64 * 1024;
const S_IFREG: u32 = 0o100000;

#[derive(Parser)]
#[command(name = "droidagent-cli", version, about = "Control a droidagent emulator host")]
struct Cli {
    #[arg(long, global = true, default_value_t = client_addr())]
    addr: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the emulator state
    State {
        /// Keep printing every change
        #[arg(long)]
        follow: bool,
    },
    /// Start the emulator
    Start {
        #[arg(long, default_value_t = 2048)]
        ram: u32,
        #[arg(long, default_value_t = 2)]
        cores: u32,
        #[arg(long, default_value_t = 320)]
        density: u32,
        #[arg(long, default_value_t = 720)]
        width: u32,
        #[arg(long, default_value_t = 1280)]
        height: u32,
        /// Restart adbd as root once the device is online
        #[arg(long)]
        root: bool,
    },
    /// Stop the emulator
    Stop {
        /// Kill the emulator process group instead of asking it to shut down
        #[arg(long)]
        force: bool,
    },
    /// List a device directory
    Ls {
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Stat a device path
    Stat {
        path: String,
        /// Stat a symlink itself instead of its target
        #[arg(long)]
        no_follow: bool,
        #[arg(long)]
        json: bool,
    },
    /// Copy a device file to the host
    Pull { remote: String, local: PathBuf },
    /// Copy a host file to the device
    Push {
        local: PathBuf,
        remote: String,
        /// Octal permission bits
        #[arg(long, default_value = "644")]
        mode: String,
    },
    /// Run a device shell; without a command the shell is interactive
    Shell {
        #[arg(long)]
        pty: bool,
        #[arg(long)]
        term: Option<String>,
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Follow the kernel console
    Syslog,
    /// Tap the screen at X,Y
    Tap { x: u32, y: u32 },
    /// Print display frame metadata as it arrives
    Display {
        #[arg(long, value_enum, default_value_t = DisplayFormat::I420)]
        format: DisplayFormat,
        #[arg(long, default_value_t = 5)]
        max_fps: u32,
        /// Milliseconds between forced keyframes, 0 to disable
        #[arg(long, default_value_t = 0)]
        keyframe_interval: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DisplayFormat {
    Rgb888,
    I420,
    Vp8,
}

impl From<DisplayFormat> for stream_display_request::Format {
    fn from(format: DisplayFormat) -> Self {
        match format {
            DisplayFormat::Rgb888 => stream_display_request::Format::Rgb888,
            DisplayFormat::I420 => stream_display_request::Format::I420,
            DisplayFormat::Vp8 => stream_display_request::Format::Vp8,
        }
    }
}

#[derive(Serialize)]
struct StatJson {
    mode: u32,
    size: u64,
    uid: u32,
    gid: u32,
    mtime: i64,
}

impl From<&FileStat> for StatJson {
    fn from(stat: &FileStat) -> Self {
        Self {
            mode: stat.mode,
            size: stat.size,
            uid: stat.uid,
            gid: stat.gid,
            mtime: stat.mtime,
        }
    }
}

#[derive(Serialize)]
struct EntryJson {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat: Option<StatJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = AgentControllerClient::new(connect(&cli.addr).await?);

    match cli.cmd {
        Cmd::State { follow } => {
            let mut stream = client.stream_state(()).await?.into_inner();
            while let Some(state) = stream.next().await {
                let state = state?;
                let name = agent_state::EmulatorState::try_from(state.emulator_state)
                    .map(|s| s.as_str_name())
                    .unwrap_or("UNKNOWN");
                match state.emulator_error {
                    Some(err) => println!("{name}\t{err}"),
                    None => println!("{name}"),
                }
                if !follow {
                    break;
                }
            }
        }
        Cmd::Start {
            ram,
            cores,
            density,
            width,
            height,
            root,
        } => {
            client
                .start_emulator(StartEmulatorRequest {
                    ram_size: ram,
                    core_count: cores,
                    lcd_density: density,
                    lcd_width: width,
                    lcd_height: height,
                    root_adb: root,
                })
                .await?;
            println!("starting");
        }
        Cmd::Stop { force } => {
            client
                .stop_emulator(StopEmulatorRequest { force_exit: force })
                .await?;
            println!("stopping");
        }
        Cmd::Ls { path, json } => {
            let resp = client
                .list_directory(ListDirectoryRequest { path })
                .await?
                .into_inner();
            let entries: Vec<EntryJson> = resp
                .entries
                .into_iter()
                .map(|e| match e.stat {
                    Some(directory_entry::Stat::StatValue(stat)) => EntryJson {
                        name: e.name,
                        stat: Some(StatJson::from(&stat)),
                        error: None,
                    },
                    Some(directory_entry::Stat::StatError(code)) => EntryJson {
                        name: e.name,
                        stat: None,
                        error: Some(code),
                    },
                    None => EntryJson {
                        name: e.name,
                        stat: None,
                        error: None,
                    },
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in entries {
                    match (e.stat, e.error) {
                        (Some(s), _) => println!("{:o}\t{}\t{}\t{}", s.mode, s.size, s.mtime, e.name),
                        (None, Some(code)) => println!("error {code}\t\t\t{}", e.name),
                        (None, None) => println!("?\t\t\t{}", e.name),
                    }
                }
            }
        }
        Cmd::Stat {
            path,
            no_follow,
            json,
        } => {
            let resp = client
                .stat_file(StatFileRequest {
                    path,
                    follow_links: !no_follow,
                })
                .await?
                .into_inner();
            match resp.stat {
                Some(stat_file_response::Stat::StatValue(stat)) => {
                    let stat = StatJson::from(&stat);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&stat)?);
                    } else {
                        println!(
                            "mode={:o}\tsize={}\tuid={}\tgid={}\tmtime={}",
                            stat.mode, stat.size, stat.uid, stat.gid, stat.mtime
                        );
                    }
                }
                Some(stat_file_response::Stat::StatError(code)) => {
                    eprintln!("stat failed with errno {code}");
                    std::process::exit(1);
                }
                None => return Err("empty stat response".into()),
            }
        }
        Cmd::Pull { remote, local } => {
            let mut stream = client
                .pull_file(PullFileRequest { path: remote })
                .await?
                .into_inner();
            let mut file = tokio::fs::File::create(&local).await?;
            let mut total = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk.data).await?;
                total += chunk.data.len();
                if chunk.last {
                    break;
                }
            }
            file.flush().await?;
            println!("{total} bytes written to {}", local.display());
        }
        Cmd::Push {
            local,
            remote,
            mode,
        } => {
            let mode = u32::from_str_radix(&mode, 8)?;
            let data = tokio::fs::read(&local).await?;
            let mtime = tokio::fs::metadata(&local)
                .await?
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
                .unwrap_or_else(|| (now_millis() / 1000) as u32);

            let mut requests = vec![PushFileRequest {
                message: Some(push_file_request::Message::Start(PushFileStart {
                    path: remote.clone(),
                    mode: S_IFREG | (mode & 0o7777),
                })),
            }];
            requests.extend(data.chunks(PUSH_CHUNK).map(|chunk| PushFileRequest {
                message: Some(push_file_request::Message::Data(PushFileData {
                    data: chunk.to_vec(),
                })),
            }));
            requests.push(PushFileRequest {
                message: Some(push_file_request::Message::End(PushFileEnd { mtime })),
            });

            client
                .push_file(futures_util::stream::iter(requests))
                .await?;
            println!("{} bytes pushed to {remote}", data.len());
        }
        Cmd::Shell { pty, term, command } => {
            let code = run_shell(&mut client, pty, term, command).await?;
            std::process::exit(code as i32);
        }
        Cmd::Syslog => {
            let mut stream = client.stream_sys_log(()).await?.into_inner();
            while let Some(entry) = stream.next().await {
                println!("{}", entry?.line);
            }
        }
        Cmd::Tap { x, y } => {
            for pressure in [1, 0] {
                client
                    .send_input(InputRequest {
                        event: Some(input_request::Event::Touch(TouchEvent {
                            identifier: 0,
                            x,
                            y,
                            pressure,
                            touch_major: 0,
                            touch_minor: 0,
                        })),
                    })
                    .await?;
            }
        }
        Cmd::Display {
            format,
            max_fps,
            keyframe_interval,
        } => {
            let mut stream = client
                .stream_display(StreamDisplayRequest {
                    format: stream_display_request::Format::from(format) as i32,
                    max_fps,
                    keyframe_interval,
                })
                .await?
                .into_inner();
            while let Some(frame) = stream.next().await {
                let frame = frame?;
                println!(
                    "{}x{}\tkeyframe={}\t{} bytes",
                    frame.width,
                    frame.height,
                    frame.keyframe,
                    frame.data.len()
                );
            }
        }
    }

    Ok(())
}

async fn run_shell(
    client: &mut AgentControllerClient<Channel>,
    pty: bool,
    term: Option<String>,
    command: Vec<String>,
) -> Result<u32, Box<dyn std::error::Error>> {
    let shell_type = if pty { ShellType::Pty } else { ShellType::Raw };
    let (tx, rx) = mpsc::channel(16);
    tx.send(ShellRequest {
        message: Some(shell_request::Message::Start(ShellStartRequest {
            shell_type: shell_type as i32,
            command: (!command.is_empty()).then(|| command.join(" ")),
            term_type: term,
        })),
    })
    .await?;
    if pty {
        tx.send(ShellRequest {
            message: Some(shell_request::Message::Resize(ShellResizeRequest {
                rows: 24,
                cols: 80,
                width: 0,
                height: 0,
            })),
        })
        .await?;
    }

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            let (data, close) = match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => (Vec::new(), true),
                Ok(n) => (buf[..n].to_vec(), false),
            };
            let msg = ShellRequest {
                message: Some(shell_request::Message::Stdin(ShellStdinRequest { data, close })),
            };
            if tx.send(msg).await.is_err() || close {
                return;
            }
        }
    });

    let mut responses = client
        .open_shell(ReceiverStream::new(rx))
        .await?
        .into_inner();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some(resp) = responses.next().await {
        match resp?.message {
            Some(shell_response::Message::Output(out)) => {
                if out.channel == shell_output_response::Channel::Err as i32 {
                    stderr.write_all(&out.data).await?;
                    stderr.flush().await?;
                } else {
                    stdout.write_all(&out.data).await?;
                    stdout.flush().await?;
                }
            }
            Some(shell_response::Message::Exit(exit)) => return Ok(exit.code),
            None => {}
        }
    }
    Ok(0)
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = format!("http://{addr}");
    Ok(Channel::from_shared(endpoint)?.connect().await?)
}
