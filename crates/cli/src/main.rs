use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use livepush::media::{AudioFormat, FourCc, MediaSink, VideoFormat};
use livepush::mpegts::{PACKET_SIZE, PacketHeader, TsMuxer};
use livepush::rtmp::{ConnectionStatus, ReadyState, RtmpSocket, RtmpSocketListener, SocketConfig};
use livepush::srt::{PublishUrl, Scheme, StreamId};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "livepush", about = "Diagnostics for the livepush RTMP and SRT uplinks")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the RTMP handshake against an ingest server and report.
    Probe {
        host: String,
        #[arg(long, short, default_value_t = 1935)]
        port: u16,
        /// Connect timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Mux synthetic media and print transport stream statistics.
    MuxStats {
        /// Presentation time to generate, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[arg(long, default_value_t = 30)]
        fps: u64,
        /// Network fragment size in bytes
        #[arg(long, default_value_t = 1316)]
        fragment_size: usize,
    },
    /// Build or validate an SRT publish URL.
    SrtUrl {
        /// Existing URL to validate; other options are ignored when given
        #[arg(long)]
        parse: Option<String>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
        #[arg(long, default_value = "")]
        stream_id: String,
        /// Use SRTLA (bonded links) instead of plain SRT
        #[arg(long)]
        srtla: bool,
        /// Receiver latency in milliseconds
        #[arg(long)]
        latency: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let result = match args.command {
        Command::Probe {
            host,
            port,
            timeout,
        } => probe(&host, port, Duration::from_secs(timeout)).await,
        Command::MuxStats {
            seconds,
            fps,
            fragment_size,
        } => {
            mux_stats(seconds, fps, fragment_size);
            Ok(())
        }
        Command::SrtUrl {
            parse,
            host,
            port,
            stream_id,
            srtla,
            latency,
        } => srt_url(parse, host, port, stream_id, srtla, latency),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

enum ProbeEvent {
    State(ReadyState),
    Status(ConnectionStatus),
}

struct ProbeListener(mpsc::UnboundedSender<ProbeEvent>);

impl RtmpSocketListener for ProbeListener {
    fn data_received(&mut self, buffer: &mut BytesMut) {
        tracing::debug!(len = buffer.len(), "server sent post-handshake bytes");
        buffer.clear();
    }

    fn ready_state_changed(&mut self, state: ReadyState) {
        let _ = self.0.send(ProbeEvent::State(state));
    }

    fn status(&mut self, status: ConnectionStatus) {
        let _ = self.0.send(ProbeEvent::Status(status));
    }
}

async fn probe(host: &str, port: u16, timeout: Duration) -> livepush::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = SocketConfig {
        connect_timeout: timeout,
        ..Default::default()
    };
    let socket = RtmpSocket::with_connector(livepush::rtmp::TcpConnector, config, ProbeListener(tx));
    socket.connect(host, port)?;

    while let Some(event) = rx.recv().await {
        match event {
            ProbeEvent::State(ReadyState::HandshakeDone) => {
                println!(
                    "{host}:{port} handshake done ({} bytes in, {} bytes out)",
                    socket.total_bytes_in(),
                    socket.total_bytes_out()
                );
                socket.close()?;
                return Ok(());
            }
            ProbeEvent::State(state) => println!("{host}:{port} {state}"),
            ProbeEvent::Status(status) => {
                println!("{host}:{port} {status}");
                return Err(livepush::Error::Io(std::io::Error::other(status.to_string())));
            }
        }
    }
    Err(livepush::Error::SocketGone)
}

/// Minimal High profile `avcC` for synthetic pictures.
fn synthetic_avcc() -> Bytes {
    let sps = [0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50];
    let pps = [0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];
    let mut record = vec![1, 0x64, 0x00, 0x1F, 0xFF, 0xE1];
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(&sps);
    record.push(1);
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(&pps);
    Bytes::from(record)
}

fn mux_stats(seconds: u64, fps: u64, fragment_size: usize) {
    let fps = fps.max(1);
    let fragment_size = fragment_size.max(PACKET_SIZE);
    let mut muxer = TsMuxer::with_fragment_size(Vec::<Bytes>::new(), fragment_size);
    muxer.start();
    muxer.set_video_format(&VideoFormat {
        codec: FourCc::AVC,
        decoder_config: synthetic_avcc(),
    });
    muxer.set_audio_format(&AudioFormat::aac(48000, 2));

    // AAC-LC: 1024 samples per frame.
    let audio_frame = Duration::from_micros(1024 * 1_000_000 / 48000);
    let end = Duration::from_secs(seconds);
    let mut audio_pts = Duration::ZERO;
    for frame in 0..seconds * fps {
        let pts = Duration::from_micros(frame * 1_000_000 / fps);
        let keyframe = frame % fps == 0;
        let size: usize = if keyframe { 20_000 } else { 3_000 };
        let mut unit = (size as u32).to_be_bytes().to_vec();
        unit.push(if keyframe { 0x65 } else { 0x41 });
        unit.resize(4 + size, 0xAB);
        muxer.on_encoded_video(&unit, pts, None, keyframe);

        while audio_pts <= pts && audio_pts < end {
            muxer.on_encoded_audio(&[0x21; 256], audio_pts);
            audio_pts += audio_frame;
        }
    }

    let held = muxer.pending_video();
    let fragments = muxer.into_sink();
    let mut per_pid: BTreeMap<u16, usize> = BTreeMap::new();
    let mut pcrs = 0;
    let stream = fragments.concat();
    for packet in stream.chunks(PACKET_SIZE) {
        if let Some(header) = PacketHeader::parse(packet) {
            *per_pid.entry(header.pid).or_default() += 1;
            if header.pcr.is_some() {
                pcrs += 1;
            }
        }
    }
    let full = fragments.iter().filter(|f| f.len() == fragment_size).count();

    println!("fragments: {} ({} full, {} bytes)", fragments.len(), full, stream.len());
    for (pid, packets) in &per_pid {
        println!("  pid {pid:>5}: {packets} packets");
    }
    println!("PCRs: {pcrs}");
    println!("video bytes still held: {held}");
}

fn srt_url(
    parse: Option<String>,
    host: String,
    port: u16,
    stream_id: String,
    srtla: bool,
    latency: Option<u64>,
) -> livepush::Result<()> {
    let url = match parse {
        Some(input) => PublishUrl::parse(&input)?,
        None => {
            let scheme = if srtla { Scheme::Srtla } else { Scheme::Srt };
            let mut url = PublishUrl::new(scheme, host, port, StreamId::new(stream_id)?);
            if let Some(ms) = latency {
                url.config.latency = Duration::from_millis(ms);
            }
            url
        }
    };
    println!("{url}");
    println!("  host: {}", url.host);
    println!("  port: {}", url.port);
    println!("  stream id: {:?}", url.stream_id.as_str());
    println!("  latency: {} ms", url.config.latency.as_millis());
    Ok(())
}
