//! Integration tests: RTMP handshake against a local TCP server, and a
//! muxed stream checked packet by packet.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use livepush::media::{AudioFormat, FourCc, MediaSink, VideoFormat};
use livepush::mpegts::{AUDIO_PID, PACKET_SIZE, PAT_PID, PMT_PID, PacketHeader, TsMuxer, VIDEO_PID};
use livepush::rtmp::handshake::SIGNATURE_SIZE;
use livepush::rtmp::{ConnectionStatus, ReadyState, RtmpSocket, RtmpSocketListener};

#[derive(Debug)]
enum Seen {
    State(ReadyState),
    Data(Vec<u8>),
    Status(ConnectionStatus),
}

struct Forward(mpsc::UnboundedSender<Seen>);

impl RtmpSocketListener for Forward {
    fn data_received(&mut self, buffer: &mut BytesMut) {
        let _ = self.0.send(Seen::Data(buffer.split().to_vec()));
    }

    fn ready_state_changed(&mut self, state: ReadyState) {
        let _ = self.0.send(Seen::State(state));
    }

    fn status(&mut self, status: ConnectionStatus) {
        let _ = self.0.send(Seen::Status(status));
    }
}

#[tokio::test]
async fn rtmp_handshake_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut c0c1 = vec![0u8; 1 + SIGNATURE_SIZE];
        stream.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], 3, "client must offer version 3");

        // S0+S1, S2, then the first bytes of the chunk stream in one write.
        let mut reply = vec![3];
        reply.extend(std::iter::repeat_n(0x11, SIGNATURE_SIZE));
        reply.extend_from_slice(&c0c1[1..]);
        reply.extend_from_slice(b"\x02set-chunk-size");
        stream.write_all(&reply).await.unwrap();

        let mut c2 = vec![0u8; SIGNATURE_SIZE];
        stream.read_exact(&mut c2).await.unwrap();
        assert_eq!(&c2[8..], &[0x11; SIGNATURE_SIZE - 8][..]);
        stream
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let socket = RtmpSocket::new(Forward(tx));
    socket.connect("127.0.0.1", port).unwrap();

    let mut states = Vec::new();
    let mut forwarded = Vec::new();
    let collect = async {
        while forwarded.len() < 15 {
            match rx.recv().await.expect("socket task alive") {
                Seen::State(state) => states.push(state),
                Seen::Data(data) => forwarded.extend(data),
                Seen::Status(status) => panic!("unexpected status {status}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("handshake within 5 s");

    assert_eq!(
        states,
        vec![
            ReadyState::VersionSent,
            ReadyState::AckSent,
            ReadyState::HandshakeDone
        ]
    );
    assert_eq!(forwarded, b"\x02set-chunk-size");
    assert_eq!(socket.ready_state(), ReadyState::HandshakeDone);

    // Server hangs up after the handshake.
    let stream = server.await.unwrap();
    drop(stream);
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Seen::Status(status)) = rx.recv().await {
                return status;
            }
        }
    })
    .await
    .expect("status within 5 s");
    assert_eq!(status, ConnectionStatus::ConnectClosed);
    assert_eq!(socket.ready_state(), ReadyState::Closed);
}

fn avcc() -> Bytes {
    let sps = [0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    let pps = [0x68, 0xEB, 0xE3, 0xCB];
    let mut record = vec![1, 0x64, 0x00, 0x1F, 0xFF, 0xE1];
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(&sps);
    record.push(1);
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(&pps);
    Bytes::from(record)
}

fn picture(size: usize, keyframe: bool) -> Vec<u8> {
    let mut unit = (size as u32).to_be_bytes().to_vec();
    unit.push(if keyframe { 0x65 } else { 0x41 });
    unit.extend(std::iter::repeat_n(0xAB, size - 1));
    unit
}

#[test]
fn three_seconds_of_media() {
    let mut muxer = TsMuxer::new(Vec::<Bytes>::new());
    muxer.start();
    muxer.set_video_format(&VideoFormat {
        codec: FourCc::AVC,
        decoder_config: avcc(),
    });
    muxer.set_audio_format(&AudioFormat::aac(48000, 2));

    // 30 fps video with a keyframe every second, AAC frames every ~21 ms.
    let mut audio_ms = 0u64;
    for frame in 0..90u64 {
        let pts = Duration::from_millis(frame * 1000 / 30);
        let keyframe = frame % 30 == 0;
        muxer.on_encoded_video(&picture(if keyframe { 9000 } else { 1500 }, keyframe), pts, None, keyframe);
        while audio_ms <= frame * 1000 / 30 {
            muxer.on_encoded_audio(&[0x21; 180], Duration::from_millis(audio_ms));
            audio_ms += 21;
        }
    }

    let fragments = muxer.into_sink();
    assert!(fragments.iter().all(|f| f.len() <= 1316 && f.len() % PACKET_SIZE == 0));

    let stream: Vec<u8> = fragments.concat();
    let mut last_cc = std::collections::HashMap::new();
    let mut tables = 0;
    let mut keyframes = 0;
    let mut pcrs = 0;
    for packet in stream.chunks(PACKET_SIZE) {
        let header = PacketHeader::parse(packet).expect("valid packet");
        if let Some(previous) = last_cc.insert(header.pid, header.continuity_counter) {
            assert_eq!(
                header.continuity_counter,
                (previous + 1) % 16,
                "continuity break on PID {}",
                header.pid
            );
        }
        match header.pid {
            PAT_PID => tables += 1,
            VIDEO_PID if header.random_access => keyframes += 1,
            AUDIO_PID if header.pcr.is_some() => pcrs += 1,
            PMT_PID | VIDEO_PID | AUDIO_PID => {}
            other => panic!("unexpected PID {other}"),
        }
    }

    // Install plus one re-emission past the 2 s mark.
    assert_eq!(tables, 2);
    // The last picture is still held in the interleave buffer.
    assert_eq!(keyframes, 3);
    assert!(pcrs > 100);
}
