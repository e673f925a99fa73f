//! SRT publishing: couples the transport stream muxer to an SRT sender.
//!
//! The sender itself (pacing, retransmission, link bonding) is an external
//! collaborator behind [`SrtSender`]. [`SrtStream`] only moves fragments:
//!
//! ```text
//! encoders ──▶ TsMuxer ──▶ fragment queue ──▶ output task ──▶ SrtSender
//!                 ▲                                            │
//!                 └──── start / stop ◀── control task ◀── SenderEvent
//! ```

pub mod url;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::media::{AudioFormat, MediaSink, VideoFormat};
use crate::mpegts::{FragmentSink, TsMuxer};

pub use url::{PublishUrl, Scheme, StreamId};

/// Session settings passed to the sender at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtConfig {
    /// Receiver latency budget.
    pub latency: Duration,
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(3000),
        }
    }
}

/// Notifications a sender posts back to its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    Connected,
    Disconnected,
    /// A datagram for the network.
    Output(Bytes),
}

/// Handle a sender uses to post [`SenderEvent`]s. Events posted after the
/// stream closed are dropped.
#[derive(Debug, Clone)]
pub struct SenderEvents(mpsc::UnboundedSender<SenderEvent>);

impl SenderEvents {
    pub fn connected(&self) {
        self.post(SenderEvent::Connected);
    }

    pub fn disconnected(&self) {
        self.post(SenderEvent::Disconnected);
    }

    pub fn output(&self, packet: Bytes) {
        self.post(SenderEvent::Output(packet));
    }

    fn post(&self, event: SenderEvent) {
        let _ = self.0.send(event);
    }
}

/// Sender statistics for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceSnapshot {
    pub packets_sent: u64,
    pub packets_retransmitted: u64,
    pub packets_dropped: u64,
    pub round_trip_time: Duration,
    /// Packets waiting in the sender's queue.
    pub send_queue: usize,
}

/// Reliable transport sender contract.
pub trait SrtSender: Send + 'static {
    type Packet: Send;

    /// Start a session; connect and disconnect are reported through `events`.
    fn open(&mut self, stream_id: &StreamId, latency: Duration, events: SenderEvents);

    /// Wrap one fragment-sized payload.
    fn data_packet(&mut self, payload: Bytes) -> Self::Packet;

    fn enqueue(&mut self, packet: Self::Packet, now: Instant);

    /// Transmit what is due and run retransmission bookkeeping.
    fn flush(&mut self, now: Instant);

    /// Feed an inbound datagram (ACK, NAK, keepalive).
    fn input(&mut self, packet: Bytes);

    fn performance(&self) -> PerformanceSnapshot;

    fn close(&mut self);
}

/// Receives stream notifications. Called from the stream's control task.
pub trait SrtStreamListener: Send + 'static {
    fn connected(&mut self) {}

    fn disconnected(&mut self) {}

    /// A datagram the sender wants on the network.
    fn output(&mut self, _packet: Bytes) {}
}

/// A fragment tagged with the session that produced it.
struct Fragment {
    session: u64,
    data: Bytes,
}

/// Fragment sink feeding the output task.
#[derive(Debug)]
struct FragmentQueue {
    queue: mpsc::UnboundedSender<Fragment>,
    depth: Arc<AtomicUsize>,
    session: Arc<AtomicU64>,
}

impl FragmentSink for FragmentQueue {
    fn write_fragment(&mut self, data: Bytes) {
        let fragment = Fragment {
            session: self.session.load(Ordering::Acquire),
            data,
        };
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.queue.send(fragment).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Latest formats announced by the encoders, installed on every connect.
#[derive(Debug, Default)]
struct Formats {
    audio: Option<AudioFormat>,
    video: Option<VideoFormat>,
}

struct Shared<T: SrtSender> {
    /// Lock order: `muxer` before `formats`.
    muxer: Mutex<TsMuxer<FragmentQueue>>,
    formats: Mutex<Formats>,
    sender: Mutex<Option<T>>,
    listener: Mutex<Box<dyn SrtStreamListener>>,
    publishing: AtomicBool,
    depth: Arc<AtomicUsize>,
    /// Bumped by `close()`; the output task drops fragments of older sessions.
    session: Arc<AtomicU64>,
}

/// MPEG-TS over SRT.
///
/// Encoder input is forwarded to the muxer only while the sender reports a
/// connection. Must be created within a tokio runtime.
pub struct SrtStream<T: SrtSender> {
    shared: Arc<Shared<T>>,
    output: JoinHandle<()>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SrtSender> SrtStream<T> {
    pub fn new(listener: Box<dyn SrtStreamListener>) -> Self {
        let (queue, fragments) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(Shared {
            muxer: Mutex::new(TsMuxer::new(FragmentQueue {
                queue,
                depth: depth.clone(),
                session: session.clone(),
            })),
            formats: Mutex::new(Formats::default()),
            sender: Mutex::new(None),
            listener: Mutex::new(listener),
            publishing: AtomicBool::new(false),
            depth,
            session,
        });
        let output = tokio::spawn(output_loop(shared.clone(), fragments));
        Self {
            shared,
            output,
            control: Mutex::new(None),
        }
    }

    /// Open a session on `sender`, replacing any previous one.
    pub fn open(&self, mut sender: T, stream_id: &StreamId, latency: Duration) {
        self.close();

        let (events, event_rx) = mpsc::unbounded_channel();
        tracing::info!(stream_id = %stream_id, latency_ms = latency.as_millis() as u64, "srt stream opening");
        sender.open(stream_id, latency, SenderEvents(events));
        *self.shared.sender.lock() = Some(sender);
        *self.control.lock() = Some(tokio::spawn(control_loop(self.shared.clone(), event_rx)));
    }

    /// Close the sender and stop muxing.
    pub fn close(&self) {
        if let Some(control) = self.control.lock().take() {
            control.abort();
        }
        if let Some(mut sender) = self.shared.sender.lock().take() {
            sender.close();
            tracing::info!("srt stream closed");
        }
        let mut muxer = self.shared.muxer.lock();
        self.shared.publishing.store(false, Ordering::Release);
        self.shared.session.fetch_add(1, Ordering::AcqRel);
        muxer.stop();
    }

    /// Feed an inbound network datagram to the sender.
    pub fn input_packet(&self, packet: Bytes) {
        if let Some(sender) = self.shared.sender.lock().as_mut() {
            sender.input(packet);
        }
    }

    pub fn performance(&self) -> Option<PerformanceSnapshot> {
        self.shared.sender.lock().as_ref().map(|sender| sender.performance())
    }

    /// The sender is connected and encoder input is being muxed.
    pub fn is_publishing(&self) -> bool {
        self.shared.publishing.load(Ordering::Acquire)
    }

    /// Fragments produced but not yet handed to the sender.
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }
}

impl<T: SrtSender> Drop for SrtStream<T> {
    fn drop(&mut self) {
        self.close();
        self.output.abort();
    }
}

impl<T: SrtSender> MediaSink for SrtStream<T> {
    fn set_audio_format(&mut self, format: &AudioFormat) {
        let mut muxer = self.shared.muxer.lock();
        self.shared.formats.lock().audio = Some(format.clone());
        if self.is_publishing() {
            muxer.set_audio_format(format);
        }
    }

    fn set_video_format(&mut self, format: &VideoFormat) {
        let mut muxer = self.shared.muxer.lock();
        self.shared.formats.lock().video = Some(format.clone());
        if self.is_publishing() {
            muxer.set_video_format(format);
        }
    }

    fn on_encoded_audio(&mut self, data: &[u8], pts: Duration) {
        if self.is_publishing() {
            self.shared.muxer.lock().on_encoded_audio(data, pts);
        }
    }

    fn on_encoded_video(
        &mut self,
        data: &[u8],
        pts: Duration,
        dts: Option<Duration>,
        random_access: bool,
    ) {
        if self.is_publishing() {
            self.shared
                .muxer
                .lock()
                .on_encoded_video(data, pts, dts, random_access);
        }
    }
}

async fn control_loop<T: SrtSender>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<SenderEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SenderEvent::Connected => {
                tracing::info!("srt sender connected");
                {
                    let mut muxer = shared.muxer.lock();
                    muxer.start();
                    let formats = shared.formats.lock();
                    if let Some(video) = &formats.video {
                        muxer.set_video_format(video);
                    }
                    if let Some(audio) = &formats.audio {
                        muxer.set_audio_format(audio);
                    }
                    shared.publishing.store(true, Ordering::Release);
                }
                shared.listener.lock().connected();
            }
            SenderEvent::Disconnected => {
                tracing::info!("srt sender disconnected");
                {
                    let mut muxer = shared.muxer.lock();
                    shared.publishing.store(false, Ordering::Release);
                    muxer.stop();
                }
                shared.listener.lock().disconnected();
            }
            SenderEvent::Output(packet) => shared.listener.lock().output(packet),
        }
    }
}

/// Hand every queued fragment to the sender, one flush per batch.
async fn output_loop<T: SrtSender>(
    shared: Arc<Shared<T>>,
    mut fragments: mpsc::UnboundedReceiver<Fragment>,
) {
    while let Some(first) = fragments.recv().await {
        let mut batch = vec![first];
        while let Ok(fragment) = fragments.try_recv() {
            batch.push(fragment);
        }
        shared.depth.fetch_sub(batch.len(), Ordering::Relaxed);

        let mut sender = shared.sender.lock();
        let Some(sender) = sender.as_mut() else {
            tracing::trace!(fragments = batch.len(), "no srt session, dropping fragments");
            continue;
        };
        // Read under the sender lock: `open` installs a sender only after
        // `close` has moved the session on.
        let session = shared.session.load(Ordering::Acquire);
        let queued = batch.len();
        batch.retain(|fragment| fragment.session == session);
        if batch.len() < queued {
            tracing::debug!(stale = queued - batch.len(), "dropping fragments of a closed srt session");
        }
        if batch.is_empty() {
            continue;
        }
        let now = Instant::now();
        for fragment in batch {
            let packet = sender.data_packet(fragment.data);
            sender.enqueue(packet, now);
        }
        sender.flush(now);
    }
}
