use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::interleave::{FragmentSink, Interleaver};
use super::packet::{PACKET_SIZE, packetize};
use super::pes::{Pes, ticks};
use super::psi::{ElementaryStream, ProgramAssociation, ProgramMapping, StreamType};
use super::{AUDIO_PID, PAT_PID, PCR_INTERVAL, PMT_PID, SEGMENT_DURATION, VIDEO_PID};
use crate::media::{AudioConfig, AudioFormat, MediaSink, VideoConfig, VideoFormat};

/// Stateful transport stream encoder.
///
/// Accepts format descriptions and access units through [`MediaSink`] and
/// writes network fragments to `S`. Nothing is written until both an audio
/// and a video format are installed; units arriving earlier are dropped.
///
/// ```
/// use std::time::Duration;
/// use bytes::Bytes;
/// use livepush::media::{AudioFormat, MediaSink};
/// use livepush::mpegts::TsMuxer;
///
/// let mut muxer = TsMuxer::new(Vec::<Bytes>::new());
/// muxer.start();
/// muxer.set_audio_format(&AudioFormat::aac(48000, 2));
/// // No video format yet: the frame is dropped.
/// muxer.on_encoded_audio(&[0x21; 32], Duration::ZERO);
/// assert!(muxer.sink().is_empty());
/// ```
#[derive(Debug)]
pub struct TsMuxer<S: FragmentSink> {
    sink: S,
    interleaver: Interleaver,
    running: bool,
    pat: ProgramAssociation,
    pmt: ProgramMapping,
    audio: Option<AudioConfig>,
    video: Option<VideoConfig>,
    /// Next continuity counter per PID, tables included.
    continuity: BTreeMap<u16, u8>,
    last_tables: Duration,
    last_pcr: Duration,
}

impl<S: FragmentSink> TsMuxer<S> {
    pub fn new(sink: S) -> Self {
        Self::with_fragment_size(sink, super::FRAGMENT_SIZE)
    }

    pub fn with_fragment_size(sink: S, fragment_size: usize) -> Self {
        Self {
            sink,
            interleaver: Interleaver::new(fragment_size),
            running: false,
            pat: ProgramAssociation::default(),
            pmt: ProgramMapping::default(),
            audio: None,
            video: None,
            continuity: BTreeMap::new(),
            last_tables: Duration::ZERO,
            last_pcr: Duration::ZERO,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        tracing::debug!("ts muxer started");
    }

    /// Return to the freshly constructed state, keeping the sink.
    pub fn stop(&mut self) {
        self.running = false;
        self.continuity.clear();
        self.pat = ProgramAssociation::default();
        self.pmt = ProgramMapping::default();
        self.audio = None;
        self.video = None;
        self.interleaver.clear();
        self.last_tables = Duration::ZERO;
        self.last_pcr = Duration::ZERO;
        tracing::debug!("ts muxer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Both formats are installed.
    pub fn can_write(&self) -> bool {
        self.audio.is_some() && self.video.is_some()
    }

    pub fn audio_config(&self) -> Option<&AudioConfig> {
        self.audio.as_ref()
    }

    pub fn video_config(&self) -> Option<&VideoConfig> {
        self.video.as_ref()
    }

    /// Video bytes held in the interleave buffer.
    pub fn pending_video(&self) -> usize {
        self.interleaver.pending_video()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x0F;
        current
    }

    fn write_tables(&mut self) {
        self.pmt.pcr_pid = AUDIO_PID;
        let mut pat = self.pat.packet(PAT_PID);
        let mut pmt = self.pmt.packet(PMT_PID);
        pat.continuity_counter = self.next_continuity(PAT_PID);
        pmt.continuity_counter = self.next_continuity(PMT_PID);

        let mut out = BytesMut::with_capacity(2 * PACKET_SIZE);
        pat.encode_into(&mut out);
        pmt.encode_into(&mut out);
        tracing::debug!(streams = self.pmt.streams.len(), "writing PAT/PMT");
        self.interleaver.write_through(&out.freeze(), &mut self.sink);
    }

    fn write_tables_if_ready(&mut self) {
        if self.can_write() {
            self.write_tables();
        }
    }

    /// PCR base for an audio unit at `pts`, if one is due.
    fn take_pcr(&mut self, pts: Duration) -> Option<u64> {
        if pts.saturating_sub(self.last_pcr) < PCR_INTERVAL {
            return None;
        }
        self.last_pcr = pts;
        Some(ticks(pts))
    }

    /// Packetize one PES unit into a serialized packet run. Tables due for
    /// re-emission are written ahead of the run.
    fn encode_run(
        &mut self,
        pid: u16,
        pes: &Pes,
        random_access: bool,
        pcr: Option<u64>,
        pts: Duration,
    ) -> Bytes {
        let packets = packetize(pid, &pes.encode(), random_access, pcr);

        if pts.saturating_sub(self.last_tables) > SEGMENT_DURATION {
            self.write_tables();
            self.last_tables = pts;
        }

        let mut out = BytesMut::with_capacity(packets.len() * PACKET_SIZE);
        for mut packet in packets {
            packet.continuity_counter = self.next_continuity(pid);
            packet.encode_into(&mut out);
        }
        out.freeze()
    }
}

impl<S: FragmentSink> MediaSink for TsMuxer<S> {
    fn set_audio_format(&mut self, format: &AudioFormat) {
        let config = match AudioConfig::from_format(format) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(codec = %format.codec, error = %e, "audio format rejected");
                return;
            }
        };
        tracing::info!(
            codec = config.codec_name(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            "audio format installed"
        );
        let stream_type = match config {
            AudioConfig::Aac { .. } => StreamType::AdtsAac,
            AudioConfig::Opus { .. } => StreamType::PrivateData,
        };
        self.pmt.upsert(ElementaryStream {
            stream_type,
            pid: AUDIO_PID,
            descriptors: config.descriptors(),
        });
        self.continuity.remove(&AUDIO_PID);
        self.audio = Some(config);
        self.write_tables_if_ready();
    }

    fn set_video_format(&mut self, format: &VideoFormat) {
        self.continuity.remove(&VIDEO_PID);
        let config = match VideoConfig::from_format(format) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(codec = %format.codec, error = %e, "video format rejected");
                return;
            }
        };
        tracing::info!(codec = config.codec_name(), "video format installed");
        let stream_type = match config {
            VideoConfig::Avc(_) => StreamType::H264,
            VideoConfig::Hevc(_) => StreamType::H265,
        };
        self.pmt.upsert(ElementaryStream {
            stream_type,
            pid: VIDEO_PID,
            descriptors: Bytes::new(),
        });
        self.video = Some(config);
        self.write_tables_if_ready();
    }

    fn on_encoded_audio(&mut self, data: &[u8], pts: Duration) {
        let pes = match (&self.audio, &self.video) {
            (Some(audio), Some(_)) => Pes::audio(audio, data, pts),
            _ => {
                tracing::trace!(len = data.len(), "audio dropped, formats incomplete");
                return;
            }
        };
        let pcr = self.take_pcr(pts);
        let run = self.encode_run(AUDIO_PID, &pes, true, pcr, pts);
        self.interleaver.write_audio(run, &mut self.sink);
    }

    fn on_encoded_video(
        &mut self,
        data: &[u8],
        pts: Duration,
        dts: Option<Duration>,
        random_access: bool,
    ) {
        let pes = match (&self.audio, &self.video) {
            (Some(_), Some(video)) => Pes::video(video, data, pts, dts, random_access),
            _ => {
                tracing::trace!(len = data.len(), "video dropped, formats incomplete");
                return;
            }
        };
        let pes = match pes {
            Ok(pes) => pes,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed video access unit");
                return;
            }
        };
        let run = self.encode_run(VIDEO_PID, &pes, random_access, None, pts);
        self.interleaver.write_video(run, &mut self.sink);
    }
}
