use std::sync::Arc;

use rand::Rng;
use webrtc::Error as WebRtcError;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// Holds one video and one audio broadcast sink for a session. Each sink is
/// a `TrackLocalStaticRTP`: writing raw RTP bytes fans them out to every
/// peer currently subscribed, with no further work required here.
#[derive(Debug)]
pub struct TrackGroup {
    pub video: Arc<TrackLocalStaticRTP>,
    pub audio: Arc<TrackLocalStaticRTP>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("codec mime type '{0}' is not a valid MIME type (expected e.g. 'video/H264')")]
    InvalidMimeType(String),
}

impl TrackGroup {
    pub fn new(video_codec_mime: &str, audio_codec_mime: &str) -> Result<Self, CodecError> {
        let video_id = random_track_id("video");
        let audio_id = random_track_id("audio");

        let video = Arc::new(TrackLocalStaticRTP::new(
            codec_capability(video_codec_mime)?,
            video_id.clone(),
            video_id,
        ));
        let audio = Arc::new(TrackLocalStaticRTP::new(
            codec_capability(audio_codec_mime)?,
            audio_id.clone(),
            audio_id,
        ));

        Ok(Self { video, audio })
    }

    pub async fn write_video(&self, data: &[u8]) {
        write_ignoring_closed_pipe(&self.video, data, "video").await;
    }

    pub async fn write_audio(&self, data: &[u8]) {
        write_ignoring_closed_pipe(&self.audio, data, "audio").await;
    }
}

async fn write_ignoring_closed_pipe(track: &TrackLocalStaticRTP, data: &[u8], kind: &str) {
    match track.write(data).await {
        Ok(_) => {}
        Err(WebRtcError::ErrClosedPipe) => {}
        Err(e) => tracing::debug!(kind, "track write failed: {e}"),
    }
}

fn codec_capability(mime_type: &str) -> Result<RTCRtpCodecCapability, CodecError> {
    if !mime_type.contains('/') {
        return Err(CodecError::InvalidMimeType(mime_type.to_string()));
    }
    Ok(RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        ..Default::default()
    })
}

fn random_track_id(prefix: &str) -> String {
    let n: u32 = rand::thread_rng().r#gen();
    format!("{prefix}-{n}")
}
