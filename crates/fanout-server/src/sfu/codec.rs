//! Payload type to codec mapping shared by the media engine and subscribers.

use webrtc::api::media_engine::MediaEngine;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use crate::error::Result;

pub const H264_PAYLOAD_TYPE: u8 = 96;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

pub fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        channels: 0,
        // Baseline profile, level 3.1; packetization-mode=1 for FU-A
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Codec a subscriber track must use to carry packets of `payload_type`
pub fn capability_for(payload_type: u8) -> Option<RTCRtpCodecCapability> {
    match payload_type {
        H264_PAYLOAD_TYPE => Some(h264_capability()),
        OPUS_PAYLOAD_TYPE => Some(opus_capability()),
        _ => None,
    }
}

pub fn register_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: h264_capability(),
            payload_type: H264_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_payload_types_map_to_codecs() {
        assert_eq!(capability_for(96).unwrap().mime_type, "video/H264");
        assert_eq!(capability_for(111).unwrap().clock_rate, 48000);
        assert!(capability_for(0).is_none());
        assert!(capability_for(127).is_none());
    }

    #[test]
    fn test_register_codecs() {
        let mut media_engine = MediaEngine::default();
        assert!(register_codecs(&mut media_engine).is_ok());
    }
}
