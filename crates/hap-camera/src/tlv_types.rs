//! Typed TLV payloads for the stream-setup sub-protocol.
//!
//! Two characteristics carry this exchange: setup-endpoints (stage 1,
//! address and SRTP negotiation) and selected-RTP-stream-configuration
//! (stage 2, session control and codec selection). All tag values, command
//! codes, and status codes are protocol compatibility constants.

use crate::srtp::SrtpParameters;
use hap_core::{Tlv, TlvError};

// Setup-endpoints request tags
const TAG_SESSION_ID: u8 = 0x01;
const TAG_CONTROLLER_ADDRESS: u8 = 0x03;
const TAG_VIDEO_SRTP: u8 = 0x04;
const TAG_AUDIO_SRTP: u8 = 0x05;

// Setup-endpoints response tags
const TAG_RESPONSE_STATUS: u8 = 0x02;
const TAG_ACCESSORY_ADDRESS: u8 = 0x03;
const TAG_VIDEO_SSRC: u8 = 0x06;
const TAG_AUDIO_SSRC: u8 = 0x07;

// Address sub-TLV tags
const TAG_ADDR_IP_VERSION: u8 = 0x01;
const TAG_ADDR_IP_ADDRESS: u8 = 0x02;
const TAG_ADDR_VIDEO_PORT: u8 = 0x03;
const TAG_ADDR_AUDIO_PORT: u8 = 0x04;

// Selected-configuration tags
const TAG_SESSION_CONTROL: u8 = 0x01;
const TAG_SELECTED_VIDEO: u8 = 0x02;
const TAG_SELECTED_AUDIO: u8 = 0x03;

// Session-control sub-TLV tags
const TAG_CONTROL_SESSION_ID: u8 = 0x01;
const TAG_CONTROL_COMMAND: u8 = 0x02;

// Codec-parameter sub-TLV tags
const TAG_CODEC_TYPE: u8 = 0x01;
const TAG_CODEC_PARAMS: u8 = 0x02;
const TAG_VIDEO_ATTRIBUTES: u8 = 0x03;
const TAG_RTP_PARAMS: u8 = 0x04;
const TAG_COMFORT_NOISE: u8 = 0x05;

const TAG_ATTR_WIDTH: u8 = 0x01;
const TAG_ATTR_HEIGHT: u8 = 0x02;
const TAG_ATTR_FRAMERATE: u8 = 0x03;

const TAG_RTP_PAYLOAD_TYPE: u8 = 0x01;
const TAG_RTP_SSRC: u8 = 0x02;
const TAG_RTP_MAX_BITRATE: u8 = 0x03;
const TAG_RTP_MIN_RTCP_INTERVAL: u8 = 0x04;
const TAG_RTP_MAX_MTU: u8 = 0x05;

const TAG_AUDIO_CHANNELS: u8 = 0x01;
const TAG_AUDIO_BITRATE: u8 = 0x02;
const TAG_AUDIO_SAMPLE_RATE: u8 = 0x03;

fn f32_field(tlv: &Tlv, tag: u8) -> Result<f32, TlvError> {
    let v = tlv.required(tag)?;
    match v {
        [a, b, c, d] => Ok(f32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(TlvError::UnexpectedLength { tag, len: v.len() }),
    }
}

/// Address family of an endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpVersion {
    V4 = 0,
    V6 = 1,
}

impl IpVersion {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::V4),
            1 => Some(Self::V6),
            _ => None,
        }
    }
}

/// One side's media endpoint: IP address plus video/audio RTP ports. The
/// same TLV layout carries the controller's address in the request and the
/// accessory's in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAddress {
    pub ip_version: IpVersion,
    pub address: String,
    pub video_rtp_port: u16,
    pub audio_rtp_port: u16,
}

impl StreamAddress {
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        let raw_version = tlv.u8(TAG_ADDR_IP_VERSION)?;
        let ip_version = IpVersion::from_u8(raw_version).ok_or(TlvError::InvalidValue {
            tag: TAG_ADDR_IP_VERSION,
            reason: format!("unknown ip version {}", raw_version),
        })?;
        let address = String::from_utf8(tlv.required(TAG_ADDR_IP_ADDRESS)?.to_vec()).map_err(
            |_| TlvError::InvalidValue {
                tag: TAG_ADDR_IP_ADDRESS,
                reason: "address is not utf-8".to_string(),
            },
        )?;
        Ok(Self {
            ip_version,
            address,
            video_rtp_port: tlv.u16(TAG_ADDR_VIDEO_PORT)?,
            audio_rtp_port: tlv.u16(TAG_ADDR_AUDIO_PORT)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push_u8(TAG_ADDR_IP_VERSION, self.ip_version as u8);
        tlv.push(TAG_ADDR_IP_ADDRESS, self.address.as_bytes().to_vec());
        tlv.push_u16(TAG_ADDR_VIDEO_PORT, self.video_rtp_port);
        tlv.push_u16(TAG_ADDR_AUDIO_PORT, self.audio_rtp_port);
        tlv.encode()
    }
}

/// Stage-1 setup request written to the setup-endpoints characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    pub session_id: Vec<u8>,
    pub controller_address: StreamAddress,
    pub video_crypto: SrtpParameters,
    pub audio_crypto: SrtpParameters,
}

impl SetupRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(payload)?;
        Ok(Self {
            session_id: tlv.required(TAG_SESSION_ID)?.to_vec(),
            controller_address: StreamAddress::decode(tlv.required(TAG_CONTROLLER_ADDRESS)?)?,
            video_crypto: SrtpParameters::decode(tlv.required(TAG_VIDEO_SRTP)?)?,
            audio_crypto: SrtpParameters::decode(tlv.required(TAG_AUDIO_SRTP)?)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push(TAG_SESSION_ID, self.session_id.clone());
        tlv.push(TAG_CONTROLLER_ADDRESS, self.controller_address.encode());
        tlv.push(TAG_VIDEO_SRTP, self.video_crypto.encode());
        tlv.push(TAG_AUDIO_SRTP, self.audio_crypto.encode());
        tlv.encode()
    }
}

/// Stage-1 setup outcome. Wire values are protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStatus {
    Success = 0,
    Busy = 1,
    Error = 2,
}

impl SetupStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Busy),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Stage-1 setup response read back from the setup-endpoints
/// characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupResponse {
    pub session_id: Vec<u8>,
    pub status: SetupStatus,
    pub accessory_address: Option<StreamAddress>,
    pub video_crypto: Option<SrtpParameters>,
    pub audio_crypto: Option<SrtpParameters>,
    pub video_ssrc: Option<u32>,
    pub audio_ssrc: Option<u32>,
}

impl SetupResponse {
    /// A busy rejection tagged with the requested session id.
    pub fn busy(session_id: Vec<u8>) -> Self {
        Self::status_only(session_id, SetupStatus::Busy)
    }

    /// A setup failure tagged with the requested session id.
    pub fn error(session_id: Vec<u8>) -> Self {
        Self::status_only(session_id, SetupStatus::Error)
    }

    fn status_only(session_id: Vec<u8>, status: SetupStatus) -> Self {
        Self {
            session_id,
            status,
            accessory_address: None,
            video_crypto: None,
            audio_crypto: None,
            video_ssrc: None,
            audio_ssrc: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push(TAG_SESSION_ID, self.session_id.clone());
        tlv.push_u8(TAG_RESPONSE_STATUS, self.status as u8);
        if let Some(address) = &self.accessory_address {
            tlv.push(TAG_ACCESSORY_ADDRESS, address.encode());
        }
        if let Some(crypto) = &self.video_crypto {
            tlv.push(TAG_VIDEO_SRTP, crypto.encode());
        }
        if let Some(crypto) = &self.audio_crypto {
            tlv.push(TAG_AUDIO_SRTP, crypto.encode());
        }
        if let Some(ssrc) = self.video_ssrc {
            tlv.push_u32(TAG_VIDEO_SSRC, ssrc);
        }
        if let Some(ssrc) = self.audio_ssrc {
            tlv.push_u32(TAG_AUDIO_SSRC, ssrc);
        }
        tlv.encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(payload)?;
        let raw_status = tlv.u8(TAG_RESPONSE_STATUS)?;
        let status = SetupStatus::from_u8(raw_status).ok_or(TlvError::InvalidValue {
            tag: TAG_RESPONSE_STATUS,
            reason: format!("unknown status {}", raw_status),
        })?;
        Ok(Self {
            session_id: tlv.required(TAG_SESSION_ID)?.to_vec(),
            status,
            accessory_address: tlv
                .first(TAG_ACCESSORY_ADDRESS)
                .map(StreamAddress::decode)
                .transpose()?,
            video_crypto: tlv
                .first(TAG_VIDEO_SRTP)
                .map(SrtpParameters::decode)
                .transpose()?,
            audio_crypto: tlv
                .first(TAG_AUDIO_SRTP)
                .map(SrtpParameters::decode)
                .transpose()?,
            video_ssrc: tlv.contains(TAG_VIDEO_SSRC).then(|| tlv.u32(TAG_VIDEO_SSRC)).transpose()?,
            audio_ssrc: tlv.contains(TAG_AUDIO_SSRC).then(|| tlv.u32(TAG_AUDIO_SSRC)).transpose()?,
        })
    }
}

/// Stage-2 session-control commands. Wire values are protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionCommand {
    End = 0,
    Start = 1,
    Suspend = 2,
    Resume = 3,
    Reconfigure = 4,
}

impl SessionCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::End),
            1 => Some(Self::Start),
            2 => Some(Self::Suspend),
            3 => Some(Self::Resume),
            4 => Some(Self::Reconfigure),
            _ => None,
        }
    }
}

/// Stage-2 session-control block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionControl {
    pub session_id: Vec<u8>,
    pub command: SessionCommand,
}

impl SessionControl {
    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        let raw = tlv.u8(TAG_CONTROL_COMMAND)?;
        Ok(Self {
            session_id: tlv.required(TAG_CONTROL_SESSION_ID)?.to_vec(),
            command: SessionCommand::from_u8(raw).ok_or(TlvError::InvalidValue {
                tag: TAG_CONTROL_COMMAND,
                reason: format!("unknown command {}", raw),
            })?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push(TAG_CONTROL_SESSION_ID, self.session_id.clone());
        tlv.push_u8(TAG_CONTROL_COMMAND, self.command as u8);
        tlv.encode()
    }
}

/// Negotiated video frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoAttributes {
    pub width: u16,
    pub height: u16,
    pub framerate: u8,
}

impl VideoAttributes {
    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        Ok(Self {
            width: tlv.u16(TAG_ATTR_WIDTH)?,
            height: tlv.u16(TAG_ATTR_HEIGHT)?,
            framerate: tlv.u8(TAG_ATTR_FRAMERATE)?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push_u16(TAG_ATTR_WIDTH, self.width);
        tlv.push_u16(TAG_ATTR_HEIGHT, self.height);
        tlv.push_u8(TAG_ATTR_FRAMERATE, self.framerate);
        tlv.encode()
    }
}

/// Negotiated RTP transport parameters for one media direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpParameters {
    pub payload_type: u8,
    pub ssrc: u32,
    pub max_bitrate: u16,
    pub min_rtcp_interval: f32,
    pub max_mtu: Option<u16>,
}

impl RtpParameters {
    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        Ok(Self {
            payload_type: tlv.u8(TAG_RTP_PAYLOAD_TYPE)?,
            ssrc: tlv.u32(TAG_RTP_SSRC)?,
            max_bitrate: tlv.u16(TAG_RTP_MAX_BITRATE)?,
            min_rtcp_interval: f32_field(&tlv, TAG_RTP_MIN_RTCP_INTERVAL)?,
            max_mtu: tlv
                .contains(TAG_RTP_MAX_MTU)
                .then(|| tlv.u16(TAG_RTP_MAX_MTU))
                .transpose()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push_u8(TAG_RTP_PAYLOAD_TYPE, self.payload_type);
        tlv.push_u32(TAG_RTP_SSRC, self.ssrc);
        tlv.push_u16(TAG_RTP_MAX_BITRATE, self.max_bitrate);
        tlv.push(
            TAG_RTP_MIN_RTCP_INTERVAL,
            self.min_rtcp_interval.to_le_bytes().to_vec(),
        );
        if let Some(mtu) = self.max_mtu {
            tlv.push_u16(TAG_RTP_MAX_MTU, mtu);
        }
        tlv.encode()
    }
}

/// Selected video codec, geometry, and RTP parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedVideoParameters {
    pub codec_type: u8,
    pub attributes: VideoAttributes,
    pub rtp: RtpParameters,
}

impl SelectedVideoParameters {
    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        Ok(Self {
            codec_type: tlv.u8(TAG_CODEC_TYPE)?,
            attributes: VideoAttributes::decode(tlv.required(TAG_VIDEO_ATTRIBUTES)?)?,
            rtp: RtpParameters::decode(tlv.required(TAG_RTP_PARAMS)?)?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push_u8(TAG_CODEC_TYPE, self.codec_type);
        tlv.push(TAG_VIDEO_ATTRIBUTES, self.attributes.encode());
        tlv.push(TAG_RTP_PARAMS, self.rtp.encode());
        tlv.encode()
    }
}

/// Selected audio codec and RTP parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedAudioParameters {
    pub codec_type: u8,
    pub channels: u8,
    pub bitrate_mode: u8,
    pub sample_rate: u8,
    pub rtp: RtpParameters,
    pub comfort_noise: bool,
}

impl SelectedAudioParameters {
    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        let params = Tlv::decode(tlv.required(TAG_CODEC_PARAMS)?)?;
        Ok(Self {
            codec_type: tlv.u8(TAG_CODEC_TYPE)?,
            channels: params.u8(TAG_AUDIO_CHANNELS)?,
            bitrate_mode: params.u8(TAG_AUDIO_BITRATE)?,
            sample_rate: params.u8(TAG_AUDIO_SAMPLE_RATE)?,
            rtp: RtpParameters::decode(tlv.required(TAG_RTP_PARAMS)?)?,
            comfort_noise: tlv.u8(TAG_COMFORT_NOISE)? != 0,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut params = Tlv::new();
        params.push_u8(TAG_AUDIO_CHANNELS, self.channels);
        params.push_u8(TAG_AUDIO_BITRATE, self.bitrate_mode);
        params.push_u8(TAG_AUDIO_SAMPLE_RATE, self.sample_rate);

        let mut tlv = Tlv::new();
        tlv.push_u8(TAG_CODEC_TYPE, self.codec_type);
        tlv.push(TAG_CODEC_PARAMS, params.encode());
        tlv.push(TAG_RTP_PARAMS, self.rtp.encode());
        tlv.push_u8(TAG_COMFORT_NOISE, u8::from(self.comfort_noise));
        tlv.encode()
    }
}

/// Stage-2 payload written to the selected-configuration characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedConfiguration {
    pub control: SessionControl,
    pub video: Option<SelectedVideoParameters>,
    pub audio: Option<SelectedAudioParameters>,
}

impl SelectedConfiguration {
    pub fn decode(payload: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(payload)?;
        Ok(Self {
            control: SessionControl::decode(tlv.required(TAG_SESSION_CONTROL)?)?,
            video: tlv
                .first(TAG_SELECTED_VIDEO)
                .map(SelectedVideoParameters::decode)
                .transpose()?,
            audio: tlv
                .first(TAG_SELECTED_AUDIO)
                .map(SelectedAudioParameters::decode)
                .transpose()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push(TAG_SESSION_CONTROL, self.control.encode());
        if let Some(video) = &self.video {
            tlv.push(TAG_SELECTED_VIDEO, video.encode());
        }
        if let Some(audio) = &self.audio {
            tlv.push(TAG_SELECTED_AUDIO, audio.encode());
        }
        tlv.encode()
    }
}
