//! # hap-camera
//!
//! Camera media-session negotiation: the TLV sub-protocol that sets up
//! authenticated SRTP media transport for one camera stream slot, the
//! AVAILABLE/IN_USE session state machine behind it, and the pluggable
//! media delegate that actually moves bytes.

pub mod delegate;
pub mod session;
pub mod srtp;
pub mod tlv_types;

pub use delegate::{
    MediaDelegate, MediaError, PrepareRequest, ReconfigureRequest, StartRequest, StopRequest,
    StreamEndpoint,
};
pub use session::{
    stream_management_service, StreamSessionManager, StreamSessionSlot, StreamingStatus,
};
pub use srtp::{SrtpCryptoSuite, SrtpParameters};
pub use tlv_types::{
    IpVersion, RtpParameters, SelectedAudioParameters, SelectedConfiguration,
    SelectedVideoParameters, SessionCommand, SessionControl, SetupRequest, SetupResponse,
    SetupStatus, StreamAddress, VideoAttributes,
};
