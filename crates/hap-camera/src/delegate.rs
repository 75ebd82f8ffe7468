//! Media delegate trait (enables mocking in tests).
//!
//! The engine negotiates addresses, crypto, and codec parameters; the
//! delegate supplied by camera-implementation code actually produces and
//! moves media.

use crate::srtp::SrtpParameters;
use crate::tlv_types::{SelectedAudioParameters, SelectedVideoParameters, StreamAddress};
use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// Failure reported by the media delegate. Any delegate error during
/// setup, start, or reconfigure forces an end-equivalent teardown.
#[derive(Error, Debug)]
#[error("media delegate error: {0}")]
pub struct MediaError(pub String);

/// Ask the delegate to prepare a stream toward a controller endpoint.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub session_id: Vec<u8>,
    pub controller_address: StreamAddress,
    /// SRTP material the accessory will send with, mirrored from the
    /// controller's negotiated suites.
    pub video_crypto: SrtpParameters,
    pub audio_crypto: SrtpParameters,
}

/// Where the accessory will emit media from for one session.
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    pub address: IpAddr,
    pub video_port: u16,
    pub audio_port: u16,
}

/// Start streaming with the negotiated codec selection.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: Vec<u8>,
    pub video: SelectedVideoParameters,
    pub audio: Option<SelectedAudioParameters>,
}

/// Apply updated video attributes to a running stream.
#[derive(Debug, Clone)]
pub struct ReconfigureRequest {
    pub session_id: Vec<u8>,
    pub video: SelectedVideoParameters,
}

/// Stop the stream for a session (fire-and-forget).
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub session_id: Vec<u8>,
}

/// Camera-implementation side of a stream slot.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait MediaDelegate: Send + Sync {
    /// Allocate whatever the stream needs and report the accessory-side
    /// endpoint.
    async fn prepare_stream(&self, request: PrepareRequest) -> Result<StreamEndpoint, MediaError>;

    /// Begin emitting media.
    async fn start_stream(&self, request: StartRequest) -> Result<(), MediaError>;

    /// Adjust a running stream.
    async fn reconfigure_stream(&self, request: ReconfigureRequest) -> Result<(), MediaError>;

    /// Stop emitting media. Teardown has already happened; failures are
    /// the delegate's own problem.
    async fn stop_stream(&self, request: StopRequest);
}
