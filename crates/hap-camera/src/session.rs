//! Camera stream slot state machine.
//!
//! One slot serves one RTP stream at a time: AVAILABLE → IN_USE on a
//! successful setup, back to AVAILABLE on end-session, delegate failure,
//! owning-connection close, or factory reset. A setup attempted while the
//! slot is busy is answered BUSY without touching the active session, and
//! a session-control block with a mismatched session id is rejected
//! without altering state.

use crate::delegate::{
    MediaDelegate, PrepareRequest, ReconfigureRequest, StartRequest, StopRequest,
};
use crate::srtp::{SrtpCryptoSuite, SrtpParameters};
use crate::tlv_types::{
    IpVersion, SelectedConfiguration, SessionCommand, SetupRequest, SetupResponse, StreamAddress,
};
use async_trait::async_trait;
use hap_accessory::{Characteristic, ConnectionId, OnWrite, Service};
use hap_core::hap_type::{characteristic as char_type, service as service_type};
use hap_core::{Format, HapStatus, HapValue, Perms, Tlv};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// StreamingStatus characteristic TLV tag
const TAG_STREAMING_STATUS: u8 = 0x01;

/// Value of the streaming-status characteristic. Wire values are protocol
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamingStatus {
    Available = 0,
    InUse = 1,
    Unavailable = 2,
}

/// Encode a streaming status as the characteristic's TLV value.
pub fn streaming_status_value(status: StreamingStatus) -> HapValue {
    let mut tlv = Tlv::new();
    tlv.push_u8(TAG_STREAMING_STATUS, status as u8);
    HapValue::Data(tlv.encode())
}

/// Accessory-side SRTP material mirroring the controller's negotiated
/// suite.
fn accessory_crypto(suite: SrtpCryptoSuite) -> SrtpParameters {
    match suite {
        SrtpCryptoSuite::Disabled => SrtpParameters::disabled(),
        suite => SrtpParameters::generate(suite),
    }
}

/// Local UDP sockets proxying media toward a legacy non-SRTP peer. Owned
/// exclusively by the session that allocated them; released only by that
/// session's teardown.
struct RelaySockets {
    video: UdpSocket,
    audio: UdpSocket,
}

impl RelaySockets {
    async fn bind() -> std::io::Result<Self> {
        Ok(Self {
            video: UdpSocket::bind(("0.0.0.0", 0)).await?,
            audio: UdpSocket::bind(("0.0.0.0", 0)).await?,
        })
    }

    fn ports(&self) -> std::io::Result<(u16, u16)> {
        Ok((
            self.video.local_addr()?.port(),
            self.audio.local_addr()?.port(),
        ))
    }
}

struct ActiveSession {
    session_id: Vec<u8>,
    connection: ConnectionId,
    relay: Option<RelaySockets>,
}

struct SlotState {
    status: StreamingStatus,
    active: Option<ActiveSession>,
}

/// One camera RTP stream slot.
pub struct StreamSessionSlot {
    delegate: Arc<dyn MediaDelegate>,
    state: Mutex<SlotState>,
    status_characteristic: RwLock<Option<Arc<Characteristic>>>,
}

impl StreamSessionSlot {
    pub fn new(delegate: Arc<dyn MediaDelegate>) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            state: Mutex::new(SlotState {
                status: StreamingStatus::Available,
                active: None,
            }),
            status_characteristic: RwLock::new(None),
        })
    }

    /// Mirror slot transitions into the streaming-status characteristic.
    pub fn attach_status_characteristic(&self, characteristic: Arc<Characteristic>) {
        *self
            .status_characteristic
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(characteristic);
    }

    pub async fn status(&self) -> StreamingStatus {
        self.state.lock().await.status
    }

    /// Stage 1: a setup-endpoints write. Returns the TLV response the
    /// controller reads back.
    pub async fn handle_setup(
        &self,
        payload: &[u8],
        connection: ConnectionId,
    ) -> Result<Vec<u8>, HapStatus> {
        let request = SetupRequest::decode(payload).map_err(|err| {
            warn!(%err, "malformed setup-endpoints payload");
            HapStatus::InvalidValue
        })?;

        let mut state = self.state.lock().await;
        if state.active.is_some() {
            warn!(%connection, "stream slot busy, rejecting setup");
            return Ok(SetupResponse::busy(request.session_id).encode());
        }

        // Legacy peers that negotiated no SRTP are bridged through a local
        // relay; everyone else streams direct from the delegate's endpoint.
        let relay = if request.video_crypto.suite == SrtpCryptoSuite::Disabled {
            match RelaySockets::bind().await {
                Ok(relay) => Some(relay),
                Err(err) => {
                    error!(%err, "relay socket allocation failed");
                    return Ok(SetupResponse::error(request.session_id).encode());
                }
            }
        } else {
            None
        };

        let video_crypto = accessory_crypto(request.video_crypto.suite);
        let audio_crypto = accessory_crypto(request.audio_crypto.suite);

        let endpoint = match self
            .delegate
            .prepare_stream(PrepareRequest {
                session_id: request.session_id.clone(),
                controller_address: request.controller_address.clone(),
                video_crypto: video_crypto.clone(),
                audio_crypto: audio_crypto.clone(),
            })
            .await
        {
            Ok(endpoint) => endpoint,
            Err(err) => {
                error!(%err, "delegate failed to prepare stream");
                return Ok(SetupResponse::error(request.session_id).encode());
            }
        };

        let (video_port, audio_port) = match &relay {
            Some(relay) => match relay.ports() {
                Ok(ports) => ports,
                Err(err) => {
                    error!(%err, "relay socket has no local address");
                    return Ok(SetupResponse::error(request.session_id).encode());
                }
            },
            None => (endpoint.video_port, endpoint.audio_port),
        };

        let response = SetupResponse {
            session_id: request.session_id.clone(),
            status: crate::tlv_types::SetupStatus::Success,
            accessory_address: Some(StreamAddress {
                ip_version: if endpoint.address.is_ipv4() {
                    IpVersion::V4
                } else {
                    IpVersion::V6
                },
                address: endpoint.address.to_string(),
                video_rtp_port: video_port,
                audio_rtp_port: audio_port,
            }),
            video_crypto: Some(video_crypto),
            audio_crypto: Some(audio_crypto),
            video_ssrc: Some(rand::random()),
            audio_ssrc: Some(rand::random()),
        };

        state.active = Some(ActiveSession {
            session_id: request.session_id,
            connection,
            relay,
        });
        state.status = StreamingStatus::InUse;
        self.publish_status(StreamingStatus::InUse);
        info!(%connection, "stream session established");
        Ok(response.encode())
    }

    /// Stage 2: a selected-configuration write.
    pub async fn handle_control(&self, payload: &[u8]) -> Result<(), HapStatus> {
        let config = SelectedConfiguration::decode(payload).map_err(|err| {
            warn!(%err, "malformed selected-configuration payload");
            HapStatus::InvalidValue
        })?;

        let mut state = self.state.lock().await;
        let session_id = match state.active.as_ref() {
            Some(active) if active.session_id == config.control.session_id => {
                active.session_id.clone()
            }
            Some(_) => {
                warn!("session control for a different session id");
                return Err(HapStatus::InvalidValue);
            }
            None => {
                warn!("session control with no active session");
                return Err(HapStatus::InvalidValue);
            }
        };

        match config.control.command {
            SessionCommand::Start => {
                let video = config.video.ok_or(HapStatus::InvalidValue)?;
                let request = StartRequest {
                    session_id: session_id.clone(),
                    video,
                    audio: config.audio,
                };
                if let Err(err) = self.delegate.start_stream(request).await {
                    error!(%err, "delegate failed to start stream, tearing down");
                    self.teardown_and_stop(&mut state).await;
                    return Err(HapStatus::ServiceCommunicationFailure);
                }
                info!("stream started");
                Ok(())
            }
            SessionCommand::Reconfigure => {
                let video = config.video.ok_or(HapStatus::InvalidValue)?;
                let request = ReconfigureRequest {
                    session_id: session_id.clone(),
                    video,
                };
                if let Err(err) = self.delegate.reconfigure_stream(request).await {
                    error!(%err, "delegate failed to reconfigure stream, tearing down");
                    self.teardown_and_stop(&mut state).await;
                    return Err(HapStatus::ServiceCommunicationFailure);
                }
                debug!("stream reconfigured");
                Ok(())
            }
            SessionCommand::End => {
                info!("stream ended by controller");
                self.teardown_and_stop(&mut state).await;
                Ok(())
            }
            SessionCommand::Suspend | SessionCommand::Resume => {
                warn!(command = ?config.control.command, "unsupported session command");
                Err(HapStatus::InvalidValue)
            }
        }
    }

    /// The owning transport connection closed: end-equivalent teardown.
    pub async fn handle_connection_closed(&self, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        let owns = state
            .active
            .as_ref()
            .map(|active| active.connection == connection)
            .unwrap_or(false);
        if !owns {
            return;
        }
        info!(%connection, "owning connection closed, tearing down stream");
        self.teardown_and_stop(&mut state).await;
    }

    /// Factory reset / controller removal: teardown without telling the
    /// delegate to stop (the peer is already gone).
    pub async fn force_teardown(&self) {
        let mut state = self.state.lock().await;
        if state.active.is_some() {
            info!("forced stream teardown");
            self.teardown(&mut state);
        }
    }

    /// Release session resources and return the slot to AVAILABLE.
    /// Dropping the active session releases its relay sockets.
    fn teardown(&self, state: &mut SlotState) -> Vec<u8> {
        let session_id = state
            .active
            .take()
            .map(|active| active.session_id)
            .unwrap_or_default();
        state.status = StreamingStatus::Available;
        self.publish_status(StreamingStatus::Available);
        session_id
    }

    async fn teardown_and_stop(&self, state: &mut SlotState) {
        let session_id = self.teardown(state);
        self.delegate
            .stop_stream(StopRequest { session_id })
            .await;
    }

    fn publish_status(&self, status: StreamingStatus) {
        let characteristic = self
            .status_characteristic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(characteristic) = characteristic {
            characteristic.update_value(streaming_status_value(status));
        }
    }
}

/// All stream slots of one accessory root, for lifecycle sweeps.
#[derive(Default)]
pub struct StreamSessionManager {
    slots: Vec<Arc<StreamSessionSlot>>,
}

impl StreamSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slot(&mut self, slot: Arc<StreamSessionSlot>) {
        self.slots.push(slot);
    }

    pub fn slots(&self) -> &[Arc<StreamSessionSlot>] {
        &self.slots
    }

    /// A transport connection closed: tear down every session it owned.
    pub async fn handle_connection_closed(&self, connection: ConnectionId) {
        for slot in &self.slots {
            slot.handle_connection_closed(connection).await;
        }
    }

    /// Factory reset: force every slot down without delegate notification.
    pub async fn factory_reset(&self) {
        for slot in &self.slots {
            slot.force_teardown().await;
        }
    }
}

struct SetupEndpointsHandler {
    slot: Arc<StreamSessionSlot>,
}

#[async_trait]
impl OnWrite for SetupEndpointsHandler {
    async fn write(
        &self,
        value: HapValue,
        originator: Option<ConnectionId>,
    ) -> Result<Option<HapValue>, HapStatus> {
        let payload = value.as_bytes().ok_or(HapStatus::InvalidValue)?;
        // Setup binds the session to its transport connection
        let connection = originator.ok_or(HapStatus::InvalidValue)?;
        let response = self.slot.handle_setup(payload, connection).await?;
        Ok(Some(HapValue::Data(response)))
    }
}

struct SelectedConfigurationHandler {
    slot: Arc<StreamSessionSlot>,
}

#[async_trait]
impl OnWrite for SelectedConfigurationHandler {
    async fn write(
        &self,
        value: HapValue,
        _originator: Option<ConnectionId>,
    ) -> Result<Option<HapValue>, HapStatus> {
        let payload = value.as_bytes().ok_or(HapStatus::InvalidValue)?;
        self.slot.handle_control(payload).await?;
        Ok(None)
    }
}

/// Build a camera RTP stream management service wired to a slot.
///
/// The supported-configuration blobs are the camera's static capability
/// advertisements, produced by the camera implementation.
pub fn stream_management_service(
    slot: &Arc<StreamSessionSlot>,
    subtype: Option<String>,
    supported_video: Vec<u8>,
    supported_audio: Vec<u8>,
    supported_rtp: Vec<u8>,
) -> Service {
    let mut service = Service::new(service_type::CAMERA_RTP_STREAM_MANAGEMENT, subtype);

    // A fresh service with distinct types: none of these adds can conflict
    if let Ok(status) = service.add_characteristic(
        Characteristic::new(
            char_type::STREAMING_STATUS,
            Format::Tlv8,
            Perms::read_notify(),
        )
        .with_initial_value(streaming_status_value(StreamingStatus::Available)),
    ) {
        slot.attach_status_characteristic(status);
    }

    if let Ok(setup) = service.add_characteristic(Characteristic::new(
        char_type::SETUP_ENDPOINTS,
        Format::Tlv8,
        Perms::from_raw(Perms::PAIRED_READ | Perms::PAIRED_WRITE | Perms::WRITE_RESPONSE),
    )) {
        setup.on_write(Arc::new(SetupEndpointsHandler {
            slot: Arc::clone(slot),
        }));
    }

    if let Ok(selected) = service.add_characteristic(Characteristic::new(
        char_type::SELECTED_RTP_STREAM_CONFIGURATION,
        Format::Tlv8,
        Perms::from_raw(Perms::PAIRED_READ | Perms::PAIRED_WRITE),
    )) {
        selected.on_write(Arc::new(SelectedConfigurationHandler {
            slot: Arc::clone(slot),
        }));
    }

    for (hap_type, blob) in [
        (char_type::SUPPORTED_VIDEO_STREAM_CONFIGURATION, supported_video),
        (char_type::SUPPORTED_AUDIO_STREAM_CONFIGURATION, supported_audio),
        (char_type::SUPPORTED_RTP_CONFIGURATION, supported_rtp),
    ] {
        let _ = service.add_characteristic(
            Characteristic::new(
                hap_type,
                Format::Tlv8,
                Perms::from_raw(Perms::PAIRED_READ),
            )
            .with_initial_value(HapValue::Data(blob)),
        );
    }

    service
}
