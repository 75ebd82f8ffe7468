//! Demo: publish a virtual bridge (a lamp and a camera) and advertise it
//! over mDNS. The network transport is out of scope here; this exercises
//! the engine's publish/dispatch/notification lifecycle end to end.

use async_trait::async_trait;
use hap_accessory::{
    Accessory, Category, Characteristic, ConnectionId, MemoryStorage, OnWrite, Service,
};
use hap_camera::{
    stream_management_service, MediaDelegate, MediaError, PrepareRequest, ReconfigureRequest,
    StartRequest, StopRequest, StreamEndpoint, StreamSessionManager, StreamSessionSlot,
};
use hap_core::hap_type::{characteristic as char_type, service as service_type};
use hap_core::{Format, HapStatus, HapValue, Perms};
use hap_server::{AccessoryServer, AdvertisedState, Advertiser, EventSink, PushedEvent};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Advertises the accessory root as a `_hap._tcp` service.
struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    device_id: String,
    port: u16,
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn update(&self, state: AdvertisedState) {
        let mut txt = HashMap::new();
        txt.insert("c#".to_string(), state.config_version.to_string());
        txt.insert("ff".to_string(), "0".to_string());
        txt.insert("id".to_string(), self.device_id.clone());
        txt.insert("md".to_string(), state.name.clone());
        txt.insert("pv".to_string(), "1.1".to_string());
        txt.insert("s#".to_string(), "1".to_string());
        txt.insert(
            "sf".to_string(),
            if state.paired { "0" } else { "1" }.to_string(),
        );
        txt.insert("ci".to_string(), state.category.to_string());

        let host = format!("{}.local.", self.device_id.replace(':', "-"));
        match ServiceInfo::new("_hap._tcp.local.", &state.name, &host, "", self.port, txt) {
            Ok(service) => {
                if let Err(err) = self.daemon.register(service.enable_addr_auto()) {
                    warn!(%err, "mDNS registration failed");
                }
            }
            Err(err) => warn!(%err, "could not build mDNS service info"),
        }
    }
}

/// Prints pushed events instead of writing them to a transport.
struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, connection: ConnectionId, event: PushedEvent, immediate: bool) {
        info!(
            %connection,
            aid = event.aid,
            iid = event.iid,
            immediate,
            "event push"
        );
    }
}

/// Lamp write handler: just log what a real lamp would do.
struct LampPower;

#[async_trait]
impl OnWrite for LampPower {
    async fn write(
        &self,
        value: HapValue,
        _originator: Option<ConnectionId>,
    ) -> Result<Option<HapValue>, HapStatus> {
        info!(?value, "lamp power set");
        Ok(None)
    }
}

/// Media delegate that only logs; a real camera would drive its encoder.
struct LoggingCamera;

#[async_trait]
impl MediaDelegate for LoggingCamera {
    async fn prepare_stream(&self, request: PrepareRequest) -> Result<StreamEndpoint, MediaError> {
        info!(
            controller = %request.controller_address.address,
            "preparing stream"
        );
        Ok(StreamEndpoint {
            address: "192.168.1.9".parse().map_err(|_| {
                MediaError("demo endpoint address is invalid".to_string())
            })?,
            video_port: 51000,
            audio_port: 51002,
        })
    }

    async fn start_stream(&self, request: StartRequest) -> Result<(), MediaError> {
        info!(
            width = request.video.attributes.width,
            height = request.video.attributes.height,
            "starting stream"
        );
        Ok(())
    }

    async fn reconfigure_stream(&self, request: ReconfigureRequest) -> Result<(), MediaError> {
        info!(
            width = request.video.attributes.width,
            height = request.video.attributes.height,
            "reconfiguring stream"
        );
        Ok(())
    }

    async fn stop_stream(&self, _request: StopRequest) {
        info!("stopping stream");
    }
}

fn lamp() -> (Accessory, Arc<Characteristic>) {
    let mut accessory = Accessory::new(
        Uuid::new_v4(),
        "Demo Lamp",
        Category::Lightbulb,
    );
    let mut service = Service::new(service_type::LIGHTBULB, None);
    let on = service
        .add_characteristic(Characteristic::new(
            char_type::ON,
            Format::Bool,
            Perms::read_write_notify(),
        ))
        .expect("fresh lightbulb service");
    on.on_write(Arc::new(LampPower));
    accessory
        .add_service(service)
        .expect("fresh accessory");
    (accessory, on)
}

fn camera(sessions: &mut StreamSessionManager) -> Accessory {
    let mut accessory = Accessory::new(Uuid::new_v4(), "Demo Camera", Category::IpCamera);
    let slot = StreamSessionSlot::new(Arc::new(LoggingCamera));
    let service = stream_management_service(&slot, None, vec![], vec![], vec![]);
    accessory.add_service(service).expect("fresh accessory");
    sessions.add_slot(slot);
    accessory
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(err) => {
            warn!(%err, "mDNS daemon unavailable, exiting");
            return;
        }
    };
    let advertiser = Arc::new(MdnsAdvertiser {
        daemon,
        device_id: "11:22:33:44:55:66".to_string(),
        port: 51826,
    });

    let mut bridge = Accessory::new(Uuid::new_v4(), "Demo Bridge", Category::Bridge);
    let (lamp, lamp_on) = lamp();
    let mut sessions = StreamSessionManager::new();
    let cam = camera(&mut sessions);
    bridge.add_bridged_accessory(lamp).expect("bridge has room");
    bridge.add_bridged_accessory(cam).expect("bridge has room");

    let server = match AccessoryServer::new(
        bridge,
        Arc::new(MemoryStorage::new()),
        advertiser,
        Arc::new(LogSink),
    )
    .await
    {
        Ok(server) => server,
        Err(err) => {
            warn!(%err, "could not build accessory server");
            return;
        }
    };

    if let Err(err) = server.publish().await {
        warn!(%err, "publish failed");
        return;
    }
    info!("bridge published, toggling the lamp every 10s");

    let mut ticker = time::interval(Duration::from_secs(10));
    let mut lit = false;
    loop {
        ticker.tick().await;
        lit = !lit;
        lamp_on.update_value(HapValue::Bool(lit));
    }
}
