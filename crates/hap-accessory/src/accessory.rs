//! Accessory: the root of the capability tree, optionally bridging child
//! accessories.

use crate::characteristic::Characteristic;
use crate::iid_cache::IdentifierCache;
use crate::service::Service;
use hap_core::hap_type::{characteristic as char_type, service as service_type};
use hap_core::{Format, HapType, HapValue, Perms, StructuralError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Maximum services per accessory.
pub const MAX_SERVICES: usize = 100;

/// Maximum bridged accessories per bridge.
pub const MAX_BRIDGED_ACCESSORIES: usize = 149;

/// Instance-id base for a bridge's own non-information services, keeping
/// them clear of every bridged child's range. Protocol compatibility
/// constant.
pub const BRIDGE_SERVICE_IID_BASE: u64 = 2_000_000_000;

/// Accessory category hint published to the advertiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    Other = 1,
    Bridge = 2,
    Fan = 3,
    GarageDoorOpener = 4,
    Lightbulb = 5,
    DoorLock = 6,
    Outlet = 7,
    Switch = 8,
    Thermostat = 9,
    Sensor = 10,
    SecuritySystem = 11,
    Door = 12,
    Window = 13,
    WindowCovering = 14,
    ProgrammableSwitch = 15,
    RangeExtender = 16,
    IpCamera = 17,
    VideoDoorbell = 18,
    AirPurifier = 19,
}

impl Category {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Resolution map from (aid, iid) to the characteristic serving it.
pub type CharacteristicIndex = HashMap<(u64, u64), Arc<Characteristic>>;

/// A device exposed over the protocol: an ordered set of services, plus
/// bridged child accessories when acting as a bridge.
pub struct Accessory {
    uuid: Uuid,
    name: String,
    category: Category,
    aid: u64,
    services: Vec<Service>,
    children: Vec<Accessory>,
    bridged: bool,
    change_tx: Option<mpsc::UnboundedSender<()>>,
}

impl Accessory {
    /// Create an accessory with its mandatory information service.
    pub fn new(uuid: Uuid, name: impl Into<String>, category: Category) -> Self {
        let name = name.into();

        let mut info = Service::new(service_type::ACCESSORY_INFORMATION, None);
        let entries = [
            (char_type::NAME, name.clone()),
            (char_type::MANUFACTURER, "Default-Manufacturer".to_string()),
            (char_type::MODEL, "Default-Model".to_string()),
            (char_type::SERIAL_NUMBER, "Default-SerialNumber".to_string()),
            (char_type::FIRMWARE_REVISION, "1.0".to_string()),
        ];
        for (hap_type, value) in entries {
            // Fresh information service: these cannot conflict
            let _ = info.add_characteristic(
                Characteristic::new(
                    hap_type,
                    Format::String,
                    Perms::from_raw(Perms::PAIRED_READ),
                )
                .with_initial_value(HapValue::String(value)),
            );
        }
        let _ = info.add_characteristic(Characteristic::new(
            char_type::IDENTIFY,
            Format::Bool,
            Perms::write_only(),
        ));

        Self {
            uuid,
            name,
            category,
            aid: 0,
            services: vec![info],
            children: Vec::new(),
            bridged: false,
            change_tx: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Assigned accessory id, zero before the first assignment pass.
    pub fn aid(&self) -> u64 {
        self.aid
    }

    pub fn ids_assigned(&self) -> bool {
        self.aid != 0
    }

    pub fn is_bridge(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_bridged(&self) -> bool {
        self.bridged
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn bridged_accessories(&self) -> &[Accessory] {
        &self.children
    }

    /// Add a service, enforcing (type, subtype) uniqueness and the
    /// per-accessory cap.
    pub fn add_service(&mut self, service: Service) -> Result<(), StructuralError> {
        if self.find_service(service.hap_type(), service.subtype()).is_some() {
            return Err(StructuralError::DuplicateService {
                service_type: service.hap_type().to_wire(),
                subtype: service.subtype().map(str::to_string),
            });
        }
        if self.services.len() >= MAX_SERVICES {
            return Err(StructuralError::ServiceLimit {
                limit: MAX_SERVICES,
            });
        }
        self.services.push(service);
        self.mark_changed();
        Ok(())
    }

    /// Remove a service by identity.
    pub fn remove_service(
        &mut self,
        hap_type: HapType,
        subtype: Option<&str>,
    ) -> Result<Service, StructuralError> {
        let idx = self
            .services
            .iter()
            .position(|s| s.hap_type() == hap_type && s.subtype() == subtype)
            .ok_or_else(|| StructuralError::ServiceNotFound {
                service_type: hap_type.to_wire(),
                subtype: subtype.map(str::to_string),
            })?;
        let removed = self.services.remove(idx);
        self.mark_changed();
        Ok(removed)
    }

    /// Look up a service by identity.
    pub fn find_service(&self, hap_type: HapType, subtype: Option<&str>) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.hap_type() == hap_type && s.subtype() == subtype)
    }

    pub fn find_service_mut(
        &mut self,
        hap_type: HapType,
        subtype: Option<&str>,
    ) -> Option<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.hap_type() == hap_type && s.subtype() == subtype)
    }

    /// First service of a type regardless of subtype.
    pub fn service_of_type(&self, hap_type: HapType) -> Option<&Service> {
        self.services.iter().find(|s| s.hap_type() == hap_type)
    }

    /// Mark a service primary, clearing any previous primary.
    pub fn set_primary_service(
        &mut self,
        hap_type: HapType,
        subtype: Option<&str>,
    ) -> Result<(), StructuralError> {
        if self.find_service(hap_type, subtype).is_none() {
            return Err(StructuralError::ServiceNotFound {
                service_type: hap_type.to_wire(),
                subtype: subtype.map(str::to_string),
            });
        }
        for service in &mut self.services {
            let is_target = service.hap_type() == hap_type && service.subtype() == subtype;
            service.set_primary(is_target);
        }
        self.mark_changed();
        Ok(())
    }

    /// Link `target` from `source` for UI grouping. Both must exist on this
    /// accessory.
    pub fn add_linked_service(
        &mut self,
        source: (HapType, Option<&str>),
        target: (HapType, Option<&str>),
    ) -> Result<(), StructuralError> {
        if self.find_service(target.0, target.1).is_none() {
            return Err(StructuralError::ServiceNotFound {
                service_type: target.0.to_wire(),
                subtype: target.1.map(str::to_string),
            });
        }
        let source_service = self.find_service_mut(source.0, source.1).ok_or_else(|| {
            StructuralError::ServiceNotFound {
                service_type: source.0.to_wire(),
                subtype: source.1.map(str::to_string),
            }
        })?;
        source_service.push_link((target.0, target.1.map(str::to_string)));
        self.mark_changed();
        Ok(())
    }

    /// Bridge a child accessory.
    pub fn add_bridged_accessory(&mut self, mut child: Accessory) -> Result<(), StructuralError> {
        if child.bridged {
            return Err(StructuralError::AlreadyBridged {
                uuid: child.uuid.to_string(),
            });
        }
        if !child.children.is_empty() {
            return Err(StructuralError::NestedBridge);
        }
        if self.children.len() >= MAX_BRIDGED_ACCESSORIES {
            return Err(StructuralError::BridgeLimit {
                limit: MAX_BRIDGED_ACCESSORIES,
            });
        }
        child.bridged = true;
        child.change_tx = self.change_tx.clone();
        self.children.push(child);
        self.mark_changed();
        Ok(())
    }

    /// Unbridge a child accessory by UUID.
    pub fn remove_bridged_accessory(&mut self, uuid: Uuid) -> Result<Accessory, StructuralError> {
        let idx = self
            .children
            .iter()
            .position(|c| c.uuid == uuid)
            .ok_or_else(|| StructuralError::BridgedAccessoryNotFound {
                uuid: uuid.to_string(),
            })?;
        let mut removed = self.children.remove(idx);
        removed.bridged = false;
        removed.change_tx = None;
        self.mark_changed();
        Ok(removed)
    }

    pub fn bridged_accessory_mut(&mut self, uuid: Uuid) -> Option<&mut Accessory> {
        self.children.iter_mut().find(|c| c.uuid == uuid)
    }

    /// Install the structural-change listener on this accessory and every
    /// bridged child. Changes on a bridged child notify the same root
    /// listener, where they are debounced.
    pub fn set_change_listener(&mut self, tx: mpsc::UnboundedSender<()>) {
        self.change_tx = Some(tx.clone());
        for child in &mut self.children {
            child.change_tx = Some(tx.clone());
        }
    }

    fn mark_changed(&self) {
        if let Some(tx) = &self.change_tx {
            let _ = tx.send(());
        }
    }

    /// One full deterministic id-assignment pass, recursing into bridged
    /// children, bracketed by the cache's usage tracking so stale entries
    /// expire.
    pub fn assign_ids(&mut self, cache: &mut IdentifierCache) {
        cache.begin_usage_tracking();
        self.assign_ids_recursive(cache);
        cache.expire_unused();
    }

    fn assign_ids_recursive(&mut self, cache: &mut IdentifierCache) {
        self.aid = if self.bridged {
            cache.resolve_aid(&self.uuid)
        } else {
            1
        };
        debug!(accessory = %self.name, aid = self.aid, "assigned accessory id");

        // A bridge's own services sit in a reserved range above every
        // bridged child's ids.
        let base = if self.is_bridge() {
            BRIDGE_SERVICE_IID_BASE
        } else {
            0
        };

        let accessory_uuid = self.uuid;
        let aid = self.aid;
        for service in &mut self.services {
            let iid = if service.hap_type() == service_type::ACCESSORY_INFORMATION
                && service.subtype().is_none()
            {
                1
            } else {
                base + cache.resolve_iid(
                    &accessory_uuid,
                    "",
                    &service.hap_type().uuid(),
                    service.subtype(),
                )
            };
            service.set_iid(iid);

            let owner_key = format!(
                "{}|{}",
                service.hap_type().uuid(),
                service.subtype().unwrap_or("")
            );
            for characteristic in service.characteristics() {
                let ciid = base
                    + cache.resolve_iid(
                        &accessory_uuid,
                        &owner_key,
                        &characteristic.hap_type().uuid(),
                        None,
                    );
                characteristic.set_ids(aid, ciid);
            }
        }

        for child in &mut self.children {
            child.assign_ids_recursive(cache);
        }
    }

    /// Build the (aid, iid) resolution map over this accessory and its
    /// bridged children. Only meaningful after an assignment pass.
    pub fn build_index(&self) -> CharacteristicIndex {
        let mut index = CharacteristicIndex::new();
        self.collect_index(&mut index);
        index
    }

    fn collect_index(&self, index: &mut CharacteristicIndex) {
        for service in &self.services {
            for characteristic in service.characteristics() {
                index.insert(characteristic.ids(), Arc::clone(characteristic));
            }
        }
        for child in &self.children {
            child.collect_index(index);
        }
    }

    /// Visit every characteristic in the tree.
    pub fn for_each_characteristic(&self, f: &mut impl FnMut(&Arc<Characteristic>)) {
        for service in &self.services {
            for characteristic in service.characteristics() {
                f(characteristic);
            }
        }
        for child in &self.children {
            child.for_each_characteristic(f);
        }
    }

    /// Resolve a service's linked identities to instance ids.
    pub fn linked_iids(&self, service: &Service) -> Vec<u64> {
        service
            .linked_services()
            .iter()
            .filter_map(|(t, s)| self.find_service(*t, s.as_deref()))
            .map(Service::iid)
            .filter(|iid| *iid != 0)
            .collect()
    }
}
