//! Service: a feature group of characteristics.

use crate::characteristic::Characteristic;
use hap_core::hap_type::characteristic as char_type;
use hap_core::{HapType, StructuralError};
use std::sync::Arc;

/// Maximum characteristics per service.
pub const MAX_CHARACTERISTICS: usize = 100;

/// A group of characteristics identified by (type, subtype) within an
/// accessory.
pub struct Service {
    hap_type: HapType,
    subtype: Option<String>,
    iid: u64,
    primary: bool,
    hidden: bool,
    characteristics: Vec<Arc<Characteristic>>,
    linked: Vec<(HapType, Option<String>)>,
}

impl Service {
    pub fn new(hap_type: HapType, subtype: Option<String>) -> Self {
        Self {
            hap_type,
            subtype,
            iid: 0,
            primary: false,
            hidden: false,
            characteristics: Vec::new(),
            linked: Vec::new(),
        }
    }

    pub fn hap_type(&self) -> HapType {
        self.hap_type
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    /// (type, subtype) identity within the owning accessory.
    pub fn identity(&self) -> (HapType, Option<&str>) {
        (self.hap_type, self.subtype())
    }

    pub fn iid(&self) -> u64 {
        self.iid
    }

    pub(crate) fn set_iid(&mut self, iid: u64) {
        self.iid = iid;
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub(crate) fn set_primary(&mut self, primary: bool) {
        self.primary = primary;
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    /// Add a characteristic, enforcing the per-service cap and type
    /// uniqueness. Returns the shared handle for later value updates.
    ///
    /// The firmware-revision type is the one sanctioned duplicate: adding
    /// it again coalesces into the existing characteristic (its value is
    /// replaced) instead of failing.
    pub fn add_characteristic(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<Arc<Characteristic>, StructuralError> {
        if let Some(existing) = self.characteristic(characteristic.hap_type()) {
            if characteristic.hap_type() == char_type::FIRMWARE_REVISION {
                let existing = Arc::clone(existing);
                existing.update_value(characteristic.value());
                return Ok(existing);
            }
            return Err(StructuralError::DuplicateCharacteristic {
                characteristic_type: characteristic.hap_type().to_wire(),
            });
        }

        if self.characteristics.len() >= MAX_CHARACTERISTICS {
            return Err(StructuralError::CharacteristicLimit {
                limit: MAX_CHARACTERISTICS,
            });
        }

        let characteristic = Arc::new(characteristic);
        self.characteristics.push(Arc::clone(&characteristic));
        Ok(characteristic)
    }

    /// Look up a characteristic by type.
    pub fn characteristic(&self, hap_type: HapType) -> Option<&Arc<Characteristic>> {
        self.characteristics
            .iter()
            .find(|c| c.hap_type() == hap_type)
    }

    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }

    /// Link another service of the same accessory (UI grouping, not
    /// ownership). Existence is validated by the owning accessory.
    pub(crate) fn push_link(&mut self, target: (HapType, Option<String>)) {
        if !self
            .linked
            .iter()
            .any(|(t, s)| *t == target.0 && s.as_deref() == target.1.as_deref())
        {
            self.linked.push(target);
        }
    }

    pub fn linked_services(&self) -> &[(HapType, Option<String>)] {
        &self.linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_core::hap_type::service as service_type;
    use hap_core::{Format, HapValue, Perms};

    fn lightbulb() -> Service {
        Service::new(service_type::LIGHTBULB, None)
    }

    fn on_characteristic() -> Characteristic {
        Characteristic::new(char_type::ON, Format::Bool, Perms::read_write_notify())
    }

    #[test]
    fn add_and_look_up_characteristic() {
        let mut service = lightbulb();
        service.add_characteristic(on_characteristic()).unwrap();
        assert!(service.characteristic(char_type::ON).is_some());
        assert!(service.characteristic(char_type::BRIGHTNESS).is_none());
    }

    #[test]
    fn duplicate_type_is_structural_conflict() {
        let mut service = lightbulb();
        service.add_characteristic(on_characteristic()).unwrap();
        let err = service.add_characteristic(on_characteristic()).unwrap_err();
        assert!(matches!(
            err,
            StructuralError::DuplicateCharacteristic { .. }
        ));
        assert_eq!(service.characteristics().len(), 1);
    }

    #[test]
    fn firmware_revision_duplicate_coalesces() {
        let mut service = lightbulb();
        let first = service
            .add_characteristic(
                Characteristic::new(
                    char_type::FIRMWARE_REVISION,
                    Format::String,
                    Perms::from_raw(Perms::PAIRED_READ),
                )
                .with_initial_value(HapValue::String("1.0".to_string())),
            )
            .unwrap();

        let coalesced = service
            .add_characteristic(
                Characteristic::new(
                    char_type::FIRMWARE_REVISION,
                    Format::String,
                    Perms::from_raw(Perms::PAIRED_READ),
                )
                .with_initial_value(HapValue::String("1.1".to_string())),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first, &coalesced));
        assert_eq!(service.characteristics().len(), 1);
        assert_eq!(first.value(), HapValue::String("1.1".to_string()));
    }

    #[test]
    fn characteristic_cap_enforced() {
        let mut service = lightbulb();
        for i in 0..MAX_CHARACTERISTICS {
            let t = HapType::short(0x1000 + i as u32);
            service
                .add_characteristic(Characteristic::new(t, Format::Bool, Perms::read_notify()))
                .unwrap();
        }
        let err = service
            .add_characteristic(Characteristic::new(
                HapType::short(0x2000),
                Format::Bool,
                Perms::read_notify(),
            ))
            .unwrap_err();
        assert_eq!(
            err,
            StructuralError::CharacteristicLimit {
                limit: MAX_CHARACTERISTICS
            }
        );
    }

    #[test]
    fn links_are_deduplicated() {
        let mut service = lightbulb();
        service.push_link((service_type::SWITCH, None));
        service.push_link((service_type::SWITCH, None));
        service.push_link((service_type::SWITCH, Some("b".to_string())));
        assert_eq!(service.linked_services().len(), 2);
    }
}
