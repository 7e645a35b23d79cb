//! GATT table discovered on a connected device

use uuid::Uuid;

use crate::error::BleTransportError;
use crate::protocol::{uuid_from_att, TileBusCharacteristic, TILEBUS_SERVICE_UUID};

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

/// Property bits of a characteristic declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }
}

// ----------------------------------------------------------------------------
// Table Entries
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    /// Parse the value of a characteristic declaration attribute
    ///
    /// Layout: properties (u8), value handle (u16 LE), uuid (2 or 16 bytes).
    pub fn from_declaration(
        declaration_handle: u16,
        value: &[u8],
    ) -> Result<Self, BleTransportError> {
        if value.len() < 5 {
            return Err(BleTransportError::Decode(format!(
                "characteristic declaration at 0x{:04x} is {} bytes",
                declaration_handle,
                value.len()
            )));
        }

        let uuid = uuid_from_att(&value[3..]).ok_or_else(|| {
            BleTransportError::Decode(format!(
                "characteristic declaration at 0x{:04x} has a {} byte uuid",
                declaration_handle,
                value.len() - 3
            ))
        })?;

        Ok(Self {
            uuid,
            declaration_handle,
            value_handle: u16::from_le_bytes([value[1], value[2]]),
            properties: CharacteristicProperties(value[0]),
        })
    }

    /// Handle of the client characteristic configuration descriptor
    ///
    /// Assumes the descriptor immediately follows the value attribute, which
    /// holds for every TileBus firmware. `None` when the value handle is the
    /// last one in the attribute table.
    pub fn config_handle(&self) -> Option<u16> {
        self.value_handle.checked_add(1)
    }

    /// Whether notifications can be enabled on this characteristic
    pub fn is_subscribable(&self) -> bool {
        self.properties.can_notify() && self.config_handle().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, start_handle: u16, end_handle: u16) -> Self {
        Self {
            uuid,
            start_handle,
            end_handle,
            characteristics: Vec::new(),
        }
    }

    pub fn contains_handle(&self, handle: u16) -> bool {
        (self.start_handle..=self.end_handle).contains(&handle)
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

// ----------------------------------------------------------------------------
// GATT Table
// ----------------------------------------------------------------------------

/// Services and characteristics of one connected device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattTable {
    services: Vec<Service>,
}

impl GattTable {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.service(uuid).is_some()
    }

    /// Textual uuids of every discovered service
    pub fn service_uuids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.uuid.to_string()).collect()
    }

    pub fn characteristic(&self, service: &Uuid, uuid: &Uuid) -> Option<&Characteristic> {
        self.service(service)?.characteristic(uuid)
    }

    /// Characteristic of the TileBus service
    pub fn tilebus(&self, which: TileBusCharacteristic) -> Option<&Characteristic> {
        self.characteristic(&TILEBUS_SERVICE_UUID, &which.uuid())
    }

    /// Required TileBus characteristics the device lacks
    pub fn missing_required(&self) -> Vec<TileBusCharacteristic> {
        TileBusCharacteristic::REQUIRED
            .iter()
            .copied()
            .filter(|c| self.tilebus(*c).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration(properties: u8, value_handle: u16, short: u16) -> Vec<u8> {
        let mut value = vec![properties];
        value.extend_from_slice(&value_handle.to_le_bytes());
        value.extend_from_slice(&short.to_le_bytes());
        value
    }

    #[test]
    fn test_parse_declaration() {
        let c = Characteristic::from_declaration(0x0011, &declaration(0x10, 0x0012, 0x2001))
            .unwrap();
        assert_eq!(c.uuid, TileBusCharacteristic::ReceiveHeader.uuid());
        assert_eq!(c.value_handle, 0x0012);
        assert_eq!(c.config_handle(), Some(0x0013));
        assert!(c.properties.can_notify());
        assert!(!c.properties.contains(CharacteristicProperties::WRITE));
    }

    #[test]
    fn test_last_value_handle_has_no_config_handle() {
        let c = Characteristic::from_declaration(0xFFFE, &[0x10, 0xFF, 0xFF, 0x01, 0x20]).unwrap();
        assert_eq!(c.value_handle, 0xFFFF);
        assert_eq!(c.config_handle(), None);
        assert!(!c.is_subscribable());
    }

    #[test]
    fn test_notify_property_required_to_subscribe() {
        let c = Characteristic::from_declaration(0x0011, &declaration(0x0A, 0x0012, 0x2001))
            .unwrap();
        assert!(!c.properties.can_notify());
        assert!(!c.is_subscribable());

        let c = Characteristic::from_declaration(0x0011, &declaration(0x20, 0x0012, 0x2001))
            .unwrap();
        assert!(c.is_subscribable());
    }

    #[test]
    fn test_service_handle_range() {
        let service = Service::new(TILEBUS_SERVICE_UUID, 0x10, 0x30);
        assert!(service.contains_handle(0x10));
        assert!(service.contains_handle(0x30));
        assert!(!service.contains_handle(0x0F));
        assert!(!service.contains_handle(0x31));
    }

    #[test]
    fn test_short_declaration_rejected() {
        assert!(Characteristic::from_declaration(0x0011, &[0x10, 0x12]).is_err());
        assert!(Characteristic::from_declaration(0x0011, &[0x10, 0x12, 0x00, 0x01, 0x20, 0x00])
            .is_err());
    }

    #[test]
    fn test_missing_required_characteristics() {
        let mut service = Service::new(TILEBUS_SERVICE_UUID, 0x10, 0x30);
        for (i, which) in [
            TileBusCharacteristic::ReceiveHeader,
            TileBusCharacteristic::SendHeader,
        ]
        .iter()
        .enumerate()
        {
            let decl = 0x11 + 3 * i as u16;
            service.characteristics.push(
                Characteristic::from_declaration(decl, &declaration(0x18, decl + 1, which.short_uuid()))
                    .unwrap(),
            );
        }

        let table = GattTable::new(vec![service]);
        assert!(table.has_service(&TILEBUS_SERVICE_UUID));
        assert_eq!(
            table.missing_required(),
            vec![
                TileBusCharacteristic::ReceivePayload,
                TileBusCharacteristic::SendPayload
            ]
        );
        assert!(table.tilebus(TileBusCharacteristic::Streaming).is_none());
    }
}
