//! BLE endpoint resolution
//!
//! BLE ELM327 clones expose a serial-like pair of characteristics under a
//! vendor service. The BLE collaborator reports what it discovered and this
//! module picks the characteristic to write commands to and the one to
//! subscribe to for responses.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into a full UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Parse a 16-bit ("FFF0"), 32-bit or full UUID string
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let text = text.trim();
    match text.len() {
        4 => u16::from_str_radix(text, 16).ok().map(short_uuid),
        8 => u32::from_str_radix(text, 16)
            .ok()
            .map(|v| Uuid::from_u128(BASE_UUID | ((v as u128) << 96))),
        _ => Uuid::parse_str(text).ok(),
    }
}

/// Characteristic capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// The resolved command/response pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterEndpoints {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
    /// Use acknowledged writes; false means write-without-response
    pub write_with_response: bool,
}

/// A vendor service layout seen on real adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownLayout {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

/// Known layouts, tried in order before the capability fallback
pub const KNOWN_LAYOUTS: &[KnownLayout] = &[
    KnownLayout {
        service: short_uuid(0xFFF0),
        write: short_uuid(0xFFF2),
        notify: short_uuid(0xFFF1),
    },
    KnownLayout {
        service: short_uuid(0xFFE0),
        write: short_uuid(0xFFE1),
        notify: short_uuid(0xFFE1),
    },
    KnownLayout {
        service: short_uuid(0x18F0),
        write: short_uuid(0x2AF1),
        notify: short_uuid(0x2AF0),
    },
    // vLinker / Vgate
    KnownLayout {
        service: Uuid::from_u128(0xE781_0A71_73AE_499D_8C15_FAA9_AEF0_C3F2),
        write: Uuid::from_u128(0xBEF8_D6C9_9C21_4C9E_B632_BD58_C100_9F9F),
        notify: Uuid::from_u128(0xBEF8_D6C9_9C21_4C9E_B632_BD58_C100_9F9F),
    },
];

/// Standard services that never carry the adapter link
const SKIPPED_SERVICES: &[u16] = &[0x1800, 0x1801, 0x180A, 0x180F];

fn find<'a>(service: &'a GattService, uuid: Uuid) -> Option<&'a GattCharacteristic> {
    service.characteristics.iter().find(|c| c.uuid == uuid)
}

fn endpoints(
    service: &GattService,
    write: &GattCharacteristic,
    notify: &GattCharacteristic,
) -> AdapterEndpoints {
    AdapterEndpoints {
        service: service.uuid,
        write: write.uuid,
        notify: notify.uuid,
        // Prefer the faster unacknowledged write when offered
        write_with_response: !write.properties.write_without_response,
    }
}

fn resolve_known(services: &[GattService]) -> Option<AdapterEndpoints> {
    for layout in KNOWN_LAYOUTS {
        let Some(service) = services.iter().find(|s| s.uuid == layout.service) else {
            continue;
        };
        let write = find(service, layout.write).filter(|c| c.properties.can_write());
        let notify = find(service, layout.notify).filter(|c| c.properties.can_subscribe());
        if let (Some(write), Some(notify)) = (write, notify) {
            return Some(endpoints(service, write, notify));
        }
    }
    None
}

fn resolve_by_capability(services: &[GattService]) -> Option<AdapterEndpoints> {
    services
        .iter()
        .filter(|s| !SKIPPED_SERVICES.iter().any(|short| s.uuid == short_uuid(*short)))
        .find_map(|service| {
            let notify = service
                .characteristics
                .iter()
                .find(|c| c.properties.can_subscribe())?;
            let write = service
                .characteristics
                .iter()
                .find(|c| c.properties.can_write())?;
            Some(endpoints(service, write, notify))
        })
}

/// Pick the write/notify characteristics: known layouts first, then the
/// first service offering both a writable and a subscribable characteristic.
pub fn resolve_endpoints(services: &[GattService]) -> Option<AdapterEndpoints> {
    resolve_known(services).or_else(|| resolve_by_capability(services))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ch(uuid: Uuid, write: bool, wnr: bool, notify: bool) -> GattCharacteristic {
        GattCharacteristic {
            uuid,
            properties: CharacteristicProperties {
                write,
                write_without_response: wnr,
                notify,
                ..Default::default()
            },
        }
    }

    fn device_info_service() -> GattService {
        GattService {
            uuid: short_uuid(0x180A),
            characteristics: vec![ch(short_uuid(0x2A29), true, false, true)],
        }
    }

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            short_uuid(0xFFF0).to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(parse_uuid("FFE1"), Some(short_uuid(0xFFE1)));
        assert_eq!(parse_uuid("0000FFE1"), Some(short_uuid(0xFFE1)));
        assert_eq!(
            parse_uuid("e7810a71-73ae-499d-8c15-faa9aef0c3f2"),
            Some(KNOWN_LAYOUTS[3].service)
        );
        assert_eq!(parse_uuid("nope"), None);
    }

    #[test]
    fn test_fff0_layout() {
        let services = vec![
            device_info_service(),
            GattService {
                uuid: short_uuid(0xFFF0),
                characteristics: vec![
                    ch(short_uuid(0xFFF1), false, false, true),
                    ch(short_uuid(0xFFF2), true, true, false),
                ],
            },
        ];
        assert_eq!(
            resolve_endpoints(&services),
            Some(AdapterEndpoints {
                service: short_uuid(0xFFF0),
                write: short_uuid(0xFFF2),
                notify: short_uuid(0xFFF1),
                write_with_response: false,
            })
        );
    }

    #[test]
    fn test_single_characteristic_layout() {
        let services = vec![GattService {
            uuid: short_uuid(0xFFE0),
            characteristics: vec![ch(short_uuid(0xFFE1), true, false, true)],
        }];
        let ep = resolve_endpoints(&services).unwrap();
        assert_eq!(ep.write, ep.notify);
        assert!(ep.write_with_response);
    }

    #[test]
    fn test_capability_fallback() {
        let vendor = Uuid::from_u128(0x1234_5678_0000_1000_8000_0000_0000_0001);
        let rx = Uuid::from_u128(0x1234_5678_0000_1000_8000_0000_0000_0002);
        let tx = Uuid::from_u128(0x1234_5678_0000_1000_8000_0000_0000_0003);
        let services = vec![
            device_info_service(),
            GattService {
                uuid: vendor,
                characteristics: vec![ch(rx, false, false, true), ch(tx, false, true, false)],
            },
        ];
        let ep = resolve_endpoints(&services).unwrap();
        assert_eq!(ep.service, vendor);
        assert_eq!(ep.notify, rx);
        assert_eq!(ep.write, tx);
    }

    #[test]
    fn test_known_layout_missing_properties_falls_through() {
        // FFF1 cannot notify here, so FFF0 is not usable as a known layout
        let services = vec![GattService {
            uuid: short_uuid(0xFFF0),
            characteristics: vec![
                ch(short_uuid(0xFFF1), false, false, false),
                ch(short_uuid(0xFFF2), true, false, false),
            ],
        }];
        assert_eq!(resolve_endpoints(&services), None);
    }

    #[test]
    fn test_nothing_usable() {
        assert_eq!(resolve_endpoints(&[]), None);
        assert_eq!(resolve_endpoints(&[device_info_service()]), None);
    }
}
