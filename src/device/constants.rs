use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * How long (milliseconds) to wait before reporting a failed scan, so that the rescan which follows is not a
 * hot loop.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * The HID-over-GATT service. Only used as a scan filter to locate the keyboard.
 */
pub const HID_SERVICE: u16 = 0x1812;

/**
 * The standard Battery Service. A split keyboard may expose it once per half.
 */
pub const BATTERY_SERVICE: u16 = 0x180F;

/**
 * The Battery Level characteristic: a single byte in the range [0, 100].
 */
pub const BATTERY_LEVEL_CHARACTERISTIC: u16 = 0x2A19;

/**
 * The Characteristic User Description descriptor. Its string value names the half that a battery level
 * characteristic belongs to.
 */
pub const CHARACTERISTIC_USER_DESCRIPTION: u16 = 0x2901;

/**
 * Battery level byte meaning that the level has not been sampled yet.
 */
pub const NULL_BATTERY_LEVEL: u8 = 0xFF;

/**
 * Highest battery level a compliant peripheral reports.
 */
pub const MAX_BATTERY_LEVEL: u8 = 100;

/**
 * Shown wherever a device did not report a name.
 */
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

pub const fn make_hid_service_uuid() -> Uuid {
    uuid_from_u16(HID_SERVICE)
}

pub const fn make_battery_service_uuid() -> Uuid {
    uuid_from_u16(BATTERY_SERVICE)
}

pub const fn make_battery_level_uuid() -> Uuid {
    uuid_from_u16(BATTERY_LEVEL_CHARACTERISTIC)
}

pub const fn make_user_description_uuid() -> Uuid {
    uuid_from_u16(CHARACTERISTIC_USER_DESCRIPTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_onto_the_base_uuid() {
        assert_eq!(
            make_battery_service_uuid(),
            Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            make_battery_level_uuid(),
            Uuid::parse_str("00002a19-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            make_hid_service_uuid(),
            Uuid::parse_str("00001812-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            make_user_description_uuid(),
            Uuid::parse_str("00002901-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }
}
