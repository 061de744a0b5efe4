//! Firmware version report.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::{VERSION_ENTRY_SIZE, VERSION_HEADER_SIZE};
use super::error::ProtocolError;

/// Version of one component as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentVersion {
    pub component_id: u8,
    pub version: u32,
    pub flags: u8,
    pub vendor_specific: u16,
}

/// Parsed `GET_FIRMWARE_VERSION` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareVersions {
    pub protocol_revision: u8,
    pub components: Vec<ComponentVersion>,
}

impl FirmwareVersions {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < VERSION_HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                expected: VERSION_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let count = data[0] as usize;
        let protocol_revision = data[3] & 0x0F;

        let available = (data.len() - VERSION_HEADER_SIZE) / VERSION_ENTRY_SIZE;
        if available < count {
            return Err(ProtocolError::TruncatedVersionReport {
                declared: count,
                available,
            });
        }

        let mut cursor = Cursor::new(&data[VERSION_HEADER_SIZE..]);
        let mut components = Vec::with_capacity(count);
        for _ in 0..count {
            // Length checked above, reads cannot fail.
            let version = cursor.read_u32::<LittleEndian>().unwrap_or_default();
            let flags = cursor.read_u8().unwrap_or_default();
            let component_id = cursor.read_u8().unwrap_or_default();
            let vendor_specific = cursor.read_u16::<LittleEndian>().unwrap_or_default();
            components.push(ComponentVersion {
                component_id,
                version,
                flags,
                vendor_specific,
            });
        }

        Ok(Self {
            protocol_revision,
            components,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; VERSION_HEADER_SIZE];
        buf[0] = self.components.len() as u8;
        buf[3] = self.protocol_revision & 0x0F;
        for c in &self.components {
            buf.extend_from_slice(&c.version.to_le_bytes());
            buf.push(c.flags);
            buf.push(c.component_id);
            buf.extend_from_slice(&c.vendor_specific.to_le_bytes());
        }
        buf
    }

    /// Version reported for `component_id`, if any.
    pub fn version_of(&self, component_id: u8) -> Option<u32> {
        self.components
            .iter()
            .find(|c| c.component_id == component_id)
            .map(|c| c.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_components() {
        let report = FirmwareVersions {
            protocol_revision: 2,
            components: vec![
                ComponentVersion {
                    component_id: 0x21,
                    version: 0x0001_0203,
                    flags: 0,
                    vendor_specific: 0,
                },
                ComponentVersion {
                    component_id: 0x22,
                    version: 0x0A0B_0C0D,
                    flags: 1,
                    vendor_specific: 0xBEEF,
                },
            ],
        };
        let parsed = FirmwareVersions::from_bytes(&report.to_bytes()).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(parsed.version_of(0x22), Some(0x0A0B_0C0D));
        assert_eq!(parsed.version_of(0x30), None);
    }

    #[test]
    fn test_truncated_report() {
        let raw = [3u8, 0, 0, 2, 1, 2, 3, 4, 0, 0x21, 0, 0];
        assert_eq!(
            FirmwareVersions::from_bytes(&raw),
            Err(ProtocolError::TruncatedVersionReport {
                declared: 3,
                available: 1
            })
        );
    }
}
