//! Per-component resume checkpoints and update diagnostics.
//!
//! Values live in a [`CheckpointStore`] under keys of the form
//! `[InstanceID:<id>:]Component<hex2><Field>`, one unsigned 32-bit value
//! per key.

mod store;

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::payload::ChunkCursor;
use crate::protocol::RejectReason;
use crate::protocol::constants::FIRST_SEQUENCE_NUMBER;

pub use store::{CheckpointStore, MemoryStore, StoreError, TomlFileStore};

/// Where an interrupted transfer picks up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeCheckpoint {
    pub cursor: ChunkCursor,
    pub sequence_number: u16,
    pub resume_on_connect: bool,
}

impl ResumeCheckpoint {
    pub fn new(cursor: ChunkCursor, sequence_number: u16) -> Self {
        Self {
            cursor,
            sequence_number,
            resume_on_connect: true,
        }
    }
}

impl Default for ResumeCheckpoint {
    fn default() -> Self {
        Self {
            cursor: ChunkCursor::default(),
            sequence_number: FIRST_SEQUENCE_NUMBER,
            resume_on_connect: false,
        }
    }
}

/// Persisted per-component values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointField {
    ResumePayloadBinRecordIndex,
    ResumePayloadBufferBinRecordDataOffset,
    ResumeSequenceNumber,
    ResumeOnConnect,
    CurrentFwVersion,
    OfferFwVersion,
    FirmwareUpdateStatus,
    FirmwareUpdateStatusRejectReason,
}

impl CheckpointField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointField::ResumePayloadBinRecordIndex => "ResumePayloadBinRecordIndex",
            CheckpointField::ResumePayloadBufferBinRecordDataOffset => {
                "ResumePayloadBufferBinRecordDataOffset"
            }
            CheckpointField::ResumeSequenceNumber => "ResumeSequenceNumber",
            CheckpointField::ResumeOnConnect => "ResumeOnConnect",
            CheckpointField::CurrentFwVersion => "CurrentFwVersion",
            CheckpointField::OfferFwVersion => "OfferFwVersion",
            CheckpointField::FirmwareUpdateStatus => "FirmwareUpdateStatus",
            CheckpointField::FirmwareUpdateStatusRejectReason => {
                "FirmwareUpdateStatusRejectReason"
            }
        }
    }
}

impl fmt::Display for CheckpointField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the store key for one field of one component.
pub fn checkpoint_key(instance_id: Option<&str>, component_id: u8, field: CheckpointField) -> String {
    match instance_id {
        Some(id) if !id.is_empty() => {
            format!("InstanceID:{id}:Component{component_id:02X}{field}")
        }
        _ => format!("Component{component_id:02X}{field}"),
    }
}

/// Outcome of the last update attempt, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpdateStatus {
    NotStarted = 0,
    OfferAccepted = 1,
    OfferRejected = 2,
    OfferSkipped = 3,
    PayloadFailed = 4,
    Interrupted = 5,
    Succeeded = 6,
}

impl UpdateStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(UpdateStatus::NotStarted),
            1 => Some(UpdateStatus::OfferAccepted),
            2 => Some(UpdateStatus::OfferRejected),
            3 => Some(UpdateStatus::OfferSkipped),
            4 => Some(UpdateStatus::PayloadFailed),
            5 => Some(UpdateStatus::Interrupted),
            6 => Some(UpdateStatus::Succeeded),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::NotStarted => write!(f, "NotStarted"),
            UpdateStatus::OfferAccepted => write!(f, "OfferAccepted"),
            UpdateStatus::OfferRejected => write!(f, "OfferRejected"),
            UpdateStatus::OfferSkipped => write!(f, "OfferSkipped"),
            UpdateStatus::PayloadFailed => write!(f, "PayloadFailed"),
            UpdateStatus::Interrupted => write!(f, "Interrupted"),
            UpdateStatus::Succeeded => write!(f, "Succeeded"),
        }
    }
}

/// Typed access to the persisted values of every component of one device.
pub struct ResumeStore {
    backend: Box<dyn CheckpointStore>,
    instance_id: Option<String>,
    // Serializes read-modify-write of a component's checkpoint fields.
    lock: Mutex<()>,
}

impl fmt::Debug for ResumeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeStore")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ResumeStore {
    pub fn new(backend: Box<dyn CheckpointStore>, instance_id: Option<String>) -> Self {
        Self {
            backend,
            instance_id: instance_id.filter(|id| !id.is_empty()),
            lock: Mutex::new(()),
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn key(&self, component_id: u8, field: CheckpointField) -> String {
        checkpoint_key(self.instance_id(), component_id, field)
    }

    pub fn get(&self, component_id: u8, field: CheckpointField) -> Result<Option<u32>, StoreError> {
        self.backend.get(&self.key(component_id, field))
    }

    pub fn set(&self, component_id: u8, field: CheckpointField, value: u32) -> Result<(), StoreError> {
        self.backend.set(&self.key(component_id, field), value)
    }

    /// Read the stored checkpoint, whether or not it is armed.
    pub fn load(&self, component_id: u8) -> Result<Option<ResumeCheckpoint>, StoreError> {
        let _guard = self.lock.lock();
        self.load_locked(component_id)
    }

    /// Write all four checkpoint fields as one update.
    pub fn save(&self, component_id: u8, checkpoint: &ResumeCheckpoint) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let entries = [
            (
                self.key(component_id, CheckpointField::ResumePayloadBinRecordIndex),
                checkpoint.cursor.bin_record_start_index,
            ),
            (
                self.key(component_id, CheckpointField::ResumePayloadBufferBinRecordDataOffset),
                u32::from(checkpoint.cursor.bin_record_data_offset),
            ),
            (
                self.key(component_id, CheckpointField::ResumeSequenceNumber),
                u32::from(checkpoint.sequence_number),
            ),
            (
                self.key(component_id, CheckpointField::ResumeOnConnect),
                u32::from(checkpoint.resume_on_connect),
            ),
        ];
        self.backend.set_many(&entries)?;
        debug!(
            component_id,
            record_index = checkpoint.cursor.bin_record_start_index,
            data_offset = checkpoint.cursor.bin_record_data_offset,
            sequence_number = checkpoint.sequence_number,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Return an armed checkpoint and disarm it in the same update, so a
    /// checkpoint is consumed at most once.
    pub fn take(&self, component_id: u8) -> Result<Option<ResumeCheckpoint>, StoreError> {
        let _guard = self.lock.lock();
        let Some(checkpoint) = self.load_locked(component_id)? else {
            return Ok(None);
        };
        if !checkpoint.resume_on_connect {
            return Ok(None);
        }
        self.backend
            .set(&self.key(component_id, CheckpointField::ResumeOnConnect), 0)?;
        Ok(Some(checkpoint))
    }

    /// Disarm any stored checkpoint.
    pub fn clear(&self, component_id: u8) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        self.backend
            .set(&self.key(component_id, CheckpointField::ResumeOnConnect), 0)
    }

    pub fn set_update_status(
        &self,
        component_id: u8,
        status: UpdateStatus,
        reject_reason: Option<RejectReason>,
    ) -> Result<(), StoreError> {
        let mut entries = vec![(
            self.key(component_id, CheckpointField::FirmwareUpdateStatus),
            status as u32,
        )];
        if let Some(reason) = reject_reason {
            entries.push((
                self.key(component_id, CheckpointField::FirmwareUpdateStatusRejectReason),
                u32::from(reason.as_u8()),
            ));
        }
        self.backend.set_many(&entries)
    }

    pub fn update_status(&self, component_id: u8) -> Result<Option<UpdateStatus>, StoreError> {
        let key = self.key(component_id, CheckpointField::FirmwareUpdateStatus);
        match self.backend.get(&key)? {
            None => Ok(None),
            Some(value) => UpdateStatus::from_u32(value)
                .map(Some)
                .ok_or(StoreError::Corrupt { key, value }),
        }
    }

    /// Reset the status and reject reason to zero. Failures are logged only.
    pub fn clear_update_status(&self, component_id: u8) {
        let entries = [
            (self.key(component_id, CheckpointField::FirmwareUpdateStatus), 0),
            (
                self.key(component_id, CheckpointField::FirmwareUpdateStatusRejectReason),
                0,
            ),
        ];
        if let Err(e) = self.backend.set_many(&entries) {
            warn!(component_id, error = %e, "Failed to clear update status");
        }
    }

    fn load_locked(&self, component_id: u8) -> Result<Option<ResumeCheckpoint>, StoreError> {
        let flag = self.get(component_id, CheckpointField::ResumeOnConnect)?;
        let index = self.get(component_id, CheckpointField::ResumePayloadBinRecordIndex)?;
        let offset = self.get(component_id, CheckpointField::ResumePayloadBufferBinRecordDataOffset)?;
        let sequence = self.get(component_id, CheckpointField::ResumeSequenceNumber)?;

        let (Some(flag), Some(index), Some(offset), Some(sequence)) = (flag, index, offset, sequence)
        else {
            return Ok(None);
        };

        let data_offset = u8::try_from(offset).map_err(|_| StoreError::Corrupt {
            key: self.key(component_id, CheckpointField::ResumePayloadBufferBinRecordDataOffset),
            value: offset,
        })?;
        let sequence_number = u16::try_from(sequence)
            .ok()
            .filter(|s| *s != 0)
            .ok_or_else(|| StoreError::Corrupt {
                key: self.key(component_id, CheckpointField::ResumeSequenceNumber),
                value: sequence,
            })?;

        Ok(Some(ResumeCheckpoint {
            cursor: ChunkCursor::new(index, data_offset),
            sequence_number,
            resume_on_connect: flag != 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_key_naming() {
        assert_eq!(
            checkpoint_key(None, 0x2A, CheckpointField::ResumeSequenceNumber),
            "Component2AResumeSequenceNumber"
        );
        assert_eq!(
            checkpoint_key(Some("dock-1"), 0x05, CheckpointField::ResumeOnConnect),
            "InstanceID:dock-1:Component05ResumeOnConnect"
        );
        assert_eq!(
            checkpoint_key(Some(""), 0x05, CheckpointField::OfferFwVersion),
            "Component05OfferFwVersion"
        );
    }

    #[test]
    fn test_save_then_take_consumes_once() {
        let store = ResumeStore::new(Box::new(MemoryStore::new()), None);
        let checkpoint = ResumeCheckpoint::new(ChunkCursor::new(130, 12), 9);
        store.save(0x21, &checkpoint).unwrap();

        assert_eq!(store.take(0x21).unwrap(), Some(checkpoint));
        assert_eq!(store.take(0x21).unwrap(), None);

        let disarmed = store.load(0x21).unwrap().unwrap();
        assert!(!disarmed.resume_on_connect);
        assert_eq!(disarmed.sequence_number, 9);
    }

    #[test]
    fn test_instances_do_not_collide() {
        let backend = Arc::new(MemoryStore::new());
        let a = ResumeStore::new(Box::new(Arc::clone(&backend)), Some("a".into()));
        let b = ResumeStore::new(Box::new(Arc::clone(&backend)), Some("b".into()));

        a.save(1, &ResumeCheckpoint::new(ChunkCursor::new(5, 0), 2))
            .unwrap();
        assert_eq!(b.take(1).unwrap(), None);
        assert!(a.take(1).unwrap().is_some());
        assert_eq!(
            backend.snapshot().get("InstanceID:a:Component01ResumeOnConnect"),
            Some(&0)
        );
    }

    #[test]
    fn test_corrupt_values_rejected() {
        let backend = Arc::new(MemoryStore::new());
        let store = ResumeStore::new(Box::new(Arc::clone(&backend)), None);
        store
            .save(3, &ResumeCheckpoint::new(ChunkCursor::new(0, 0), 1))
            .unwrap();
        backend
            .set("Component03ResumeSequenceNumber", 0x1_0000)
            .unwrap();
        assert!(matches!(store.take(3), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_update_status_round_trip() {
        let store = ResumeStore::new(Box::new(MemoryStore::new()), None);
        assert_eq!(store.update_status(7).unwrap(), None);
        store
            .set_update_status(7, UpdateStatus::OfferRejected, Some(RejectReason::SwapPending))
            .unwrap();
        assert_eq!(store.update_status(7).unwrap(), Some(UpdateStatus::OfferRejected));
        assert_eq!(
            store
                .get(7, CheckpointField::FirmwareUpdateStatusRejectReason)
                .unwrap(),
            Some(0x02)
        );

        store.clear_update_status(7);
        assert_eq!(store.update_status(7).unwrap(), Some(UpdateStatus::NotStarted));
    }
}
