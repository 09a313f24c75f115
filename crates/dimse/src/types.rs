//! Common types for DIMSE operations

use std::net::SocketAddr;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DimseError, Result};

/// Identity of one accepted association, handed to the association handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationContext {
    /// Opaque session identifier, unique per association
    pub session_id: String,

    /// AE title of the peer that opened the association
    pub calling_aet: String,

    /// AE title the peer addressed
    pub called_aet: String,

    /// Socket address of the peer
    pub peer_addr: SocketAddr,

    /// When the association was accepted
    pub opened_at: chrono::DateTime<chrono::Utc>,
}

impl AssociationContext {
    /// Create a context with a fresh session id
    pub fn new(calling_aet: impl Into<String>, called_aet: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            calling_aet: calling_aet.into(),
            called_aet: called_aet.into(),
            peer_addr,
            opened_at: chrono::Utc::now(),
        }
    }
}

/// A received C-STORE request: command attributes plus the raw data set
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Message ID of the C-STORE-RQ
    pub message_id: u16,

    /// Affected SOP Class UID
    pub sop_class_uid: String,

    /// Affected SOP Instance UID
    pub sop_instance_uid: String,

    /// Transfer syntax negotiated for the presentation context
    pub transfer_syntax: String,

    /// Data set bytes encoded with `transfer_syntax`
    pub payload: Vec<u8>,
}

impl StoreRequest {
    /// Encode an in-memory object into a store request.
    ///
    /// The SOP class and instance UIDs are read from the object itself.
    pub fn from_object(message_id: u16, object: &InMemDicomObject, transfer_syntax: &str) -> Result<Self> {
        let ts = lookup_transfer_syntax(transfer_syntax)?;
        let sop_class_uid = element_str(object, tags::SOP_CLASS_UID)
            .ok_or_else(|| DimseError::DicomObject("SOPClassUID missing".into()))?;
        let sop_instance_uid = element_str(object, tags::SOP_INSTANCE_UID)
            .ok_or_else(|| DimseError::DicomObject("SOPInstanceUID missing".into()))?;

        let mut payload = Vec::new();
        object
            .write_dataset_with_ts(&mut payload, ts)
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;

        Ok(Self {
            message_id,
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax: transfer_syntax.to_string(),
            payload,
        })
    }

    /// Decode the payload into a Part 10 file object with a matching meta group
    pub fn decode(&self) -> Result<FileDicomObject<InMemDicomObject>> {
        let ts = lookup_transfer_syntax(&self.transfer_syntax)?;
        let object = InMemDicomObject::read_dataset_with_ts(self.payload.as_slice(), ts)
            .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(self.sop_class_uid.as_str())
            .media_storage_sop_instance_uid(self.sop_instance_uid.as_str())
            .transfer_syntax(self.transfer_syntax.as_str())
            .build()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;

        Ok(object.with_exact_meta(meta))
    }
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

impl DimseStatus {
    /// Generic processing failure (0x0110)
    pub const PROCESSING_FAILURE: DimseStatus = DimseStatus::Failure(0x0110);

    /// The numeric status code sent on the wire
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => *code,
        }
    }
}

static REGISTRY: TransferSyntaxRegistry = TransferSyntaxRegistry;

/// Look up a transfer syntax in the registry, trimming UID padding
pub fn lookup_transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = trim_uid(uid);
    REGISTRY
        .get(uid)
        .ok_or_else(|| DimseError::UnsupportedTransferSyntax(uid.to_string()))
}

/// Read a string attribute, dropping trailing padding
pub fn element_str(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

/// Strip the NUL/space padding DICOM puts on odd-length values
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()).trim_start()
}
