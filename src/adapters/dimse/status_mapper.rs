//! DIMSE Status Code Mapping
//!
//! Converts capture save failures into the status returned to the sending peer,
//! following DICOM PS3.4:
//! - `0x0000`: Success
//! - `0xA700`: Out of resources
//! - `0xA900`: Data set does not match SOP class / cannot be handled in this encoding
//! - `0xC000`: Cannot understand
//! - `0x0110`: Processing failure
//!
//! # Usage
//!
//! ```ignore
//! use seggate::adapters::dimse::status_mapper;
//! use seggate::capture::SaveError;
//!
//! let status = status_mapper::save_error_to_dimse(&SaveError::OutOfResources("disk full".into()));
//! assert_eq!(status, DimseStatus::Failure(0xA700));
//! ```

use crate::capture::SaveError;
use dimse::types::DimseStatus;

/// Cannot understand
pub const CANNOT_UNDERSTAND: u16 = 0xC000;
/// Data set does not match SOP class
pub const DATASET_MISMATCH: u16 = 0xA900;
/// Out of resources
pub const OUT_OF_RESOURCES: u16 = 0xA700;
/// Processing failure
pub const PROCESSING_FAILURE: u16 = 0x0110;

/// Maps a save failure to the status sent back in the C-STORE-RSP
pub fn save_error_to_dimse(error: &SaveError) -> DimseStatus {
    match error {
        SaveError::MalformedPayload(_) => DimseStatus::Failure(CANNOT_UNDERSTAND),
        SaveError::UnsupportedEncoding(_) => DimseStatus::Failure(DATASET_MISMATCH),
        SaveError::OutOfResources(_) => DimseStatus::Failure(OUT_OF_RESOURCES),
        SaveError::Unrecognized(_) => DimseStatus::Failure(PROCESSING_FAILURE),
    }
}
