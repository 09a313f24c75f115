//! DIMSE (DICOM Message Service Element) boundary for the segmentation gateway
//!
//! This crate wraps the DICOM toolkit so the gateway core never touches the
//! wire format directly.
//!
//! # Features
//! - Inbound storage SCP: C-STORE and C-ECHO over the DICOM upper layer, with a
//!   caller supplied transfer syntax acceptance policy
//! - Outbound SCU: C-ECHO and C-STORE (DCMTK command line tools, feature = "dcmtk_cli")
//! - Store payload decoding into Part 10 file objects

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{AcceptancePolicy, AssociationHandler, AssociationIdentity, DimseScp, ScpHandle};
pub use scu::{DimseScu, ScuTransport};
pub use types::{AssociationContext, DimseStatus, StoreRequest};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.2.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Verification SOP Class (C-ECHO)
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
