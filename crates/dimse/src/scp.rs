//! Service Class Provider (SCP) implementation for inbound storage associations

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ServerAssociationOptions;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::types::{element_str, lookup_transfer_syntax, AssociationContext, DimseStatus, StoreRequest};
use crate::{DimseError, Result, EXPLICIT_VR_LE, IMPLICIT_VR_LE, VERIFICATION_SOP_CLASS};

const C_STORE_RQ: u16 = 0x0001;
const C_STORE_RSP: u16 = 0x8001;
const C_ECHO_RQ: u16 = 0x0030;
const C_ECHO_RSP: u16 = 0x8030;
const NO_DATA_SET: u16 = 0x0101;
const UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// What the acceptance policy gets to look at before negotiation
#[derive(Debug, Clone)]
pub struct AssociationIdentity {
    /// Socket address of the connecting peer
    pub peer_addr: SocketAddr,

    /// Our own AE title
    pub local_aet: String,
}

/// Returns the transfer syntax UIDs accepted for an incoming association.
/// An empty list rejects the connection.
pub type AcceptancePolicy = Arc<dyn Fn(&AssociationIdentity) -> Vec<String> + Send + Sync>;

/// Policy that accepts the same fixed list for every peer
pub fn static_policy(transfer_syntaxes: Vec<String>) -> AcceptancePolicy {
    Arc::new(move |_identity: &AssociationIdentity| transfer_syntaxes.clone())
}

/// Receives the events of each association accepted by the SCP.
///
/// Calls for one association are made sequentially from a single thread, in
/// receipt order. Different associations are served concurrently.
#[async_trait]
pub trait AssociationHandler: Send + Sync {
    /// Called once the association has been negotiated
    async fn association_opened(&self, _ctx: &AssociationContext) {}

    /// Handle one C-STORE request; the returned status is sent to the peer
    async fn store(&self, ctx: &AssociationContext, request: StoreRequest) -> DimseStatus;

    /// Called when the association ends; `released` is false for aborts and
    /// transport failures
    async fn association_closed(&self, ctx: &AssociationContext, released: bool);
}

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    handler: Arc<dyn AssociationHandler>,
    policy: AcceptancePolicy,
    /// One permit per concurrent association
    associations: Arc<Semaphore>,
}

/// Handle to a running SCP accept loop
pub struct ScpHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ScpHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new associations. In-flight associations run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the accept loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for the accept loop to exit
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("SCP accept loop ended abnormally: {}", e);
        }
    }
}

impl DimseScp {
    /// Create a new SCP with the given configuration and association handler.
    ///
    /// Accepts Implicit and Explicit VR Little Endian until a policy is set.
    pub fn new(config: DimseConfig, handler: Arc<dyn AssociationHandler>) -> Self {
        let associations = Arc::new(Semaphore::new(config.max_associations as usize));
        Self {
            config,
            handler,
            policy: static_policy(vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()]),
            associations,
        }
    }

    /// Set the transfer syntax acceptance policy
    pub fn with_acceptance_policy(mut self, policy: AcceptancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns once the socket is bound, so the caller knows the SCP is listening.
    pub async fn spawn(self) -> Result<ScpHandle> {
        self.config.validate()?;

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            local_addr, self.config.local_aet
        );

        let shutdown = CancellationToken::new();
        let scp = Arc::new(self);
        let task = tokio::spawn(scp.accept_loop(listener, shutdown.clone()));

        Ok(ScpHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP '{}' stopped accepting associations", self.config.local_aet);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);

                        // Acquired before spawning so the limit also holds for a burst of connects
                        let permit = match Arc::clone(&self.associations).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(
                                    "Maximum associations reached, rejecting connection from {}",
                                    peer_addr
                                );
                                drop(stream);
                                continue;
                            }
                        };

                        let scp = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = scp.handle_association(stream, peer_addr, permit).await {
                                error!("Error handling association from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }
    }

    /// Handle a single association; the permit is returned when it ends
    async fn handle_association(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        self.serve_blocking(stream, peer_addr).await
    }

    /// The upper layer implementation is synchronous, so each association
    /// runs on the blocking pool and calls back into the runtime for the handler.
    async fn serve_blocking(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.association_timeout()))?;

        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || self.serve_association(stream, peer_addr, runtime))
            .await
            .map_err(|e| DimseError::internal(format!("Association task failed: {}", e)))?
    }

    fn serve_association(
        &self,
        stream: std::net::TcpStream,
        peer_addr: SocketAddr,
        runtime: Handle,
    ) -> Result<()> {
        let identity = AssociationIdentity {
            peer_addr,
            local_aet: self.config.local_aet.clone(),
        };
        let accepted = (self.policy)(&identity);
        if accepted.is_empty() {
            warn!("Acceptance policy rejected every transfer syntax for {}", peer_addr);
            return Err(DimseError::AssociationRejected(format!(
                "no transfer syntax accepted for {}",
                peer_addr
            )));
        }

        let mut options = ServerAssociationOptions::new()
            .ae_title(self.config.local_aet.clone())
            .max_pdu_length(self.config.max_pdu)
            .promiscuous(true)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS);
        for ts in accepted {
            options = options.with_transfer_syntax(ts);
        }

        let mut association = options
            .establish(stream)
            .map_err(|e| DimseError::DicomUl(e.to_string()))?;

        let ctx = AssociationContext::new(
            association.client_ae_title().to_string(),
            self.config.local_aet.clone(),
            peer_addr,
        );
        info!(
            session_id = %ctx.session_id,
            "Association established with {} ({})",
            ctx.calling_aet, peer_addr
        );
        runtime.block_on(self.handler.association_opened(&ctx));

        let mut command_buf: Vec<u8> = Vec::new();
        let mut data_buf: Vec<u8> = Vec::new();
        let mut pending_store: Option<(u8, InMemDicomObject)> = None;

        // Returns whether the peer released the association normally
        let mut serve = || -> Result<bool> {
            loop {
                let pdu = match association.receive() {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        warn!(session_id = %ctx.session_id, "Association receive failed: {}", e);
                        return Ok(false);
                    }
                };

                match pdu {
                    Pdu::PData { data } => {
                        for pdv in data {
                            match pdv.value_type {
                                PDataValueType::Command => {
                                    command_buf.extend_from_slice(&pdv.data);
                                    if !pdv.is_last {
                                        continue;
                                    }
                                    let command = read_command(&command_buf)?;
                                    command_buf.clear();

                                    let field = command_field(&command);
                                    let message_id = command_message_id(&command);
                                    match field {
                                        C_STORE_RQ => {
                                            pending_store = Some((pdv.presentation_context_id, command));
                                        }
                                        C_ECHO_RQ => {
                                            debug!(session_id = %ctx.session_id, "Processing C-ECHO request");
                                            let response = echo_response(message_id);
                                            association
                                                .send(&command_pdu(pdv.presentation_context_id, &response)?)
                                                .map_err(|e| DimseError::DicomUl(e.to_string()))?;
                                        }
                                        other => {
                                            warn!(
                                                session_id = %ctx.session_id,
                                                "Unsupported DIMSE command 0x{:04X}", other
                                            );
                                            let response = failure_response(other | 0x8000, message_id, UNRECOGNIZED_OPERATION);
                                            association
                                                .send(&command_pdu(pdv.presentation_context_id, &response)?)
                                                .map_err(|e| DimseError::DicomUl(e.to_string()))?;
                                        }
                                    }
                                }
                                PDataValueType::Data => {
                                    data_buf.extend_from_slice(&pdv.data);
                                    if !pdv.is_last {
                                        continue;
                                    }
                                    let payload = std::mem::take(&mut data_buf);

                                    let Some((pc_id, command)) = pending_store.take() else {
                                        warn!(session_id = %ctx.session_id, "Data set received without a C-STORE command");
                                        continue;
                                    };

                                    let transfer_syntax = association
                                        .presentation_contexts()
                                        .iter()
                                        .find(|pc| pc.id == pc_id)
                                        .map(|pc| pc.transfer_syntax.clone())
                                        .unwrap_or_else(|| IMPLICIT_VR_LE.to_string());

                                    let request = StoreRequest {
                                        message_id: command_message_id(&command),
                                        sop_class_uid: element_str(&command, tags::AFFECTED_SOP_CLASS_UID)
                                            .unwrap_or_default(),
                                        sop_instance_uid: element_str(&command, tags::AFFECTED_SOP_INSTANCE_UID)
                                            .unwrap_or_default(),
                                        transfer_syntax,
                                        payload,
                                    };
                                    let message_id = request.message_id;
                                    let sop_class_uid = request.sop_class_uid.clone();
                                    let sop_instance_uid = request.sop_instance_uid.clone();

                                    let status = runtime.block_on(self.handler.store(&ctx, request));
                                    debug!(
                                        session_id = %ctx.session_id,
                                        "C-STORE {} answered with status 0x{:04X}",
                                        sop_instance_uid,
                                        status.code()
                                    );

                                    let response = store_response(message_id, &sop_class_uid, &sop_instance_uid, status);
                                    association
                                        .send(&command_pdu(pc_id, &response)?)
                                        .map_err(|e| DimseError::DicomUl(e.to_string()))?;
                                }
                            }
                        }
                    }
                    Pdu::ReleaseRQ => {
                        if let Err(e) = association.send(&Pdu::ReleaseRP) {
                            warn!(session_id = %ctx.session_id, "Failed to send release response: {}", e);
                        }
                        return Ok(true);
                    }
                    Pdu::AbortRQ { .. } => {
                        warn!(session_id = %ctx.session_id, "Association aborted by {}", peer_addr);
                        return Ok(false);
                    }
                    other => {
                        debug!(session_id = %ctx.session_id, "Ignoring unexpected PDU: {:?}", other);
                    }
                }
            }
        };

        let released = match serve() {
            Ok(released) => released,
            Err(e) => {
                error!(session_id = %ctx.session_id, "Association with {} failed: {}", peer_addr, e);
                false
            }
        };

        runtime.block_on(self.handler.association_closed(&ctx, released));
        info!(session_id = %ctx.session_id, "Association with {} completed", peer_addr);
        Ok(())
    }
}

fn read_command(bytes: &[u8]) -> Result<InMemDicomObject> {
    let ts = lookup_transfer_syntax(IMPLICIT_VR_LE)?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| DimseError::DicomParsing(format!("Invalid command set: {}", e)))
}

fn command_field(command: &InMemDicomObject) -> u16 {
    command
        .element(tags::COMMAND_FIELD)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .unwrap_or(0)
}

fn command_message_id(command: &InMemDicomObject) -> u16 {
    command
        .element(tags::MESSAGE_ID)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .unwrap_or(0)
}

fn echo_response(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(VERIFICATION_SOP_CLASS)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_ECHO_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(DimseStatus::Success.code())),
    ])
}

fn store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: DimseStatus,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_STORE_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status.code())),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
    ])
}

fn failure_response(command_field: u16, message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ])
}

fn command_pdu(presentation_context_id: u8, command: &InMemDicomObject) -> Result<Pdu> {
    let ts = lookup_transfer_syntax(IMPLICIT_VR_LE)?;
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, ts)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;

    Ok(Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })
}
