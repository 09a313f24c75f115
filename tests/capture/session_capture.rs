use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ClientAssociationOptions;
use dimse::scp::static_policy;
use dimse::types::lookup_transfer_syntax;
use dimse::{DimseConfig, StoreRequest, EXPLICIT_VR_LE, IMPLICIT_VR_LE};
use seggate::capture::SessionCapture;
use seggate::models::WorkItemState;
use seggate::relay::{RelaySettings, ResultRelay, RetryPolicy, WorkItemQueue};
use seggate::storage::queue_store::QUEUE_DB_FILE;
use seggate::storage::DatabaseManager;
use tempfile::TempDir;

#[path = "../relay/support.rs"]
mod support;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn scp_config() -> DimseConfig {
    DimseConfig {
        local_aet: "SEGGATE".to_string(),
        bind_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        port: 0,
        ..Default::default()
    }
}

fn instance(uid: &str, modality: &str) -> StoreRequest {
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid)),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from(modality)),
    ]);
    StoreRequest::from_object(1, &object, EXPLICIT_VR_LE).unwrap()
}

fn encode_command(command: &InMemDicomObject) -> Vec<u8> {
    let mut bytes = Vec::new();
    command
        .write_dataset_with_ts(&mut bytes, lookup_transfer_syntax(IMPLICIT_VR_LE).unwrap())
        .unwrap();
    bytes
}

fn status_of(pdu: Pdu) -> u16 {
    match pdu {
        Pdu::PData { data } => {
            let ts = lookup_transfer_syntax(IMPLICIT_VR_LE).unwrap();
            let command = InMemDicomObject::read_dataset_with_ts(data[0].data.as_slice(), ts).unwrap();
            command.element(tags::STATUS).unwrap().to_int::<u16>().unwrap()
        }
        other => panic!("expected P-DATA response, got {:?}", other),
    }
}

/// One association storing every instance, then a release. Returns the statuses.
fn send_session(addr: SocketAddr, calling_aet: &str, instances: Vec<StoreRequest>) -> Vec<u16> {
    send_session_with(addr, calling_aet, instances, |_| {})
}

/// Like `send_session`, calling `after_store(n)` once instance `n` has been answered
fn send_session_with(
    addr: SocketAddr,
    calling_aet: &str,
    instances: Vec<StoreRequest>,
    mut after_store: impl FnMut(usize),
) -> Vec<u16> {
    let mut association = ClientAssociationOptions::new()
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])
        .calling_ae_title(calling_aet)
        .called_ae_title("SEGGATE")
        .establish(addr)
        .expect("association should be accepted");
    let pc_id = association.presentation_contexts()[0].id;

    let mut statuses = Vec::new();
    for (n, request) in instances.into_iter().enumerate() {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x0001u16)),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(n as u16 + 1)),
            DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0u16)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0000u16)),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(request.sop_instance_uid.as_str()),
            ),
        ]);

        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: encode_command(&command),
                }],
            })
            .unwrap();
        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: request.payload,
                }],
            })
            .unwrap();
        statuses.push(status_of(association.receive().unwrap()));
        after_store(n);
    }

    association.release().unwrap();
    statuses
}

fn relay_settings(dir: &TempDir) -> RelaySettings {
    RelaySettings {
        own_aet: "SEGGATE".into(),
        reply_port: 104,
        destination: None,
        poll_interval: Duration::from_millis(10),
        result_timeout: Duration::from_secs(60),
        required_channels: vec!["CT".into()],
        results_dir: dir.path().join("results"),
        retry: RetryPolicy::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_sessions_each_produce_one_work_item() {
    let dir = TempDir::new().unwrap();
    let queue = WorkItemQueue::open(dir.path()).unwrap();
    let relay = Arc::new(ResultRelay::new(
        queue,
        support::FakeInference::instant(),
        support::RecordingTransfer::new(0),
        relay_settings(&dir),
    ));

    let capture = SessionCapture::new(scp_config(), &dir.path().join("received"), "Modality", relay.clone()).unwrap();
    assert!(capture
        .start(0, static_policy(vec![EXPLICIT_VR_LE.to_string()]), Duration::from_secs(5))
        .await
        .unwrap());
    let addr = capture.local_addr().await.unwrap();

    let sessions = 6;
    let mut senders = Vec::new();
    for n in 0..sessions {
        senders.push(tokio::task::spawn_blocking(move || {
            let instances = vec![
                instance(&format!("1.2.826.0.1.{}.1", n), "CT"),
                instance(&format!("1.2.826.0.1.{}.2", n), "CT"),
                instance(&format!("1.2.826.0.1.{}.3", n), "RTSTRUCT"),
            ];
            send_session(addr, &format!("MOD{}", n), instances)
        }));
    }
    for sender in senders {
        assert_eq!(sender.await.unwrap(), vec![0x0000, 0x0000, 0x0000]);
    }

    for _ in 0..200 {
        if relay.queue().len().unwrap() == sessions as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    capture.stop().await;

    let items = relay.queue().list().unwrap();
    assert_eq!(items.len(), sessions);
    for item in &items {
        assert_eq!(item.state, WorkItemState::Queued);
        assert_eq!(item.channels.len(), 2);
        assert_eq!(item.channels[0].channel_id(), "CT");
        assert_eq!(item.channels[0].files().len(), 2);
        assert_eq!(item.channels[1].channel_id(), "RTSTRUCT");
        assert_eq!(item.reply_to.host, "127.0.0.1");
        assert!(item.reply_to.ae_title.starts_with("MOD"));

        let files: Vec<&PathBuf> = item.channels.iter().flat_map(|c| c.files()).collect();
        assert!(files.iter().all(|f| f.is_file()));
        assert!(files.iter().all(|f| f.starts_with(dir.path().join("received").join(&item.session_id))));
    }
    assert_eq!(capture.open_sessions(), 0);

    drop(relay);
    drop(capture);
    let _ = DatabaseManager::global().close_database(&dir.path().join(QUEUE_DB_FILE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_instance_gets_a_specific_status() {
    let dir = TempDir::new().unwrap();
    let queue = WorkItemQueue::open(dir.path()).unwrap();
    let relay = Arc::new(ResultRelay::new(
        queue,
        support::FakeInference::instant(),
        support::RecordingTransfer::new(0),
        relay_settings(&dir),
    ));
    let capture = SessionCapture::new(scp_config(), &dir.path().join("received"), "Modality", relay.clone()).unwrap();
    assert!(capture
        .start(0, static_policy(vec![EXPLICIT_VR_LE.to_string()]), Duration::from_secs(5))
        .await
        .unwrap());
    let addr = capture.local_addr().await.unwrap();

    let mut garbage = instance("1.2.826.0.1.77.1", "CT");
    garbage.payload = vec![0xFF; 12];
    let statuses = tokio::task::spawn_blocking(move || send_session(addr, "MOD", vec![garbage]))
        .await
        .unwrap();
    assert_eq!(statuses, vec![0xC000]);

    // Nothing was captured, so no work item appears
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.queue().is_empty().unwrap());

    capture.stop().await;
    drop(relay);
    drop(capture);
    let _ = DatabaseManager::global().close_database(&dir.path().join(QUEUE_DB_FILE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_lets_an_open_association_finish() {
    let dir = TempDir::new().unwrap();
    let queue = WorkItemQueue::open(dir.path()).unwrap();
    let relay = Arc::new(ResultRelay::new(
        queue,
        support::FakeInference::instant(),
        support::RecordingTransfer::new(0),
        relay_settings(&dir),
    ));
    let capture = SessionCapture::new(scp_config(), &dir.path().join("received"), "Modality", relay.clone()).unwrap();
    assert!(capture
        .start(0, static_policy(vec![EXPLICIT_VR_LE.to_string()]), Duration::from_secs(5))
        .await
        .unwrap());
    let addr = capture.local_addr().await.unwrap();

    let runtime = tokio::runtime::Handle::current();
    let stopping = capture.clone();
    let (statuses, refused_after_stop) = tokio::task::spawn_blocking(move || {
        let mut refused_after_stop = false;
        let instances = vec![
            instance("1.2.826.0.1.88.1", "CT"),
            instance("1.2.826.0.1.88.2", "CT"),
        ];
        let statuses = send_session_with(addr, "MODSTOP", instances, |n| {
            if n == 0 {
                // Stop between the two stores of the open association
                runtime.block_on(stopping.stop());
                refused_after_stop = ClientAssociationOptions::new()
                    .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])
                    .calling_ae_title("LATE")
                    .called_ae_title("SEGGATE")
                    .establish(addr)
                    .is_err();
            }
        });
        (statuses, refused_after_stop)
    })
    .await
    .unwrap();

    assert_eq!(statuses, vec![0x0000, 0x0000]);
    assert!(refused_after_stop, "no new association after stop");
    assert!(capture.local_addr().await.is_none());

    for _ in 0..200 {
        if relay.queue().len().unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The session in flight completes whole: one queued item holding both files
    let items = relay.queue().list().unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.reply_to.ae_title, "MODSTOP");
    assert_eq!(item.channels.len(), 1);
    assert_eq!(item.channels[0].files().len(), 2);
    assert!(item.channels[0].files().iter().all(|f| f.is_file()));

    let folder = dir.path().join("received").join(&item.session_id);
    assert!(!folder.join(seggate::capture::PENDING_MARKER).exists());
    assert_eq!(capture.open_sessions(), 0);

    drop(relay);
    drop(capture);
    let _ = DatabaseManager::global().close_database(&dir.path().join(QUEUE_DB_FILE));
}
