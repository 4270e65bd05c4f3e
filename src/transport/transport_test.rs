use serde_json::json;

use super::*;
use crate::channel::Response;
use crate::rtp_parameters::MediaKind;

fn new_transport(id: u32) -> Transport {
    let (notifier, _rx) = Notifier::new();
    Transport::new(notifier, id)
}

fn producer_with_parameters(producer_id: u32, ssrc: u32) -> Producer {
    let (notifier, _rx) = Notifier::new();
    let mut producer = Producer::new(notifier, producer_id, MediaKind::Video);
    let request = Request::new(
        MethodId::ProducerReceive,
        json!({ "producerId": producer_id }),
        json!({
            "codecs": [{ "name": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": ssrc, "codecPayloadType": 96, "rtx": { "ssrc": ssrc + 1 } }]
        }),
    );
    producer.handle_request(&request).unwrap();
    producer
}

#[tokio::test]
async fn test_ice_credentials_change_on_request() {
    let mut transport = new_transport(1);
    let before = transport.to_json();

    let request = Request::new(
        MethodId::TransportChangeUfragPwd,
        json!({ "transportId": 1 }),
        json!({}),
    );
    let (data, event) = transport.handle_request(&request).unwrap();
    assert!(event.is_none());

    let data = data.unwrap();
    let after = transport.to_json();
    assert_eq!(
        data["usernameFragment"],
        after["iceLocalParameters"]["usernameFragment"]
    );
    assert_ne!(
        before["iceLocalParameters"]["usernameFragment"],
        after["iceLocalParameters"]["usernameFragment"]
    );
    assert_eq!(
        data["usernameFragment"].as_str().unwrap().len(),
        16
    );
    assert_eq!(data["password"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn test_set_max_bitrate_validation_and_floor() {
    let mut transport = new_transport(1);

    let request = Request::new(
        MethodId::TransportSetMaxBitrate,
        json!({ "transportId": 1 }),
        json!({ "bitrate": "fast" }),
    );
    assert_eq!(
        transport.handle_request(&request).unwrap_err().to_string(),
        "Request has not numeric data.bitrate"
    );

    let request = Request::new(
        MethodId::TransportSetMaxBitrate,
        json!({ "transportId": 1 }),
        json!({ "bitrate": 1 }),
    );
    let (data, _) = transport.handle_request(&request).unwrap();
    assert_eq!(data.unwrap()["bitrate"], 10_000);
}

#[tokio::test]
async fn test_set_remote_dtls_parameters() {
    let mut transport = new_transport(1);

    let request = Request::new(
        MethodId::TransportSetRemoteDtlsParameters,
        json!({ "transportId": 1 }),
        json!({ "fingerprints": [] }),
    );
    assert_eq!(
        transport.handle_request(&request).unwrap_err().to_string(),
        "missing data.role"
    );

    let request = Request::new(
        MethodId::TransportSetRemoteDtlsParameters,
        json!({ "transportId": 1 }),
        json!({ "role": "sideways", "fingerprints": [] }),
    );
    assert_eq!(
        transport.handle_request(&request).unwrap_err().to_string(),
        "invalid data.role"
    );

    let request = Request::new(
        MethodId::TransportSetRemoteDtlsParameters,
        json!({ "transportId": 1 }),
        json!({
            "role": "server",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
        }),
    );
    let (data, _) = transport.handle_request(&request).unwrap();
    assert_eq!(data.unwrap()["role"], "client");
}

#[tokio::test]
async fn test_producer_ssrc_table() {
    let mut transport = new_transport(1);
    let producer = producer_with_parameters(10, 1000);

    transport.add_producer(&producer).unwrap();
    assert_eq!(transport.get_producer_id(1000), Some(10));
    // RTX side stream resolves to the same producer.
    assert_eq!(transport.get_producer_id(1001), Some(10));
    assert_eq!(transport.get_producer_id(9999), None);

    // Another producer claiming the same SSRC is refused.
    let other = producer_with_parameters(11, 1000);
    assert_eq!(
        transport.add_producer(&other).unwrap_err(),
        Error::ErrSsrcAlreadyExists
    );
    assert_eq!(transport.get_producer_id(1000), Some(10));

    // Re-adding the same producer is idempotent.
    transport.add_producer(&producer).unwrap();

    transport.remove_producer(10);
    assert_eq!(transport.get_producer_id(1000), None);
}

#[tokio::test]
async fn test_add_producer_without_parameters() {
    let mut transport = new_transport(1);
    let (notifier, _rx) = Notifier::new();
    let producer = Producer::new(notifier, 10, MediaKind::Audio);

    assert_eq!(
        transport.add_producer(&producer).unwrap_err(),
        Error::ErrProducerParametersNotSet
    );
}

#[tokio::test]
async fn test_close_emits_notification_once() {
    let (notifier, mut rx) = Notifier::new();
    let mut transport = Transport::new(notifier, 7);

    transport.close();
    transport.close();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.target_id, 7);
    assert_eq!(notification.event, "close");
    assert_eq!(notification.data["class"], "Transport");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rtcp_sink() {
    let mut transport = new_transport(1);
    // No sink attached: must not panic.
    transport.send_rtcp_compound_packet(&[0x80, 0xc9]);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    transport.set_rtcp_sink(tx);
    transport.send_rtcp_compound_packet(&[0x80, 0xc9, 0x00, 0x01]);

    let sent = rx.recv().await.unwrap();
    assert_eq!(sent.len(), 4);

    transport.close();
    transport.send_rtcp_compound_packet(&[0x80, 0xc9, 0x00, 0x01]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unrelated_method_is_unknown() {
    let mut transport = new_transport(1);
    let request = Request::new(MethodId::Unsupported, json!({}), json!({}));
    assert_eq!(
        transport.handle_request(&request).unwrap_err(),
        Error::ErrUnknownMethod
    );

    // Response helpers used by the worker loop.
    let response = Response::Rejected("unknown method".to_owned());
    assert!(!response.is_accepted());
    assert_eq!(response.reason(), Some("unknown method"));
}
