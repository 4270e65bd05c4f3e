use std::time::Duration;

use bytes::Bytes;
use rtcp::transport_feedbacks::transport_layer_nack::NackPair;
use serde_json::json;

use super::*;

fn forwarded_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters::from_value(json!({
        "codecs": [{ "name": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
        "encodings": [{ "ssrc": ssrc, "codecPayloadType": 96 }],
        "rtcp": { "cname": "remote-peer" }
    }))
    .unwrap()
}

fn rtp_packet(ssrc: u32, seq: u16, payload_len: usize) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            ssrc,
            sequence_number: seq,
            timestamp: 0,
            ..Default::default()
        },
        payload: Bytes::from(vec![0u8; payload_len]),
    }
}

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

#[tokio::test]
async fn test_send_activates_with_primary_ssrc() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);
    assert!(!consumer.active());

    consumer.send(forwarded_parameters(5000));
    assert!(consumer.active());
    assert!(consumer.send_rtp_packet(at(10), &rtp_packet(5000, 1, 100)));
}

#[tokio::test]
async fn test_send_without_ssrc_stays_inactive() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);

    let parameters = RtpParameters::from_value(json!({
        "codecs": [{ "name": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
        "encodings": [{ "codecPayloadType": 96 }]
    }))
    .unwrap();
    consumer.send(parameters);

    assert!(!consumer.active());
    assert!(!consumer.send_rtp_packet(at(10), &rtp_packet(5000, 1, 100)));
}

#[tokio::test]
async fn test_disable_stops_forwarding_and_rtcp() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);
    consumer.send(forwarded_parameters(5000));
    consumer.send_rtp_packet(at(10), &rtp_packet(5000, 1, 100));

    let request = Request::new(
        MethodId::ConsumerDisable,
        json!({ "consumerId": 20 }),
        json!({}),
    );
    consumer.handle_request(&request).unwrap();

    assert!(!consumer.active());
    assert!(!consumer.send_rtp_packet(at(10), &rtp_packet(5000, 2, 100)));

    let mut compound = RtcpCompound::new();
    consumer.get_rtcp(&mut compound, at(11));
    assert!(compound.is_empty());
}

#[tokio::test]
async fn test_rtcp_contribution_is_sr_plus_sdes() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);
    consumer.send(forwarded_parameters(5000));
    consumer.send_rtp_packet(at(10), &rtp_packet(5000, 1, 100));

    let mut compound = RtcpCompound::new();
    consumer.get_rtcp(&mut compound, at(11));
    assert_eq!(compound.sender_report_count(), 1);
    assert_eq!(compound.receiver_report_count(), 0);
    assert!(!compound.is_empty());
}

#[tokio::test]
async fn test_receive_nack_counts_recoverable_packets() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);
    consumer.send(forwarded_parameters(5000));

    for seq in 100u16..110 {
        consumer.send_rtp_packet(at(10), &rtp_packet(5000, seq, 100));
    }

    // 102 and 103 are buffered, 900 never was.
    let nack = TransportLayerNack {
        sender_ssrc: 1,
        media_ssrc: 5000,
        nacks: vec![
            NackPair {
                packet_id: 102,
                lost_packets: 1,
            },
            NackPair {
                packet_id: 900,
                lost_packets: 0,
            },
        ],
    };

    assert_eq!(consumer.receive_nack(&nack), 2);
    assert_eq!(consumer.nacked_packets(), 3);
}

#[tokio::test]
async fn test_transmission_rate() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);
    consumer.send(forwarded_parameters(5000));

    // 1000 wire bytes per packet (12 header + 988 payload), 150 packets.
    for seq in 0u16..150 {
        consumer.send_rtp_packet(at(100), &rtp_packet(5000, seq, 988));
    }
    assert_eq!(consumer.get_transmission_rate(at(100)), 1_200_000);

    let (notifier, _rx) = Notifier::new();
    let mut idle = Consumer::new(notifier, 21, MediaKind::Audio);
    assert_eq!(idle.get_transmission_rate(at(100)), 0);
}

#[tokio::test]
async fn test_close_emits_notification_once() {
    let (notifier, mut rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Video);

    consumer.close();
    consumer.close();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.target_id, 20);
    assert_eq!(notification.event, "close");
    assert_eq!(notification.data["class"], "Consumer");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dump_shape() {
    let (notifier, _rx) = Notifier::new();
    let mut consumer = Consumer::new(notifier, 20, MediaKind::Depth);
    consumer.send(forwarded_parameters(5000));
    consumer.set_transport(3);

    let request = Request::new(
        MethodId::ConsumerDump,
        json!({ "consumerId": 20 }),
        json!({}),
    );
    let dump = consumer.handle_request(&request).unwrap().unwrap();

    assert_eq!(dump["consumerId"], 20);
    assert_eq!(dump["kind"], "depth");
    assert_eq!(dump["transportId"], 3);
    assert_eq!(dump["active"], true);
    assert_eq!(dump["rtpParameters"]["rtcp"]["cname"], "remote-peer");
}
