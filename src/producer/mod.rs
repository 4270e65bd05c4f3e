mod receive_stream;

use std::collections::HashMap;
use std::time::SystemTime;

use rand::{thread_rng, Rng};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use serde_json::{json, Value};

use crate::channel::{MethodId, Notifier, Request};
use crate::error::{Error, Result};
use crate::rtcp_compound::RtcpCompound;
use crate::rtp_parameters::{MediaKind, RtpParameters};

use receive_stream::ReceiveStream;

/// Event a producer reports back to its owning peer after handling a
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    Closed,
    /// RTP parameters were received; the peer must reduce them against the
    /// peer capabilities and register the producer into its transport.
    ParametersSet,
}

/// An incoming media stream from the remote participant.
pub struct Producer {
    pub producer_id: u32,
    pub kind: MediaKind,
    notifier: Notifier,
    parameters: Option<RtpParameters>,
    /// Set once the peer has reduced the parameters and registered the
    /// producer into its transport. RTP/RTCP processing is refused before.
    parameters_done: bool,
    transport_id: Option<u32>,
    rtp_raw_event: bool,
    rtp_object_event: bool,
    streams: HashMap<u32, ReceiveStream>,
    /// Local SSRC stamped on the receiver reports this producer generates.
    receiver_ssrc: u32,
    closed: bool,
}

impl Producer {
    pub fn new(notifier: Notifier, producer_id: u32, kind: MediaKind) -> Self {
        Producer {
            producer_id,
            kind,
            notifier,
            parameters: None,
            parameters_done: false,
            transport_id: None,
            rtp_raw_event: false,
            rtp_object_event: false,
            streams: HashMap::new(),
            receiver_ssrc: thread_rng().gen::<u32>(),
            closed: false,
        }
    }

    pub fn handle_request(
        &mut self,
        request: &Request,
    ) -> Result<(Option<Value>, Option<ProducerEvent>)> {
        match request.method {
            MethodId::ProducerClose => {
                self.close();
                Ok((None, Some(ProducerEvent::Closed)))
            }

            MethodId::ProducerDump => Ok((Some(self.to_json()), None)),

            MethodId::ProducerReceive => {
                let parameters = RtpParameters::from_value(request.data.clone())?;
                self.parameters = Some(parameters);
                self.parameters_done = false;
                self.streams.clear();

                Ok((None, Some(ProducerEvent::ParametersSet)))
            }

            MethodId::ProducerSetRtpRawEvent => {
                let enabled = request
                    .data
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or(Error::ErrNonBooleanEnabled)?;
                self.rtp_raw_event = enabled;
                Ok((None, None))
            }

            MethodId::ProducerSetRtpObjectEvent => {
                let enabled = request
                    .data
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or(Error::ErrNonBooleanEnabled)?;
                self.rtp_object_event = enabled;
                Ok((None, None))
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    pub fn parameters(&self) -> Option<&RtpParameters> {
        self.parameters.as_ref()
    }

    pub fn parameters_mut(&mut self) -> Option<&mut RtpParameters> {
        self.parameters.as_mut()
    }

    pub fn parameters_done(&self) -> bool {
        self.parameters_done
    }

    /// Finalize the (already reduced) parameters: build one receive stream
    /// per declared media SSRC and open the RTP/RTCP path.
    pub fn set_parameters_done(&mut self) {
        let Some(parameters) = &self.parameters else {
            return;
        };

        self.streams.clear();
        for encoding in &parameters.encodings {
            let Some(ssrc) = encoding.ssrc else { continue };
            let clock_rate = parameters.clock_rate_for(encoding).unwrap_or(90000);
            self.streams
                .insert(ssrc, ReceiveStream::new(ssrc, clock_rate, self.receiver_ssrc));
        }

        self.parameters_done = true;
    }

    pub fn set_transport(&mut self, transport_id: u32) {
        self.transport_id = Some(transport_id);
    }

    /// Unbind if currently bound to the given transport.
    pub fn remove_transport(&mut self, transport_id: u32) {
        if self.transport_id == Some(transport_id) {
            self.transport_id = None;
        }
    }

    pub fn transport_id(&self) -> Option<u32> {
        self.transport_id
    }

    /// Feed one received RTP packet. Returns `true` when the packet was
    /// accounted and should be forwarded upward.
    pub fn receive_rtp_packet(&mut self, now: SystemTime, packet: &rtp::packet::Packet) -> bool {
        if self.closed || !self.parameters_done {
            log::trace!(
                "ignoring RTP packet, producer not ready [producerId:{}]",
                self.producer_id
            );
            return false;
        }

        let ssrc = packet.header.ssrc;
        let Some(stream) = self.streams.get_mut(&ssrc) else {
            log::warn!(
                "no stream for received RTP packet [producerId:{}, ssrc:{ssrc}]",
                self.producer_id
            );
            return false;
        };
        stream.process_rtp(now, packet);

        if self.rtp_raw_event {
            self.notifier.emit(
                self.producer_id,
                "rtpraw",
                json!({ "class": "Producer", "length": packet.payload.len() }),
            );
        }
        if self.rtp_object_event {
            self.notifier.emit(
                self.producer_id,
                "rtpobject",
                json!({
                    "class": "Producer",
                    "payloadType": packet.header.payload_type,
                    "timestamp": packet.header.timestamp,
                    "sequenceNumber": packet.header.sequence_number,
                    "ssrc": ssrc,
                }),
            );
        }

        true
    }

    /// Record the sender report of one of our streams so the next receiver
    /// report carries LSR/DLSR.
    pub fn process_sender_report(&mut self, now: SystemTime, sr: &SenderReport) {
        if let Some(stream) = self.streams.get_mut(&sr.ssrc) {
            stream.process_sender_report(now, sr);
        }
    }

    /// Append one receiver report per stream to the compound.
    pub fn get_rtcp(&mut self, compound: &mut RtcpCompound, now: SystemTime) {
        if !self.parameters_done {
            return;
        }
        for stream in self.streams.values_mut() {
            compound.add_receiver_report(stream.generate_report(now));
        }
    }

    /// Ask the remote sender for a keyframe: one PLI per media stream.
    pub fn request_full_frame(&self) -> Vec<PictureLossIndication> {
        self.streams
            .values()
            .map(|stream| PictureLossIndication {
                sender_ssrc: stream.receiver_ssrc(),
                media_ssrc: stream.ssrc(),
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.notifier
            .emit(self.producer_id, "close", json!({ "class": "Producer" }));
    }

    pub fn to_json(&self) -> Value {
        json!({
            "producerId": self.producer_id,
            "kind": self.kind.as_str(),
            "rtpParameters": self.parameters.as_ref().map(RtpParameters::to_json),
            "transportId": self.transport_id,
            "rtpRawEventEnabled": self.rtp_raw_event,
            "rtpObjectEventEnabled": self.rtp_object_event,
        })
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn receive_request(data: Value) -> Request {
        Request::new(MethodId::ProducerReceive, json!({ "producerId": 1 }), data)
    }

    fn vp8_parameters() -> Value {
        json!({
            "codecs": [{ "name": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 3000, "codecPayloadType": 96 }]
        })
    }

    fn rtp_packet(ssrc: u32, seq: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                ssrc,
                sequence_number: seq,
                timestamp: 1234,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0u8; 50]),
        }
    }

    #[tokio::test]
    async fn test_receive_then_finalize_opens_rtp_path() {
        let (notifier, _rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);

        let (_, event) = producer.handle_request(&receive_request(vp8_parameters())).unwrap();
        assert_eq!(event, Some(ProducerEvent::ParametersSet));
        assert!(!producer.parameters_done());

        // Not finalized yet: packets are refused.
        assert!(!producer.receive_rtp_packet(SystemTime::UNIX_EPOCH, &rtp_packet(3000, 1)));

        producer.set_parameters_done();
        assert!(producer.parameters_done());
        assert!(producer.receive_rtp_packet(SystemTime::UNIX_EPOCH, &rtp_packet(3000, 2)));
        // Unknown SSRC is dropped.
        assert!(!producer.receive_rtp_packet(SystemTime::UNIX_EPOCH, &rtp_packet(4000, 3)));
    }

    #[tokio::test]
    async fn test_receive_with_malformed_parameters() {
        let (notifier, _rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);

        let result = producer.handle_request(&receive_request(json!({ "codecs": 5 })));
        assert!(result.is_err());
        assert!(producer.parameters().is_none());
    }

    #[tokio::test]
    async fn test_rtp_object_event_notification() {
        let (notifier, mut rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);
        producer.handle_request(&receive_request(vp8_parameters())).unwrap();
        producer.set_parameters_done();

        let request = Request::new(
            MethodId::ProducerSetRtpObjectEvent,
            json!({ "producerId": 1 }),
            json!({ "enabled": true }),
        );
        producer.handle_request(&request).unwrap();

        producer.receive_rtp_packet(SystemTime::UNIX_EPOCH, &rtp_packet(3000, 7));

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event, "rtpobject");
        assert_eq!(notification.data["sequenceNumber"], 7);
        assert_eq!(notification.data["ssrc"], 3000);
    }

    #[tokio::test]
    async fn test_set_rtp_event_requires_bool() {
        let (notifier, _rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);

        let request = Request::new(
            MethodId::ProducerSetRtpRawEvent,
            json!({ "producerId": 1 }),
            json!({ "enabled": "yes" }),
        );
        assert_eq!(
            producer.handle_request(&request).unwrap_err(),
            Error::ErrNonBooleanEnabled
        );
    }

    #[tokio::test]
    async fn test_full_frame_request_builds_pli_per_stream() {
        let (notifier, _rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);
        assert!(producer.request_full_frame().is_empty());

        producer.handle_request(&receive_request(vp8_parameters())).unwrap();
        producer.set_parameters_done();

        let plis = producer.request_full_frame();
        assert_eq!(plis.len(), 1);
        assert_eq!(plis[0].media_ssrc, 3000);
    }

    #[tokio::test]
    async fn test_rtcp_contribution() {
        let (notifier, _rx) = Notifier::new();
        let mut producer = Producer::new(notifier, 1, MediaKind::Video);
        producer.handle_request(&receive_request(vp8_parameters())).unwrap();

        // No contribution before the parameters are finalized.
        let mut compound = RtcpCompound::new();
        producer.get_rtcp(&mut compound, SystemTime::UNIX_EPOCH);
        assert!(compound.is_empty());

        producer.set_parameters_done();
        producer.receive_rtp_packet(SystemTime::UNIX_EPOCH, &rtp_packet(3000, 1));
        producer.get_rtcp(&mut compound, SystemTime::UNIX_EPOCH);
        assert_eq!(compound.receiver_report_count(), 1);
    }
}
