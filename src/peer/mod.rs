pub mod rtcp_timer;

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use rand::{thread_rng, Rng};
use rtcp::header::{
    PacketType, FORMAT_FIR, FORMAT_PLI, FORMAT_REMB, FORMAT_SLI, FORMAT_TLN,
};
use rtcp::packet::Packet;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::payload_feedbacks::slice_loss_indication::SliceLossIndication;
use rtcp::raw_packet::RawPacket;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use util::marshal::Marshal;

use crate::channel::{MethodId, Notifier, Request, Response};
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::producer::{Producer, ProducerEvent};
use crate::rtcp_compound::RtcpCompound;
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::{Transport, TransportEvent};
use crate::{MAX_VIDEO_INTERVAL_MS, RTCP_BUFFER_SIZE};

use rtcp_timer::RtcpTimer;

/// Reference picture selection indication, a PSFB subtype the codec layer
/// does not model; it reaches us as a raw packet.
const FORMAT_RPSI: u8 = 3;

/// Callbacks a peer makes into its owner (the room).
///
/// The listener outlives the peer and is handed into every entry point
/// instead of being stored, so the room can be re-entered while it is
/// borrowed. `on_peer_capabilities` receives the peer mutably: the room
/// intersects `peer.capabilities_mut()` with the room capabilities in place
/// and may already adopt consumers via [`Peer::add_consumer`].
pub trait PeerListener {
    fn on_peer_closed(&mut self, peer: &Peer);
    fn on_peer_capabilities(&mut self, peer: &mut Peer);
    fn on_peer_producer_parameters(&mut self, peer: &Peer, producer: &Producer);
    fn on_peer_producer_closed(&mut self, peer: &Peer, producer: &Producer);
    fn on_peer_consumer_closed(&mut self, peer: &Peer, consumer: &Consumer);
    fn on_peer_rtp_packet(&mut self, peer: &Peer, producer: &Producer, packet: &rtp::packet::Packet);
    fn on_peer_rtcp_receiver_report(
        &mut self,
        peer: &Peer,
        consumer: &Consumer,
        report: &ReceptionReport,
    );
    fn on_peer_rtcp_sender_report(&mut self, peer: &Peer, producer: &Producer, report: &SenderReport);
    fn on_peer_rtcp_feedback(
        &mut self,
        peer: &Peer,
        consumer: &Consumer,
        packet: &(dyn Packet + Send + Sync),
    );
    fn on_full_frame_required(&mut self, peer: &Peer, consumer: &Consumer);
}

/// Per-participant session controller.
///
/// Owns the transports, producers and consumers of one participant, routes
/// control requests to them, demultiplexes received RTCP and drives the
/// periodic RTCP feedback loop. Single-threaded: every entry point runs to
/// completion on the worker task that owns the peer.
pub struct Peer {
    pub peer_id: u32,
    pub peer_name: String,
    notifier: Notifier,
    capabilities: RtpCapabilities,
    has_capabilities: bool,
    transports: HashMap<u32, Transport>,
    producers: HashMap<u32, Producer>,
    consumers: HashMap<u32, Consumer>,
    timer: RtcpTimer,
    /// Serialization scratch for outgoing compounds, reused across ticks.
    rtcp_buffer: BytesMut,
    closed: bool,
}

impl Peer {
    pub fn new(
        notifier: Notifier,
        peer_id: u32,
        peer_name: String,
        tick_tx: mpsc::UnboundedSender<u32>,
    ) -> Self {
        let timer = RtcpTimer::new(peer_id, tick_tx);
        timer.start(Duration::from_millis(MAX_VIDEO_INTERVAL_MS / 2));

        Peer {
            peer_id,
            peer_name,
            notifier,
            capabilities: RtpCapabilities::default(),
            has_capabilities: false,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            timer,
            rtcp_buffer: BytesMut::with_capacity(RTCP_BUFFER_SIZE),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_capabilities(&self) -> bool {
        self.has_capabilities
    }

    /// The declared capabilities, readable once set.
    pub fn capabilities(&self) -> Option<&RtpCapabilities> {
        self.has_capabilities.then_some(&self.capabilities)
    }

    /// Mutable access for the listener's one-time intersection with the
    /// room capabilities. After `peer.setCapabilities` resolves they are
    /// never written again.
    pub fn capabilities_mut(&mut self) -> &mut RtpCapabilities {
        &mut self.capabilities
    }

    pub fn transport(&self, transport_id: u32) -> Option<&Transport> {
        self.transports.get(&transport_id)
    }

    pub fn transport_mut(&mut self, transport_id: u32) -> Option<&mut Transport> {
        self.transports.get_mut(&transport_id)
    }

    pub fn producer(&self, producer_id: u32) -> Option<&Producer> {
        self.producers.get(&producer_id)
    }

    pub fn producer_mut(&mut self, producer_id: u32) -> Option<&mut Producer> {
        self.producers.get_mut(&producer_id)
    }

    pub fn consumer(&self, consumer_id: u32) -> Option<&Consumer> {
        self.consumers.get(&consumer_id)
    }

    pub fn consumer_mut(&mut self, consumer_id: u32) -> Option<&mut Consumer> {
        self.consumers.get_mut(&consumer_id)
    }

    /// Cooperative closure: producers first, then consumers, then
    /// transports. Closing a transport before the objects bound to it
    /// would fire unbind events at disposed collaborators, hence the
    /// strict order. Idempotent.
    pub fn destroy(&mut self, listener: &mut dyn PeerListener) {
        if self.closed {
            return;
        }

        let producer_ids: Vec<u32> = self.producers.keys().copied().collect();
        for producer_id in producer_ids {
            if let Some(mut producer) = self.producers.remove(&producer_id) {
                for transport in self.transports.values_mut() {
                    transport.remove_producer(producer_id);
                }
                producer.close();
                listener.on_peer_producer_closed(self, &producer);
            }
        }

        let consumer_ids: Vec<u32> = self.consumers.keys().copied().collect();
        for consumer_id in consumer_ids {
            if let Some(mut consumer) = self.consumers.remove(&consumer_id) {
                consumer.close();
                listener.on_peer_consumer_closed(self, &consumer);
            }
        }

        let transport_ids: Vec<u32> = self.transports.keys().copied().collect();
        for transport_id in transport_ids {
            if let Some(mut transport) = self.transports.remove(&transport_id) {
                transport.close();
            }
        }

        self.notifier
            .emit(self.peer_id, "close", json!({ "class": "Peer" }));

        self.closed = true;
        self.timer.stop();

        listener.on_peer_closed(self);
    }

    pub fn handle_request(
        &mut self,
        request: &Request,
        listener: &mut dyn PeerListener,
    ) -> Response {
        match self.process_request(request, listener) {
            Ok(data) => Response::Accepted(data),
            Err(error) => Response::Rejected(error.to_string()),
        }
    }

    fn process_request(
        &mut self,
        request: &Request,
        listener: &mut dyn PeerListener,
    ) -> Result<Option<Value>> {
        match request.method {
            MethodId::PeerClose => {
                self.destroy(listener);
                Ok(None)
            }

            MethodId::PeerDump => Ok(Some(self.to_json())),

            MethodId::PeerSetCapabilities => {
                if self.has_capabilities {
                    return Err(Error::ErrCapabilitiesAlreadySet);
                }

                self.capabilities = RtpCapabilities::from_value(request.data.clone())?;
                self.has_capabilities = true;

                // The room reduces the capabilities to a subset of its own
                // and may already adopt consumers for this peer. Accepting
                // only afterwards guarantees every "newconsumer" event is
                // on the channel before setCapabilities() resolves.
                listener.on_peer_capabilities(self);

                Ok(Some(self.capabilities.to_json()))
            }

            MethodId::PeerCreateTransport => {
                let transport_id = self.transport_id_from_request(request)?;
                if self.transports.contains_key(&transport_id) {
                    return Err(Error::ErrTransportAlreadyExists);
                }

                let transport = Transport::new(self.notifier.clone(), transport_id);
                let data = transport.to_json();
                self.transports.insert(transport_id, transport);

                log::debug!("transport created [transportId:{transport_id}]");

                Ok(Some(data))
            }

            MethodId::PeerCreateProducer => {
                if !self.has_capabilities {
                    return Err(Error::ErrCapabilitiesNotSet);
                }

                let producer_id = self.producer_id_from_request(request)?;
                if self.producers.contains_key(&producer_id) {
                    return Err(Error::ErrProducerAlreadyExists);
                }

                let transport_id = self.transport_id_from_request(request)?;
                if !self.transports.contains_key(&transport_id) {
                    return Err(Error::ErrTransportNotFound);
                }

                let kind = match request.data.get("kind") {
                    Some(Value::String(kind)) => {
                        MediaKind::from_name(kind).ok_or(Error::ErrInvalidKind)?
                    }
                    _ => return Err(Error::ErrMissingKind),
                };

                let mut producer = Producer::new(self.notifier.clone(), producer_id, kind);
                producer.set_transport(transport_id);
                self.producers.insert(producer_id, producer);

                log::debug!("producer created [producerId:{producer_id}, kind:{kind}]");

                Ok(None)
            }

            MethodId::TransportClose
            | MethodId::TransportDump
            | MethodId::TransportSetRemoteDtlsParameters
            | MethodId::TransportSetMaxBitrate
            | MethodId::TransportChangeUfragPwd => {
                let transport_id = self.transport_id_from_request(request)?;
                let transport = self
                    .transports
                    .get_mut(&transport_id)
                    .ok_or(Error::ErrTransportNotFound)?;

                let (data, event) = transport.handle_request(request)?;
                if let Some(TransportEvent::Closed) = event {
                    self.on_transport_closed(transport_id);
                }

                Ok(data)
            }

            MethodId::ProducerClose
            | MethodId::ProducerDump
            | MethodId::ProducerReceive
            | MethodId::ProducerSetRtpRawEvent
            | MethodId::ProducerSetRtpObjectEvent => {
                let producer_id = self.producer_id_from_request(request)?;
                let producer = self
                    .producers
                    .get_mut(&producer_id)
                    .ok_or(Error::ErrProducerNotFound)?;

                let (data, event) = producer.handle_request(request)?;
                match event {
                    Some(ProducerEvent::Closed) => {
                        self.on_producer_closed(producer_id, listener);
                    }
                    Some(ProducerEvent::ParametersSet) => {
                        self.on_producer_parameters(producer_id)?;
                        self.on_producer_parameters_done(producer_id, listener);
                    }
                    None => {}
                }

                Ok(data)
            }

            MethodId::ProducerSetTransport => {
                let producer_id = self.producer_id_from_request(request)?;
                if !self.producers.contains_key(&producer_id) {
                    return Err(Error::ErrProducerNotFound);
                }

                let transport_id = self.transport_id_from_request(request)?;
                if !self.transports.contains_key(&transport_id) {
                    return Err(Error::ErrTransportNotFound);
                }

                // Register into the new transport first; on failure the old
                // binding stays untouched.
                {
                    let producer = &self.producers[&producer_id];
                    let transport = self.transports.get_mut(&transport_id).unwrap();
                    transport.add_producer(producer)?;
                }

                // Keep REMB enabled across the migration.
                let previous_remb = self.producers[&producer_id]
                    .transport_id()
                    .and_then(|id| self.transports.get(&id))
                    .map(Transport::has_remb)
                    .unwrap_or(false);
                if previous_remb {
                    if let Some(transport) = self.transports.get_mut(&transport_id) {
                        transport.enable_remb();
                    }
                }

                if let Some(producer) = self.producers.get_mut(&producer_id) {
                    producer.set_transport(transport_id);
                }

                Ok(None)
            }

            MethodId::ConsumerDump | MethodId::ConsumerDisable => {
                let consumer_id = self.consumer_id_from_request(request)?;
                let consumer = self
                    .consumers
                    .get_mut(&consumer_id)
                    .ok_or(Error::ErrConsumerNotFound)?;

                consumer.handle_request(request)
            }

            MethodId::ConsumerSetTransport => {
                let consumer_id = self.consumer_id_from_request(request)?;
                if !self.consumers.contains_key(&consumer_id) {
                    return Err(Error::ErrConsumerNotFound);
                }

                let transport_id = self.transport_id_from_request(request)?;
                if !self.transports.contains_key(&transport_id) {
                    return Err(Error::ErrTransportNotFound);
                }

                if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                    consumer.set_transport(transport_id);
                }

                Ok(None)
            }

            _ => {
                log::error!("unknown method \"{}\"", request.method);

                Err(Error::ErrUnknownMethod)
            }
        }
    }

    /// Adopt a consumer created by the room for one of the other peers'
    /// producers. The caller guarantees the id is fresh.
    pub fn add_consumer(
        &mut self,
        mut consumer: Consumer,
        rtp_parameters: RtpParameters,
        associated_producer_id: u32,
    ) {
        assert!(
            !self.consumers.contains_key(&consumer.consumer_id),
            "given Consumer already exists in this Peer"
        );

        consumer.set_peer_capabilities(self.capabilities.clone());
        consumer.send(rtp_parameters);

        let consumer_id = consumer.consumer_id;
        let mut event_data = consumer.to_json();
        event_data["class"] = json!("Peer");
        event_data["associatedProducerId"] = json!(associated_producer_id);

        self.consumers.insert(consumer_id, consumer);

        self.notifier.emit(self.peer_id, "newconsumer", event_data);
    }

    /// Find the consumer owning the given SSRC, including FEC and RTX side
    /// streams. Linear over consumers and their encodings.
    pub fn get_consumer(&self, ssrc: u32) -> Option<&Consumer> {
        self.consumers.values().find(|consumer| {
            let Some(parameters) = consumer.parameters() else {
                return false;
            };
            parameters.encodings.iter().any(|encoding| {
                encoding.ssrc == Some(ssrc)
                    || encoding.fec.as_ref().is_some_and(|fec| fec.ssrc == ssrc)
                    || encoding.rtx.as_ref().is_some_and(|rtx| rtx.ssrc == ssrc)
            })
        })
    }

    fn get_consumer_id(&self, ssrc: u32) -> Option<u32> {
        self.get_consumer(ssrc).map(|consumer| consumer.consumer_id)
    }

    pub fn to_json(&self) -> Value {
        let transports: Vec<Value> = self.transports.values().map(Transport::to_json).collect();
        let producers: Vec<Value> = self.producers.values().map(Producer::to_json).collect();
        let consumers: Vec<Value> = self.consumers.values().map(Consumer::to_json).collect();

        let mut json = json!({
            "peerId": self.peer_id,
            "peerName": self.peer_name,
            "transports": transports,
            "producers": producers,
            "consumers": consumers,
        });
        if self.has_capabilities {
            json["capabilities"] = self.capabilities.to_json();
        }

        json
    }

    /* Collaborator callbacks. */

    /// The transport became connected: ask for a keyframe on behalf of
    /// every video-like consumer it carries.
    pub fn on_transport_connected(&mut self, transport_id: u32, listener: &mut dyn PeerListener) {
        for consumer in self.consumers.values() {
            if !consumer.kind.is_visual() {
                continue;
            }
            if consumer.transport_id() != Some(transport_id) {
                continue;
            }
            listener.on_full_frame_required(self, consumer);
        }
    }

    /// The transport is going away: drop every reference to it before it
    /// is destroyed.
    pub fn on_transport_closed(&mut self, transport_id: u32) {
        for producer in self.producers.values_mut() {
            producer.remove_transport(transport_id);
        }
        for consumer in self.consumers.values_mut() {
            consumer.remove_transport(transport_id);
        }
        self.transports.remove(&transport_id);
    }

    /// The remote endpoint asked for a keyframe on this transport: relay
    /// the request upstream through every video-like producer on it.
    pub fn on_transport_full_frame_required(&mut self, transport_id: u32) {
        let producer_ids: Vec<u32> = self
            .producers
            .values()
            .filter(|producer| {
                producer.kind.is_visual() && producer.transport_id() == Some(transport_id)
            })
            .map(|producer| producer.producer_id)
            .collect();

        for producer_id in producer_ids {
            self.request_producer_full_frame(producer_id);
        }
    }

    fn request_producer_full_frame(&mut self, producer_id: u32) {
        let Some(producer) = self.producers.get(&producer_id) else {
            return;
        };
        let Some(transport_id) = producer.transport_id() else {
            return;
        };

        for pli in producer.request_full_frame() {
            let data = match pli.marshal() {
                Ok(data) => data,
                Err(error) => {
                    log::warn!("cannot serialize PLI: {error}");
                    continue;
                }
            };
            if let Some(transport) = self.transports.get_mut(&transport_id) {
                transport.send_rtcp_compound_packet(&data);
            }
        }
    }

    /// New producer parameters: trim them down to the peer capabilities and
    /// register the producer into its transport.
    fn on_producer_parameters(&mut self, producer_id: u32) -> Result<()> {
        let Some(producer) = self.producers.get_mut(&producer_id) else {
            return Ok(());
        };

        if let Some(parameters) = producer.parameters_mut() {
            parameters.reduce_codecs_and_encodings(&self.capabilities);
            parameters.reduce_header_extensions(&self.capabilities.header_extensions);
        }

        if let Some(transport_id) = producer.transport_id() {
            if let Some(transport) = self.transports.get_mut(&transport_id) {
                transport.add_producer(producer)?;
            }
        }

        producer.set_parameters_done();

        Ok(())
    }

    fn on_producer_parameters_done(&mut self, producer_id: u32, listener: &mut dyn PeerListener) {
        if let Some(producer) = self.producers.get(&producer_id) {
            listener.on_peer_producer_parameters(self, producer);
        }
    }

    /// RTP arrived on a transport: account it on the producer that owns the
    /// SSRC and hand it upward for forwarding.
    pub fn on_rtp_packet(
        &mut self,
        transport_id: u32,
        now: SystemTime,
        packet: &rtp::packet::Packet,
        listener: &mut dyn PeerListener,
    ) {
        let Some(transport) = self.transports.get(&transport_id) else {
            return;
        };
        let Some(producer_id) = transport.get_producer_id(packet.header.ssrc) else {
            log::warn!(
                "no producer for received RTP packet [ssrc:{}]",
                packet.header.ssrc
            );
            return;
        };

        let forwarded = match self.producers.get_mut(&producer_id) {
            Some(producer) => producer.receive_rtp_packet(now, packet),
            None => false,
        };
        if forwarded {
            if let Some(producer) = self.producers.get(&producer_id) {
                listener.on_peer_rtp_packet(self, producer, packet);
            }
        }
    }

    pub fn on_producer_closed(&mut self, producer_id: u32, listener: &mut dyn PeerListener) {
        for transport in self.transports.values_mut() {
            transport.remove_producer(producer_id);
        }

        if let Some(mut producer) = self.producers.remove(&producer_id) {
            producer.close();
            listener.on_peer_producer_closed(self, &producer);
        }
    }

    pub fn on_consumer_closed(&mut self, consumer_id: u32, listener: &mut dyn PeerListener) {
        if let Some(mut consumer) = self.consumers.remove(&consumer_id) {
            consumer.close();
            listener.on_peer_consumer_closed(self, &consumer);
        }
    }

    pub fn on_consumer_full_frame_required(
        &mut self,
        consumer_id: u32,
        listener: &mut dyn PeerListener,
    ) {
        if let Some(consumer) = self.consumers.get(&consumer_id) {
            listener.on_full_frame_required(self, consumer);
        }
    }

    /* RTCP receive pipeline. */

    /// Dispatch a parsed compound packet received on the given transport.
    ///
    /// Unknown SSRCs and unsupported subtypes are logged and skipped;
    /// processing always continues with the next element.
    pub fn on_transport_rtcp_packet(
        &mut self,
        transport_id: u32,
        now: SystemTime,
        packets: &[Box<dyn Packet + Send + Sync>],
        listener: &mut dyn PeerListener,
    ) {
        if !self.transports.contains_key(&transport_id) {
            log::warn!("RTCP from unknown transport [transportId:{transport_id}]");
            return;
        }

        for packet in packets {
            self.handle_rtcp_packet(transport_id, now, packet.as_ref(), listener);
        }
    }

    fn handle_rtcp_packet(
        &mut self,
        transport_id: u32,
        now: SystemTime,
        packet: &(dyn Packet + Send + Sync),
        listener: &mut dyn PeerListener,
    ) {
        let header = packet.header();
        match header.packet_type {
            /* Feedback for local consumers, forwarded toward the remote
             * producer behind them. */
            PacketType::ReceiverReport => {
                let Some(rr) = packet.as_any().downcast_ref::<ReceiverReport>() else {
                    return;
                };
                for report in &rr.reports {
                    match self.get_consumer(report.ssrc) {
                        Some(consumer) => {
                            listener.on_peer_rtcp_receiver_report(self, consumer, report);
                        }
                        None => log::warn!(
                            "no consumer found for received receiver report [ssrc:{}]",
                            report.ssrc
                        ),
                    }
                }
            }

            PacketType::PayloadSpecificFeedback => {
                self.handle_psfb_packet(header.count, packet, listener);
            }

            PacketType::TransportSpecificFeedback => match header.count {
                FORMAT_TLN => {
                    let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() else {
                        return;
                    };
                    match self.get_consumer_id(nack.media_ssrc) {
                        Some(consumer_id) => {
                            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                                consumer.receive_nack(nack);
                            }
                        }
                        None => log::warn!(
                            "no consumer found for received NACK [media ssrc:{}]",
                            nack.media_ssrc
                        ),
                    }
                }
                format => log::warn!(
                    "ignoring unsupported RTP feedback packet [fmt:{format}]"
                ),
            },

            /* Reports from the remote producers on this transport. */
            PacketType::SenderReport => {
                let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() else {
                    return;
                };
                let producer_id = self
                    .transports
                    .get(&transport_id)
                    .and_then(|transport| transport.get_producer_id(sr.ssrc));

                match producer_id {
                    Some(producer_id) => {
                        if let Some(producer) = self.producers.get_mut(&producer_id) {
                            producer.process_sender_report(now, sr);
                        }
                        if let Some(producer) = self.producers.get(&producer_id) {
                            listener.on_peer_rtcp_sender_report(self, producer, sr);
                        }
                    }
                    None => log::warn!(
                        "no producer found for received sender report [ssrc:{}]",
                        sr.ssrc
                    ),
                }
            }

            PacketType::SourceDescription => {
                let Some(sdes) = packet.as_any().downcast_ref::<SourceDescription>() else {
                    return;
                };
                let Some(transport) = self.transports.get(&transport_id) else {
                    return;
                };
                for chunk in &sdes.chunks {
                    if transport.get_producer_id(chunk.source).is_none() {
                        log::warn!(
                            "no producer for received SDES chunk [ssrc:{}]",
                            chunk.source
                        );
                    }
                }
            }

            PacketType::Goodbye => {
                log::debug!("ignoring received RTCP BYE");
            }

            packet_type => {
                log::warn!("unhandled RTCP type received [type:{packet_type}]");
            }
        }
    }

    fn handle_psfb_packet(
        &mut self,
        format: u8,
        packet: &(dyn Packet + Send + Sync),
        listener: &mut dyn PeerListener,
    ) {
        match format {
            // An AFB that really is REMB belongs to the bitrate estimator,
            // not to us. Everything else with FMT 15 reaches us as a raw
            // packet and deliberately falls through to the generic arm.
            FORMAT_REMB
                if packet
                    .as_any()
                    .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
                    .is_some() => {}

            FORMAT_PLI | FORMAT_SLI | FORMAT_FIR | FORMAT_RPSI | FORMAT_REMB => {
                let Some(media_ssrc) = psfb_media_ssrc(packet) else {
                    log::warn!(
                        "cannot extract media ssrc from feedback packet [fmt:{format}]"
                    );
                    return;
                };

                match self.get_consumer(media_ssrc) {
                    Some(consumer) => {
                        // Inactive consumers silently absorb feedback.
                        if !consumer.active() {
                            return;
                        }
                        if format == FORMAT_PLI {
                            log::debug!("PLI received [media ssrc:{media_ssrc}]");
                        }
                        listener.on_peer_rtcp_feedback(self, consumer, packet);
                    }
                    None => log::warn!(
                        "no consumer found for received feedback packet \
                         [fmt:{format}, media ssrc:{media_ssrc}]"
                    ),
                }
            }

            _ => log::warn!(
                "ignoring unsupported payload-specific feedback packet [fmt:{format}]"
            ),
        }
    }

    /* RTCP send pipeline. */

    /// Build and send the outgoing compounds for every transport: one
    /// compound per sender report, receiver reports aggregated into one
    /// trailing compound.
    pub fn send_rtcp(&mut self, now: SystemTime) {
        let transport_ids: Vec<u32> = self.transports.keys().copied().collect();

        for transport_id in transport_ids {
            let mut compound = RtcpCompound::new();

            let consumer_ids: Vec<u32> = self.consumers.keys().copied().collect();
            for consumer_id in consumer_ids {
                {
                    let consumer = self.consumers.get_mut(&consumer_id).unwrap();
                    if consumer.transport_id() != Some(transport_id) {
                        continue;
                    }
                    consumer.get_rtcp(&mut compound, now);
                }

                // One compound on the wire per sender report, so the SR
                // stays paired with its SDES.
                if compound.sender_report_count() != 0 {
                    if !self.flush_rtcp_compound(transport_id, &compound) {
                        return;
                    }
                    compound = RtcpCompound::new();
                }
            }

            for producer in self.producers.values_mut() {
                if producer.transport_id() != Some(transport_id) {
                    continue;
                }
                producer.get_rtcp(&mut compound, now);
            }

            if compound.receiver_report_count() != 0
                && !self.flush_rtcp_compound(transport_id, &compound)
            {
                return;
            }
        }
    }

    /// Serialize and hand one compound to the transport. Returns `false`
    /// when the tick must be aborted.
    fn flush_rtcp_compound(&mut self, transport_id: u32, compound: &RtcpCompound) -> bool {
        if compound.size() > RTCP_BUFFER_SIZE {
            log::warn!(
                "cannot send RTCP packet, size too big ({} bytes)",
                compound.size()
            );
            return false;
        }

        if let Err(error) = compound.serialize(&mut self.rtcp_buffer) {
            log::warn!("cannot serialize RTCP compound packet: {error}");
            return false;
        }

        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.send_rtcp_compound_packet(&self.rtcp_buffer);
        }

        true
    }

    /* Adaptive scheduling. */

    /// Periodic tick: send RTCP, then re-arm the timer with an interval
    /// derived from the aggregate consumer transmission rate, jittered
    /// into [0.5x, 1.5x] per RFC 3550. Returns the chosen interval.
    pub fn on_timer(&mut self, now: SystemTime) -> Duration {
        self.send_rtcp(now);

        let mut interval = self.compute_rtcp_interval(now);
        let draw = thread_rng().gen_range(5..=15u64);
        interval = jitter_interval(interval, draw);

        let interval = Duration::from_millis(interval);
        self.timer.start(interval);
        interval
    }

    /// Pre-jitter interval in milliseconds: 360000 / rate in kbps, capped
    /// by [`MAX_VIDEO_INTERVAL_MS`].
    fn compute_rtcp_interval(&mut self, now: SystemTime) -> u64 {
        let mut interval = MAX_VIDEO_INTERVAL_MS;

        if !self.consumers.is_empty() {
            let mut rate_kbps: u64 = 0;
            for consumer in self.consumers.values_mut() {
                rate_kbps += consumer.get_transmission_rate(now) / 1000;
            }

            if rate_kbps != 0 {
                interval = 360_000 / rate_kbps;
            }
            if interval > MAX_VIDEO_INTERVAL_MS {
                interval = MAX_VIDEO_INTERVAL_MS;
            }
        }

        interval
    }

    /* Request id helpers. */

    fn transport_id_from_request(&self, request: &Request) -> Result<u32> {
        request
            .internal_id("transportId")
            .ok_or(Error::ErrNonNumericTransportId)
    }

    fn producer_id_from_request(&self, request: &Request) -> Result<u32> {
        request
            .internal_id("producerId")
            .ok_or(Error::ErrNonNumericProducerId)
    }

    fn consumer_id_from_request(&self, request: &Request) -> Result<u32> {
        request
            .internal_id("consumerId")
            .ok_or(Error::ErrNonNumericConsumerId)
    }
}

/// Apply the RFC 3550 jitter factor: `draw` is uniform in [5, 15], scaling
/// the interval into [0.5x, 1.5x].
fn jitter_interval(interval: u64, draw: u64) -> u64 {
    interval * draw / 10
}

/// Media SSRC of a payload-specific feedback element. Typed packets carry
/// it as a field; raw ones (RPSI, non-REMB AFB) per RFC 4585 at FCI offset
/// 8.
fn psfb_media_ssrc(packet: &(dyn Packet + Send + Sync)) -> Option<u32> {
    if let Some(pli) = packet.as_any().downcast_ref::<PictureLossIndication>() {
        return Some(pli.media_ssrc);
    }
    if let Some(sli) = packet.as_any().downcast_ref::<SliceLossIndication>() {
        return Some(sli.media_ssrc);
    }
    if let Some(fir) = packet.as_any().downcast_ref::<FullIntraRequest>() {
        return Some(fir.media_ssrc);
    }
    if let Some(raw) = packet.as_any().downcast_ref::<RawPacket>() {
        let data: &[u8] = &raw.0;
        if data.len() >= 12 {
            return Some(u32::from_be_bytes([data[8], data[9], data[10], data[11]]));
        }
    }
    None
}
