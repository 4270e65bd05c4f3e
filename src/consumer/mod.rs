#[cfg(test)]
mod consumer_test;
mod send_stream;

use std::time::SystemTime;

use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use serde_json::{json, Value};

use crate::channel::{MethodId, Notifier, Request};
use crate::error::{Error, Result};
use crate::rtcp_compound::RtcpCompound;
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};

use send_stream::SendStream;

/// An outgoing media stream forwarded to the remote participant.
pub struct Consumer {
    pub consumer_id: u32,
    pub kind: MediaKind,
    notifier: Notifier,
    parameters: Option<RtpParameters>,
    peer_capabilities: Option<RtpCapabilities>,
    transport_id: Option<u32>,
    active: bool,
    stream: Option<SendStream>,
    closed: bool,
}

impl Consumer {
    pub fn new(notifier: Notifier, consumer_id: u32, kind: MediaKind) -> Self {
        Consumer {
            consumer_id,
            kind,
            notifier,
            parameters: None,
            peer_capabilities: None,
            transport_id: None,
            active: false,
            stream: None,
            closed: false,
        }
    }

    pub fn handle_request(&mut self, request: &Request) -> Result<Option<Value>> {
        match request.method {
            MethodId::ConsumerDump => Ok(Some(self.to_json())),

            MethodId::ConsumerDisable => {
                self.active = false;

                log::debug!("consumer disabled [consumerId:{}]", self.consumer_id);

                Ok(None)
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    /// Capabilities of the owning peer, set when the consumer is adopted.
    pub fn set_peer_capabilities(&mut self, capabilities: RtpCapabilities) {
        self.peer_capabilities = Some(capabilities);
    }

    pub fn peer_capabilities(&self) -> Option<&RtpCapabilities> {
        self.peer_capabilities.as_ref()
    }

    /// Start forwarding with the given RTP parameters.
    ///
    /// The consumer becomes active when the parameters declare a primary
    /// SSRC to stamp on outgoing packets and reports.
    pub fn send(&mut self, parameters: RtpParameters) {
        let primary = parameters
            .encodings
            .iter()
            .find_map(|encoding| encoding.ssrc.map(|ssrc| (ssrc, encoding)));

        match primary {
            Some((ssrc, encoding)) => {
                let clock_rate = parameters.clock_rate_for(encoding).unwrap_or(90000);
                let cname = parameters
                    .rtcp
                    .cname
                    .clone()
                    .unwrap_or_else(|| format!("consumer-{}", self.consumer_id));
                self.stream = Some(SendStream::new(ssrc, clock_rate, cname));
                self.active = true;
            }
            None => {
                log::warn!(
                    "cannot activate consumer, no encoding with ssrc [consumerId:{}]",
                    self.consumer_id
                );
                self.active = false;
            }
        }

        self.parameters = Some(parameters);
    }

    pub fn parameters(&self) -> Option<&RtpParameters> {
        self.parameters.as_ref()
    }

    pub fn active(&self) -> bool {
        self.active && !self.closed
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

    /// Account one forwarded RTP packet. Returns `true` when the consumer
    /// is active and took it.
    pub fn send_rtp_packet(&mut self, now: SystemTime, packet: &rtp::packet::Packet) -> bool {
        if !self.active() {
            return false;
        }
        let Some(stream) = &mut self.stream else {
            return false;
        };
        stream.process_rtp(now, packet);
        true
    }

    /// Answer a NACK from the retransmission buffer. Returns how many of
    /// the requested packets were still buffered.
    pub fn receive_nack(&mut self, nack: &TransportLayerNack) -> usize {
        let Some(stream) = &mut self.stream else {
            return 0;
        };

        let mut requested = 0u64;
        let mut recovered = 0usize;
        for pair in &nack.nacks {
            for seq in pair.packet_list() {
                requested += 1;
                if stream.buffer_get(seq).is_some() {
                    // The transport re-sends from here; this side only
                    // accounts the recovery.
                    recovered += 1;
                }
            }
        }
        stream.record_nack(requested, recovered as u64);

        log::debug!(
            "NACK processed [consumerId:{}, requested:{requested}, recovered:{recovered}]",
            self.consumer_id
        );

        recovered
    }

    pub fn nacked_packets(&self) -> u64 {
        self.stream.as_ref().map(SendStream::nacked_packets).unwrap_or(0)
    }

    /// Append this consumer's sender report and SDES chunk to the compound.
    pub fn get_rtcp(&mut self, compound: &mut RtcpCompound, now: SystemTime) {
        if !self.active() {
            return;
        }
        let Some(stream) = &self.stream else {
            return;
        };
        compound.add_sender_report(stream.generate_sender_report(now));
        compound.add_sdes_chunk(stream.sdes_chunk());
    }

    /// Current sending rate in bits per second.
    pub fn get_transmission_rate(&mut self, now: SystemTime) -> u64 {
        match &mut self.stream {
            Some(stream) => stream.transmission_rate(now),
            None => 0,
        }
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
            .emit(self.consumer_id, "close", json!({ "class": "Consumer" }));
    }

    pub fn to_json(&self) -> Value {
        json!({
            "consumerId": self.consumer_id,
            "kind": self.kind.as_str(),
            "rtpParameters": self.parameters.as_ref().map(RtpParameters::to_json),
            "transportId": self.transport_id,
            "active": self.active(),
        })
    }
}
