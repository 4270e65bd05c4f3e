#[cfg(test)]
mod transport_test;

use std::collections::HashMap;

use bytes::Bytes;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::channel::{MethodId, Notifier, Request};
use crate::error::{Error, Result};
use crate::producer::Producer;

const RUNES_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const ICE_UFRAG_LENGTH: usize = 16;
const ICE_PWD_LENGTH: usize = 32;

/// Floor applied to `transport.setMaxBitrate`.
const MIN_MAX_BITRATE: u64 = 10_000;

fn rand_alpha(n: usize) -> String {
    let mut rng = thread_rng();
    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..RUNES_ALPHA.len());
            RUNES_ALPHA[idx] as char
        })
        .collect()
}

/// Event a transport reports back to its owning peer after handling a
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Closed,
}

/// Network path boundary object.
///
/// The peer only relies on the surface modeled here: the SSRC to producer
/// index, the REMB capability flag, locally generated ICE credentials,
/// stored remote DTLS parameters and an outbound sink for serialized RTCP.
/// Connectivity itself (ICE/DTLS/SRTP) is established elsewhere.
pub struct Transport {
    pub transport_id: u32,
    notifier: Notifier,
    /// SSRC of every stream (media, RTX, FEC) to the producer feeding it.
    producer_ssrc_table: HashMap<u32, u32>,
    remb: bool,
    max_bitrate: Option<u64>,
    ice_ufrag: String,
    ice_pwd: String,
    remote_dtls_role: Option<String>,
    remote_dtls_fingerprints: Option<Value>,
    rtcp_sink: Option<mpsc::UnboundedSender<Bytes>>,
    closed: bool,
}

impl Transport {
    pub fn new(notifier: Notifier, transport_id: u32) -> Self {
        Transport {
            transport_id,
            notifier,
            producer_ssrc_table: HashMap::new(),
            remb: false,
            max_bitrate: None,
            ice_ufrag: rand_alpha(ICE_UFRAG_LENGTH),
            ice_pwd: rand_alpha(ICE_PWD_LENGTH),
            remote_dtls_role: None,
            remote_dtls_fingerprints: None,
            rtcp_sink: None,
            closed: false,
        }
    }

    pub fn handle_request(
        &mut self,
        request: &Request,
    ) -> Result<(Option<Value>, Option<TransportEvent>)> {
        match request.method {
            MethodId::TransportClose => {
                self.close();
                Ok((None, Some(TransportEvent::Closed)))
            }

            MethodId::TransportDump => Ok((Some(self.to_json()), None)),

            MethodId::TransportSetRemoteDtlsParameters => {
                let role = match request.data.get("role") {
                    Some(Value::String(role)) => role.clone(),
                    Some(_) => return Err(Error::ErrInvalidDtlsRole),
                    None => return Err(Error::ErrMissingDtlsRole),
                };
                if !matches!(role.as_str(), "auto" | "client" | "server") {
                    return Err(Error::ErrInvalidDtlsRole);
                }
                let fingerprints = request
                    .data
                    .get("fingerprints")
                    .ok_or(Error::ErrMissingDtlsFingerprints)?
                    .clone();

                // The remote answers our passive side unless it is itself
                // a server.
                let local_role = if role == "server" { "client" } else { "server" };

                self.remote_dtls_role = Some(role);
                self.remote_dtls_fingerprints = Some(fingerprints);

                Ok((Some(json!({ "role": local_role })), None))
            }

            MethodId::TransportSetMaxBitrate => {
                let bitrate = request
                    .data
                    .get("bitrate")
                    .and_then(Value::as_u64)
                    .ok_or(Error::ErrNonNumericBitrate)?;
                let bitrate = bitrate.max(MIN_MAX_BITRATE);
                self.max_bitrate = Some(bitrate);

                log::debug!(
                    "transport max bitrate set [transportId:{}, bitrate:{bitrate}]",
                    self.transport_id
                );

                Ok((Some(json!({ "bitrate": bitrate })), None))
            }

            MethodId::TransportChangeUfragPwd => {
                self.ice_ufrag = rand_alpha(ICE_UFRAG_LENGTH);
                self.ice_pwd = rand_alpha(ICE_PWD_LENGTH);

                Ok((
                    Some(json!({
                        "usernameFragment": self.ice_ufrag,
                        "password": self.ice_pwd,
                    })),
                    None,
                ))
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    /// Register every SSRC the producer's parameters declare.
    ///
    /// Fails without touching the table when the producer has no parameters
    /// yet or when one of its SSRCs is already taken by another producer.
    pub fn add_producer(&mut self, producer: &Producer) -> Result<()> {
        let parameters = producer
            .parameters()
            .ok_or(Error::ErrProducerParametersNotSet)?;

        let ssrcs = parameters.ssrcs();
        for ssrc in &ssrcs {
            if let Some(existing) = self.producer_ssrc_table.get(ssrc) {
                if *existing != producer.producer_id {
                    return Err(Error::ErrSsrcAlreadyExists);
                }
            }
        }
        for ssrc in ssrcs {
            self.producer_ssrc_table.insert(ssrc, producer.producer_id);
        }

        Ok(())
    }

    pub fn remove_producer(&mut self, producer_id: u32) {
        self.producer_ssrc_table
            .retain(|_, id| *id != producer_id);
    }

    pub fn get_producer_id(&self, ssrc: u32) -> Option<u32> {
        self.producer_ssrc_table.get(&ssrc).copied()
    }

    pub fn has_remb(&self) -> bool {
        self.remb
    }

    pub fn enable_remb(&mut self) {
        self.remb = true;
    }

    /// Attach the outbound sink the serialized RTCP is handed to. Without a
    /// sink outgoing RTCP is dropped, which is the pre-connected state.
    pub fn set_rtcp_sink(&mut self, sink: mpsc::UnboundedSender<Bytes>) {
        self.rtcp_sink = Some(sink);
    }

    pub fn send_rtcp_compound_packet(&mut self, data: &[u8]) {
        if self.closed {
            return;
        }
        match &self.rtcp_sink {
            Some(sink) => {
                if sink.send(Bytes::copy_from_slice(data)).is_err() {
                    log::trace!(
                        "rtcp sink gone [transportId:{}]",
                        self.transport_id
                    );
                }
            }
            None => log::trace!(
                "no rtcp sink attached, dropping outgoing packet [transportId:{}]",
                self.transport_id
            ),
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
            .emit(self.transport_id, "close", json!({ "class": "Transport" }));
    }

    pub fn to_json(&self) -> Value {
        json!({
            "transportId": self.transport_id,
            "iceLocalParameters": {
                "usernameFragment": self.ice_ufrag,
                "password": self.ice_pwd,
            },
            "dtlsRemoteParameters": {
                "role": self.remote_dtls_role,
                "fingerprints": self.remote_dtls_fingerprints,
            },
            "hasRemb": self.remb,
            "maxBitrate": self.max_bitrate,
        })
    }
}
