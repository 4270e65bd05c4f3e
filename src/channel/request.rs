use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control-channel methods routed through a peer.
///
/// The wire names follow the `<target>.<action>` convention of the control
/// protocol. Anything the channel cannot map lands on [`MethodId::Unsupported`]
/// and is rejected by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodId {
    #[serde(rename = "peer.close")]
    PeerClose,
    #[serde(rename = "peer.dump")]
    PeerDump,
    #[serde(rename = "peer.setCapabilities")]
    PeerSetCapabilities,
    #[serde(rename = "peer.createTransport")]
    PeerCreateTransport,
    #[serde(rename = "peer.createProducer")]
    PeerCreateProducer,
    #[serde(rename = "transport.close")]
    TransportClose,
    #[serde(rename = "transport.dump")]
    TransportDump,
    #[serde(rename = "transport.setRemoteDtlsParameters")]
    TransportSetRemoteDtlsParameters,
    #[serde(rename = "transport.setMaxBitrate")]
    TransportSetMaxBitrate,
    #[serde(rename = "transport.changeUfragPwd")]
    TransportChangeUfragPwd,
    #[serde(rename = "producer.close")]
    ProducerClose,
    #[serde(rename = "producer.dump")]
    ProducerDump,
    #[serde(rename = "producer.receive")]
    ProducerReceive,
    #[serde(rename = "producer.setRtpRawEvent")]
    ProducerSetRtpRawEvent,
    #[serde(rename = "producer.setRtpObjectEvent")]
    ProducerSetRtpObjectEvent,
    #[serde(rename = "producer.setTransport")]
    ProducerSetTransport,
    #[serde(rename = "consumer.dump")]
    ConsumerDump,
    #[serde(rename = "consumer.setTransport")]
    ConsumerSetTransport,
    #[serde(rename = "consumer.disable")]
    ConsumerDisable,
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unsupported".to_owned());
        write!(f, "{s}")
    }
}

/// A request delivered over the control channel.
///
/// `internal` carries routing ids (`transportId`, `producerId`,
/// `consumerId`) set by the controlling process; `data` carries the
/// method-specific payload.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: MethodId,
    pub internal: Value,
    pub data: Value,
}

impl Request {
    pub fn new(method: MethodId, internal: Value, data: Value) -> Self {
        Request {
            method,
            internal,
            data,
        }
    }

    /// Numeric id from the `internal` object, `None` when absent or not an
    /// unsigned integer that fits `u32`.
    pub fn internal_id(&self, key: &str) -> Option<u32> {
        self.internal
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
    }
}

/// Outcome of a request: accepted with an optional payload, or rejected
/// with a reason string.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Accepted(Option<Value>),
    Rejected(String),
}

impl Response {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Response::Accepted(_))
    }

    /// Payload of an accepted response, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Accepted(data) => data.as_ref(),
            Response::Rejected(_) => None,
        }
    }

    /// Reason of a rejected response.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Response::Accepted(_) => None,
            Response::Rejected(reason) => Some(reason),
        }
    }
}
