use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// ErrCapabilitiesAlreadySet indicates a second `peer.setCapabilities`
    /// on the same peer. Capabilities are one-shot.
    #[error("peer capabilities already set")]
    ErrCapabilitiesAlreadySet,

    /// ErrCapabilitiesNotSet indicates an operation that requires the peer
    /// capabilities before they have been declared.
    #[error("peer capabilities are not yet set")]
    ErrCapabilitiesNotSet,

    /// ErrTransportAlreadyExists indicates a transport id collision on
    /// `peer.createTransport`.
    #[error("Transport already exists")]
    ErrTransportAlreadyExists,

    /// ErrTransportNotFound indicates that `internal.transportId` does not
    /// resolve to a transport of this peer.
    #[error("Transport does not exist")]
    ErrTransportNotFound,

    /// ErrProducerAlreadyExists indicates a producer id collision on
    /// `peer.createProducer`.
    #[error("Producer already exists")]
    ErrProducerAlreadyExists,

    /// ErrProducerNotFound indicates that `internal.producerId` does not
    /// resolve to a producer of this peer.
    #[error("Producer does not exist")]
    ErrProducerNotFound,

    /// ErrConsumerNotFound indicates that `internal.consumerId` does not
    /// resolve to a consumer of this peer.
    #[error("Consumer does not exist")]
    ErrConsumerNotFound,

    /// ErrMissingKind indicates `peer.createProducer` without a string
    /// `data.kind`.
    #[error("missing kind")]
    ErrMissingKind,

    /// ErrInvalidKind indicates a `data.kind` outside audio/video/depth.
    #[error("invalid kind")]
    ErrInvalidKind,

    #[error("Request has not numeric internal.transportId")]
    ErrNonNumericTransportId,

    #[error("Request has not numeric internal.producerId")]
    ErrNonNumericProducerId,

    #[error("Request has not numeric internal.consumerId")]
    ErrNonNumericConsumerId,

    #[error("Request has not numeric data.bitrate")]
    ErrNonNumericBitrate,

    #[error("Request has not boolean data.enabled")]
    ErrNonBooleanEnabled,

    /// ErrMissingDtlsRole indicates `transport.setRemoteDtlsParameters`
    /// without a string `data.role`.
    #[error("missing data.role")]
    ErrMissingDtlsRole,

    /// ErrInvalidDtlsRole indicates a `data.role` outside auto/client/server.
    #[error("invalid data.role")]
    ErrInvalidDtlsRole,

    /// ErrMissingDtlsFingerprints indicates `transport.setRemoteDtlsParameters`
    /// without `data.fingerprints`.
    #[error("missing data.fingerprints")]
    ErrMissingDtlsFingerprints,

    /// ErrProducerParametersNotSet indicates an attempt to register a
    /// producer into a transport SSRC table before `producer.receive`.
    #[error("Producer has no RTP parameters")]
    ErrProducerParametersNotSet,

    /// ErrSsrcAlreadyExists indicates an SSRC collision in a transport's
    /// producer table.
    #[error("ssrc already exists in the Transport")]
    ErrSsrcAlreadyExists,

    #[error("unknown method")]
    ErrUnknownMethod,

    /// Malformed JSON in a request payload; carries the parse message.
    #[error("{0}")]
    ErrInvalidJson(String),

    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ErrInvalidJson(e.to_string())
    }
}
