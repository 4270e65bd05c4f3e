#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Per-participant session controller for a selective forwarding unit.
//!
//! A [`peer::Peer`] owns the transports, producers (incoming media) and
//! consumers (outgoing media) that belong to one participant, routes
//! control-channel requests to them, dispatches received RTCP to the right
//! collaborator and drives the periodic RTCP feedback loop.
//!
//! The crate does not touch the wire: RTCP arrives already parsed as
//! [`rtcp`] packet trait objects and leaves as serialized compound packets
//! handed to a [`transport::Transport`]. ICE/DTLS/SRTP, bitrate estimation
//! and the room that aggregates peers live elsewhere and talk to the peer
//! through [`peer::PeerListener`] and the notification channel.

pub use rtcp;
pub use rtp;

pub use error::Error;

pub mod channel;
pub mod consumer;
pub mod error;
pub mod peer;
pub mod producer;
pub mod rtcp_compound;
pub mod rtp_parameters;
pub mod transport;

/// Upper bound on the RTCP transmission interval in milliseconds.
///
/// The interval shrinks with the aggregate consumer transmission rate but
/// never grows past this value. A freshly created peer fires its first
/// RTCP tick after half of it.
pub const MAX_VIDEO_INTERVAL_MS: u64 = 5000;

/// Maximum size in bytes of a serialized RTCP compound packet.
///
/// Compounds that would exceed it are dropped with a warning.
pub const RTCP_BUFFER_SIZE: usize = 65536;
