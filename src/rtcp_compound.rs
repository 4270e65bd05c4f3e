use bytes::BytesMut;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SourceDescription, SourceDescriptionChunk};
use util::marshal::{Marshal, MarshalSize};

use crate::error::Result;

/// An outgoing RTCP compound packet under construction.
///
/// Sender reports come first, then receiver reports, then a single source
/// description carrying every accumulated SDES chunk. The peer flushes a
/// compound as soon as it holds a sender report and aggregates receiver
/// reports into one trailing compound per transport.
#[derive(Default)]
pub struct RtcpCompound {
    sender_reports: Vec<SenderReport>,
    receiver_reports: Vec<ReceiverReport>,
    sdes: SourceDescription,
}

impl RtcpCompound {
    pub fn new() -> Self {
        RtcpCompound::default()
    }

    pub fn add_sender_report(&mut self, report: SenderReport) {
        self.sender_reports.push(report);
    }

    pub fn add_receiver_report(&mut self, report: ReceiverReport) {
        self.receiver_reports.push(report);
    }

    pub fn add_sdes_chunk(&mut self, chunk: SourceDescriptionChunk) {
        self.sdes.chunks.push(chunk);
    }

    pub fn sender_report_count(&self) -> usize {
        self.sender_reports.len()
    }

    pub fn receiver_report_count(&self) -> usize {
        self.receiver_reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty()
            && self.receiver_reports.is_empty()
            && self.sdes.chunks.is_empty()
    }

    /// Serialized size in bytes, padding included.
    pub fn size(&self) -> usize {
        let mut size = 0;
        for report in &self.sender_reports {
            size += report.marshal_size();
        }
        for report in &self.receiver_reports {
            size += report.marshal_size();
        }
        if !self.sdes.chunks.is_empty() {
            size += self.sdes.marshal_size();
        }
        size
    }

    /// Serialize every packet of the compound into `buf`, replacing its
    /// previous contents.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.clear();
        for report in &self.sender_reports {
            buf.extend_from_slice(&report.marshal()?);
        }
        for report in &self.receiver_reports {
            buf.extend_from_slice(&report.marshal()?);
        }
        if !self.sdes.chunks.is_empty() {
            buf.extend_from_slice(&self.sdes.marshal()?);
        }
        Ok(())
    }
}
