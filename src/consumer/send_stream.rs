use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescriptionChunk, SourceDescriptionItem};
use rtp::extension::abs_send_time_extension::unix2ntp;
use util::marshal::MarshalSize;

/// Capacity of the retransmission ring buffer, packets.
const SEND_BUFFER_SIZE: u16 = 1 << 9;

const HALF_U16: u16 = 1 << 15;

/// Width of the rate measurement window.
const RATE_WINDOW_MS: u64 = 1000;

/// Windowed byte-rate gauge feeding the adaptive RTCP interval.
pub(crate) struct RateCalculator {
    samples: VecDeque<(SystemTime, usize)>,
    bytes_in_window: usize,
}

impl RateCalculator {
    pub(crate) fn new() -> Self {
        RateCalculator {
            samples: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    fn evict(&mut self, now: SystemTime) {
        let horizon = now
            .checked_sub(Duration::from_millis(RATE_WINDOW_MS))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        while let Some((time, bytes)) = self.samples.front() {
            if *time > horizon {
                break;
            }
            self.bytes_in_window -= bytes;
            self.samples.pop_front();
        }
    }

    pub(crate) fn update(&mut self, now: SystemTime, bytes: usize) {
        self.evict(now);
        self.samples.push_back((now, bytes));
        self.bytes_in_window += bytes;
    }

    /// Current rate in bits per second.
    pub(crate) fn rate(&mut self, now: SystemTime) -> u64 {
        self.evict(now);
        (self.bytes_in_window as u64) * 8 * 1000 / RATE_WINDOW_MS
    }
}

/// Send-side state of a consumer: sender-report data, the retransmission
/// ring buffer answered on NACK, and the transmission-rate gauge.
pub(crate) struct SendStream {
    ssrc: u32,
    clock_rate: f64,
    cname: String,

    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,
    packet_count: u32,
    octet_count: u32,

    buffer: Vec<Option<rtp::packet::Packet>>,
    buffer_started: bool,
    last_added: u16,

    rate: RateCalculator,

    nacked_packets: u64,
    retransmitted_packets: u64,
}

impl SendStream {
    pub(crate) fn new(ssrc: u32, clock_rate: u32, cname: String) -> Self {
        SendStream {
            ssrc,
            clock_rate: f64::from(clock_rate),
            cname,

            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,
            packet_count: 0,
            octet_count: 0,

            buffer: vec![None; SEND_BUFFER_SIZE as usize],
            buffer_started: false,
            last_added: 0,

            rate: RateCalculator::new(),

            nacked_packets: 0,
            retransmitted_packets: 0,
        }
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(crate) fn process_rtp(&mut self, now: SystemTime, packet: &rtp::packet::Packet) {
        self.last_rtp_time_rtp = packet.header.timestamp;
        self.last_rtp_time_time = now;
        self.packet_count += 1;
        self.octet_count += packet.payload.len() as u32;

        self.rate.update(now, packet.marshal_size());
        self.buffer_add(packet);
    }

    fn buffer_add(&mut self, packet: &rtp::packet::Packet) {
        let seq = packet.header.sequence_number;
        if !self.buffer_started {
            self.buffer[(seq % SEND_BUFFER_SIZE) as usize] = Some(packet.clone());
            self.last_added = seq;
            self.buffer_started = true;
            return;
        }

        let diff = seq.wrapping_sub(self.last_added);
        if diff == 0 {
            return;
        } else if diff < HALF_U16 {
            // Clear the gap so stale packets cannot answer future NACKs.
            let mut i = self.last_added.wrapping_add(1);
            while i != seq {
                self.buffer[(i % SEND_BUFFER_SIZE) as usize] = None;
                i = i.wrapping_add(1);
            }
        }

        self.buffer[(seq % SEND_BUFFER_SIZE) as usize] = Some(packet.clone());
        self.last_added = seq;
    }

    pub(crate) fn buffer_get(&self, seq: u16) -> Option<&rtp::packet::Packet> {
        let diff = self.last_added.wrapping_sub(seq);
        if diff >= HALF_U16 || diff >= SEND_BUFFER_SIZE {
            return None;
        }
        self.buffer[(seq % SEND_BUFFER_SIZE) as usize]
            .as_ref()
            .filter(|p| p.header.sequence_number == seq)
    }

    pub(crate) fn record_nack(&mut self, requested: u64, recovered: u64) {
        self.nacked_packets += requested;
        self.retransmitted_packets += recovered;
    }

    pub(crate) fn nacked_packets(&self) -> u64 {
        self.nacked_packets
    }

    pub(crate) fn retransmitted_packets(&self) -> u64 {
        self.retransmitted_packets
    }

    pub(crate) fn generate_sender_report(&self, now: SystemTime) -> SenderReport {
        let elapsed = now
            .duration_since(self.last_rtp_time_time)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();

        SenderReport {
            ssrc: self.ssrc,
            ntp_time: unix2ntp(now),
            rtp_time: self
                .last_rtp_time_rtp
                .wrapping_add((elapsed * self.clock_rate) as u32),
            packet_count: self.packet_count,
            octet_count: self.octet_count,
            ..Default::default()
        }
    }

    pub(crate) fn sdes_chunk(&self) -> SourceDescriptionChunk {
        SourceDescriptionChunk {
            source: self.ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(self.cname.clone()),
            }],
        }
    }

    pub(crate) fn transmission_rate(&mut self, now: SystemTime) -> u64 {
        self.rate.rate(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rtp_packet(seq: u16, timestamp: u32, payload_len: usize) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                ssrc: 5000,
                sequence_number: seq,
                timestamp,
                ..Default::default()
            },
            payload: Bytes::from(vec![0u8; payload_len]),
        }
    }

    fn at_millis(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_sender_report_extrapolates_rtp_time() {
        let mut stream = SendStream::new(5000, 90000, "cname".to_owned());
        stream.process_rtp(at_millis(1000), &rtp_packet(1, 3000, 100));

        let sr = stream.generate_sender_report(at_millis(2000));
        assert_eq!(sr.ssrc, 5000);
        assert_eq!(sr.packet_count, 1);
        assert_eq!(sr.octet_count, 100);
        // One second of 90 kHz clock on top of the last timestamp.
        assert_eq!(sr.rtp_time, 3000 + 90000);
    }

    #[test]
    fn test_buffer_answers_recent_sequence_numbers() {
        let mut stream = SendStream::new(5000, 90000, "cname".to_owned());
        for seq in 100u16..110 {
            stream.process_rtp(at_millis(1000), &rtp_packet(seq, 0, 10));
        }

        assert!(stream.buffer_get(105).is_some());
        assert!(stream.buffer_get(110).is_none());
        // Far in the past relative to the newest entry.
        assert!(stream.buffer_get(90).is_none());
    }

    #[test]
    fn test_buffer_gap_is_cleared() {
        let mut stream = SendStream::new(5000, 90000, "cname".to_owned());
        stream.process_rtp(at_millis(1000), &rtp_packet(100, 0, 10));
        stream.process_rtp(at_millis(1000), &rtp_packet(103, 0, 10));

        assert!(stream.buffer_get(100).is_some());
        assert!(stream.buffer_get(101).is_none());
        assert!(stream.buffer_get(102).is_none());
        assert!(stream.buffer_get(103).is_some());
    }

    #[test]
    fn test_transmission_rate_window() {
        let mut stream = SendStream::new(5000, 90000, "cname".to_owned());

        // 150 packets of 1000 wire bytes (12 header + 988 payload) within
        // the window: 1_200_000 bits over one second.
        for seq in 0u16..150 {
            stream.process_rtp(at_millis(10_000), &rtp_packet(seq, 0, 988));
        }
        assert_eq!(stream.transmission_rate(at_millis(10_000)), 1_200_000);

        // Everything has left the window two seconds later.
        assert_eq!(stream.transmission_rate(at_millis(12_000)), 0);
    }

    #[test]
    fn test_sdes_chunk_carries_cname() {
        let stream = SendStream::new(5000, 90000, "abcd".to_owned());
        let chunk = stream.sdes_chunk();
        assert_eq!(chunk.source, 5000);
        assert_eq!(chunk.items[0].sdes_type, SdesType::SdesCname);
        assert_eq!(&chunk.items[0].text[..], b"abcd");
    }
}
