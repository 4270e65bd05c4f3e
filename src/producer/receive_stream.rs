use std::time::{Duration, SystemTime};

use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;

/// Receive-side statistics for one incoming SSRC, the source of the
/// receiver reports the owning producer contributes to outgoing compounds.
///
/// Loss is tracked with a bitmap of recently seen sequence numbers; jitter
/// follows the RFC 3550 interarrival estimator.
pub(crate) struct ReceiveStream {
    ssrc: u32,
    receiver_ssrc: u32,
    clock_rate: f64,

    seen: Vec<u64>,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: i32,
    last_report_seq_num: i32,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,
    jitter: f64,
    last_sender_report: u32,
    last_sender_report_time: SystemTime,
    total_lost: u32,

    packet_count: u64,
    octet_count: u64,
}

impl ReceiveStream {
    pub(crate) fn new(ssrc: u32, clock_rate: u32, receiver_ssrc: u32) -> Self {
        ReceiveStream {
            ssrc,
            receiver_ssrc,
            clock_rate: f64::from(clock_rate),

            seen: vec![0u64; 128],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,
            jitter: 0.0,
            last_sender_report: 0,
            last_sender_report_time: SystemTime::UNIX_EPOCH,
            total_lost: 0,

            packet_count: 0,
            octet_count: 0,
        }
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(crate) fn receiver_ssrc(&self) -> u32 {
        self.receiver_ssrc
    }

    fn set_seen(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.seen.len() * 64);
        self.seen[pos / 64] |= 1 << (pos % 64);
    }

    fn clear_seen(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.seen.len() * 64);
        self.seen[pos / 64] &= u64::MAX ^ (1u64 << (pos % 64));
    }

    fn is_seen(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (self.seen.len() * 64);
        (self.seen[pos / 64] & (1 << (pos % 64))) != 0
    }

    pub(crate) fn process_rtp(&mut self, now: SystemTime, packet: &rtp::packet::Packet) {
        let seq = packet.header.sequence_number;

        if !self.started {
            self.started = true;
            self.set_seen(seq);
            self.last_seq_num = i32::from(seq);
            self.last_report_seq_num = i32::from(seq) - 1;
        } else {
            self.set_seen(seq);

            let diff = i32::from(seq) - self.last_seq_num;
            if !(-0x0FFF..=0).contains(&diff) {
                if diff < -0x0FFF {
                    self.seq_num_cycles += 1;
                }

                // Everything between the previous head and this packet is
                // unaccounted for until it arrives.
                for missing in self.last_seq_num + 1..i32::from(seq) {
                    self.clear_seen(missing as u16);
                }

                self.last_seq_num = i32::from(seq);
            }

            // RFC 3550 interarrival jitter, smoothed by 1/16.
            let d = now
                .duration_since(self.last_rtp_time_time)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64()
                * self.clock_rate
                - (f64::from(packet.header.timestamp) - f64::from(self.last_rtp_time_rtp));
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }

        self.last_rtp_time_rtp = packet.header.timestamp;
        self.last_rtp_time_time = now;
        self.packet_count += 1;
        self.octet_count += packet.payload.len() as u64;
    }

    pub(crate) fn process_sender_report(&mut self, now: SystemTime, sr: &SenderReport) {
        self.last_sender_report = (sr.ntp_time >> 16) as u32;
        self.last_sender_report_time = now;
    }

    pub(crate) fn generate_report(&mut self, now: SystemTime) -> ReceiverReport {
        let total_since_report = (self.last_seq_num - self.last_report_seq_num) as u16;
        let mut lost_since_report = {
            if self.last_seq_num == self.last_report_seq_num {
                0
            } else {
                let mut lost = 0u32;
                let mut i = (self.last_report_seq_num + 1) as u16;
                while i != self.last_seq_num as u16 {
                    if !self.is_seen(i) {
                        lost += 1;
                    }
                    i = i.wrapping_add(1);
                }
                lost
            }
        };

        self.total_lost += lost_since_report;

        // Both counters are 24-bit on the wire.
        if lost_since_report > 0x00FF_FFFF {
            lost_since_report = 0x00FF_FFFF;
        }
        if self.total_lost > 0x00FF_FFFF {
            self.total_lost = 0x00FF_FFFF;
        }

        let fraction_lost = if total_since_report == 0 {
            0
        } else {
            ((lost_since_report * 256) as f64 / f64::from(total_since_report)) as u8
        };

        let delay = if self.last_sender_report_time == SystemTime::UNIX_EPOCH {
            0
        } else {
            match now.duration_since(self.last_sender_report_time) {
                Ok(d) => (d.as_secs_f64() * 65536.0) as u32,
                Err(_) => 0,
            }
        };

        let report = ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![ReceptionReport {
                ssrc: self.ssrc,
                fraction_lost,
                total_lost: self.total_lost,
                last_sequence_number: (u32::from(self.seq_num_cycles) << 16)
                    | (self.last_seq_num as u32),
                jitter: self.jitter as u32,
                last_sender_report: self.last_sender_report,
                delay,
            }],
            ..Default::default()
        };

        self.last_report_seq_num = self.last_seq_num;

        report
    }

    pub(crate) fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub(crate) fn octet_count(&self) -> u64 {
        self.octet_count
    }
}
