//! Length-delimited message transport over fixed-size HID reports.
//!
//! A message is a varint-length-delimited byte string (the same framing the
//! proto codec produces). The first report of a message starts with that
//! varint; each continuation report starts with a `0x00` marker byte. Since
//! a delimited message can never start with `0x00` (a zero-length message
//! is never sent), the marker is unambiguous.
//!
//! Reassembly is best-effort: a stray continuation with no message in
//! progress is discarded, and a fresh header aborts any partial assembly.

use crate::proto::Reader;
use tachyon_core::HidEndpoint;

/// Transport over `REPORT`-byte reports, reassembling messages of up to
/// `CAP` encoded bytes.
pub struct ProtoTransport<const REPORT: usize, const CAP: usize> {
    buf: [u8; CAP],
    /// Total length of the message being assembled (prefix included); zero
    /// when no assembly is in progress.
    expected: usize,
    /// Bytes received so far.
    received: usize,
}

impl<const REPORT: usize, const CAP: usize> ProtoTransport<REPORT, CAP> {
    /// Idle transport.
    pub const fn new() -> Self {
        Self {
            buf: [0; CAP],
            expected: 0,
            received: 0,
        }
    }

    /// Send one delimited message, fragmenting it over as many reports as
    /// needed. Returns `false` (with the message abandoned) as soon as the
    /// endpoint refuses a report.
    pub fn send<E: HidEndpoint>(&mut self, endpoint: &mut E, message: &[u8]) -> bool {
        if message.is_empty() {
            return false;
        }
        let mut report = [0u8; REPORT];
        let first = message.len().min(REPORT);
        report[..first].copy_from_slice(&message[..first]);
        if !endpoint.send_report(&report) {
            return false;
        }
        let mut sent = first;
        while sent < message.len() {
            let chunk = (message.len() - sent).min(REPORT - 1);
            report[0] = 0;
            report[1..1 + chunk].copy_from_slice(&message[sent..sent + chunk]);
            report[1 + chunk..].fill(0);
            if !endpoint.send_report(&report) {
                return false;
            }
            sent += chunk;
        }
        true
    }

    /// Poll the endpoint for one report and advance reassembly. Returns the
    /// complete delimited message when one becomes available.
    pub fn poll_receive<E: HidEndpoint>(&mut self, endpoint: &mut E) -> Option<&[u8]> {
        let mut report = [0u8; REPORT];
        let len = endpoint.read_report(&mut report)?;
        let report = &report[..len];

        if report.first() == Some(&0) {
            if self.expected == 0 {
                // Continuation with nothing in progress.
                return None;
            }
            let chunk = (report.len() - 1).min(self.expected - self.received);
            self.buf[self.received..self.received + chunk]
                .copy_from_slice(&report[1..1 + chunk]);
            self.received += chunk;
        } else {
            // New message; any partial assembly is abandoned.
            self.expected = 0;
            self.received = 0;
            let mut reader = Reader::new(report);
            let body_len = reader.read_varint()? as usize;
            let prefix_len = reader.position();
            let total = prefix_len + body_len;
            if total > CAP {
                return None;
            }
            // The prefix stays in the buffer; the consumer re-reads it.
            let chunk = report.len().min(total);
            self.buf[..chunk].copy_from_slice(&report[..chunk]);
            self.expected = total;
            self.received = chunk;
        }

        if self.expected > 0 && self.received >= self.expected {
            // Received size can overshoot the declared length because
            // reports are fixed size; the declared length wins.
            let total = self.expected;
            self.expected = 0;
            self.received = 0;
            Some(&self.buf[..total])
        } else {
            None
        }
    }
}

impl<const REPORT: usize, const CAP: usize> Default for ProtoTransport<REPORT, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeHid {
        sent: Vec<Vec<u8>>,
        inbound: VecDeque<Vec<u8>>,
        refuse_sends: bool,
    }

    impl HidEndpoint for FakeHid {
        fn configured(&mut self) -> bool {
            true
        }
        fn connect(&mut self, _blocking: bool) {}
        fn send_report(&mut self, report: &[u8]) -> bool {
            if self.refuse_sends {
                return false;
            }
            self.sent.push(report.to_vec());
            true
        }
        fn read_report(&mut self, buf: &mut [u8]) -> Option<usize> {
            let report = self.inbound.pop_front()?;
            buf[..report.len()].copy_from_slice(&report);
            Some(report.len())
        }
    }

    /// Delimited message of `body_len` distinguishable bytes.
    fn message(body_len: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 4];
        let mut writer = crate::proto::Writer::new(&mut buf);
        writer.write_varint(body_len as u64).unwrap();
        let prefix = writer.len();
        bytes.extend_from_slice(&buf[..prefix]);
        bytes.extend((0..body_len).map(|i| (i % 251 + 1) as u8));
        bytes
    }

    #[test]
    fn multi_report_roundtrip() {
        // 150 encoded bytes over 64-byte reports: three reports, the later
        // two marked as continuations.
        let message = message(148); // 2-byte prefix + 148 = 150
        assert_eq!(message.len(), 150);

        let mut tx: ProtoTransport<64, 256> = ProtoTransport::new();
        let mut hid = FakeHid::default();
        assert!(tx.send(&mut hid, &message));
        assert_eq!(hid.sent.len(), 3);
        assert_ne!(hid.sent[0][0], 0);
        assert_eq!(hid.sent[1][0], 0);
        assert_eq!(hid.sent[2][0], 0);

        let mut rx: ProtoTransport<64, 256> = ProtoTransport::new();
        hid.inbound = hid.sent.drain(..).collect();
        assert!(rx.poll_receive(&mut hid).is_none());
        assert!(rx.poll_receive(&mut hid).is_none());
        let assembled = rx.poll_receive(&mut hid).unwrap();
        assert_eq!(assembled, &message[..]);
    }

    #[test]
    fn single_report_message() {
        let message = message(10);
        let mut tx: ProtoTransport<64, 256> = ProtoTransport::new();
        let mut hid = FakeHid::default();
        assert!(tx.send(&mut hid, &message));
        assert_eq!(hid.sent.len(), 1);

        let mut rx: ProtoTransport<64, 256> = ProtoTransport::new();
        hid.inbound = hid.sent.drain(..).collect();
        let assembled = rx.poll_receive(&mut hid).unwrap();
        assert_eq!(assembled, &message[..]);
    }

    #[test]
    fn stray_continuation_is_discarded() {
        let mut rx: ProtoTransport<64, 256> = ProtoTransport::new();
        let mut hid = FakeHid::default();
        hid.inbound.push_back([0u8; 64].to_vec());
        assert!(rx.poll_receive(&mut hid).is_none());

        // And a real message afterwards still decodes.
        let message = message(5);
        let mut report = [0u8; 64];
        report[..message.len()].copy_from_slice(&message);
        hid.inbound.push_back(report.to_vec());
        assert_eq!(rx.poll_receive(&mut hid).unwrap(), &message[..]);
    }

    #[test]
    fn new_header_aborts_partial_assembly() {
        let long = message(148);
        let short = message(5);

        let mut hid = FakeHid::default();
        let mut tx: ProtoTransport<64, 256> = ProtoTransport::new();
        tx.send(&mut hid, &long);
        // Deliver only the first report of the long message...
        let mut rx: ProtoTransport<64, 256> = ProtoTransport::new();
        hid.inbound.push_back(hid.sent[0].clone());
        assert!(rx.poll_receive(&mut hid).is_none());

        // ...then a complete short message: the partial one is dropped.
        let mut report = [0u8; 64];
        report[..short.len()].copy_from_slice(&short);
        hid.inbound.push_back(report.to_vec());
        assert_eq!(rx.poll_receive(&mut hid).unwrap(), &short[..]);
    }

    #[test]
    fn oversized_message_is_discarded() {
        let mut rx: ProtoTransport<64, 128> = ProtoTransport::new();
        let mut hid = FakeHid::default();
        let message = message(200); // over CAP
        let mut report = [0u8; 64];
        report.copy_from_slice(&message[..64]);
        hid.inbound.push_back(report.to_vec());
        assert!(rx.poll_receive(&mut hid).is_none());
    }

    #[test]
    fn refused_report_fails_the_send() {
        let mut tx: ProtoTransport<64, 256> = ProtoTransport::new();
        let mut hid = FakeHid {
            refuse_sends: true,
            ..FakeHid::default()
        };
        assert!(!tx.send(&mut hid, &message(10)));
    }
}
