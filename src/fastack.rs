//! FastAck credit-based flow control.
//!
//! Credits travel over a backchannel as three bytes: an opcode followed by a
//! little-endian byte count. The host grants receive credit on the TX
//! characteristic and the device grants transmit credit by notifying on RX.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace};

/// Receive credit granted to the peer when flow control starts
pub const INITIAL_RX_CREDIT: u16 = 0x7FFF;
/// Returned receive credit is batched until it exceeds this many bytes
pub const RX_RETURN_THRESHOLD: u32 = 0x1000;

/// Backchannel opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CreditOpcode {
    Assign = 0x00,
    Add = 0x01,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BackchannelError {
    #[error("backchannel message must be 3 bytes, got {0}")]
    Length(usize),
    #[error("unknown backchannel opcode 0x{0:02X}")]
    Opcode(u8),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CreditMessage {
    pub opcode: CreditOpcode,
    pub bytes: u16,
}

impl CreditMessage {
    pub fn assign(bytes: u16) -> Self {
        CreditMessage {
            opcode: CreditOpcode::Assign,
            bytes,
        }
    }

    pub fn add(bytes: u16) -> Self {
        CreditMessage {
            opcode: CreditOpcode::Add,
            bytes,
        }
    }

    pub fn encode(&self) -> [u8; 3] {
        let [lo, hi] = self.bytes.to_le_bytes();
        [self.opcode.into(), lo, hi]
    }

    pub fn decode(value: &[u8]) -> Result<Self, BackchannelError> {
        if value.len() != 3 {
            return Err(BackchannelError::Length(value.len()));
        }
        let opcode = CreditOpcode::try_from(value[0]).map_err(|_| BackchannelError::Opcode(value[0]))?;
        Ok(CreditMessage {
            opcode,
            bytes: u16::from_le_bytes([value[1], value[2]]),
        })
    }
}

/// Credit bookkeeping for one connection
#[derive(Debug, Default)]
pub struct FlowControl {
    rx_credit: i32,
    tx_credit: u32,
    rx_to_return: u32,
}

impl FlowControl {
    pub fn new() -> Self {
        FlowControl::default()
    }

    /// The grant sent to the peer as soon as the backchannel is subscribed.
    pub fn initial_grant(&self) -> CreditMessage {
        CreditMessage::assign(INITIAL_RX_CREDIT)
    }

    /// Account for a grant the peer has acknowledged.
    pub fn grant_sent(&mut self, msg: CreditMessage) {
        match msg.opcode {
            CreditOpcode::Assign => {
                self.rx_credit = i32::from(msg.bytes);
                debug!(rx_credit = self.rx_credit, "fastack rx credit assigned");
            }
            CreditOpcode::Add => {
                self.rx_credit += i32::from(msg.bytes);
                trace!(rx_credit = self.rx_credit, added = msg.bytes, "fastack rx credit returned");
            }
        }
    }

    /// Account for inbound serial data. Returns a grant to send once enough
    /// bytes have accumulated.
    pub fn data_received(&mut self, len: usize) -> Option<CreditMessage> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        self.rx_credit = self.rx_credit.saturating_sub(i32::try_from(len).unwrap_or(i32::MAX));
        self.rx_to_return = self.rx_to_return.saturating_add(len);
        if self.rx_to_return <= RX_RETURN_THRESHOLD {
            return None;
        }
        let bytes = u16::try_from(self.rx_to_return).unwrap_or(u16::MAX);
        self.rx_to_return -= u32::from(bytes);
        Some(CreditMessage::add(bytes))
    }

    /// Apply a grant from the peer. Returns true when a stalled writer
    /// should be woken.
    pub fn backchannel(&mut self, msg: CreditMessage) -> bool {
        match msg.opcode {
            CreditOpcode::Assign => {
                self.tx_credit = u32::from(msg.bytes);
                debug!(tx_credit = self.tx_credit, "fastack tx credit assigned");
                false
            }
            CreditOpcode::Add => {
                let was_stalled = self.tx_credit == 0;
                self.tx_credit = self.tx_credit.saturating_add(u32::from(msg.bytes));
                trace!(tx_credit = self.tx_credit, added = msg.bytes, "fastack tx credit added");
                was_stalled && self.tx_credit > 0
            }
        }
    }

    /// Largest chunk that may be written now, capped at `max`.
    pub fn chunk_len(&self, max: usize) -> usize {
        max.min(usize::try_from(self.tx_credit).unwrap_or(usize::MAX))
    }

    /// Spend transmit credit on a chunk handed to the transport.
    pub fn consume(&mut self, len: usize) {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        debug_assert!(len <= self.tx_credit, "chunk exceeds transmit credit");
        self.tx_credit = self.tx_credit.saturating_sub(len);
        trace!(tx_credit = self.tx_credit, spent = len, "fastack tx credit spent");
    }

    /// Give back credit for a chunk the transport failed to send.
    pub fn refund(&mut self, len: usize) {
        self.tx_credit = self.tx_credit.saturating_add(u32::try_from(len).unwrap_or(u32::MAX));
    }

    pub fn is_stalled(&self) -> bool {
        self.tx_credit == 0
    }

    pub fn tx_credit(&self) -> u32 {
        self.tx_credit
    }

    pub fn rx_credit(&self) -> i32 {
        self.rx_credit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn codec_matches_firmware_layout() {
        assert_eq!(CreditMessage::assign(0x7FFF).encode(), [0x00, 0xFF, 0x7F]);
        assert_eq!(CreditMessage::add(0x1234).encode(), [0x01, 0x34, 0x12]);
        assert_eq!(CreditMessage::decode(&[0x01, 0x00, 0x02]), Ok(CreditMessage::add(0x0200)));
        assert_eq!(CreditMessage::decode(&[0x01, 0x00]), Err(BackchannelError::Length(2)));
        assert_eq!(CreditMessage::decode(&[0x07, 0x00, 0x00]), Err(BackchannelError::Opcode(0x07)));
    }

    #[test]
    fn receive_credit_is_batched_past_threshold() {
        let mut fc = FlowControl::new();
        fc.grant_sent(fc.initial_grant());
        assert_eq!(fc.rx_credit(), 0x7FFF);

        for _ in 0..16 {
            assert_eq!(fc.data_received(256), None);
        }
        // 4096 bytes is not past the threshold yet
        let grant = fc.data_received(1).expect("grant");
        assert_eq!(grant, CreditMessage::add(4097));
        assert_eq!(fc.rx_credit(), 0x7FFF - 4097);

        fc.grant_sent(grant);
        assert_eq!(fc.rx_credit(), 0x7FFF);
        assert_eq!(fc.data_received(10), None);
    }

    #[test]
    fn add_after_stall_wakes_writer() {
        let mut fc = FlowControl::new();
        assert!(fc.is_stalled());
        assert!(!fc.backchannel(CreditMessage::assign(0)));
        assert!(fc.backchannel(CreditMessage::add(100)));
        // not stalled any more, no second wake
        assert!(!fc.backchannel(CreditMessage::add(100)));
        assert_eq!(fc.tx_credit(), 200);
    }

    #[test]
    fn chunk_is_capped_by_credit() {
        let mut fc = FlowControl::new();
        fc.backchannel(CreditMessage::assign(30));
        assert_eq!(fc.chunk_len(20), 20);
        fc.consume(20);
        assert_eq!(fc.chunk_len(20), 10);
        fc.consume(10);
        assert_eq!(fc.chunk_len(20), 0);
        assert!(fc.is_stalled());
        fc.refund(10);
        assert_eq!(fc.chunk_len(20), 10);
    }

    proptest! {
        #[test]
        fn sent_never_exceeds_granted(
            grants in proptest::collection::vec((any::<bool>(), 0u16..512), 1..50),
            wants in proptest::collection::vec(1usize..300, 1..100),
        ) {
            let mut fc = FlowControl::new();
            let mut granted: u64 = 0;
            let mut sent: u64 = 0;
            let mut wants = wants.into_iter();

            for (assign, bytes) in grants {
                let msg = if assign { CreditMessage::assign(bytes) } else { CreditMessage::add(bytes) };
                fc.backchannel(msg);
                granted += u64::from(bytes);

                while let Some(want) = wants.next() {
                    let len = fc.chunk_len(want);
                    if len == 0 {
                        break;
                    }
                    fc.consume(len);
                    sent += len as u64;
                }
                prop_assert!(sent <= granted);
            }
        }
    }
}
