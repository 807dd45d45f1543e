use nfq::{Message, Queue, Verdict as NfqVerdict};
use tracing::warn;

use crate::interceptor::{PacketSource, Verdict};

/// A packet received from NFQUEUE, still owed a verdict.
pub struct NfqMessage(Message);

impl NfqMessage {
    /// Consumes the message and stamps the verdict on it, ready for
    /// `Queue::verdict`.
    pub fn into_verdict(self, verdict: Verdict) -> Message {
        let mut msg = self.0;
        msg.set_verdict(match verdict {
            Verdict::Accept => NfqVerdict::Accept,
            Verdict::Drop => NfqVerdict::Drop,
        });
        msg
    }
}

impl AsRef<[u8]> for NfqMessage {
    fn as_ref(&self) -> &[u8] {
        self.0.get_payload()
    }
}

impl From<Message> for NfqMessage {
    fn from(value: Message) -> Self {
        Self(value)
    }
}

impl PacketSource for Queue {
    type Packet = NfqMessage;

    /// Non-blocking queue: `WouldBlock` and real errors both end the batch.
    fn next_packet(&mut self) -> Option<NfqMessage> {
        self.recv().ok().map(NfqMessage::from)
    }

    fn issue(&mut self, packet: NfqMessage, verdict: Verdict) {
        if let Err(e) = self.verdict(packet.into_verdict(verdict)) {
            warn!(?verdict, "verdict failed: {e}");
        }
    }
}
