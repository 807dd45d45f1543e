use std::net::Ipv4Addr;

use serde::Deserialize;

/// How the two checksum bytes are turned into a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintOrder {
    /// Big-endian, the value packet analyzers display.
    #[default]
    Network,
    /// Raw in-memory value on this host. Traces recorded by the legacy
    /// kernel tooling carry ids in this form.
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    checksum: [u8; 2],
}

impl Ipv4Header {
    /// Returns `None` for anything that is not a complete IPv4 header.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        // 1. IP header is at least 20 bytes
        if payload.len() < 20 {
            return None;
        }

        // 2. version nibble
        if (payload[0] >> 4) != 4 {
            return None;
        }

        // 3. IHL in 32-bit words, truncated copies are rejected
        let ihl = (payload[0] & 0x0F) as usize * 4;
        if ihl < 20 || payload.len() < ihl {
            return None;
        }

        Some(Self {
            src: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
            dst: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
            proto: payload[9],
            checksum: [payload[10], payload[11]],
        })
    }

    pub fn fingerprint(&self, order: FingerprintOrder) -> u32 {
        match order {
            FingerprintOrder::Network => u16::from_be_bytes(self.checksum) as u32,
            FingerprintOrder::Native => u16::from_ne_bytes(self.checksum) as u32,
        }
    }
}

#[cfg(test)]
pub(crate) fn build_packet(dst: Ipv4Addr, checksum: u16) -> Vec<u8> {
    let mut p = vec![0u8; 28];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&28u16.to_be_bytes());
    p[8] = 64;
    p[9] = 17;
    p[10..12].copy_from_slice(&checksum.to_be_bytes());
    p[12..16].copy_from_slice(&[10, 0, 0, 1]);
    p[16..20].copy_from_slice(&dst.octets());
    p
}
