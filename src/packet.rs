//! Single-owner packet buffer handed through the translation pipeline.
//!
//! A [`PacketBuf`] owns the full IP packet (network header first) together
//! with the checksum bookkeeping the translators consult: whether the stored
//! TCP checksum is complete, pseudo-header-only (hardware offload), already
//! verified, or absent. Handlers require exclusive access for the duration of
//! a call; the option injector grows the buffer in place.

use crate::protocol::{ipv4, ipv6};
use crate::{Error, Result};

/// Address family of a connection or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// Where the stored TCP checksum stands, mirroring the offload states the
/// surrounding stack tracks per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    /// Checksum must be treated as unverified and recomputed on edit.
    #[default]
    None,
    /// Offloaded: the stored value covers the pseudo-header only.
    Partial,
    /// The device produced a full checksum that still verifies.
    Complete,
    /// Already verified (or freshly recomputed); no further checking needed.
    Unnecessary,
}

/// Fallback path MTU when the framework supplies none.
pub const DEFAULT_MTU: usize = 1500;

#[derive(Debug, Clone)]
pub struct PacketBuf {
    data: Vec<u8>,
    csum: ChecksumState,
    /// Path MTU toward the packet's destination.
    mtu: usize,
    /// Firewall mark carried by the framework, used for service lookup.
    mark: u32,
}

impl PacketBuf {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            csum: ChecksumState::None,
            mtu: DEFAULT_MTU,
            mark: 0,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_csum_state(mut self, csum: ChecksumState) -> Self {
        self.csum = csum;
        self
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn csum_state(&self) -> ChecksumState {
        self.csum
    }

    pub fn set_csum_state(&mut self, csum: ChecksumState) {
        self.csum = csum;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Offset of the transport header for the given family. IPv4 honors the
    /// IHL field; IPv6 places the L4 header behind the fixed header.
    pub fn l4_offset(&self, af: AddrFamily) -> Result<usize> {
        match af {
            AddrFamily::V4 => Ok(ipv4::Ipv4Header::parse(&self.data)?.header_len()),
            AddrFamily::V6 => {
                ipv6::Ipv6Header::parse(&self.data)?;
                Ok(ipv6::HEADER_SIZE)
            }
        }
    }

    /// Check that a writable transport window of `len` bytes exists. The
    /// analogue of the unshare-and-linearize step the original performs
    /// before mangling.
    pub fn ensure_l4_window(&self, af: AddrFamily, len: usize) -> Result<usize> {
        let offset = self.l4_offset(af)?;
        if self.data.len() < offset + len {
            return Err(Error::Parse("transport header window too short".into()));
        }
        Ok(offset)
    }

    /// Insert `len` zero bytes at `offset`, shifting the tail right. Used by
    /// the client-address option injector.
    pub fn expand_at(&mut self, offset: usize, len: usize) {
        self.data
            .splice(offset..offset, std::iter::repeat(0u8).take(len));
    }
}
