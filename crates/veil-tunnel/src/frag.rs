//! Fragmentation and reassembly of logical messages inside tunnels.
//!
//! A tunnel-data message carries a fixed 1008-byte window. Decrypted, the
//! window reads:
//!
//! ```text
//! checksum (4) | nonzero padding ... | 0x00 | fragment area
//! ```
//!
//! The checksum is the first four bytes of SHA-256 over the fragment area
//! followed by the message IV; it is verified before any fragment is
//! parsed, so a mis-keyed or corrupted window contributes nothing to
//! reassembly. The fragment area packs one or more fragments, each:
//!
//! ```text
//! message ID (4) | frag byte (1) | [delivery instruction, fragment 0 only]
//!               | length (2) | payload
//! ```
//!
//! The frag byte carries the last-fragment flag in bit 7 and the fragment
//! number in the low seven bits. The delivery instruction rides only on
//! fragment zero: a type byte (0 local, 1 router, 2 tunnel) followed by a
//! 32-byte target hash for router delivery, or hash plus 4-byte tunnel ID
//! for tunnel delivery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use veil_crypto::checksum4;

use crate::TUNNEL_DATA_WINDOW;
use crate::error::FragmentError;
use crate::identity::{IdentHash, TunnelId};

/// Checksum prefix size.
const CHECKSUM_LEN: usize = 4;

/// Usable fragment-area budget per window: the window minus the checksum
/// and the mandatory zero separator.
pub const FRAGMENT_AREA_BUDGET: usize = TUNNEL_DATA_WINDOW - CHECKSUM_LEN - 1;

/// Maximum fragments per logical message (7-bit fragment number).
pub const MAX_FRAGMENTS: usize = 128;

/// Payload bytes per fragment. Conservative so any fragment, including
/// fragment zero with a tunnel delivery instruction, fits one window.
pub const FRAGMENT_PAYLOAD: usize = 956;

/// Where a reassembled message should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryInstruction {
    /// Deliver to the local router.
    Local,
    /// Forward to the named router.
    Router(IdentHash),
    /// Forward into another tunnel at the named router.
    Tunnel(IdentHash, TunnelId),
}

impl DeliveryInstruction {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Local => 1,
            Self::Router(_) => 1 + 32,
            Self::Tunnel(..) => 1 + 32 + 4,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Local => buf.push(0),
            Self::Router(hash) => {
                buf.push(1);
                buf.extend_from_slice(hash.as_bytes());
            }
            Self::Tunnel(hash, tunnel_id) => {
                buf.push(2);
                buf.extend_from_slice(hash.as_bytes());
                buf.extend_from_slice(&tunnel_id.value().to_be_bytes());
            }
        }
    }

    fn decode(data: &[u8], offset: usize) -> Result<(Self, usize), FragmentError> {
        let type_byte = *data.get(offset).ok_or(FragmentError::Malformed(offset))?;
        match type_byte {
            0 => Ok((Self::Local, offset + 1)),
            1 => {
                let end = offset + 1 + 32;
                let bytes = data
                    .get(offset + 1..end)
                    .ok_or(FragmentError::Malformed(offset))?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(bytes);
                Ok((Self::Router(IdentHash::from_bytes(hash)), end))
            }
            2 => {
                let end = offset + 1 + 36;
                let bytes = data
                    .get(offset + 1..end)
                    .ok_or(FragmentError::Malformed(offset))?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes[..32]);
                let id = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
                Ok((
                    Self::Tunnel(IdentHash::from_bytes(hash), TunnelId::new(id)),
                    end,
                ))
            }
            other => Err(FragmentError::UnknownDeliveryType(other)),
        }
    }
}

/// One wire fragment of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Logical message this fragment belongs to.
    pub message_id: u32,
    /// Position within the message (0-based).
    pub number: u8,
    /// Whether this is the final fragment.
    pub is_last: bool,
    /// Delivery instruction; present only on fragment zero.
    pub instruction: Option<DeliveryInstruction>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Fragment {
    fn encoded_len(&self) -> usize {
        4 + 1
            + self.instruction.as_ref().map_or(0, DeliveryInstruction::encoded_len)
            + 2
            + self.payload.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        let mut frag_byte = self.number & 0x7F;
        if self.is_last {
            frag_byte |= 0x80;
        }
        buf.push(frag_byte);
        if let Some(instruction) = &self.instruction {
            instruction.encode_into(buf);
        }
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    fn decode(data: &[u8], offset: usize) -> Result<(Self, usize), FragmentError> {
        let header = data
            .get(offset..offset + 5)
            .ok_or(FragmentError::Malformed(offset))?;
        let message_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let frag_byte = header[4];
        let number = frag_byte & 0x7F;
        let is_last = frag_byte & 0x80 != 0;
        let mut cursor = offset + 5;

        let instruction = if number == 0 {
            let (instruction, next) = DeliveryInstruction::decode(data, cursor)?;
            cursor = next;
            Some(instruction)
        } else {
            None
        };

        let len_bytes = data
            .get(cursor..cursor + 2)
            .ok_or(FragmentError::Malformed(cursor))?;
        let payload_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        cursor += 2;
        let payload = data
            .get(cursor..cursor + payload_len)
            .ok_or(FragmentError::Malformed(cursor))?
            .to_vec();
        Ok((
            Self {
                message_id,
                number,
                is_last,
                instruction,
                payload,
            },
            cursor + payload_len,
        ))
    }
}

/// Splits logical messages into fragments and packs fragments into
/// checksummed windows.
pub struct Fragmenter;

impl Fragmenter {
    /// Split a logical message into wire fragments.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::TooManyFragments`] if the payload exceeds
    /// the per-message fragment limit.
    pub fn fragment(
        message_id: u32,
        instruction: &DeliveryInstruction,
        payload: &[u8],
    ) -> Result<Vec<Fragment>, FragmentError> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(FRAGMENT_PAYLOAD).collect()
        };
        if chunks.len() > MAX_FRAGMENTS {
            return Err(FragmentError::TooManyFragments {
                needed: chunks.len(),
                limit: MAX_FRAGMENTS,
            });
        }
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(number, chunk)| Fragment {
                message_id,
                number: number as u8,
                is_last: number == last,
                instruction: (number == 0).then(|| instruction.clone()),
                payload: chunk.to_vec(),
            })
            .collect())
    }

    /// Greedily pack fragments into fragment areas, each within the window
    /// budget. Fragments stay in order; a fragment never splits across
    /// windows.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::PayloadTooLarge`] if a single fragment
    /// exceeds the window budget.
    pub fn pack_areas(fragments: &[Fragment]) -> Result<Vec<Vec<u8>>, FragmentError> {
        let mut areas = Vec::new();
        let mut current = Vec::new();
        for fragment in fragments {
            let len = fragment.encoded_len();
            if len > FRAGMENT_AREA_BUDGET {
                return Err(FragmentError::PayloadTooLarge(len));
            }
            if current.len() + len > FRAGMENT_AREA_BUDGET {
                areas.push(std::mem::take(&mut current));
            }
            fragment.encode_into(&mut current);
        }
        if !current.is_empty() {
            areas.push(current);
        }
        Ok(areas)
    }

    /// Assemble a plaintext window around a fragment area: checksum over
    /// the area and IV, nonzero padding, zero separator, area at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::PayloadTooLarge`] if the area exceeds the
    /// window budget.
    pub fn build_window(area: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>, FragmentError> {
        use rand::Rng;

        if area.len() > FRAGMENT_AREA_BUDGET {
            return Err(FragmentError::PayloadTooLarge(area.len()));
        }
        let padding_len = TUNNEL_DATA_WINDOW - CHECKSUM_LEN - 1 - area.len();
        let mut window = Vec::with_capacity(TUNNEL_DATA_WINDOW);
        window.extend_from_slice(&checksum4(area, iv));
        let mut rng = rand::thread_rng();
        let mut padding = vec![0u8; padding_len];
        rng.fill(padding.as_mut_slice());
        for byte in &mut padding {
            // Padding must be nonzero so the separator is unambiguous.
            if *byte == 0 {
                *byte = 0xFF;
            }
        }
        window.extend_from_slice(&padding);
        window.push(0);
        window.extend_from_slice(area);
        debug_assert_eq!(window.len(), TUNNEL_DATA_WINDOW);
        Ok(window)
    }

    /// Parse a decrypted window back into fragments, verifying the
    /// checksum first.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::ChecksumMismatch`] if the truncated
    /// checksum does not verify, or a parse error for malformed content.
    pub fn parse_window(window: &[u8], iv: &[u8; 16]) -> Result<Vec<Fragment>, FragmentError> {
        if window.len() != TUNNEL_DATA_WINDOW {
            return Err(FragmentError::WrongWindowLength {
                expected: TUNNEL_DATA_WINDOW,
                actual: window.len(),
            });
        }
        let separator = window[CHECKSUM_LEN..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(FragmentError::Malformed(CHECKSUM_LEN))?;
        let area = &window[CHECKSUM_LEN + separator + 1..];
        if checksum4(area, iv) != window[..CHECKSUM_LEN] {
            return Err(FragmentError::ChecksumMismatch);
        }
        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < area.len() {
            let (fragment, next) = Fragment::decode(area, offset)?;
            fragments.push(fragment);
            offset = next;
        }
        Ok(fragments)
    }
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Logical message ID.
    pub message_id: u32,
    /// Where the message should be delivered.
    pub instruction: DeliveryInstruction,
    /// Reassembled payload bytes.
    pub payload: Vec<u8>,
}

struct PartialMessage {
    slots: Vec<Option<Vec<u8>>>,
    instruction: Option<DeliveryInstruction>,
    last_index: Option<usize>,
    touched: Instant,
}

impl PartialMessage {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            instruction: None,
            last_index: None,
            touched: Instant::now(),
        }
    }

    fn fragment_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => self.slots.len() > last && self.slots[..=last].iter().all(Option::is_some),
            None => false,
        }
    }
}

/// Time-bounded reassembly state, keyed by message ID.
pub struct Reassembler {
    buffers: HashMap<u32, PartialMessage>,
}

impl Reassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Parse a decrypted window and absorb its fragments. Returns any
    /// messages completed by this window.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::ChecksumMismatch`] without absorbing
    /// anything if the window checksum fails.
    pub fn ingest_window(
        &mut self,
        iv: &[u8; 16],
        window: &[u8],
    ) -> Result<Vec<CompletedMessage>, FragmentError> {
        let fragments = Fragmenter::parse_window(window, iv)?;
        Ok(fragments
            .into_iter()
            .filter_map(|fragment| self.absorb(fragment))
            .collect())
    }

    /// Absorb one fragment. Returns the completed message once the last
    /// fragment's slot and every slot below it are filled.
    pub fn absorb(&mut self, fragment: Fragment) -> Option<CompletedMessage> {
        let entry = self
            .buffers
            .entry(fragment.message_id)
            .or_insert_with(PartialMessage::new);
        entry.touched = Instant::now();

        let index = fragment.number as usize;
        if entry.slots.len() <= index {
            entry.slots.resize_with(index + 1, || None);
        }
        entry.slots[index] = Some(fragment.payload);
        if fragment.is_last {
            entry.last_index = Some(index);
        }
        if let Some(instruction) = fragment.instruction {
            entry.instruction = Some(instruction);
        }

        if entry.is_complete() && entry.instruction.is_some() {
            let entry = self.buffers.remove(&fragment.message_id)?;
            let last = entry.last_index?;
            let payload = entry
                .slots
                .into_iter()
                .take(last + 1)
                .flatten()
                .flatten()
                .collect();
            Some(CompletedMessage {
                message_id: fragment.message_id,
                instruction: entry.instruction?,
                payload,
            })
        } else {
            None
        }
    }

    /// Drop buffers idle longer than the eviction window. Returns how
    /// many message buffers were discarded.
    pub fn evict_idle(&mut self, window: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, partial| partial.touched.elapsed() <= window);
        before - self.buffers.len()
    }

    /// Total buffered fragments across all partial messages.
    #[must_use]
    pub fn buffered_fragments(&self) -> usize {
        self.buffers.values().map(PartialMessage::fragment_count).sum()
    }

    /// Number of partial messages currently buffered.
    #[must_use]
    pub fn buffered_messages(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
