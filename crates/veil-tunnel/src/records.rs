//! Build request/response records and their onion layering.
//!
//! A tunnel build message carries one fixed 256-byte record per hop. Each
//! record is sealed to its hop's public record key and prefixed with the
//! truncated identity hash the hop matches on:
//!
//! ```text
//! trunc hash (16) | sealed request (240)
//! ```
//!
//! Every hop, after answering, re-encrypts all the *other* records with
//! the reply key and IV its own record delivered, and replaces its slot
//! with a response record encrypted under the same key. The creator
//! therefore pre-decrypts each record with every earlier hop's reply key
//! when assembling the message, so the layering applied in flight cancels
//! exactly when the record reaches its hop; and it unwinds each response
//! with the reply keys of that hop and every later hop, innermost first.
//!
//! Response record layout (before layering):
//!
//! ```text
//! integrity hash (32) | random padding (223) | reply byte (1)
//! ```
//!
//! The reply byte distinguishes only accept from not-accept; no rejection
//! reason is leaked to the far end.

use rand::Rng;
use rand::seq::SliceRandom;

use veil_crypto::record::{open_record, seal_record};
use veil_crypto::reply::ReplyMaterial;
use veil_crypto::{IvKey, LayerKey, record_decrypt, record_encrypt, sha256};

use crate::BUILD_RECORD_SIZE;
use crate::config::TunnelDirection;
use crate::error::{RecordError, TunnelError};
use crate::hop::Hop;
use crate::identity::{IdentHash, RouterIdentity, TunnelId};

/// Plaintext size of a build request record.
pub const REQUEST_PLAINTEXT_SIZE: usize = 168;

/// "From anyone": the hop is the gateway of an inbound tunnel.
pub const FLAG_INBOUND_GATEWAY: u8 = 0x80;

/// "To anyone": the hop is the endpoint of an outbound tunnel.
pub const FLAG_OUTBOUND_ENDPOINT: u8 = 0x40;

/// Role a hop plays for a tunnel, determined from its build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopRole {
    /// Gateway of someone else's inbound tunnel.
    InboundGateway,
    /// Endpoint of someone else's outbound tunnel.
    OutboundEndpoint,
    /// Mid-chain relay of someone else's tunnel.
    Participant,
    /// This router is the terminus of an inbound tunnel it built itself.
    OwnInboundTerminus,
}

/// A hop's answer to a build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReply {
    /// The hop joined the tunnel.
    Accept,
    /// The hop declined; no reason is carried.
    Reject,
}

/// Decrypted contents of one build request record.
pub struct BuildRequestRecord {
    /// Tunnel ID the hop will receive on.
    pub receive_tunnel_id: TunnelId,
    /// Identity of the next hop.
    pub next_ident: IdentHash,
    /// Tunnel ID at the next hop.
    pub next_tunnel_id: TunnelId,
    /// Layer-encryption key assigned to the hop.
    pub layer_key: LayerKey,
    /// IV-obfuscation key assigned to the hop.
    pub iv_key: IvKey,
    /// Reply key for layering the build reply.
    pub reply_key: [u8; 32],
    /// Reply IV paired with the reply key.
    pub reply_iv: [u8; 16],
    /// Role flags.
    pub flags: u8,
    /// Request freshness, minutes since the Unix epoch.
    pub request_time_minutes: u32,
    /// Message ID the build reply must carry.
    pub reply_msg_id: u32,
}

impl BuildRequestRecord {
    /// Encode to the fixed plaintext layout.
    #[must_use]
    pub fn encode(&self) -> [u8; REQUEST_PLAINTEXT_SIZE] {
        let mut buf = [0u8; REQUEST_PLAINTEXT_SIZE];
        buf[0..4].copy_from_slice(&self.receive_tunnel_id.value().to_be_bytes());
        buf[4..36].copy_from_slice(self.next_ident.as_bytes());
        buf[36..40].copy_from_slice(&self.next_tunnel_id.value().to_be_bytes());
        buf[40..72].copy_from_slice(self.layer_key.as_bytes());
        buf[72..104].copy_from_slice(self.iv_key.as_bytes());
        buf[104..136].copy_from_slice(&self.reply_key);
        buf[136..152].copy_from_slice(&self.reply_iv);
        buf[152] = self.flags;
        buf[153..157].copy_from_slice(&self.request_time_minutes.to_be_bytes());
        buf[157..161].copy_from_slice(&self.reply_msg_id.to_be_bytes());
        rand::thread_rng().fill(&mut buf[161..]);
        buf
    }

    /// Decode from the fixed plaintext layout.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::WrongLength`] or [`RecordError::ZeroTunnelId`]
    /// for malformed input.
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() != REQUEST_PLAINTEXT_SIZE {
            return Err(RecordError::WrongLength {
                expected: REQUEST_PLAINTEXT_SIZE,
                actual: data.len(),
            });
        }
        let receive_tunnel_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if receive_tunnel_id == 0 {
            return Err(RecordError::ZeroTunnelId);
        }
        let mut next_ident = [0u8; 32];
        next_ident.copy_from_slice(&data[4..36]);
        let mut layer_key = [0u8; 32];
        layer_key.copy_from_slice(&data[40..72]);
        let mut iv_key = [0u8; 32];
        iv_key.copy_from_slice(&data[72..104]);
        let mut reply_key = [0u8; 32];
        reply_key.copy_from_slice(&data[104..136]);
        let mut reply_iv = [0u8; 16];
        reply_iv.copy_from_slice(&data[136..152]);
        Ok(Self {
            receive_tunnel_id: TunnelId::new(receive_tunnel_id),
            next_ident: IdentHash::from_bytes(next_ident),
            next_tunnel_id: TunnelId::new(u32::from_be_bytes([
                data[36], data[37], data[38], data[39],
            ])),
            layer_key: LayerKey::from_bytes(layer_key),
            iv_key: IvKey::from_bytes(iv_key),
            reply_key,
            reply_iv,
            flags: data[152],
            request_time_minutes: u32::from_be_bytes([data[153], data[154], data[155], data[156]]),
            reply_msg_id: u32::from_be_bytes([data[157], data[158], data[159], data[160]]),
        })
    }

    /// Determine the single role this record assigns to the local router.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::AmbiguousRole`] if more than one
    /// classification applies; such a record must be rejected, not guessed.
    pub fn role(&self, local: &IdentHash) -> Result<HopRole, RecordError> {
        let from_anyone = self.flags & FLAG_INBOUND_GATEWAY != 0;
        let to_anyone = self.flags & FLAG_OUTBOUND_ENDPOINT != 0;
        match (from_anyone, to_anyone) {
            (true, true) => Err(RecordError::AmbiguousRole),
            (true, false) => Ok(HopRole::InboundGateway),
            (false, true) => Ok(HopRole::OutboundEndpoint),
            (false, false) if self.next_ident != *local => Ok(HopRole::Participant),
            (false, false) => Ok(HopRole::OwnInboundTerminus),
        }
    }
}

/// A build record opened by this router: its slot index and plaintext.
pub struct OpenedRecord {
    /// Slot of the record within the build message.
    pub index: usize,
    /// Decrypted request.
    pub request: BuildRequestRecord,
}

/// Per-hop outcome of unwinding a build reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopBuildResult {
    /// Chain position of the hop.
    pub hop_index: usize,
    /// The hop's reply; integrity failures read as reject.
    pub reply: BuildReply,
    /// Whether the response record's integrity hash verified.
    pub integrity_ok: bool,
}

/// Inputs for assembling a build message.
pub struct BuildPlan<'a> {
    /// Hop chain in data-flow order. Record indices are written back.
    pub hops: &'a mut [Hop],
    /// Direction of the tunnel under construction.
    pub direction: TunnelDirection,
    /// For outbound builds: gateway the endpoint sends the reply to.
    pub reply_gateway: Option<(IdentHash, TunnelId)>,
    /// Message ID the reply must carry.
    pub reply_msg_id: u32,
    /// Request freshness, minutes since the Unix epoch.
    pub request_time_minutes: u32,
}

/// Assemble the onion-encrypted records for a build request.
///
/// Records are placed in shuffled slots; each hop's slot is recorded on
/// the hop for reply unwinding. Each record is sealed to its hop and then
/// pre-decrypted with every earlier hop's reply key, innermost first, so
/// the symmetric layering applied in flight cancels at the right hop.
///
/// # Errors
///
/// Returns an error if sealing fails or reply material is missing.
pub fn create_build_message(plan: BuildPlan<'_>) -> Result<Vec<Vec<u8>>, TunnelError> {
    let hop_count = plan.hops.len();
    let mut slots: Vec<usize> = (0..hop_count).collect();
    slots.shuffle(&mut rand::thread_rng());

    let mut records: Vec<Vec<u8>> = vec![Vec::new(); hop_count];
    for (i, slot) in slots.iter().copied().enumerate() {
        let (next_ident, next_tunnel_id, flags) = record_routing(&plan, i)?;
        let (reply_key, reply_iv) = plan.hops[i]
            .with_reply(|material| (material.key, material.iv))
            .unwrap_or_else(|| {
                // Terminal self record: the slot carries throwaway material,
                // it is never used to layer a reply.
                let mut rng = rand::thread_rng();
                (rng.r#gen(), rng.r#gen())
            });

        let request = BuildRequestRecord {
            receive_tunnel_id: plan.hops[i].tunnel_id,
            next_ident,
            next_tunnel_id,
            layer_key: plan.hops[i].layer_key.clone(),
            iv_key: plan.hops[i].iv_key.clone(),
            reply_key,
            reply_iv,
            flags,
            request_time_minutes: plan.request_time_minutes,
            reply_msg_id: plan.reply_msg_id,
        };

        let sealed = seal_record(&plan.hops[i].peer.record_key, &request.encode())?;
        let mut record = Vec::with_capacity(BUILD_RECORD_SIZE);
        record.extend_from_slice(&plan.hops[i].peer.hash.trunc());
        record.extend_from_slice(&sealed);
        debug_assert_eq!(record.len(), BUILD_RECORD_SIZE);

        // Cancel the layering hops 0..i will apply in flight.
        for j in (0..i).rev() {
            plan.hops[j]
                .with_reply(|material| {
                    record_decrypt(&material.key, &material.iv, &mut record)
                })
                .ok_or(RecordError::ReplyConsumed(j))??;
        }

        plan.hops[i].set_record_index(slot);
        records[slot] = record;
    }
    Ok(records)
}

fn record_routing(
    plan: &BuildPlan<'_>,
    index: usize,
) -> Result<(IdentHash, TunnelId, u8), TunnelError> {
    let last = plan.hops.len() - 1;
    let mut flags = 0u8;
    if plan.direction == TunnelDirection::Inbound && index == 0 {
        flags |= FLAG_INBOUND_GATEWAY;
    }
    if index < last {
        return Ok((
            plan.hops[index + 1].peer.hash,
            plan.hops[index + 1].tunnel_id,
            flags,
        ));
    }
    match plan.direction {
        TunnelDirection::Outbound => {
            let (gateway, tunnel_id) = plan
                .reply_gateway
                .ok_or(TunnelError::MissingReplyGateway)?;
            Ok((gateway, tunnel_id, flags | FLAG_OUTBOUND_ENDPOINT))
        }
        // The terminal inbound record points at this router itself.
        TunnelDirection::Inbound => Ok((
            plan.hops[last].peer.hash,
            plan.hops[last].tunnel_id,
            flags,
        )),
    }
}

/// Locate and open the single record addressed to this router.
///
/// # Errors
///
/// Returns [`RecordError::NoMatchingRecord`] if no record's truncated
/// hash prefix matches, or a crypto error if the matching record cannot
/// be opened.
pub fn find_and_open(
    local: &RouterIdentity,
    records: &[Vec<u8>],
) -> Result<OpenedRecord, TunnelError> {
    let trunc = local.hash().trunc();
    for (index, record) in records.iter().enumerate() {
        if record.len() != BUILD_RECORD_SIZE {
            return Err(RecordError::WrongLength {
                expected: BUILD_RECORD_SIZE,
                actual: record.len(),
            }
            .into());
        }
        if record[..16] == trunc {
            let plaintext = open_record(local.keypair(), &record[16..])?;
            let request = BuildRequestRecord::decode(&plaintext)?;
            return Ok(OpenedRecord { index, request });
        }
    }
    Err(RecordError::NoMatchingRecord.into())
}

/// Answer a build request: write the response into this hop's slot and
/// layer every record with the delivered reply key and IV.
///
/// # Errors
///
/// Returns a crypto error if layering fails.
pub fn write_reply(
    records: &mut [Vec<u8>],
    own_index: usize,
    reply_key: &[u8; 32],
    reply_iv: &[u8; 16],
    reply: BuildReply,
) -> Result<(), TunnelError> {
    let mut response = vec![0u8; BUILD_RECORD_SIZE];
    rand::thread_rng().fill(&mut response[32..BUILD_RECORD_SIZE - 1]);
    response[BUILD_RECORD_SIZE - 1] = match reply {
        BuildReply::Accept => 0,
        BuildReply::Reject => 1,
    };
    let digest = sha256(&response[32..]);
    response[..32].copy_from_slice(&digest);
    record_encrypt(reply_key, reply_iv, &mut response)?;
    records[own_index] = response;

    for (index, record) in records.iter_mut().enumerate() {
        if index != own_index {
            record_encrypt(reply_key, reply_iv, record)?;
        }
    }
    Ok(())
}

/// Unwind the build reply on the creator side.
///
/// Consumes each participating hop's reply material (it must never be
/// reused) and peels the layers of every hop's response record, innermost
/// hop first. A record whose integrity hash fails reads as a reject with
/// `integrity_ok == false`.
///
/// # Errors
///
/// Returns [`RecordError::ReplyConsumed`] if a hop's material was already
/// taken, or a crypto error if layering fails.
pub fn unwind_build_replies(
    hops: &[Hop],
    participant_count: usize,
    records: &mut [Vec<u8>],
) -> Result<Vec<HopBuildResult>, TunnelError> {
    let mut materials: Vec<ReplyMaterial> = Vec::with_capacity(participant_count);
    for (index, hop) in hops.iter().take(participant_count).enumerate() {
        materials.push(hop.take_reply(index)?);
    }

    let mut results = Vec::with_capacity(participant_count);
    for (k, hop) in hops.iter().take(participant_count).enumerate() {
        let slot = hop
            .record_index()
            .ok_or(RecordError::ReplyConsumed(k))?;
        let record = records
            .get_mut(slot)
            .ok_or(RecordError::BadRecordCount(slot))?;
        if record.len() != BUILD_RECORD_SIZE {
            return Err(RecordError::WrongLength {
                expected: BUILD_RECORD_SIZE,
                actual: record.len(),
            }
            .into());
        }
        for material in materials[k..participant_count].iter().rev() {
            record_decrypt(&material.key, &material.iv, record)?;
        }
        let integrity_ok = sha256(&record[32..]) == record[..32];
        let reply = if integrity_ok && record[BUILD_RECORD_SIZE - 1] == 0 {
            BuildReply::Accept
        } else {
            BuildReply::Reject
        };
        results.push(HopBuildResult {
            hop_index: k,
            reply,
            integrity_ok,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelPool;
    use crate::identity::PeerIdentity;

    fn make_chain(n: usize) -> (Vec<RouterIdentity>, Vec<Hop>) {
        let routers: Vec<RouterIdentity> =
            (0..n).map(|_| RouterIdentity::generate().unwrap()).collect();
        let hops: Vec<Hop> = routers
            .iter()
            .map(|r| Hop::new(r.as_peer()).unwrap())
            .collect();
        (routers, hops)
    }

    /// Drive a build message through each hop in chain order, answering
    /// with the given replies, and return the final record set.
    fn run_hops(
        routers: &[RouterIdentity],
        mut records: Vec<Vec<u8>>,
        replies: &[BuildReply],
    ) -> Vec<Vec<u8>> {
        for (router, reply) in routers.iter().zip(replies) {
            let opened = find_and_open(router, &records).unwrap();
            write_reply(
                &mut records,
                opened.index,
                &opened.request.reply_key,
                &opened.request.reply_iv,
                *reply,
            )
            .unwrap();
        }
        records
    }

    fn outbound_plan(hops: &mut [Hop]) -> BuildPlan<'_> {
        BuildPlan {
            hops,
            direction: TunnelDirection::Outbound,
            reply_gateway: Some((IdentHash::from_bytes([9u8; 32]), TunnelId::new(77))),
            reply_msg_id: 4242,
            request_time_minutes: 29_000_000,
        }
    }

    #[test]
    fn test_build_roundtrip_all_accept() {
        let (routers, mut hops) = make_chain(3);
        let records = create_build_message(outbound_plan(&mut hops)).unwrap();
        let mut records = run_hops(&routers, records, &[BuildReply::Accept; 3]);

        let results = unwind_build_replies(&hops, 3, &mut records).unwrap();
        assert!(results.iter().all(|r| r.reply == BuildReply::Accept && r.integrity_ok));
    }

    #[test]
    fn test_build_roundtrip_middle_decline() {
        let (routers, mut hops) = make_chain(3);
        let records = create_build_message(outbound_plan(&mut hops)).unwrap();
        let replies = [BuildReply::Accept, BuildReply::Reject, BuildReply::Accept];
        let mut records = run_hops(&routers, records, &replies);

        let results = unwind_build_replies(&hops, 3, &mut records).unwrap();
        assert_eq!(results[0].reply, BuildReply::Accept);
        assert_eq!(results[1].reply, BuildReply::Reject);
        assert_eq!(results[2].reply, BuildReply::Accept);
        assert!(results.iter().all(|r| r.integrity_ok));
    }

    #[test]
    fn test_tamper_isolated_to_one_hop() {
        let (routers, mut hops) = make_chain(3);
        let records = create_build_message(outbound_plan(&mut hops)).unwrap();
        let mut records = run_hops(&routers, records, &[BuildReply::Accept; 3]);

        // Corrupt hop 1's slot only.
        let slot = hops[1].record_index().unwrap();
        records[slot][40] ^= 0x01;

        let results = unwind_build_replies(&hops, 3, &mut records).unwrap();
        assert!(results[0].integrity_ok);
        assert_eq!(results[0].reply, BuildReply::Accept);
        assert!(!results[1].integrity_ok);
        assert_eq!(results[1].reply, BuildReply::Reject);
        assert!(results[2].integrity_ok);
        assert_eq!(results[2].reply, BuildReply::Accept);
    }

    #[test]
    fn test_unwind_consumes_reply_material() {
        let (routers, mut hops) = make_chain(2);
        let records = create_build_message(outbound_plan(&mut hops)).unwrap();
        let mut records = run_hops(&routers, records, &[BuildReply::Accept; 2]);

        unwind_build_replies(&hops, 2, &mut records).unwrap();
        assert!(matches!(
            unwind_build_replies(&hops, 2, &mut records),
            Err(TunnelError::Record(RecordError::ReplyConsumed(0)))
        ));
    }

    #[test]
    fn test_record_request_encode_decode() {
        let request = BuildRequestRecord {
            receive_tunnel_id: TunnelId::new(10),
            next_ident: IdentHash::from_bytes([3u8; 32]),
            next_tunnel_id: TunnelId::new(20),
            layer_key: LayerKey::from_bytes([4u8; 32]),
            iv_key: IvKey::from_bytes([5u8; 32]),
            reply_key: [6u8; 32],
            reply_iv: [7u8; 16],
            flags: FLAG_OUTBOUND_ENDPOINT,
            request_time_minutes: 1234,
            reply_msg_id: 5678,
        };
        let decoded = BuildRequestRecord::decode(&request.encode()).unwrap();
        assert_eq!(decoded.receive_tunnel_id, TunnelId::new(10));
        assert_eq!(decoded.next_tunnel_id, TunnelId::new(20));
        assert_eq!(decoded.reply_key, [6u8; 32]);
        assert_eq!(decoded.flags, FLAG_OUTBOUND_ENDPOINT);
        assert_eq!(decoded.reply_msg_id, 5678);
    }

    #[test]
    fn test_role_classification() {
        let local = IdentHash::from_bytes([1u8; 32]);
        let other = IdentHash::from_bytes([2u8; 32]);
        let mut request = BuildRequestRecord {
            receive_tunnel_id: TunnelId::new(1),
            next_ident: other,
            next_tunnel_id: TunnelId::new(2),
            layer_key: LayerKey::from_bytes([0u8; 32]),
            iv_key: IvKey::from_bytes([0u8; 32]),
            reply_key: [0u8; 32],
            reply_iv: [0u8; 16],
            flags: 0,
            request_time_minutes: 0,
            reply_msg_id: 0,
        };

        assert_eq!(request.role(&local).unwrap(), HopRole::Participant);

        request.flags = FLAG_INBOUND_GATEWAY;
        assert_eq!(request.role(&local).unwrap(), HopRole::InboundGateway);

        request.flags = FLAG_OUTBOUND_ENDPOINT;
        assert_eq!(request.role(&local).unwrap(), HopRole::OutboundEndpoint);

        request.flags = FLAG_INBOUND_GATEWAY | FLAG_OUTBOUND_ENDPOINT;
        assert_eq!(request.role(&local), Err(RecordError::AmbiguousRole));

        request.flags = 0;
        request.next_ident = local;
        assert_eq!(request.role(&local).unwrap(), HopRole::OwnInboundTerminus);
    }

    #[test]
    fn test_inbound_build_reaches_creator() {
        // Two participants plus the creator's own terminal record.
        let (routers, _) = make_chain(2);
        let creator = RouterIdentity::generate().unwrap();

        let peers: Vec<PeerIdentity> = routers.iter().map(RouterIdentity::as_peer).collect();
        let config =
            crate::config::TunnelConfig::inbound(TunnelPool::Client, peers, &creator, None)
                .unwrap();
        let mut hops = config.hops;

        let records = create_build_message(BuildPlan {
            hops: &mut hops,
            direction: TunnelDirection::Inbound,
            reply_gateway: None,
            reply_msg_id: 1,
            request_time_minutes: 0,
        })
        .unwrap();

        let mut records = run_hops(&routers, records, &[BuildReply::Accept; 2]);

        let opened = find_and_open(&creator, &records).unwrap();
        assert_eq!(
            opened.request.role(&creator.hash()).unwrap(),
            HopRole::OwnInboundTerminus
        );

        let results = unwind_build_replies(&hops, 2, &mut records).unwrap();
        assert!(results.iter().all(|r| r.reply == BuildReply::Accept && r.integrity_ok));
    }
}
