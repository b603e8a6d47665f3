//! Property-based tests for the VEIL tunnel subsystem.

use proptest::prelude::*;

use veil_tunnel::records::{BuildPlan, BuildReply, create_build_message, find_and_open, write_reply};
use veil_tunnel::{
    DeliveryInstruction, Fragmenter, Hop, IdentHash, Reassembler, RouterIdentity, TunnelConfig,
    TunnelDirection, TunnelId, TunnelPool,
};

proptest! {
    /// Any payload split by the fragmenter and fed back in any order
    /// reassembles to the original bytes, and never completes before the
    /// last fragment's slot and all lower slots are filled.
    #[test]
    fn prop_fragment_roundtrip(
        payload in proptest::collection::vec(any::<u8>(), 0..20_000),
        seed in any::<u64>(),
    ) {
        let fragments =
            Fragmenter::fragment(7, &DeliveryInstruction::Local, &payload).unwrap();
        let total = fragments.len();

        // Deterministic shuffle from the seed.
        let mut order: Vec<usize> = (0..total).collect();
        let mut state = seed | 1;
        for i in (1..total).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut reassembler = Reassembler::new();
        let mut completed = None;
        for (fed, &index) in order.iter().enumerate() {
            let result = reassembler.absorb(fragments[index].clone());
            if fed + 1 < total {
                prop_assert!(result.is_none(), "completed before all fragments arrived");
            } else {
                completed = result;
            }
        }
        let message = completed.expect("reassembly must complete with all fragments");
        prop_assert_eq!(message.payload, payload);
        prop_assert_eq!(reassembler.buffered_fragments(), 0);
    }

    /// A corrupted window never contributes fragments to reassembly.
    #[test]
    fn prop_corrupted_window_contributes_nothing(
        payload in proptest::collection::vec(any::<u8>(), 1..900),
        flip in 0usize..1008,
    ) {
        let fragments =
            Fragmenter::fragment(3, &DeliveryInstruction::Local, &payload).unwrap();
        let area = Fragmenter::pack_areas(&fragments).unwrap().remove(0);
        let iv = [9u8; 16];
        let mut window = Fragmenter::build_window(&area, &iv).unwrap();
        let original = window.clone();
        window[flip] ^= 0x01;
        prop_assume!(window != original);

        let mut reassembler = Reassembler::new();
        match reassembler.ingest_window(&iv, &window) {
            // The flip landed in padding: the fragment area was untouched
            // and the message must come through intact.
            Ok(completions) => {
                for message in completions {
                    prop_assert_eq!(&message.payload, &payload);
                }
            }
            // Checksum or parse failure: nothing may be buffered.
            Err(_) => prop_assert_eq!(reassembler.buffered_fragments(), 0),
        }
    }

    /// Unwinding a build reply recovers every hop's decision exactly,
    /// whatever mix of accepts and rejects the hops produced.
    #[test]
    fn prop_build_reply_roundtrip(accepts in proptest::collection::vec(any::<bool>(), 1..6)) {
        let routers: Vec<RouterIdentity> = (0..accepts.len())
            .map(|_| RouterIdentity::generate().unwrap())
            .collect();
        let config = TunnelConfig::outbound(
            TunnelPool::Client,
            routers.iter().map(RouterIdentity::as_peer).collect(),
            None,
        )
        .unwrap();
        let mut hops: Vec<Hop> = config.hops;

        let mut records = create_build_message(BuildPlan {
            hops: &mut hops,
            direction: TunnelDirection::Outbound,
            reply_gateway: Some((IdentHash::from_bytes([1u8; 32]), TunnelId::new(1))),
            reply_msg_id: 1,
            request_time_minutes: 0,
        })
        .unwrap();

        for (router, accept) in routers.iter().zip(&accepts) {
            let opened = find_and_open(router, &records).unwrap();
            let reply = if *accept { BuildReply::Accept } else { BuildReply::Reject };
            write_reply(
                &mut records,
                opened.index,
                &opened.request.reply_key,
                &opened.request.reply_iv,
                reply,
            )
            .unwrap();
        }

        let results =
            veil_tunnel::records::unwind_build_replies(&hops, hops.len(), &mut records).unwrap();
        for (result, accept) in results.iter().zip(&accepts) {
            prop_assert!(result.integrity_ok);
            prop_assert_eq!(
                result.reply == BuildReply::Accept,
                *accept,
                "hop {} decision mangled",
                result.hop_index
            );
        }
    }
}
