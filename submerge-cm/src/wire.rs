// Bit-exact (enough) wire structures for the gossip three-way exchange.
// These round-trip through rmp_serde exactly as submerge_net::Msg does;
// field order here is the wire order named in the distilled spec's §6.

use crate::gossip::EndpointState;
use serde::{Deserialize, Serialize};
use submerge_net::NodeID;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipDigest {
    pub endpoint: NodeID,
    pub generation: i32,
    pub max_version: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipDigestSyn {
    pub cluster_name: String,
    pub digests: Vec<GossipDigest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipDigestAck {
    pub delta_digests: Vec<GossipDigest>,
    pub delta_state: Vec<(NodeID, EndpointState)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipDigestAck2 {
    pub delta_state: Vec<(NodeID, EndpointState)>,
}

pub fn encode_syn(msg: &GossipDigestSyn) -> submerge_base::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

pub fn decode_syn(buf: &[u8]) -> submerge_base::Result<GossipDigestSyn> {
    Ok(rmp_serde::from_slice(buf)?)
}

pub fn encode_ack(msg: &GossipDigestAck) -> submerge_base::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

pub fn decode_ack(buf: &[u8]) -> submerge_base::Result<GossipDigestAck> {
    Ok(rmp_serde::from_slice(buf)?)
}

pub fn encode_ack2(msg: &GossipDigestAck2) -> submerge_base::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

pub fn decode_ack2(buf: &[u8]) -> submerge_base::Result<GossipDigestAck2> {
    Ok(rmp_serde::from_slice(buf)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use crate::gossip::{ApplicationStateMap, HeartBeatState};

    #[test]
    fn syn_round_trips_through_rmp() {
        let syn = GossipDigestSyn {
            cluster_name: "test-cluster".to_string(),
            digests: vec![GossipDigest {
                endpoint: NodeID(1),
                generation: 3,
                max_version: 7,
            }],
        };
        let bytes = encode_syn(&syn).unwrap();
        let decoded = decode_syn(&bytes).unwrap();
        assert_eq!(decoded.cluster_name, "test-cluster");
        assert_eq!(decoded.digests.len(), 1);
        assert_eq!(decoded.digests[0].generation, 3);
    }

    #[test]
    fn ack_round_trips_endpoint_state() {
        let state = EndpointState::new(HeartBeatState::new(1, 2), ApplicationStateMap::new());
        let ack = GossipDigestAck {
            delta_digests: vec![],
            delta_state: vec![(NodeID(5), state)],
        };
        let bytes = encode_ack(&ack).unwrap();
        let decoded = decode_ack(&bytes).unwrap();
        assert_eq!(decoded.delta_state.len(), 1);
        assert_eq!(decoded.delta_state[0].0, NodeID(5));
    }
}
