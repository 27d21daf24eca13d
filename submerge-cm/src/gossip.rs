// The gossiper: endpoint state map, periodic round (SYN/ACK/ACK2),
// digest exchange, seed logic, and subscriber notification. Mutation of
// gossip state only ever happens from inside the methods below, which in
// the embedding system are all invoked from the single GOSSIP stage
// (gossip_stage.rs); nothing in this module takes its own internal lock
// reentrantly, so the embedder's single-threaded-access discipline is
// what actually keeps things sequential, exactly as §5 describes.

use crate::config::MessageTransport;
use crate::fd::FailureDetector;
use crate::wire::{GossipDigest, GossipDigestAck};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as BoolOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;
use submerge_net::{Duration, NodeID, NodeTime};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeartBeatState {
    pub generation: i32,
    pub version: i32,
}

impl HeartBeatState {
    pub fn new(generation: i32, version: i32) -> Self {
        HeartBeatState { generation, version }
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub state_version: i32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApplicationStateMap(pub BTreeMap<String, VersionedValue>);

impl ApplicationStateMap {
    pub fn new() -> Self {
        ApplicationStateMap(BTreeMap::new())
    }

    pub fn max_version(&self) -> i32 {
        self.0.values().map(|v| v.state_version).max().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointState {
    pub heartbeat: HeartBeatState,
    pub application_state: ApplicationStateMap,
    pub is_alive: bool,
    pub is_a_gossiper: bool,
    pub has_token: bool,
    pub update_timestamp: NodeTime,
}

impl EndpointState {
    pub fn new(heartbeat: HeartBeatState, application_state: ApplicationStateMap) -> Self {
        EndpointState {
            heartbeat,
            application_state,
            is_alive: false,
            is_a_gossiper: true,
            has_token: true,
            update_timestamp: NodeTime::from_micros(0),
        }
    }

    // The maxVersion of a GossipDigest: the max of the heartbeat version
    // and every application-state version.
    pub fn max_version(&self) -> i32 {
        self.heartbeat.version.max(self.application_state.max_version())
    }
}

pub trait MembershipListener: Send + Sync {
    fn on_join(&self, endpoint: NodeID, state: &EndpointState);
    fn on_alive(&self, endpoint: NodeID, state: &EndpointState);
    fn on_dead(&self, endpoint: NodeID, state: &EndpointState);
    fn on_change(&self, endpoint: NodeID, key: &str, value: &VersionedValue);
}

pub struct GossipConfig {
    pub cluster_name: String,
    pub seeds: HashSet<NodeID>,
    pub ring_delay: Duration,
    pub gossip_interval: Duration,
    pub fat_client_silence_limit: Duration,
}

impl GossipConfig {
    pub fn new(cluster_name: impl Into<String>, seeds: HashSet<NodeID>) -> Self {
        GossipConfig {
            cluster_name: cluster_name.into(),
            seeds,
            ring_delay: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(1),
            fat_client_silence_limit: Duration::from_secs(3600),
        }
    }
}

pub struct Gossiper {
    config: GossipConfig,
    local_endpoint: NodeID,
    endpoint_state_map: RwLock<HashMap<NodeID, EndpointState>>,
    live_endpoints: RwLock<BTreeSet<NodeID>>,
    unreachable_endpoints: RwLock<BTreeSet<NodeID>>,
    just_removed_endpoints: RwLock<HashMap<NodeID, NodeTime>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    failure_detector: Arc<FailureDetector>,
    rng: Mutex<StdRng>,
}

impl Gossiper {
    pub fn new(
        config: GossipConfig,
        local_endpoint: NodeID,
        initial_generation: i32,
        failure_detector: Arc<FailureDetector>,
        rng_seed: u64,
    ) -> Self {
        let mut map = HashMap::new();
        let mut local_state = EndpointState::new(
            HeartBeatState::new(initial_generation, 0),
            ApplicationStateMap::new(),
        );
        local_state.is_alive = true;
        map.insert(local_endpoint, local_state);
        let mut live = BTreeSet::new();
        live.insert(local_endpoint);
        Gossiper {
            config,
            local_endpoint,
            endpoint_state_map: RwLock::new(map),
            live_endpoints: RwLock::new(live),
            unreachable_endpoints: RwLock::new(BTreeSet::new()),
            just_removed_endpoints: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            failure_detector,
            rng: Mutex::new(StdRng::seed_from_u64(rng_seed)),
        }
    }

    pub fn register(&self, listener: Arc<dyn MembershipListener>) {
        let mut guard = self.listeners.write().unwrap();
        let mut next = (*guard).clone();
        next.push(listener);
        *guard = next;
    }

    pub fn local_endpoint(&self) -> NodeID {
        self.local_endpoint
    }

    pub fn endpoint_state(&self, endpoint: NodeID) -> Option<EndpointState> {
        self.endpoint_state_map.read().unwrap().get(&endpoint).cloned()
    }

    pub fn is_alive(&self, endpoint: NodeID) -> bool {
        self.live_endpoints.read().unwrap().contains(&endpoint)
    }

    pub fn live_endpoint_count(&self) -> usize {
        self.live_endpoints.read().unwrap().len()
    }

    pub fn unreachable_endpoint_count(&self) -> usize {
        self.unreachable_endpoints.read().unwrap().len()
    }

    // Increments the local heartbeat version. Step 1 of each tick (§4.5).
    pub fn heartbeat(&self, now: NodeTime) {
        let mut map = self.endpoint_state_map.write().unwrap();
        if let Some(local) = map.get_mut(&self.local_endpoint) {
            local.heartbeat.increment_version();
            local.update_timestamp = now;
        }
    }

    // Sets (or replaces) a key in the local application state, bumping
    // its per-key version. Used by the embedder to publish e.g. a token
    // or a schema version into gossip.
    pub fn add_local_application_state(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut map = self.endpoint_state_map.write().unwrap();
        if let Some(local) = map.get_mut(&self.local_endpoint) {
            let next_version = local.application_state.max_version() + 1;
            local.application_state.0.insert(
                key.into(),
                VersionedValue {
                    value: value.into(),
                    state_version: next_version,
                },
            );
        }
    }

    // Step 2: a shuffled digest list with the local endpoint first.
    pub fn build_digest_list(&self) -> Vec<GossipDigest> {
        let map = self.endpoint_state_map.read().unwrap();
        let mut digests: Vec<GossipDigest> = map
            .iter()
            .filter(|(ep, _)| **ep != self.local_endpoint)
            .map(|(ep, state)| GossipDigest {
                endpoint: *ep,
                generation: state.heartbeat.generation,
                max_version: state.max_version(),
            })
            .collect();
        {
            let mut rng = self.rng.lock().unwrap();
            digests.shuffle(&mut *rng);
        }
        let local = map.get(&self.local_endpoint).unwrap();
        let mut out = Vec::with_capacity(digests.len() + 1);
        out.push(GossipDigest {
            endpoint: self.local_endpoint,
            generation: local.heartbeat.generation,
            max_version: local.max_version(),
        });
        out.extend(digests);
        out
    }

    pub fn build_syn(&self) -> crate::wire::GossipDigestSyn {
        crate::wire::GossipDigestSyn {
            cluster_name: self.config.cluster_name.clone(),
            digests: self.build_digest_list(),
        }
    }

    // Step 3: chooses who to gossip to this round: a random live
    // endpoint, with probability |unreachable|/(|live|+1) a random
    // unreachable endpoint, and a random seed if the live target wasn't a
    // seed or the live set is smaller than the seed set.
    pub fn choose_gossip_targets(&self) -> GossipTargets {
        let live: Vec<NodeID> = self
            .live_endpoints
            .read()
            .unwrap()
            .iter()
            .copied()
            .filter(|ep| *ep != self.local_endpoint)
            .collect();
        let unreachable: Vec<NodeID> =
            self.unreachable_endpoints.read().unwrap().iter().copied().collect();

        let mut rng = self.rng.lock().unwrap();

        let primary = live.choose(&mut *rng).copied();

        let unreachable_target = if !unreachable.is_empty() {
            let p = unreachable.len() as f64 / (live.len() as f64 + 1.0);
            if rng.gen::<f64>() < p {
                unreachable.choose(&mut *rng).copied()
            } else {
                None
            }
        } else {
            None
        };

        let primary_is_seed = primary.map(|p| self.config.seeds.contains(&p)).unwrap_or(false);
        let seed_target = if !self.config.seeds.is_empty()
            && (!primary_is_seed || live.len() < self.config.seeds.len())
        {
            let seeds: Vec<NodeID> = self.config.seeds.iter().copied().collect();
            seeds.choose(&mut *rng).copied()
        } else {
            None
        };

        GossipTargets {
            primary,
            unreachable: unreachable_target,
            seed: seed_target,
        }
    }

    // Receiver side of a SYN: computes delta digests to request and delta
    // state to send back, per the rules of §4.5.
    pub fn handle_syn(&self, syn: &crate::wire::GossipDigestSyn, now: NodeTime) -> crate::wire::GossipDigestAck {
        let map = self.endpoint_state_map.read().unwrap();
        let mut delta_digests = Vec::new();
        let mut delta_state = Vec::new();
        let mut mentioned: HashSet<NodeID> = HashSet::new();

        for d in &syn.digests {
            mentioned.insert(d.endpoint);
            match map.get(&d.endpoint) {
                None => {
                    delta_digests.push(GossipDigest {
                        endpoint: d.endpoint,
                        generation: d.generation,
                        max_version: 0,
                    });
                }
                Some(local_state) => {
                    let local_gen = local_state.heartbeat.generation;
                    let local_max = local_state.max_version();
                    if d.generation > local_gen {
                        delta_digests.push(GossipDigest {
                            endpoint: d.endpoint,
                            generation: d.generation,
                            max_version: 0,
                        });
                    } else if d.generation < local_gen {
                        delta_state.push((d.endpoint, local_state.clone()));
                    } else if d.max_version > local_max {
                        delta_digests.push(GossipDigest {
                            endpoint: d.endpoint,
                            generation: d.generation,
                            max_version: local_max,
                        });
                    } else if d.max_version < local_max {
                        delta_state.push((
                            d.endpoint,
                            state_above_version(local_state, d.max_version),
                        ));
                    }
                }
            }
        }

        // Advertise anything we know that the syn sender never mentioned,
        // as if the sender's knowledge of it sat at generation/version 0.
        // This is what lets two freshly-introduced nodes reach full,
        // symmetric knowledge of each other in a single SYN/ACK/ACK2
        // round rather than needing a second round initiated the other
        // way.
        for (endpoint, state) in map.iter() {
            if !mentioned.contains(endpoint) {
                delta_state.push((*endpoint, state.clone()));
            }
        }
        drop(map);

        // No failure-detector reporting here: every endpoint in
        // `delta_state` at this point is one *we* are ahead of (remote
        // generation/version <= ours), the opposite of §4.5's rule
        // ("report where remoteGen > localGen, or equal and
        // remoteVersion > localVersion"). The digest cases that rule
        // actually covers only ever produce `delta_digests` entries here
        // (a request for more state, not state itself); the report
        // happens once that state comes back and is actually applied, in
        // `handle_new_join`/`handle_generation_change`/`merge_newer_state`
        // below.
        let _ = now;

        crate::wire::GossipDigestAck {
            delta_digests,
            delta_state,
        }
    }

    // Receiver side of an ACK: applies the state it carries, then replies
    // with the state requested by the delta digests.
    pub fn handle_ack(&self, ack: &crate::wire::GossipDigestAck, now: NodeTime) -> crate::wire::GossipDigestAck2 {
        self.apply_state_locally(&ack.delta_state, now);

        let map = self.endpoint_state_map.read().unwrap();
        let mut delta_state = Vec::new();
        for d in &ack.delta_digests {
            if let Some(state) = map.get(&d.endpoint) {
                delta_state.push((d.endpoint, state_above_version(state, d.max_version)));
            }
        }
        crate::wire::GossipDigestAck2 { delta_state }
    }

    pub fn handle_ack2(&self, ack2: &crate::wire::GossipDigestAck2, now: NodeTime) {
        self.apply_state_locally(&ack2.delta_state, now);
    }

    fn maybe_report_to_fd(&self, endpoint: NodeID, now: NodeTime) {
        if endpoint != self.local_endpoint {
            self.failure_detector.report(endpoint, now);
        }
    }

    // §4.5 applyStateLocally.
    fn apply_state_locally(&self, remote: &[(NodeID, EndpointState)], now: NodeTime) {
        for (endpoint, remote_state) in remote {
            let endpoint = *endpoint;
            if endpoint == self.local_endpoint {
                continue;
            }
            if self.is_quarantined(endpoint, now) {
                continue;
            }

            let existing = self.endpoint_state_map.read().unwrap().get(&endpoint).cloned();
            match existing {
                None => self.handle_new_join(endpoint, remote_state, now),
                Some(local_state) => {
                    if remote_state.heartbeat.generation > local_state.heartbeat.generation {
                        self.handle_generation_change(endpoint, remote_state, now);
                    } else if remote_state.heartbeat.generation == local_state.heartbeat.generation
                    {
                        let remote_max = remote_state.max_version();
                        let local_max = local_state.max_version();
                        if remote_max > local_max {
                            self.merge_newer_state(endpoint, &local_state, remote_state, now);
                        }
                    } else {
                        debug_assert!(
                            false,
                            "generation for {:?} went backwards: local {} remote {}",
                            endpoint, local_state.heartbeat.generation, remote_state.heartbeat.generation
                        );
                    }
                }
            }
        }
    }

    fn handle_new_join(&self, endpoint: NodeID, remote_state: &EndpointState, now: NodeTime) {
        let mut state = remote_state.clone();
        state.is_alive = true;
        state.update_timestamp = now;
        self.endpoint_state_map.write().unwrap().insert(endpoint, state.clone());
        self.mark_alive(endpoint);
        self.maybe_report_to_fd(endpoint, now);
        self.notify_join(endpoint, &state);
    }

    fn handle_generation_change(&self, endpoint: NodeID, remote_state: &EndpointState, now: NodeTime) {
        let mut state = remote_state.clone();
        state.is_alive = true;
        state.update_timestamp = now;
        self.endpoint_state_map.write().unwrap().insert(endpoint, state.clone());
        self.mark_alive(endpoint);
        self.maybe_report_to_fd(endpoint, now);
        self.notify_join(endpoint, &state);
    }

    fn merge_newer_state(
        &self,
        endpoint: NodeID,
        local_state: &EndpointState,
        remote_state: &EndpointState,
        now: NodeTime,
    ) {
        let mut merged = local_state.clone();
        if remote_state.heartbeat.version > local_state.heartbeat.version {
            merged.heartbeat = remote_state.heartbeat;
        }
        let mut changed: Vec<(String, VersionedValue)> = Vec::new();
        for (k, remote_v) in remote_state.application_state.0.iter() {
            let local_v = merged.application_state.0.get(k);
            let is_newer = local_v.map(|lv| remote_v.state_version > lv.state_version).unwrap_or(true);
            if is_newer {
                merged.application_state.0.insert(k.clone(), remote_v.clone());
                changed.push((k.clone(), remote_v.clone()));
            }
        }
        merged.update_timestamp = now;
        self.endpoint_state_map.write().unwrap().insert(endpoint, merged.clone());
        self.mark_alive(endpoint);
        self.maybe_report_to_fd(endpoint, now);
        self.notify_alive(endpoint, &merged);
        for (k, v) in changed {
            self.notify_change(endpoint, &k, &v);
        }
    }

    fn mark_alive(&self, endpoint: NodeID) {
        self.live_endpoints.write().unwrap().insert(endpoint);
        self.unreachable_endpoints.write().unwrap().remove(&endpoint);
    }

    fn mark_dead(&self, endpoint: NodeID) {
        self.live_endpoints.write().unwrap().remove(&endpoint);
        self.unreachable_endpoints.write().unwrap().insert(endpoint);
        if let Some(state) = self.endpoint_state_map.write().unwrap().get_mut(&endpoint) {
            state.is_alive = false;
        }
    }

    // Invoked by the embedder once per status-check pass (§4.5 point 4):
    // calls the failure detector for every known endpoint but self,
    // convicting endpoints whose phi exceeds threshold, evicting silent
    // fat clients, and forgetting expired quarantine entries.
    pub fn status_check(&self, now: NodeTime) {
        let endpoints: Vec<NodeID> = self
            .endpoint_state_map
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|ep| *ep != self.local_endpoint)
            .collect();

        for ep in endpoints {
            if self.failure_detector.interpret(ep, now) {
                self.convict(ep, now);
            }
        }

        self.quarantine_fat_clients(now);
        self.forget_expired_quarantine(now);
    }

    fn convict(&self, endpoint: NodeID, now: NodeTime) {
        let was_alive = self.is_alive(endpoint);
        self.mark_dead(endpoint);
        if was_alive {
            warn!(?endpoint, "failure detector convicted endpoint");
            if let Some(state) = self.endpoint_state_map.read().unwrap().get(&endpoint).cloned() {
                self.notify_dead(endpoint, &state);
            }
        }
        let _ = now;
    }

    // Fat-client nodes (gossip-only, hasToken == false) that have been
    // silent for fat_client_silence_limit are dropped from liveEndpoints
    // independently of phi conviction.
    fn quarantine_fat_clients(&self, now: NodeTime) {
        let stale: Vec<NodeID> = {
            let map = self.endpoint_state_map.read().unwrap();
            map.iter()
                .filter(|(ep, state)| {
                    **ep != self.local_endpoint
                        && !state.has_token
                        && now.elapsed_since(state.update_timestamp).as_micros()
                            > self.config.fat_client_silence_limit.as_micros()
                })
                .map(|(ep, _)| *ep)
                .collect()
        };
        for ep in stale {
            self.mark_dead(ep);
        }
    }

    fn forget_expired_quarantine(&self, now: NodeTime) {
        let mut quarantine = self.just_removed_endpoints.write().unwrap();
        quarantine.retain(|_, removed_at| {
            now.elapsed_since(*removed_at).as_micros() < self.config.ring_delay.as_micros()
        });
    }

    fn is_quarantined(&self, endpoint: NodeID, now: NodeTime) -> bool {
        let quarantine = self.just_removed_endpoints.read().unwrap();
        match quarantine.get(&endpoint) {
            Some(removed_at) => {
                now.elapsed_since(*removed_at).as_micros() < self.config.ring_delay.as_micros()
            }
            None => false,
        }
    }

    // Removes endpoint from live/unreachable/state-map/failure-detector
    // and records the removal time so a lagging SYN mentioning it is
    // ignored until RING_DELAY has elapsed (§4.5, §8 invariant 8).
    pub fn remove_endpoint(&self, endpoint: NodeID, now: NodeTime) {
        self.live_endpoints.write().unwrap().remove(&endpoint);
        self.unreachable_endpoints.write().unwrap().remove(&endpoint);
        self.endpoint_state_map.write().unwrap().remove(&endpoint);
        self.failure_detector.remove(endpoint);
        self.just_removed_endpoints.write().unwrap().insert(endpoint, now);
    }

    fn notify_join(&self, endpoint: NodeID, state: &EndpointState) {
        let listeners = self.listeners.read().unwrap().clone();
        for l in listeners.iter() {
            l.on_join(endpoint, state);
        }
    }

    fn notify_alive(&self, endpoint: NodeID, state: &EndpointState) {
        let listeners = self.listeners.read().unwrap().clone();
        for l in listeners.iter() {
            l.on_alive(endpoint, state);
        }
    }

    fn notify_dead(&self, endpoint: NodeID, state: &EndpointState) {
        let listeners = self.listeners.read().unwrap().clone();
        for l in listeners.iter() {
            l.on_dead(endpoint, state);
        }
    }

    fn notify_change(&self, endpoint: NodeID, key: &str, value: &VersionedValue) {
        let listeners = self.listeners.read().unwrap().clone();
        for l in listeners.iter() {
            l.on_change(endpoint, key, value);
        }
    }
}

fn state_above_version(state: &EndpointState, above: i32) -> EndpointState {
    let mut out = state.clone();
    if state.heartbeat.version <= above {
        // Keep the generation (needed to identify the endpoint) but
        // signal "nothing new here" with a version of 0; this mirrors
        // the real system sending heartbeat only when it's actually
        // newer than what the peer asked for.
        out.heartbeat.version = 0;
    }
    out.application_state
        .0
        .retain(|_, v| v.state_version > above);
    out
}

pub struct GossipTargets {
    pub primary: Option<NodeID>,
    pub unreachable: Option<NodeID>,
    pub seed: Option<NodeID>,
}

impl Gossiper {
    // One full tick of §4.5: bump the local heartbeat, build a SYN, and
    // fire it at this round's targets over `transport`. Finishes with a
    // status check so conviction and quarantine sweeps happen on the same
    // cadence as the gossip round itself.
    pub fn do_gossip_round(
        &self,
        transport: &dyn MessageTransport,
        now: NodeTime,
    ) -> submerge_base::Result<()> {
        self.heartbeat(now);
        let syn = self.build_syn();
        let bytes = crate::wire::encode_syn(&syn)?;
        let targets = self.choose_gossip_targets();
        for target in [targets.primary, targets.unreachable, targets.seed].into_iter().flatten() {
            debug!(?target, "gossip round: sending syn");
            transport.send_one_way(bytes.clone(), target)?;
        }
        self.status_check(now);
        Ok(())
    }

    // A single blocking round against `seed`, run once at boot before the
    // periodic loop starts (§9/SPEC_FULL supplement: "what generation do I
    // boot with" is answered by seeing the cluster's state first). Unlike
    // a normal round this never reports to the failure detector for `seed`
    // on a timeout -- a cold seed during a single node's first boot isn't
    // evidence of anything.
    //
    // `recv_ack` abstracts the blocking wait for this node's reply: the
    // caller supplies whatever the transport collaborator gives it (§6),
    // this module only knows how to build the request and apply the
    // response.
    pub fn shadow_round(
        &self,
        transport: &dyn MessageTransport,
        seed: NodeID,
        recv_ack: impl FnOnce(StdDuration) -> Option<GossipDigestAck>,
        timeout: StdDuration,
        now: NodeTime,
    ) -> submerge_base::Result<()> {
        let syn = self.build_syn();
        let bytes = crate::wire::encode_syn(&syn)?;
        transport.send_one_way(bytes, seed)?;
        match recv_ack(timeout) {
            Some(ack) => {
                debug!(?seed, "shadow round: applying seed's ack");
                self.apply_state_locally(&ack.delta_state, now);
            }
            None => debug!(?seed, "shadow round: seed did not respond before timeout"),
        }
        Ok(())
    }
}

// Owns the background thread driving `Gossiper::do_gossip_round` at
// `GossipConfig::gossip_interval`. `shutdown` cancels the timer and joins
// the thread, matching §5's "Stage shutdown cancels the gossip timer and
// drains in-flight tasks."
pub struct GossipLoopHandle {
    running: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl GossipLoopHandle {
    pub fn shutdown(mut self) {
        self.running.store(false, BoolOrdering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for GossipLoopHandle {
    fn drop(&mut self) {
        self.running.store(false, BoolOrdering::SeqCst);
    }
}

// Spawns the periodic task (§4.5): waits for the transport to be
// listening, then ticks `do_gossip_round` at `gossip_interval` until
// `shutdown` is called. `now_fn` abstracts reading the current time so
// this module never calls a wall-clock API directly.
pub fn spawn_gossip_loop(
    gossiper: Arc<Gossiper>,
    transport: Arc<dyn MessageTransport>,
    now_fn: impl Fn() -> NodeTime + Send + 'static,
) -> submerge_base::Result<GossipLoopHandle> {
    transport.wait_until_listening()?;
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let interval = StdDuration::from_micros(gossiper.config.gossip_interval.as_micros().max(0) as u64);
    let join = std::thread::spawn(move || {
        while running_clone.load(BoolOrdering::SeqCst) {
            let now = now_fn();
            if let Err(e) = gossiper.do_gossip_round(transport.as_ref(), now) {
                warn!(error = ?e, "gossip round failed, will retry next tick");
            }
            std::thread::sleep(interval);
        }
    });
    Ok(GossipLoopHandle {
        running,
        join: Some(join),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use crate::fd::FailureDetectorConfig;

    fn new_fd() -> Arc<FailureDetector> {
        Arc::new(FailureDetector::new(FailureDetectorConfig::default()))
    }

    fn new_gossiper(name: &str, local: NodeID, gen: i32, seeds: HashSet<NodeID>) -> Gossiper {
        Gossiper::new(GossipConfig::new(name, seeds), local, gen, new_fd(), 42)
    }

    // Two-node convergence scenario from the distilled spec §8.4: A at
    // gen 1 ver 3, B unknown to A at gen 1 ver 5. After one full
    // SYN/ACK/ACK2 round both converge and both see the other as alive.
    #[test]
    fn two_node_gossip_round_converges() {
        let now = NodeTime::from_micros(1_000_000);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        let b = new_gossiper("cluster", NodeID(2), 1, HashSet::new());

        // Bump A to heartbeat version 3, B to version 5.
        for _ in 0..3 {
            a.heartbeat(now);
        }
        for _ in 0..5 {
            b.heartbeat(now);
        }

        // A, knowing nobody, gossips to B. B's ACK also advertises its own
        // state back (unmentioned in A's syn), and A's ACK2 delivers the
        // state B asked for.
        let syn = a.build_syn();
        let ack = b.handle_syn(&syn, now);
        let ack2 = a.handle_ack(&ack, now);
        b.handle_ack2(&ack2, now);

        assert!(a.is_alive(NodeID(2)));
        assert!(b.is_alive(NodeID(1)));

        let a_view_of_b = a.endpoint_state(NodeID(2)).unwrap();
        let b_view_of_a = b.endpoint_state(NodeID(1)).unwrap();
        assert_eq!(a_view_of_b.heartbeat.version, 5);
        assert_eq!(b_view_of_a.heartbeat.version, 3);
    }

    #[test]
    fn subscriber_fires_on_join_for_new_endpoint() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct Counter(AtomicUsize);
        impl MembershipListener for Counter {
            fn on_join(&self, _e: NodeID, _s: &EndpointState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_alive(&self, _e: NodeID, _s: &EndpointState) {}
            fn on_dead(&self, _e: NodeID, _s: &EndpointState) {}
            fn on_change(&self, _e: NodeID, _k: &str, _v: &VersionedValue) {}
        }
        let now = NodeTime::from_micros(0);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        a.register(counter.clone());

        let remote_state = EndpointState::new(HeartBeatState::new(1, 1), ApplicationStateMap::new());
        a.apply_state_locally(&[(NodeID(99), remote_state)], now);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_endpoint_stays_quarantined_until_ring_delay() {
        let now = NodeTime::from_micros(0);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(1, 1), ApplicationStateMap::new()))],
            now,
        );
        assert!(a.endpoint_state(NodeID(2)).is_some());

        a.remove_endpoint(NodeID(2), now);
        assert!(a.endpoint_state(NodeID(2)).is_none());

        // A gossip SYN mentioning NodeID(2) again before RING_DELAY
        // elapses must not reinsert it.
        let still_quarantined = now.advance(Duration::from_secs(1));
        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(2, 1), ApplicationStateMap::new()))],
            still_quarantined,
        );
        assert!(a.endpoint_state(NodeID(2)).is_none());

        // After RING_DELAY, a fresh mention is accepted again.
        let after_ring_delay = now.advance(Duration::from_secs(31));
        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(2, 1), ApplicationStateMap::new()))],
            after_ring_delay,
        );
        assert!(a.endpoint_state(NodeID(2)).is_some());
    }

    #[test]
    fn generation_change_restarts_and_marks_alive() {
        let now = NodeTime::from_micros(0);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(1, 1), ApplicationStateMap::new()))],
            now,
        );
        assert!(a.is_alive(NodeID(2)));
        assert_eq!(a.endpoint_state(NodeID(2)).unwrap().heartbeat.generation, 1);

        a.convict(NodeID(2), now);
        assert!(!a.is_alive(NodeID(2)));

        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(2, 0), ApplicationStateMap::new()))],
            now,
        );
        assert!(a.is_alive(NodeID(2)));
        assert_eq!(a.endpoint_state(NodeID(2)).unwrap().heartbeat.generation, 2);
    }

    struct RecordingTransport {
        sent: Mutex<Vec<NodeID>>,
        listening: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Self {
            RecordingTransport {
                sent: Mutex::new(Vec::new()),
                listening: AtomicBool::new(true),
            }
        }
    }

    impl MessageTransport for RecordingTransport {
        fn send_one_way(&self, _payload: Vec<u8>, destination: NodeID) -> submerge_base::Result<()> {
            self.sent.lock().unwrap().push(destination);
            Ok(())
        }
        fn wait_until_listening(&self) -> submerge_base::Result<()> {
            if self.listening.load(BoolOrdering::SeqCst) {
                Ok(())
            } else {
                Err(submerge_base::err("transport never started listening"))
            }
        }
    }

    #[test]
    fn gossip_round_sends_syn_to_chosen_targets() {
        let now = NodeTime::from_micros(0);
        let mut seeds = HashSet::new();
        seeds.insert(NodeID(9));
        let a = new_gossiper("cluster", NodeID(1), 1, seeds);
        a.apply_state_locally(
            &[(NodeID(2), EndpointState::new(HeartBeatState::new(1, 1), ApplicationStateMap::new()))],
            now,
        );
        let transport = RecordingTransport::new();
        a.do_gossip_round(&transport, now).unwrap();
        let sent = transport.sent.lock().unwrap();
        assert!(!sent.is_empty());
        assert_eq!(a.endpoint_state(NodeID(1)).unwrap().heartbeat.version, 1);
    }

    #[test]
    fn shadow_round_applies_seeds_ack_when_it_arrives() {
        let now = NodeTime::from_micros(0);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        let transport = RecordingTransport::new();
        let ack = GossipDigestAck {
            delta_digests: vec![],
            delta_state: vec![(
                NodeID(7),
                EndpointState::new(HeartBeatState::new(5, 2), ApplicationStateMap::new()),
            )],
        };
        a.shadow_round(
            &transport,
            NodeID(9),
            |_timeout| Some(ack.clone()),
            StdDuration::from_millis(100),
            now,
        )
        .unwrap();
        assert!(a.endpoint_state(NodeID(7)).is_some());
        assert_eq!(transport.sent.lock().unwrap().as_slice(), &[NodeID(9)]);
    }

    #[test]
    fn shadow_round_timeout_leaves_state_unchanged() {
        let now = NodeTime::from_micros(0);
        let a = new_gossiper("cluster", NodeID(1), 1, HashSet::new());
        let transport = RecordingTransport::new();
        a.shadow_round(
            &transport,
            NodeID(9),
            |_timeout| None,
            StdDuration::from_millis(50),
            now,
        )
        .unwrap();
        assert!(a.endpoint_state(NodeID(9)).is_none());
    }

    #[test]
    fn gossip_loop_runs_at_least_once_then_shuts_down_cleanly() {
        let a = Arc::new(new_gossiper("cluster", NodeID(1), 1, HashSet::new()));
        let transport = Arc::new(RecordingTransport::new());
        let handle = spawn_gossip_loop(a, transport, || NodeTime::from_micros(0)).unwrap();
        std::thread::sleep(StdDuration::from_millis(50));
        handle.shutdown();
    }
}
