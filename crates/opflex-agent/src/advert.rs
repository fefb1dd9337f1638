//! Advertisement Manager (C13): gratuitous-ARP/ND and router/RARP
//! advertisement scheduling for newly-rendered endpoints and virtual
//! routers (spec.md section 4.13).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

const ENDPOINT_ADV_REPEAT: u32 = 5;
const ENDPOINT_ADV_JITTER_MIN: Duration = Duration::from_millis(250);
const ENDPOINT_ADV_JITTER_MAX: Duration = Duration::from_millis(1000);
const ROUTER_ADV_INITIAL_BURST: u32 = 3;

/// How an endpoint/router advertisement is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Disabled,
    GratuitousUnicast,
    GratuitousBroadcast,
    RouterRequest,
    RarpBroadcast,
}

fn jittered(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

struct PendingEndpointAdv {
    next_fire: Instant,
    repeat_remaining: u32,
}

struct RouterAdvState {
    interval: Duration,
    next_fire: Instant,
    burst_remaining: u32,
}

/// One fired endpoint advertisement, ready for the packet-out path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAdvEvent {
    pub uuid: String,
    pub mode: Mode,
}

/// One fired router advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvEvent {
    pub virtual_router: String,
}

/// Tracks the per-endpoint and per-virtual-router advertisement timers.
/// Pure clock-driven state: callers advance it with `tick(now)` from the
/// agent loop's timer and render/send whatever comes back.
pub struct AdvertisementManager {
    mode: Mode,
    pending_eps: HashMap<String, PendingEndpointAdv>,
    router_advs: HashMap<String, RouterAdvState>,
}

impl AdvertisementManager {
    pub fn new(mode: Mode) -> Self {
        Self { mode, pending_eps: HashMap::new(), router_advs: HashMap::new() }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// `scheduleEndpointAdv(uuid)`: (re-)arms a 5-shot jittered burst.
    /// A no-op if advertisements are disabled.
    pub fn schedule_endpoint_adv(&mut self, uuid: impl Into<String>, now: Instant) {
        if self.mode == Mode::Disabled {
            return;
        }
        self.pending_eps.insert(
            uuid.into(),
            PendingEndpointAdv {
                next_fire: now + jittered(ENDPOINT_ADV_JITTER_MIN, ENDPOINT_ADV_JITTER_MAX),
                repeat_remaining: ENDPOINT_ADV_REPEAT,
            },
        );
    }

    /// Endpoint removal cancels any pending burst for it.
    pub fn cancel_endpoint_adv(&mut self, uuid: &str) {
        self.pending_eps.remove(uuid);
    }

    pub fn is_endpoint_adv_pending(&self, uuid: &str) -> bool {
        self.pending_eps.contains_key(uuid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_eps.len()
    }

    /// Registers (or re-registers) a virtual router's steady-state
    /// advertisement interval, starting the initial 3x jittered burst.
    pub fn register_router(&mut self, virtual_router: impl Into<String>, interval: Duration, now: Instant) {
        self.router_advs.insert(
            virtual_router.into(),
            RouterAdvState {
                interval,
                next_fire: now + jittered(ENDPOINT_ADV_JITTER_MIN, ENDPOINT_ADV_JITTER_MAX),
                burst_remaining: ROUTER_ADV_INITIAL_BURST,
            },
        );
    }

    pub fn unregister_router(&mut self, virtual_router: &str) {
        self.router_advs.remove(virtual_router);
    }

    /// Advances every timer to `now`, returning what fired. Endpoint
    /// entries that exhaust their repeat count are removed; router
    /// entries fall back to their steady interval once the initial burst
    /// is spent.
    pub fn tick(&mut self, now: Instant) -> (Vec<EndpointAdvEvent>, Vec<RouterAdvEvent>) {
        let mut ep_events = Vec::new();
        let mut exhausted = Vec::new();
        for (uuid, pending) in self.pending_eps.iter_mut() {
            if pending.next_fire > now {
                continue;
            }
            ep_events.push(EndpointAdvEvent { uuid: uuid.clone(), mode: self.mode });
            pending.repeat_remaining -= 1;
            if pending.repeat_remaining == 0 {
                exhausted.push(uuid.clone());
            } else {
                pending.next_fire = now + jittered(ENDPOINT_ADV_JITTER_MIN, ENDPOINT_ADV_JITTER_MAX);
            }
        }
        for uuid in exhausted {
            self.pending_eps.remove(&uuid);
        }

        let mut router_events = Vec::new();
        for (vr, state) in self.router_advs.iter_mut() {
            if state.next_fire > now {
                continue;
            }
            router_events.push(RouterAdvEvent { virtual_router: vr.clone() });
            if state.burst_remaining > 0 {
                state.burst_remaining -= 1;
            }
            state.next_fire = now
                + if state.burst_remaining > 0 {
                    jittered(ENDPOINT_ADV_JITTER_MIN, ENDPOINT_ADV_JITTER_MAX)
                } else {
                    state.interval
                };
        }

        (ep_events, router_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_adv_fires_five_times_then_stops() {
        let mut mgr = AdvertisementManager::new(Mode::GratuitousUnicast);
        let start = Instant::now();
        mgr.schedule_endpoint_adv("ep0", start);

        let mut fired = 0;
        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_millis(1000);
            let (ep_events, _) = mgr.tick(now);
            fired += ep_events.len();
            if !mgr.is_endpoint_adv_pending("ep0") {
                break;
            }
        }
        assert_eq!(fired, 5);
        assert!(!mgr.is_endpoint_adv_pending("ep0"));
    }

    #[test]
    fn test_disabled_mode_does_not_schedule() {
        let mut mgr = AdvertisementManager::new(Mode::Disabled);
        mgr.schedule_endpoint_adv("ep0", Instant::now());
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_cancel_removes_pending_entry() {
        let mut mgr = AdvertisementManager::new(Mode::GratuitousBroadcast);
        let now = Instant::now();
        mgr.schedule_endpoint_adv("ep0", now);
        assert!(mgr.is_endpoint_adv_pending("ep0"));
        mgr.cancel_endpoint_adv("ep0");
        assert!(!mgr.is_endpoint_adv_pending("ep0"));
    }

    #[test]
    fn test_router_adv_burst_then_falls_back_to_interval() {
        let mut mgr = AdvertisementManager::new(Mode::RouterRequest);
        let start = Instant::now();
        mgr.register_router("vr0", Duration::from_secs(60), start);

        let mut fired = 0;
        let mut now = start;
        for _ in 0..3 {
            now += Duration::from_millis(1000);
            let (_, router_events) = mgr.tick(now);
            fired += router_events.len();
        }
        assert_eq!(fired, 3, "initial burst fires exactly 3 times");

        // No further fire until the steady interval elapses.
        now += Duration::from_millis(1000);
        let (_, router_events) = mgr.tick(now);
        assert!(router_events.is_empty());
    }
}
