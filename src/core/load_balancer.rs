use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    net::IpAddr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{config::LoadBalanceStrategy, core::instance::ServiceInstance};

/// Trait defining the interface for load balancing strategies.
///
/// A strategy only ever sees the slice handed to it by the caller, which is
/// taken from a single registry snapshot; it never reads the registry itself.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select one instance, or `None` when the slice is empty.
    /// `client` is the peer address of the inbound request when known.
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        client: Option<IpAddr>,
    ) -> Option<&'a ServiceInstance>;

    /// Config name of the strategy
    fn name(&self) -> &'static str;

    /// A request to `instance_id` started
    fn on_request_start(&self, _instance_id: &str) {}

    /// A request to `instance_id` finished, whatever the outcome
    fn on_request_end(&self, _instance_id: &str) {}

    /// Wrap this strategy in a shareable trait object
    fn shared(self) -> Arc<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Marks one upstream request as in flight for the balancer until dropped.
pub struct InFlightGuard {
    balancer: Arc<dyn LoadBalancingStrategy>,
    instance_id: String,
}

impl InFlightGuard {
    pub fn new(balancer: &Arc<dyn LoadBalancingStrategy>, instance_id: &str) -> Self {
        balancer.on_request_start(instance_id);
        Self {
            balancer: balancer.clone(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.balancer.on_request_end(&self.instance_id);
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    fn next<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        instances.get(count % instances.len())
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        _client: Option<IpAddr>,
    ) -> Option<&'a ServiceInstance> {
        self.next(instances)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Random selection load balancing strategy
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    /// Create a random strategy seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create a random strategy with a fixed seed (reproducible sequences)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        _client: Option<IpAddr>,
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = match self.rng.lock() {
            Ok(mut rng) => rng.random_range(0..instances.len()),
            Err(poisoned) => poisoned.into_inner().random_range(0..instances.len()),
        };
        instances.get(index)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Client affinity by rendezvous hashing of (client IP, instance ID).
///
/// A client keeps its instance while that instance stays in the snapshot;
/// membership changes only move the clients of added or removed instances.
/// Requests without a known client address fall back to round-robin.
#[derive(Default)]
pub struct IpHashStrategy {
    fallback: RoundRobinStrategy,
}

impl IpHashStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

fn affinity_score(client: IpAddr, instance: &ServiceInstance) -> u64 {
    let mut hasher = DefaultHasher::new();
    client.hash(&mut hasher);
    instance.id.hash(&mut hasher);
    hasher.finish()
}

impl LoadBalancingStrategy for IpHashStrategy {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        client: Option<IpAddr>,
    ) -> Option<&'a ServiceInstance> {
        let Some(client) = client else {
            return self.fallback.next(instances);
        };
        instances
            .iter()
            .max_by_key(|instance| affinity_score(client, instance))
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

/// Picks the instance with the fewest requests in flight through this
/// balancer. Ties rotate so idle instances share load evenly.
#[derive(Default)]
pub struct LeastConnectionsStrategy {
    in_flight: Mutex<HashMap<String, usize>>,
    rotation: AtomicUsize,
}

impl LeastConnectionsStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests currently in flight to `instance_id`
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.counts().get(instance_id).copied().unwrap_or(0)
    }
}

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        _client: Option<IpAddr>,
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        let counts = self.counts();
        (0..instances.len())
            .map(|i| &instances[(offset + i) % instances.len()])
            .min_by_key(|instance| counts.get(&instance.id).copied().unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn on_request_start(&self, instance_id: &str) {
        *self.counts().entry(instance_id.to_string()).or_default() += 1;
    }

    fn on_request_end(&self, instance_id: &str) {
        let mut counts = self.counts();
        if let Some(count) = counts.get_mut(instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(instance_id);
            }
        }
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(strategy: LoadBalanceStrategy) -> Arc<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().shared(),
            LoadBalanceStrategy::Random => RandomStrategy::new().shared(),
            LoadBalanceStrategy::IpHash => IpHashStrategy::new().shared(),
            LoadBalanceStrategy::LeastConnections => LeastConnectionsStrategy::new().shared(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn instances(ids: &[&str]) -> Vec<ServiceInstance> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ServiceInstance::new(*id, "svc", "127.0.0.1", 9000 + i as u16))
            .collect()
    }

    #[test]
    fn test_round_robin_strategy() {
        let strategy = RoundRobinStrategy::new();
        let targets = instances(&["a", "b", "c"]);

        let picked: Vec<&str> = (0..4)
            .map(|_| strategy.select(&targets, None).unwrap().id.as_str())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a"]); // Wraps around
    }

    #[test]
    fn test_round_robin_is_exactly_fair_in_sequence() {
        let strategy = RoundRobinStrategy::new();
        let targets = instances(&["a", "b", "c"]);
        let k = 50;

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut previous: Option<String> = None;
        for _ in 0..3 * k {
            let id = strategy.select(&targets, None).unwrap().id.clone();
            if let Some(prev) = &previous {
                let prev_idx = targets.iter().position(|t| &t.id == prev).unwrap();
                assert_eq!(id, targets[(prev_idx + 1) % 3].id, "cyclic order broken");
            }
            *counts.entry(id.clone()).or_default() += 1;
            previous = Some(id);
        }

        assert!(counts.values().all(|c| *c == k));
    }

    #[test]
    fn test_round_robin_concurrent_selection_stays_balanced() {
        let strategy = Arc::new(RoundRobinStrategy::new());
        let targets = Arc::new(instances(&["a", "b", "c", "d"]));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strategy = strategy.clone();
                let targets = targets.clone();
                thread::spawn(move || {
                    let mut counts: HashMap<String, usize> = HashMap::new();
                    for _ in 0..1000 {
                        let id = strategy.select(&targets, None).unwrap().id.clone();
                        *counts.entry(id).or_default() += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (id, count) in handle.join().unwrap() {
                *totals.entry(id).or_default() += count;
            }
        }
        // fetch_add hands out every counter value exactly once
        assert!(totals.values().all(|c| *c == 1000));
    }

    #[test]
    fn test_round_robin_empty_targets() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&[], None).is_none());
    }

    #[test]
    fn test_random_strategy() {
        let strategy = RandomStrategy::with_seed(7);
        let targets = instances(&["a", "b", "c"]);

        for _ in 0..100 {
            let selected = strategy.select(&targets, None).unwrap();
            assert!(targets.contains(selected));
        }
    }

    #[test]
    fn test_random_strategy_is_reproducible_with_seed() {
        let targets = instances(&["a", "b", "c", "d", "e"]);
        let first = RandomStrategy::with_seed(42);
        let second = RandomStrategy::with_seed(42);

        for _ in 0..20 {
            assert_eq!(
                first.select(&targets, None).unwrap().id,
                second.select(&targets, None).unwrap().id
            );
        }
    }

    #[test]
    fn test_random_strategy_empty_targets() {
        let strategy = RandomStrategy::new();
        assert!(strategy.select(&[], None).is_none());
    }

    #[test]
    fn test_load_balancer_factory() {
        let rr_strategy = LoadBalancerFactory::create_strategy(LoadBalanceStrategy::RoundRobin);
        assert_eq!(rr_strategy.name(), "round_robin");

        let random_strategy = LoadBalancerFactory::create_strategy(LoadBalanceStrategy::Random);
        assert_eq!(random_strategy.name(), "random");
        assert!(random_strategy.select(&instances(&["a"]), None).is_some());

        let ip_hash = LoadBalancerFactory::create_strategy(LoadBalanceStrategy::IpHash);
        assert_eq!(ip_hash.name(), "ip_hash");
        let least = LoadBalancerFactory::create_strategy(LoadBalanceStrategy::LeastConnections);
        assert_eq!(least.name(), "least_connections");
    }

    fn ip(n: u8) -> Option<IpAddr> {
        Some(IpAddr::from([10, 0, 0, n]))
    }

    #[test]
    fn test_ip_hash_is_sticky_per_client() {
        let strategy = IpHashStrategy::new();
        let targets = instances(&["a", "b", "c", "d"]);

        for n in 1..=20 {
            let first = strategy.select(&targets, ip(n)).unwrap().id.clone();
            for _ in 0..5 {
                assert_eq!(strategy.select(&targets, ip(n)).unwrap().id, first);
            }
        }
    }

    #[test]
    fn test_ip_hash_spreads_clients() {
        let strategy = IpHashStrategy::new();
        let targets = instances(&["a", "b", "c"]);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for n in 0..=255 {
            *seen
                .entry(strategy.select(&targets, ip(n)).unwrap().id.clone())
                .or_default() += 1;
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_ip_hash_keeps_clients_of_surviving_instances() {
        let strategy = IpHashStrategy::new();
        let all = instances(&["a", "b", "c", "d"]);
        let without_d: Vec<ServiceInstance> =
            all.iter().filter(|i| i.id != "d").cloned().collect();

        for n in 0..=255 {
            let before = strategy.select(&all, ip(n)).unwrap().id.clone();
            if before != "d" {
                assert_eq!(strategy.select(&without_d, ip(n)).unwrap().id, before);
            }
        }
    }

    #[test]
    fn test_ip_hash_without_client_round_robins() {
        let strategy = IpHashStrategy::new();
        let targets = instances(&["a", "b"]);
        let picked: Vec<&str> = (0..4)
            .map(|_| strategy.select(&targets, None).unwrap().id.as_str())
            .collect();
        assert_eq!(picked, vec!["a", "b", "a", "b"]);
        assert!(strategy.select(&[], ip(1)).is_none());
    }

    #[test]
    fn test_least_connections_prefers_idle_instance() {
        let strategy: Arc<dyn LoadBalancingStrategy> = LeastConnectionsStrategy::new().shared();
        let targets = instances(&["a", "b", "c"]);

        let busy_a = InFlightGuard::new(&strategy, "a");
        let busy_b = InFlightGuard::new(&strategy, "b");
        for _ in 0..5 {
            assert_eq!(strategy.select(&targets, None).unwrap().id, "c");
        }

        let busy_c = InFlightGuard::new(&strategy, "c");
        let _busy_c2 = InFlightGuard::new(&strategy, "c");
        drop(busy_a);
        assert_eq!(strategy.select(&targets, None).unwrap().id, "a");
        drop((busy_b, busy_c));
    }

    #[test]
    fn test_least_connections_counts_drop_to_zero() {
        let strategy = LeastConnectionsStrategy::new();
        strategy.on_request_start("a");
        strategy.on_request_start("a");
        assert_eq!(strategy.in_flight("a"), 2);
        strategy.on_request_end("a");
        strategy.on_request_end("a");
        strategy.on_request_end("a");
        assert_eq!(strategy.in_flight("a"), 0);
    }

    #[test]
    fn test_least_connections_rotates_ties() {
        let strategy = LeastConnectionsStrategy::new();
        let targets = instances(&["a", "b", "c"]);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            *seen
                .entry(strategy.select(&targets, None).unwrap().id.clone())
                .or_default() += 1;
        }
        assert!(seen.values().all(|c| *c == 3));
    }
}
