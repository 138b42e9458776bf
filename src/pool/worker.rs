//! Pure prefork bookkeeping: deciding how many workers to spawn or reap
//! given the configured thresholds, kept free of any actual process/fd
//! handling so it is unit-testable without a live subprocess tree.

use crate::config::Config;

/// One live worker's tracked state, as seen by the parent.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    pub pid: i32,
    pub requests_served: u32,
    pub idle: bool,
}

/// How many additional workers the parent should spawn this tick, given
/// `workers`' current idle/busy split and the pool's min/max thresholds:
/// maintain at least `min_spare_servers` idle workers, without exceeding
/// `max_servers` total.
#[must_use]
pub fn spawn_deficit(workers: &[WorkerStatus], config: &Config) -> u32 {
    let total = workers.len() as u32;
    let idle = workers.iter().filter(|w| w.idle).count() as u32;

    let to_reach_min_total = config.min_servers.saturating_sub(total);
    let to_reach_min_spare = config.min_spare_servers.saturating_sub(idle);
    let wanted = to_reach_min_total.max(to_reach_min_spare);

    wanted.min(config.max_servers.saturating_sub(total))
}

/// How many *idle* workers the parent should terminate this tick, given
/// `max_spare_servers`, never dropping below `min_servers` total.
#[must_use]
pub fn reap_surplus(workers: &[WorkerStatus], config: &Config) -> u32 {
    let total = workers.len() as u32;
    let idle = workers.iter().filter(|w| w.idle).count() as u32;

    let surplus_idle = idle.saturating_sub(config.max_spare_servers);
    let floor_room = total.saturating_sub(config.min_servers);
    surplus_idle.min(floor_room)
}

/// Whether a worker should exit after finishing its current connection: a
/// worker serving `max_requests_per_worker` connections exits after the
/// last one.
#[must_use]
pub fn should_retire(requests_served: u32, config: &Config) -> bool {
    config.max_requests_per_worker > 0 && requests_served >= config.max_requests_per_worker
}
