//! Runtime configuration and environment options.
//!
//! Recognized environment variables: `FibreDebugString` (comma-separated
//! categories from the closed set), `FibreStatsSignal` (signal number for
//! zeroing counters, `SIGUSR1` when empty or zero), `FibrePollerCount`,
//! `FibreWorkerCount`, `FibreCpuSet` (`n[-m](,n[-m])*`, binding workers to
//! CPUs; a longer list raises the worker count), and `FibrePrintStats`
//! (non-empty enables the exit dump; leading `t`/`T` adds totals).

use crate::scope::EventScope;
use crate::sched::cluster::PollerKind;
use crate::sched::idle::IdleManagerKind;
use crate::sched::ready_queue::ReadyQueueKind;

/// Tunables fixed at bootstrap.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Input pollers per cluster.
    pub poller_count: usize,
    /// Workers in the main cluster.
    pub worker_count: usize,
    /// CPUs to pin workers to, in worker order.
    pub cpu_set: Vec<usize>,
    /// Idle-manager design.
    pub idle_manager: IdleManagerKind,
    /// Ready-queue backing.
    pub ready_queue: ReadyQueueKind,
    /// Cluster poller deployment.
    pub cluster_poller: PollerKind,
    /// Give every worker a local readiness source (input polling happens
    /// in the scheduling loop; parking becomes a blocking poll).
    pub worker_poller: bool,
    /// Yield once before the first attempt of read-side wrappers.
    pub yield_before_read: bool,
    pub(crate) debug: String,
    pub(crate) stats_signal: Option<i32>,
    pub(crate) print_stats: Option<bool>, // Some(totals)
}

impl RuntimeConfig {
    /// Baseline configuration with explicit poller and worker counts.
    pub fn new(poller_count: usize, worker_count: usize) -> Self {
        Self {
            poller_count,
            worker_count,
            cpu_set: Vec::new(),
            idle_manager: IdleManagerKind::SpinWait,
            ready_queue: ReadyQueueKind::Nemesis,
            cluster_poller: PollerKind::Thread,
            worker_poller: false,
            yield_before_read: false,
            debug: String::new(),
            stats_signal: None,
            print_stats: None,
        }
    }

    /// Applies the recognized environment options on top of this
    /// configuration.
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("FibreDebugString") {
            self.debug = v;
        }
        if let Ok(v) = std::env::var("FibreStatsSignal") {
            let signum = v.trim().parse::<i32>().unwrap_or(0);
            self.stats_signal = Some(if signum == 0 { libc::SIGUSR1 } else { signum });
        }
        if let Ok(v) = std::env::var("FibrePollerCount") {
            if let Ok(n) = v.trim().parse::<usize>() {
                if n > 0 {
                    self.poller_count = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FibreWorkerCount") {
            if let Ok(n) = v.trim().parse::<usize>() {
                if n > 0 {
                    self.worker_count = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FibreCpuSet") {
            self.cpu_set = lepton_core::cpulist::parse(&v);
            if self.cpu_set.len() > self.worker_count {
                self.worker_count = self.cpu_set.len();
            }
        }
        if let Ok(v) = std::env::var("FibrePrintStats") {
            if !v.is_empty() {
                self.print_stats = Some(v.starts_with('t') || v.starts_with('T'));
            }
        }
        self
    }

    /// Selects the idle-manager design.
    pub fn idle_manager(mut self, kind: IdleManagerKind) -> Self {
        self.idle_manager = kind;
        self
    }

    /// Selects the ready-queue backing.
    pub fn ready_queue(mut self, kind: ReadyQueueKind) -> Self {
        self.ready_queue = kind;
        self
    }

    /// Selects the cluster poller deployment.
    pub fn cluster_poller(mut self, kind: PollerKind) -> Self {
        self.cluster_poller = kind;
        self
    }

    /// Enables the worker-local readiness source.
    pub fn worker_poller(mut self, enabled: bool) -> Self {
        self.worker_poller = enabled;
        self
    }

    /// Boots the runtime with this configuration; the calling thread
    /// becomes the first worker.
    pub fn bootstrap(self) -> &'static EventScope {
        EventScope::bootstrap(self)
    }
}
