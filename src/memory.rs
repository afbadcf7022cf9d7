//! Memory accounting for large PDF buffers.
//!
//! Every sizeable buffer the pipeline holds (whole input files, chunk
//! copies, render scratch space) is registered with the [`MemoryManager`]
//! before use and released afterwards. The manager compares the current heap
//! reading against two thresholds:
//!
//! | Level    | Ratio          | Reaction                                     |
//! |----------|----------------|----------------------------------------------|
//! | Normal   | < warning      | nothing                                      |
//! | Warning  | ≥ warning      | light cleanup, chunk processing goes serial  |
//! | Critical | ≥ critical     | aggressive cleanup, pause between chunks     |
//!
//! and refuses any allocation that would push usage past the hard ceiling.
//!
//! Where the reading comes from is pluggable through [`HeapProbe`]:
//! [`TrackedHeap`] counts only what was registered (deterministic, used by
//! default and in tests); [`SystemHeap`] reads the process RSS via `sysinfo`.

use crate::error::MemoryError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

// ── Heap probes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapUsage {
    pub used: u64,
    pub limit: u64,
}

impl HeapUsage {
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            1.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}

/// Source of the current heap reading.
pub trait HeapProbe: Send + Sync {
    /// `tracked` is the byte total currently registered with the manager.
    fn usage(&self, tracked: u64) -> HeapUsage;
}

/// Reports exactly the registered bytes against a fixed limit.
#[derive(Debug, Clone, Copy)]
pub struct TrackedHeap {
    pub limit: u64,
}

impl HeapProbe for TrackedHeap {
    fn usage(&self, tracked: u64) -> HeapUsage {
        HeapUsage {
            used: tracked,
            limit: self.limit,
        }
    }
}

/// Reads the resident memory of this process.
///
/// The limit is `limit` when given, otherwise total system memory.
pub struct SystemHeap {
    system: Mutex<System>,
    pid: Pid,
    limit: Option<u64>,
}

impl SystemHeap {
    pub fn new(limit: Option<u64>) -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        if limit.is_none() {
            system.refresh_memory();
        }
        Self {
            system: Mutex::new(system),
            pid,
            limit,
        }
    }
}

impl HeapProbe for SystemHeap {
    fn usage(&self, tracked: u64) -> HeapUsage {
        let Ok(mut system) = self.system.lock() else {
            return HeapUsage {
                used: tracked,
                limit: self.limit.unwrap_or(u64::MAX),
            };
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]));
        let used = system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(tracked);
        let limit = self.limit.unwrap_or_else(|| system.total_memory());
        HeapUsage { used, limit }
    }
}

// ── Records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc_{}", self.0)
    }
}

/// What a buffer is and whether cleanup may drop its registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationMeta {
    pub kind: String,
    pub can_cleanup: bool,
}

impl AllocationMeta {
    pub fn pinned(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            can_cleanup: false,
        }
    }

    pub fn cleanable(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            can_cleanup: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryAllocation {
    pub id: AllocationId,
    pub size: u64,
    pub kind: String,
    pub can_cleanup: bool,
    pub timestamp: DateTime<Utc>,
    created: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupTier {
    Light,
    Aggressive,
}

pub type CleanupCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    pub buffer_size: usize,
    pub total: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub used: u64,
    pub limit: u64,
    pub usage_ratio: f64,
    pub level: PressureLevel,
    pub tracked_bytes: u64,
    pub allocation_count: usize,
    pub pools: Vec<PoolStats>,
}

// ── Config ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Limit reported by the default [`TrackedHeap`]. Default: 512 MiB.
    pub heap_limit: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    /// Allocations that would exceed `limit × max_usage_ratio` are refused.
    pub max_usage_ratio: f64,
    /// Chunk size for [`MemoryManager::process_large_pdf`]. Default: 1 MiB.
    pub chunk_size: usize,
    /// Chunks processed at once under normal pressure. Default: 3.
    pub max_concurrency: usize,
    /// Pause between chunk waves under critical pressure. Default: 100 ms.
    pub critical_pause: Duration,
    /// Cleanable allocations older than this are dropped by a light cleanup.
    pub light_cleanup_age: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_limit: 512 * 1024 * 1024,
            warning_threshold: 0.8,
            critical_threshold: 0.9,
            max_usage_ratio: 0.95,
            chunk_size: 1024 * 1024,
            max_concurrency: 3,
            critical_pause: Duration::from_millis(100),
            light_cleanup_age: Duration::from_secs(300),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

struct MemoryPool {
    buffer_size: usize,
    total: usize,
    free: Vec<Vec<u8>>,
    allocation: AllocationId,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    allocations: HashMap<AllocationId, MemoryAllocation>,
    pools: HashMap<String, MemoryPool>,
}

impl MemoryState {
    fn tracked(&self) -> u64 {
        self.allocations.values().map(|a| a.size).sum()
    }
}

pub struct MemoryManager {
    config: MemoryConfig,
    probe: Box<dyn HeapProbe>,
    state: Mutex<MemoryState>,
    callbacks: Mutex<Vec<(CleanupTier, CleanupCallback)>>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Manager reading only registered bytes against `config.heap_limit`.
    pub fn new(config: MemoryConfig) -> Self {
        let probe = TrackedHeap {
            limit: config.heap_limit,
        };
        Self::with_probe(config, Box::new(probe))
    }

    pub fn with_probe(config: MemoryConfig, probe: Box<dyn HeapProbe>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(MemoryState::default()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn usage(&self) -> HeapUsage {
        let tracked = self.lock_state().tracked();
        self.probe.usage(tracked)
    }

    pub fn pressure(&self) -> PressureLevel {
        let ratio = self.usage().ratio();
        if ratio >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= self.config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Register `size` bytes.
    ///
    /// Runs the cleanup tier matching the current pressure first, then
    /// refuses the request if it would cross the hard ceiling.
    pub fn allocate_memory(
        &self,
        size: u64,
        meta: AllocationMeta,
    ) -> Result<AllocationId, MemoryError> {
        match self.pressure() {
            PressureLevel::Critical => {
                warn!("Memory pressure critical before allocating {} bytes", size);
                self.aggressive_cleanup();
            }
            PressureLevel::Warning => {
                debug!("Memory pressure high before allocating {} bytes", size);
                self.light_cleanup();
            }
            PressureLevel::Normal => {}
        }

        let mut state = self.lock_state();
        let usage = self.probe.usage(state.tracked());
        let ceiling = (usage.limit as f64 * self.config.max_usage_ratio) as u64;
        if usage.used.saturating_add(size) > ceiling {
            return Err(MemoryError::LimitExceeded {
                requested: size,
                used: usage.used,
                limit: usage.limit,
            });
        }

        state.next_id += 1;
        let id = AllocationId(state.next_id);
        state.allocations.insert(
            id,
            MemoryAllocation {
                id,
                size,
                kind: meta.kind,
                can_cleanup: meta.can_cleanup,
                timestamp: Utc::now(),
                created: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Returns `false` if the id was unknown or already released.
    pub fn release_allocation(&self, id: AllocationId) -> bool {
        self.lock_state().allocations.remove(&id).is_some()
    }

    pub fn allocations(&self) -> Vec<MemoryAllocation> {
        let mut list: Vec<_> = self.lock_state().allocations.values().cloned().collect();
        list.sort_by_key(|a| a.id);
        list
    }

    // ── Cleanup ──

    pub fn register_cleanup_callback(&self, tier: CleanupTier, callback: CleanupCallback) {
        if let Ok(mut cbs) = self.callbacks.lock() {
            cbs.push((tier, callback));
        }
    }

    /// Drop cleanable registrations older than `light_cleanup_age` and run
    /// the light-tier callbacks. Returns the bytes released.
    pub fn light_cleanup(&self) -> u64 {
        let age = self.config.light_cleanup_age;
        let freed = self.evict(|a| a.can_cleanup && a.created.elapsed() >= age);
        self.run_callbacks(CleanupTier::Light);
        debug!("Light memory cleanup released {} bytes", freed);
        freed
    }

    /// Drop every cleanable registration and run the aggressive-tier
    /// callbacks. Returns the bytes released.
    pub fn aggressive_cleanup(&self) -> u64 {
        let freed = self.evict(|a| a.can_cleanup);
        self.run_callbacks(CleanupTier::Aggressive);
        info!("Aggressive memory cleanup released {} bytes", freed);
        freed
    }

    fn evict(&self, pred: impl Fn(&MemoryAllocation) -> bool) -> u64 {
        let mut state = self.lock_state();
        let doomed: Vec<AllocationId> = state
            .allocations
            .values()
            .filter(|a| pred(a))
            .map(|a| a.id)
            .collect();
        doomed
            .iter()
            .filter_map(|id| state.allocations.remove(id))
            .map(|a| a.size)
            .sum()
    }

    fn run_callbacks(&self, tier: CleanupTier) {
        let selected: Vec<CleanupCallback> = match self.callbacks.lock() {
            Ok(cbs) => cbs
                .iter()
                .filter(|(t, _)| *t == tier)
                .map(|(_, cb)| cb.clone())
                .collect(),
            Err(_) => return,
        };
        for cb in selected {
            cb();
        }
    }

    // ── Pools ──

    /// Pre-allocate `count` zeroed buffers of `buffer_size` bytes.
    pub fn create_memory_pool(
        &self,
        name: &str,
        buffer_size: usize,
        count: usize,
    ) -> Result<(), MemoryError> {
        if self.lock_state().pools.contains_key(name) {
            return Err(MemoryError::PoolExists(name.to_string()));
        }
        let bytes = (buffer_size as u64).saturating_mul(count as u64);
        let allocation = self.allocate_memory(bytes, AllocationMeta::pinned(format!("pool:{name}")))?;

        let mut state = self.lock_state();
        if state.pools.contains_key(name) {
            state.allocations.remove(&allocation);
            return Err(MemoryError::PoolExists(name.to_string()));
        }
        state.pools.insert(
            name.to_string(),
            MemoryPool {
                buffer_size,
                total: count,
                free: (0..count).map(|_| vec![0u8; buffer_size]).collect(),
                allocation,
            },
        );
        Ok(())
    }

    /// Take a buffer. `None` when the pool is unknown or exhausted.
    pub fn get_pool_buffer(&self, name: &str) -> Option<Vec<u8>> {
        self.lock_state().pools.get_mut(name)?.free.pop()
    }

    /// Give a buffer back, zeroed. Buffers of the wrong size or beyond the
    /// pool's capacity are refused.
    pub fn return_pool_buffer(&self, name: &str, mut buffer: Vec<u8>) -> bool {
        let mut state = self.lock_state();
        let Some(pool) = state.pools.get_mut(name) else {
            return false;
        };
        if buffer.len() != pool.buffer_size || pool.free.len() >= pool.total {
            return false;
        }
        buffer.fill(0);
        pool.free.push(buffer);
        true
    }

    pub fn destroy_memory_pool(&self, name: &str) -> bool {
        let mut state = self.lock_state();
        match state.pools.remove(name) {
            Some(pool) => {
                state.allocations.remove(&pool.allocation);
                true
            }
            None => false,
        }
    }

    // ── Chunked processing ──

    /// Split `data` into `chunk_size` pieces and run `processor` on each,
    /// adapting parallelism to memory pressure. Results come back in chunk
    /// order; the first failing chunk fails the whole call.
    pub async fn process_large_pdf<T, E, F, Fut>(
        &self,
        data: &[u8],
        processor: F,
    ) -> Result<Vec<T>, MemoryError>
    where
        F: Fn(usize, Vec<u8>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let total = data.len().div_ceil(chunk_size);
        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut chunks = data.chunks(chunk_size).map(<[u8]>::to_vec).enumerate().peekable();
        let processor = &processor;

        while chunks.peek().is_some() {
            let width = match self.pressure() {
                PressureLevel::Normal => self.config.max_concurrency.max(1),
                PressureLevel::Warning => 1,
                PressureLevel::Critical => {
                    self.aggressive_cleanup();
                    tokio::time::sleep(self.config.critical_pause).await;
                    1
                }
            };

            let wave = chunks.by_ref().take(width).map(|(index, chunk)| async move {
                let id = self.allocate_memory(chunk.len() as u64, AllocationMeta::pinned("pdf_chunk"))?;
                let outcome = processor(index, chunk).await;
                self.release_allocation(id);
                outcome
                    .map(|v| (index, v))
                    .map_err(|e| MemoryError::ChunkFailed {
                        index,
                        detail: e.to_string(),
                    })
            });

            for r in join_all(wave).await {
                let (index, value) = r?;
                results[index] = Some(value);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let state = self.lock_state();
        let tracked = state.tracked();
        let usage = self.probe.usage(tracked);
        let ratio = usage.ratio();
        let level = if ratio >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= self.config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        };
        let mut pools: Vec<PoolStats> = state
            .pools
            .iter()
            .map(|(name, p)| PoolStats {
                name: name.clone(),
                buffer_size: p.buffer_size,
                total: p.total,
                available: p.free.len(),
            })
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        MemoryStats {
            used: usage.used,
            limit: usage.limit,
            usage_ratio: ratio,
            level,
            tracked_bytes: tracked,
            allocation_count: state.allocations.len(),
            pools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(limit: u64) -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            heap_limit: limit,
            chunk_size: 4,
            critical_pause: Duration::from_millis(1),
            light_cleanup_age: Duration::ZERO,
            ..MemoryConfig::default()
        })
    }

    #[test]
    fn allocation_past_ceiling_refused() {
        let m = manager(1000);
        let a = m.allocate_memory(900, AllocationMeta::pinned("file")).unwrap();
        let err = m.allocate_memory(100, AllocationMeta::pinned("file")).unwrap_err();
        assert!(matches!(err, MemoryError::LimitExceeded { requested: 100, used: 900, limit: 1000 }));
        assert!(m.release_allocation(a));
        assert!(!m.release_allocation(a));
        assert!(m.allocate_memory(100, AllocationMeta::pinned("file")).is_ok());
    }

    #[test]
    fn pressure_levels() {
        let m = manager(1000);
        assert_eq!(m.pressure(), PressureLevel::Normal);
        let a = m.allocate_memory(800, AllocationMeta::pinned("x")).unwrap();
        assert_eq!(m.pressure(), PressureLevel::Warning);
        m.allocate_memory(100, AllocationMeta::pinned("y")).unwrap();
        assert_eq!(m.pressure(), PressureLevel::Critical);
        m.release_allocation(a);
        assert_eq!(m.pressure(), PressureLevel::Normal);
    }

    #[test]
    fn critical_pressure_evicts_cleanable() {
        let m = manager(1000);
        m.allocate_memory(900, AllocationMeta::cleanable("cache")).unwrap();
        // Critical before this call; the cache registration is dropped.
        m.allocate_memory(500, AllocationMeta::pinned("file")).unwrap();
        assert_eq!(m.memory_stats().tracked_bytes, 500);
    }

    #[test]
    fn cleanup_callbacks_run_per_tier() {
        let m = manager(1000);
        let light = Arc::new(AtomicUsize::new(0));
        let heavy = Arc::new(AtomicUsize::new(0));
        let l = light.clone();
        let h = heavy.clone();
        m.register_cleanup_callback(CleanupTier::Light, Arc::new(move || {
            l.fetch_add(1, Ordering::SeqCst);
        }));
        m.register_cleanup_callback(CleanupTier::Aggressive, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        m.allocate_memory(10, AllocationMeta::cleanable("a")).unwrap();
        m.allocate_memory(20, AllocationMeta::pinned("b")).unwrap();
        assert_eq!(m.light_cleanup(), 10);
        assert_eq!(light.load(Ordering::SeqCst), 1);
        assert_eq!(heavy.load(Ordering::SeqCst), 0);
        assert_eq!(m.aggressive_cleanup(), 0);
        assert_eq!(heavy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn light_cleanup_respects_age() {
        let m = MemoryManager::new(MemoryConfig {
            heap_limit: 1000,
            light_cleanup_age: Duration::from_secs(3600),
            ..MemoryConfig::default()
        });
        m.allocate_memory(10, AllocationMeta::cleanable("fresh")).unwrap();
        assert_eq!(m.light_cleanup(), 0);
        assert_eq!(m.aggressive_cleanup(), 10);
    }

    #[test]
    fn pools_hand_out_and_take_back() {
        let m = manager(10_000);
        m.create_memory_pool("pages", 16, 2).unwrap();
        assert!(matches!(
            m.create_memory_pool("pages", 16, 2),
            Err(MemoryError::PoolExists(_))
        ));
        assert_eq!(m.memory_stats().tracked_bytes, 32);

        let mut a = m.get_pool_buffer("pages").unwrap();
        let b = m.get_pool_buffer("pages").unwrap();
        assert!(m.get_pool_buffer("pages").is_none());
        assert!(m.get_pool_buffer("missing").is_none());

        a[0] = 7;
        assert!(m.return_pool_buffer("pages", a));
        assert!(!m.return_pool_buffer("pages", vec![0u8; 3]));
        assert!(m.return_pool_buffer("pages", b));
        assert!(!m.return_pool_buffer("pages", vec![0u8; 16]));

        let again = m.get_pool_buffer("pages").unwrap();
        assert!(again.iter().all(|&x| x == 0));

        let stats = m.memory_stats();
        assert_eq!(stats.pools[0].available, 1);
        assert!(m.destroy_memory_pool("pages"));
        assert_eq!(m.memory_stats().tracked_bytes, 0);
    }

    #[tokio::test]
    async fn large_pdf_processed_in_order() {
        let m = manager(10_000);
        let data: Vec<u8> = (0u8..10).collect();
        let out = m
            .process_large_pdf(&data, |i, chunk| async move {
                Ok::<_, String>((i, chunk.len()))
            })
            .await
            .unwrap();
        assert_eq!(out, vec![(0, 4), (1, 4), (2, 2)]);
        assert_eq!(m.memory_stats().allocation_count, 0);
    }

    #[tokio::test]
    async fn large_pdf_chunk_failure_surfaces() {
        let m = manager(10_000);
        let data = vec![1u8; 12];
        let err = m
            .process_large_pdf(&data, |i, _chunk| async move {
                if i == 1 {
                    Err("bad chunk")
                } else {
                    Ok(i)
                }
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MemoryError::ChunkFailed {
                index: 1,
                detail: "bad chunk".into()
            }
        );
    }

    #[test]
    fn tracked_heap_ratio() {
        let probe = TrackedHeap { limit: 200 };
        assert_eq!(probe.usage(50).ratio(), 0.25);
        assert_eq!(HeapUsage { used: 1, limit: 0 }.ratio(), 1.0);
    }
}
