//! gc.rs
//! Per-stream trim watermarks and the background collector that reclaims
//! cache space once every interested stream has trimmed past an address.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::cache::EntryCache;
use crate::entry::{Address, StreamId};

/// Highest address known trimmed, per stream. Watermarks only ever rise;
/// applying a smaller prefix than the current one is a no-op.
#[derive(Default)]
pub struct TrimMap {
    marks: parking_lot::RwLock<BTreeMap<StreamId, Address>>,
}

impl TrimMap {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn trim(&self, stream: StreamId, prefix: Address) {
        let mut marks = self.marks.write();
        let mark = marks.entry(stream).or_insert(prefix);
        if *mark < prefix {
            *mark = prefix;
        }
        debug!("trim[{}] watermark now {}", stream, *mark);
    }

    pub fn mark(&self, stream: StreamId) -> Option<Address> {
        self.marks.read().get(&stream).copied()
    }

    /// True iff every one of `streams` has a watermark at or above
    /// `address`. An empty set is never covered.
    pub fn covers(&self, streams: &BTreeSet<StreamId>, address: Address) -> bool {
        if streams.is_empty() {
            return false;
        }

        let marks = self.marks.read();
        streams
            .iter()
            .all(|stream| matches!(marks.get(stream), Some(&mark) if mark >= address))
    }

    pub fn clear(&self) {
        self.marks.write().clear();
    }
}

/// One collection pass: scan resident addresses in ascending order and
/// invalidate every entry all of whose streams have trimmed past it.
/// Entries with an empty stream set belong to all streams and are never
/// reclaimed here. Per-entry disappearance mid-pass means "already gone".
pub(crate) async fn gc_pass(cache: &EntryCache, trims: &TrimMap) -> u64 {
    info!("garbage collector starting ...");
    let mut freed = 0u64;

    for address in cache.resident_addresses() {
        let Some(entry) = cache.peek(address) else {
            continue;
        };

        if entry.streams.is_empty() {
            continue;
        }

        if trims.covers(&entry.streams, address) {
            trace!("trimming entry at {}", address);
            if cache.invalidate(address).await {
                freed += 1;
            }
        }
    }

    info!("garbage collection pass complete, freed {} entries", freed);
    freed
}

/// The dedicated background loop. Runs a pass every interval; the wait is
/// interruptible for an immediate pass, the interval is reconfigurable at
/// runtime, and stopping halts the loop for good.
pub struct GarbageCollector {
    cache: Arc<EntryCache>,
    trims: Arc<TrimMap>,

    interval: Arc<parking_lot::Mutex<Duration>>,
    force_notify: Arc<Notify>,
    interval_notify: Arc<Notify>,

    stop_ch: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
}

impl GarbageCollector {
    pub fn new(cache: Arc<EntryCache>, trims: Arc<TrimMap>, interval: Duration) -> Self {
        Self {
            cache,
            trims,
            interval: Arc::new(parking_lot::Mutex::new(interval)),
            force_notify: Arc::new(Notify::new()),
            interval_notify: Arc::new(Notify::new()),
            stop_ch: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut stop_ch = self.stop_ch.lock();
        if stop_ch.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(1);
        stop_ch.replace(tx);

        let cache = self.cache.clone();
        let trims = self.trims.clone();
        let interval = self.interval.clone();
        let force_notify = self.force_notify.clone();
        let interval_notify = self.interval_notify.clone();

        tokio::spawn(async move {
            let make_ticker = |period: Duration| {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            };

            let mut ticker = make_ticker(*interval.lock());

            loop {
                select! {
                    _ = rx.recv() => {
                        info!("garbage collector stopped ...");
                        return;
                    }

                    _ = ticker.tick() => {
                        gc_pass(&cache, &trims).await;
                    }

                    _ = force_notify.notified() => {
                        gc_pass(&cache, &trims).await;
                        ticker = make_ticker(*interval.lock());
                    }

                    _ = interval_notify.notified() => {
                        ticker = make_ticker(*interval.lock());
                    }
                }
            }
        });
    }

    /// Reconfigure the periodic scan interval. Takes effect immediately,
    /// without running a pass.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
        self.interval_notify.notify_one();
    }

    /// Interrupt the current wait and run a pass now.
    pub fn force(&self) {
        self.force_notify.notify_one();
    }

    /// Run one pass inline and return the freed entry count.
    pub async fn run_pass(&self) -> u64 {
        gc_pass(&self.cache, &self.trims).await
    }

    /// Halt the background loop. Idempotent.
    pub async fn stop(&self) {
        let tx = self.stop_ch.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::WritePolicy;
    use crate::entry::{LogEntry, MetadataMap};
    use crate::log::MemLog;

    fn entry(address: Address, streams: &[StreamId]) -> LogEntry {
        LogEntry::new(
            address,
            Bytes::from_static(b"payload"),
            MetadataMap::new(),
            streams.iter().copied().collect(),
        )
    }

    fn cache() -> Arc<EntryCache> {
        Arc::new(EntryCache::new(
            Arc::new(MemLog::new()),
            WritePolicy::WriteThrough,
            1 << 20,
        ))
    }

    #[test]
    fn test_trim_is_monotonic() {
        let trims = TrimMap::new();
        let s = StreamId(1);

        trims.trim(s, 5);
        trims.trim(s, 3);
        assert_eq!(trims.mark(s), Some(5));

        trims.trim(s, 9);
        assert_eq!(trims.mark(s), Some(9));
    }

    #[test]
    fn test_covers_requires_every_stream() {
        let trims = TrimMap::new();
        let (s1, s2) = (StreamId(1), StreamId(2));
        let both: BTreeSet<StreamId> = [s1, s2].into_iter().collect();

        trims.trim(s1, 10);
        assert!(!trims.covers(&both, 5));

        trims.trim(s2, 4);
        assert!(!trims.covers(&both, 5));

        trims.trim(s2, 5);
        assert!(trims.covers(&both, 5));

        assert!(!trims.covers(&BTreeSet::new(), 0));
    }

    #[tokio::test]
    async fn test_pass_respects_watermarks() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());
        let (s1, s2) = (StreamId(1), StreamId(2));

        for address in 1..=4u64 {
            c.put(entry(address, &[s1])).await.unwrap();
        }
        c.put(entry(5, &[s1, s2])).await.unwrap();

        trims.trim(s1, 3);
        let freed = gc_pass(&c, &trims).await;

        // 1..=3 belong solely to s1 and are below its watermark
        assert_eq!(freed, 3);
        assert!(c.peek(1).is_none());
        assert!(c.peek(2).is_none());
        assert!(c.peek(3).is_none());
        assert!(c.peek(4).is_some());
        // 5 waits for s2
        assert!(c.peek(5).is_some());

        trims.trim(s1, 5);
        trims.trim(s2, 5);
        let freed = gc_pass(&c, &trims).await;
        assert_eq!(freed, 2);
    }

    #[tokio::test]
    async fn test_streamless_entries_are_immune() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());

        c.put(entry(1, &[])).await.unwrap();
        trims.trim(StreamId(1), 100);

        let freed = gc_pass(&c, &trims).await;
        assert_eq!(freed, 0);
        assert!(c.peek(1).is_some());
    }

    #[tokio::test]
    async fn test_reclaimed_address_reads_as_durable_copy() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());
        let s = StreamId(1);

        c.put(entry(1, &[s])).await.unwrap();
        trims.trim(s, 1);
        gc_pass(&c, &trims).await;
        assert!(c.peek(1).is_none());

        // trimming reclaims residency, not the durable record; a rewrite
        // of the address finds it still occupied and the read reloads it
        let err = c.put(entry(1, &[s])).await.unwrap_err();
        assert!(err.downcast_ref::<crate::cache::CacheError>().is_some());

        let got = c.get(1).await.unwrap().unwrap();
        assert_eq!(got.payload.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_force_wakes_the_loop() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());
        let s = StreamId(1);

        c.put(entry(1, &[s])).await.unwrap();
        trims.trim(s, 1);

        let gc = GarbageCollector::new(c.clone(), trims.clone(), Duration::from_secs(3600));
        gc.start();

        // the first periodic tick is an hour away; force an immediate pass
        gc.force();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(c.peek(1).is_none());
        gc.stop().await;
    }

    #[tokio::test]
    async fn test_stop_halts_collection() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());
        let s = StreamId(1);

        let gc = GarbageCollector::new(c.clone(), trims.clone(), Duration::from_millis(50));
        gc.start();
        gc.stop().await;

        c.put(entry(1, &[s])).await.unwrap();
        trims.trim(s, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // no pass ran after stop
        assert!(c.peek(1).is_some());
    }

    #[tokio::test]
    async fn test_set_interval_reschedules() {
        let c = cache();
        let trims = Arc::new(TrimMap::new());
        let s = StreamId(1);

        c.put(entry(1, &[s])).await.unwrap();
        trims.trim(s, 1);

        let gc = GarbageCollector::new(c.clone(), trims.clone(), Duration::from_secs(3600));
        gc.start();

        gc.set_interval(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(c.peek(1).is_none());
        gc.stop().await;
    }
}
