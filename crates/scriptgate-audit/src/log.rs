//! The append-only audit log
//!
//! Appends serialize on one mutex so sequence numbers are gap-free and the
//! hash chain never forks. State advances only after the sink confirms a
//! write: a failed append leaves the log exactly as it was.

use crate::error::AuditError;
use crate::event::{AuditEvent, AuditEventKind, NewEvent, GENESIS_HASH};
use crate::sink::{AuditSink, MemorySink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scriptgate_model::Fingerprint;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct ChainHead {
    last_seq: u64,
    last_hash: String,
}

/// Append-only, hash-chained audit log
#[derive(Debug)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    head: Mutex<ChainHead>,
}

impl AuditLog {
    /// Open a log over `sink`, resuming its sequence and hash chain
    ///
    /// # Errors
    /// Returns error if the sink's last event cannot be read
    pub fn open(sink: Arc<dyn AuditSink>) -> Result<Self, AuditError> {
        let head = match sink.last()? {
            Some(event) => ChainHead {
                last_seq: event.seq,
                last_hash: event.hash,
            },
            None => ChainHead {
                last_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        };
        tracing::debug!(last_seq = head.last_seq, "audit log opened");
        Ok(Self {
            sink,
            head: Mutex::new(head),
        })
    }

    /// Log backed by memory only
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            sink: Arc::new(MemorySink::new()),
            head: Mutex::new(ChainHead {
                last_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    /// Append one event
    ///
    /// # Errors
    /// Returns [`AuditError::SinkFailure`] if the sink did not record the
    /// event; callers must then fail the operation that produced it.
    pub fn append(&self, new: NewEvent) -> Result<AuditEvent, AuditError> {
        let mut head = self.head.lock();
        let mut event = AuditEvent {
            seq: head.last_seq + 1,
            timestamp: Utc::now(),
            kind: new.kind,
            correlation_id: new.correlation_id,
            policy: new.policy,
            payload: new.payload,
            prev_hash: head.last_hash.clone(),
            hash: String::new(),
        };
        event.hash = event.compute_hash()?;

        if let Err(err) = self.sink.write(&event) {
            tracing::error!(seq = event.seq, kind = %event.kind, %err, "audit append failed");
            metrics::counter!("scriptgate_audit_failures_total").increment(1);
            return Err(err);
        }

        head.last_seq = event.seq;
        head.last_hash.clone_from(&event.hash);
        metrics::counter!("scriptgate_audit_events_total", "kind" => event.kind.as_str()).increment(1);
        Ok(event)
    }

    /// Highest committed sequence number
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.head.lock().last_seq
    }

    /// Events matching `filter`, bounded at what is committed right now
    #[must_use]
    pub fn query(&self, filter: AuditFilter) -> AuditQuery {
        AuditQuery {
            sink: Arc::clone(&self.sink),
            upto: self.last_seq(),
            filter,
        }
    }

    /// Check sequence continuity and the hash chain from the first event
    ///
    /// Returns the number of events verified.
    ///
    /// # Errors
    /// Returns [`AuditError::Integrity`] at the first broken link
    pub fn verify_integrity(&self) -> Result<u64, AuditError> {
        let upto = self.last_seq();
        let mut expected_seq = 1u64;
        let mut prev_hash = GENESIS_HASH.to_string();

        for event in self.sink.read()? {
            let event = event?;
            if event.seq > upto {
                break;
            }
            if event.seq != expected_seq {
                return Err(AuditError::Integrity {
                    seq: event.seq,
                    reason: format!("expected seq {expected_seq}"),
                });
            }
            if event.prev_hash != prev_hash {
                return Err(AuditError::Integrity {
                    seq: event.seq,
                    reason: "prev_hash does not match previous event".into(),
                });
            }
            if event.compute_hash()? != event.hash {
                return Err(AuditError::Integrity {
                    seq: event.seq,
                    reason: "content does not match its hash".into(),
                });
            }
            prev_hash = event.hash;
            expected_seq += 1;
        }
        Ok(expected_seq - 1)
    }

    /// Event counts by kind
    ///
    /// # Errors
    /// Returns error if the sink cannot be read
    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let mut stats = AuditStats {
            last_seq: self.last_seq(),
            ..AuditStats::default()
        };
        for event in self.query(AuditFilter::default()).iter()? {
            let event = event?;
            stats.total += 1;
            *stats.by_kind.entry(event.kind).or_default() += 1;
        }
        Ok(stats)
    }
}

/// Selection criteria for [`AuditLog::query`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    /// Only events for this fingerprint
    pub correlation_id: Option<Fingerprint>,
    /// Only these kinds (empty = all)
    pub kinds: Vec<AuditEventKind>,
    /// Not before
    pub since: Option<DateTime<Utc>>,
    /// Not after
    pub until: Option<DateTime<Utc>>,
    /// At most this many events
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Everything
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one fingerprint
    #[must_use]
    pub fn correlation(mut self, fingerprint: Fingerprint) -> Self {
        self.correlation_id = Some(fingerprint);
        self
    }

    /// Add a kind
    #[must_use]
    pub fn kind(mut self, kind: AuditEventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restrict to a time window
    #[must_use]
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Cap the result count
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every criterion
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.correlation_id
            .as_ref()
            .map_or(true, |id| event.correlation_id.as_ref() == Some(id))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
    }
}

/// A finite, restartable view over committed events
///
/// The bound is fixed when the query is created: events appended later
/// never show up, however many times [`AuditQuery::iter`] is called.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    sink: Arc<dyn AuditSink>,
    upto: u64,
    filter: AuditFilter,
}

impl AuditQuery {
    /// Highest sequence number this query can yield
    #[must_use]
    pub fn upto(&self) -> u64 {
        self.upto
    }

    /// Start a fresh pass over the matching events
    ///
    /// # Errors
    /// Returns error if the sink cannot be opened
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<AuditEvent, AuditError>> + '_, AuditError> {
        let upto = self.upto;
        let filter = &self.filter;
        let iter = self
            .sink
            .read()?
            .take_while(move |event| event.as_ref().map_or(true, |e| e.seq <= upto))
            .filter(move |event| event.as_ref().map_or(true, |e| filter.matches(e)))
            .take(filter.limit.unwrap_or(usize::MAX));
        Ok(iter)
    }

    /// Collect every matching event
    ///
    /// # Errors
    /// Returns the first read error
    pub fn collect(&self) -> Result<Vec<AuditEvent>, AuditError> {
        self.iter()?.collect()
    }
}

/// Counts reported by [`AuditLog::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Events read
    pub total: u64,
    /// Highest committed sequence number
    pub last_seq: u64,
    /// Events per kind
    pub by_kind: BTreeMap<AuditEventKind, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditPayload;
    use crate::sink::JsonlFileSink;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_str(&hex_of(byte)).unwrap()
    }

    fn hex_of(byte: u8) -> String {
        format!("{byte:02x}").repeat(32)
    }

    fn cache_event(origin: &str) -> NewEvent {
        NewEvent::new(
            AuditEventKind::CacheMiss,
            AuditPayload::Cache {
                origin: origin.into(),
            },
        )
    }

    #[derive(Debug, Default)]
    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn write(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::sink("disk full"))
        }

        fn read(&self) -> Result<crate::sink::EventIter<'_>, AuditError> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn append_assigns_monotonic_seq_and_chains_hashes() {
        let log = AuditLog::in_memory();
        let a = log.append(cache_event("one")).unwrap();
        let b = log.append(cache_event("two")).unwrap();

        assert_eq!((a.seq, b.seq), (1, 2));
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(log.verify_integrity().unwrap(), 2);
    }

    #[test]
    fn sink_failure_does_not_advance() {
        let log = AuditLog::open(Arc::new(BrokenSink)).unwrap();
        let err = log.append(cache_event("x")).unwrap_err();
        assert!(err.is_sink_failure());
        assert_eq!(log.last_seq(), 0);
    }

    #[test]
    fn query_filters_by_correlation_and_kind() {
        let log = AuditLog::in_memory();
        log.append(cache_event("a").correlated(fp(1))).unwrap();
        log.append(NewEvent::error(AuditEventKind::Error, "boom").correlated(fp(1)))
            .unwrap();
        log.append(cache_event("b").correlated(fp(2))).unwrap();

        let by_id = log.query(AuditFilter::all().correlation(fp(1))).collect().unwrap();
        assert_eq!(by_id.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

        let by_kind = log
            .query(AuditFilter::all().kind(AuditEventKind::CacheMiss))
            .collect()
            .unwrap();
        assert_eq!(by_kind.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 3]);

        let limited = log.query(AuditFilter::all().limit(1)).collect().unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn query_is_bounded_and_restartable() {
        let log = AuditLog::in_memory();
        log.append(cache_event("a")).unwrap();
        let query = log.query(AuditFilter::all());
        log.append(cache_event("b")).unwrap();

        assert_eq!(query.upto(), 1);
        assert_eq!(query.collect().unwrap().len(), 1);
        // a second pass yields the same finite sequence
        assert_eq!(query.collect().unwrap().len(), 1);
        assert_eq!(log.query(AuditFilter::all()).collect().unwrap().len(), 2);
    }

    #[test]
    fn time_range_filter() {
        let log = AuditLog::in_memory();
        let event = log.append(cache_event("a")).unwrap();
        let later = event.timestamp + chrono::Duration::seconds(10);

        let none = log
            .query(AuditFilter::all().between(Some(later), None))
            .collect()
            .unwrap();
        assert!(none.is_empty());
        let some = log
            .query(AuditFilter::all().between(None, Some(later)))
            .collect()
            .unwrap();
        assert_eq!(some.len(), 1);
    }

    #[test]
    fn reopen_resumes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(Arc::new(JsonlFileSink::open(&path).unwrap())).unwrap();
            log.append(cache_event("a")).unwrap();
            log.append(cache_event("b")).unwrap();
        }
        let log = AuditLog::open(Arc::new(JsonlFileSink::open(&path).unwrap())).unwrap();
        let c = log.append(cache_event("c")).unwrap();
        assert_eq!(c.seq, 3);
        assert_eq!(log.verify_integrity().unwrap(), 3);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(Arc::new(JsonlFileSink::open(&path).unwrap())).unwrap();
            log.append(cache_event("first")).unwrap();
            log.append(cache_event("second")).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap().replace("first", "forged");
        std::fs::write(&path, text).unwrap();

        let log = AuditLog::open(Arc::new(JsonlFileSink::open(&path).unwrap())).unwrap();
        let err = log.verify_integrity().unwrap_err();
        assert!(matches!(err, AuditError::Integrity { seq: 1, .. }));
    }

    #[test]
    fn stats_count_by_kind() {
        let log = AuditLog::in_memory();
        log.append(cache_event("a")).unwrap();
        log.append(cache_event("b")).unwrap();
        log.append(NewEvent::error(AuditEventKind::GenerationFailed, "x")).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.last_seq, 3);
        assert_eq!(stats.by_kind[&AuditEventKind::CacheMiss], 2);
        assert_eq!(stats.by_kind[&AuditEventKind::GenerationFailed], 1);
    }

    #[test]
    fn concurrent_appends_stay_gap_free() {
        let log = Arc::new(AuditLog::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(cache_event("t")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.last_seq(), 200);
        assert_eq!(log.verify_integrity().unwrap(), 200);
    }
}
