//! Bounded response cache.
//!
//! Maps request fingerprints to responses so that a failed live call can be
//! answered from the last good response. Reads are gated on the request's
//! `enable_cache`; writes additionally require a successful response.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::types::{ServiceCallReq, ServiceCallRsp};

/// Default capacity of the response cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1_000_000;

/// LRU-evicting `fingerprint → response` cache.
pub struct ServiceCache {
    inner: Mutex<LruCache<crate::types::CallFingerprint, ServiceCallRsp>>,
}

impl ServiceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        ServiceCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up the cached response for `req`. Only requests with
    /// `enable_cache` are served; a hit is marked `is_cached`.
    pub fn get(&self, req: &ServiceCallReq) -> Option<ServiceCallRsp> {
        if !req.enable_cache {
            return None;
        }
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        cache.get(&req.fingerprint()).map(|hit| {
            let mut rsp = hit.clone();
            rsp.is_cached = true;
            rsp
        })
    }

    /// Stores `rsp` under `req`'s fingerprint. Failed responses and requests
    /// without `enable_cache` are never stored.
    pub fn set(&self, req: &ServiceCallReq, rsp: &ServiceCallRsp) {
        if !rsp.error.is_empty() || !req.enable_cache {
            return;
        }
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        cache.put(req.fingerprint(), rsp.clone());
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn req(name: &str, enable_cache: bool) -> ServiceCallReq {
        ServiceCallReq {
            service_name: name.into(),
            service_api: "/x".into(),
            enable_cache,
            ..Default::default()
        }
    }

    fn ok_rsp(name: &str) -> ServiceCallRsp {
        ServiceCallRsp {
            service_name: name.into(),
            rsp: Bytes::from_static(b"body"),
            ..Default::default()
        }
    }

    #[test]
    fn hit_marks_is_cached() {
        let cache = ServiceCache::new(16);
        let r = req("svc", true);
        cache.set(&r, &ok_rsp("svc"));
        let hit = cache.get(&r).expect("hit");
        assert!(hit.is_cached);
        assert_eq!(hit.rsp.as_ref(), b"body");
    }

    #[test]
    fn disabled_cache_flag_blocks_both_sides() {
        let cache = ServiceCache::new(16);
        let off = req("svc", false);
        cache.set(&off, &ok_rsp("svc"));
        assert!(cache.is_empty(), "set must be gated on enable_cache");

        let on = req("svc", true);
        cache.set(&on, &ok_rsp("svc"));
        assert!(cache.get(&off).is_none(), "get must be gated on enable_cache");
        assert!(cache.get(&on).is_some());
    }

    #[test]
    fn failed_responses_are_not_stored() {
        let cache = ServiceCache::new(16);
        let r = req("svc", true);
        let mut bad = ok_rsp("svc");
        bad.error = "Get Service Response Failed. eof".into();
        cache.set(&r, &bad);
        assert!(cache.get(&r).is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = ServiceCache::new(2);
        for name in ["a", "b", "c"] {
            cache.set(&req(name, true), &ok_rsp(name));
        }
        assert!(cache.get(&req("a", true)).is_none(), "oldest entry evicted");
        assert!(cache.get(&req("c", true)).is_some());
    }
}
