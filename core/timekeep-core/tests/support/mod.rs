//! Scripted remote service and registry wiring shared by integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use timekeep_core::cache::CacheSettings;
use timekeep_core::remote::HttpMethod;
use timekeep_core::{
    AuthGate, CacheChannel, CacheRegistry, Credentials, RemoteError, RemoteRequest, RemoteService,
    RetryPolicy, SchedulerConfig, SyncTaskScheduler,
};

type Handler =
    dyn Fn(&RemoteRequest, Option<&str>, usize) -> Result<Value, RemoteError> + Send + Sync;

pub struct ScriptedRemote {
    handler: Box<Handler>,
    calls: AtomicUsize,
    refreshes: AtomicUsize,
    log: Mutex<Vec<RemoteRequest>>,
}

impl ScriptedRemote {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&RemoteRequest, Option<&str>, usize) -> Result<Value, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Requests received with the given method.
    pub fn count(&self, method: HttpMethod) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|request| request.method == method)
            .count()
    }

    /// Paths of requests received with the given method, in arrival order.
    pub fn paths(&self, method: HttpMethod) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|request| request.method == method)
            .map(|request| request.path.clone())
            .collect()
    }
}

impl RemoteService for ScriptedRemote {
    fn send(&self, request: &RemoteRequest, bearer: Option<&str>) -> Result<Value, RemoteError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        (self.handler)(request, bearer, n)
    }

    fn refresh(&self, _refresh_token: &str) -> Result<Credentials, RemoteError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        Ok(Credentials {
            access_token: "fresh".to_string(),
            refresh_token: None,
        })
    }
}

pub fn credentials(token: &str) -> Credentials {
    Credentials {
        access_token: token.to_string(),
        refresh_token: Some("refresh-0".to_string()),
    }
}

/// Millisecond-scale backoff so retry tests stay fast.
pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        read_policy: RetryPolicy {
            base_delay: Duration::from_millis(10),
            cap_delay: Duration::from_millis(40),
            max_retries: 2,
        },
        write_policy: RetryPolicy {
            base_delay: Duration::from_millis(10),
            cap_delay: Duration::from_millis(20),
            max_retries: 2,
        },
        max_concurrent: 4,
    }
}

pub fn scheduler(remote: Arc<ScriptedRemote>, token: &str) -> Arc<SyncTaskScheduler> {
    let auth = Arc::new(AuthGate::with_credentials(
        Duration::from_secs(10),
        credentials(token),
    ));
    Arc::new(SyncTaskScheduler::new(remote, auth, fast_scheduler_config()))
}

pub fn registry(
    remote: Arc<ScriptedRemote>,
    channel: Arc<dyn CacheChannel>,
    settings: CacheSettings,
) -> CacheRegistry {
    CacheRegistry::new(scheduler(remote, "valid"), channel, settings)
}

pub fn settings() -> CacheSettings {
    CacheSettings {
        default_ttl: Duration::from_secs(60),
        peer_wait: Duration::from_secs(3),
        ..CacheSettings::default()
    }
}
