//! Recording gateway used by scheduler, resolver and engine tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use reqwest::StatusCode;

use crate::dto::progress::{SaveProgressRequest, Snapshot};

use super::{Credentials, GatewayError, GatewayResult, InProcessGateway, PersistenceGateway};

/// Wraps an in-memory gateway, recording every save and optionally failing or delaying it.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    inner: Arc<RecordingInner>,
}

struct RecordingInner {
    backend: InProcessGateway,
    saves: Mutex<Vec<SaveProgressRequest>>,
    loads: AtomicUsize,
    failing: AtomicBool,
    save_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for RecordingInner {
    fn default() -> Self {
        Self {
            backend: InProcessGateway::in_memory(),
            saves: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            save_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save and load fail with a 503.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay each save by `delay` before it reaches the backend.
    pub fn set_save_delay(&self, delay: Duration) {
        *self.inner.save_delay.lock().unwrap() = delay;
    }

    /// Every save request that reached the gateway, in order.
    pub fn saves(&self) -> Vec<SaveProgressRequest> {
        self.inner.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.saves.lock().unwrap().len()
    }

    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    /// Highest number of saves observed in flight at the same time.
    pub fn max_concurrent_saves(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &InProcessGateway {
        &self.inner.backend
    }
}

fn unavailable(path: &str) -> GatewayError {
    GatewayError::Server {
        path: path.into(),
        status: StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl PersistenceGateway for RecordingGateway {
    fn load(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Option<Snapshot>>> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing.load(Ordering::SeqCst) {
            return Box::pin(std::future::ready(Err(unavailable("load"))));
        }
        self.inner.backend.load(credentials, activity_type)
    }

    fn save(
        &self,
        credentials: &Credentials,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, GatewayResult<Snapshot>> {
        let inner = self.inner.clone();
        let credentials = credentials.clone();
        Box::pin(async move {
            inner.saves.lock().unwrap().push(request.clone());
            let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *inner.save_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = if inner.failing.load(Ordering::SeqCst) {
                Err(unavailable("save"))
            } else {
                inner.backend.save(&credentials, request).await
            };
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }

    fn history(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Vec<Snapshot>>> {
        self.inner.backend.history(credentials, activity_type)
    }
}
