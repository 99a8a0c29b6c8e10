//! The sequential request loop.
//!
//! Exactly one request is in flight at a time. Each iteration blocks on the
//! response, then on the pacing delay, before the next one starts. Failures
//! become observations; nothing in the loop aborts the run.

use std::iter::FusedIterator;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::http::SearchHttp;
use crate::observation::Observation;
use crate::plan::{IterationIndex, RunCursor, total_iterations};
use crate::request::SearchRequest;

/// Inter-request pacing.
pub trait Pacer {
    fn pause(&self, duration: Duration);
}

impl<T: Pacer + ?Sized> Pacer for &T {
    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

pub struct LoadDriver<H, P = ThreadPacer> {
    config: RunConfig,
    http: H,
    pacer: P,
}

impl<H: SearchHttp> LoadDriver<H, ThreadPacer> {
    pub fn new(config: RunConfig, http: H) -> Self {
        Self::with_pacer(config, http, ThreadPacer)
    }
}

impl<H: SearchHttp, P: Pacer> LoadDriver<H, P> {
    pub fn with_pacer(config: RunConfig, http: H, pacer: P) -> Self {
        Self {
            config,
            http,
            pacer,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn total_iterations(&self) -> u64 {
        total_iterations(&self.config)
    }

    /// Requests the run would send, in order, without sending anything.
    pub fn plan(&self) -> impl Iterator<Item = SearchRequest> + '_ {
        RunCursor::new(&self.config).map(|index| SearchRequest::for_iteration(&self.config, index))
    }

    /// Start the run. Observations are produced lazily, one request per `next()`.
    ///
    /// The driver is consumed, so a run cannot be restarted.
    pub fn execute(self) -> Execution<H, P> {
        let cursor = RunCursor::new(&self.config);
        Execution {
            driver: self,
            cursor,
        }
    }

    /// Dispatch, classify and pace a single iteration.
    fn step(&self, index: IterationIndex) -> Observation {
        let request = SearchRequest::for_iteration(&self.config, index);
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.http.get(&request.url);
        let elapsed = clock.elapsed();

        let observation = match result {
            Ok(outcome) => {
                debug!(
                    iteration = index.iteration,
                    pass = index.pass,
                    name = %request.label.name(),
                    status = outcome.status,
                    latency_ms = elapsed.as_secs_f64() * 1000.0,
                    bytes = outcome.body_bytes,
                    "search request completed"
                );
                Observation::responded(index, request.label, outcome.status, elapsed, started_at)
            }
            Err(err) => {
                warn!(
                    iteration = index.iteration,
                    pass = index.pass,
                    name = %request.label.name(),
                    error = %format!("{err:#}"),
                    "search request failed before a response arrived"
                );
                Observation::transport_failure(index, request.label, format!("{err:#}"), started_at)
            }
        };

        self.pacer.pause(self.config.sleep);
        observation
    }
}

/// Lazy, finite, single-use stream of observations for one run.
pub struct Execution<H, P> {
    driver: LoadDriver<H, P>,
    cursor: RunCursor,
}

impl<H: SearchHttp, P: Pacer> Execution<H, P> {
    /// Iterations already executed.
    pub fn completed(&self) -> u64 {
        self.cursor.position()
    }

    pub fn config(&self) -> &RunConfig {
        &self.driver.config
    }
}

impl<H: SearchHttp, P: Pacer> Iterator for Execution<H, P> {
    type Item = Observation;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor.next()?;
        Some(self.driver.step(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.cursor.size_hint()
    }
}

impl<H: SearchHttp, P: Pacer> FusedIterator for Execution<H, P> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpOutcome;
    use crate::observation::validate;
    use anyhow::{Result, bail};
    use std::cell::{Cell, RefCell};

    struct StubHttp {
        statuses: RefCell<Vec<Option<u16>>>,
        calls: RefCell<Vec<String>>,
    }

    impl StubHttp {
        /// `None` entries simulate a refused connection. The last entry repeats.
        fn new(statuses: Vec<Option<u16>>) -> Self {
            Self {
                statuses: RefCell::new(statuses),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn always(status: u16) -> Self {
            Self::new(vec![Some(status)])
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl SearchHttp for StubHttp {
        fn get(&self, url: &str) -> Result<HttpOutcome> {
            self.calls.borrow_mut().push(url.to_string());
            let mut statuses = self.statuses.borrow_mut();
            let next = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            };
            match next {
                Some(status) => Ok(HttpOutcome {
                    status,
                    body_bytes: 0,
                }),
                None => bail!("connection refused"),
            }
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: Cell<u32>,
        total: Cell<Duration>,
    }

    impl Pacer for CountingPacer {
        fn pause(&self, duration: Duration) {
            self.pauses.set(self.pauses.get() + 1);
            self.total.set(self.total.get() + duration);
        }
    }

    fn config(pages: u32, repeat: u32, start_page: u32) -> RunConfig {
        RunConfig {
            pages,
            repeat,
            start_page,
            sleep: Duration::from_millis(100),
            ..RunConfig::default()
        }
    }

    #[test]
    fn requests_follow_page_order() {
        let http = StubHttp::always(200);
        let pacer = CountingPacer::default();
        let driver = LoadDriver::with_pacer(config(3, 2, 0), &http, &pacer);

        let observations: Vec<Observation> = driver.execute().collect();
        let pages: Vec<u64> = observations.iter().map(|o| o.label.page).collect();
        assert_eq!(pages, vec![0, 1, 2, 0, 1, 2]);
        let passes: Vec<u32> = observations.iter().map(|o| o.pass).collect();
        assert_eq!(passes, vec![0, 0, 0, 1, 1, 1]);

        let calls = http.calls();
        assert_eq!(calls.len(), 6);
        assert_eq!(
            calls[1],
            "http://localhost:8080/api/v1/products?brandId=25&page=1&size=20&sort=POPULAR"
        );
        assert!(observations.iter().all(validate));
    }

    #[test]
    fn pacer_runs_once_per_iteration() {
        let http = StubHttp::always(200);
        let pacer = CountingPacer::default();
        let driver = LoadDriver::with_pacer(config(2, 3, 0), &http, &pacer);
        assert_eq!(driver.execute().count(), 6);
        assert_eq!(pacer.pauses.get(), 6);
        assert_eq!(pacer.total.get(), Duration::from_millis(600));
    }

    #[test]
    fn server_errors_do_not_stop_the_run() {
        let http = StubHttp::always(500);
        let pacer = CountingPacer::default();
        let driver = LoadDriver::with_pacer(config(4, 2, 0), &http, &pacer);

        let observations: Vec<Observation> = driver.execute().collect();
        assert_eq!(observations.len(), 8);
        assert!(observations.iter().all(|o| !o.success));
        assert!(observations.iter().all(|o| o.status == Some(500)));
        assert!(observations.iter().all(|o| o.latency.is_some()));
    }

    #[test]
    fn transport_errors_are_recorded_without_latency() {
        let http = StubHttp::new(vec![Some(200), None, Some(200)]);
        let pacer = CountingPacer::default();
        let driver = LoadDriver::with_pacer(config(3, 1, 0), &http, &pacer);

        let observations: Vec<Observation> = driver.execute().collect();
        assert_eq!(observations.len(), 3);
        assert!(observations[0].success);
        assert!(!observations[1].success);
        assert!(observations[1].latency.is_none());
        assert!(
            observations[1]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("connection refused"))
        );
        assert!(observations[2].success);
        assert_eq!(pacer.pauses.get(), 3);
    }

    #[test]
    fn execution_is_lazy() {
        let http = StubHttp::always(200);
        let pacer = CountingPacer::default();
        let driver = LoadDriver::with_pacer(config(5, 1, 0), &http, &pacer);

        let mut execution = driver.execute();
        assert_eq!(http.calls().len(), 0);
        assert_eq!(execution.size_hint(), (5, Some(5)));
        execution.next();
        execution.next();
        assert_eq!(http.calls().len(), 2);
        assert_eq!(execution.completed(), 2);
        assert_eq!(execution.by_ref().count(), 3);
        assert!(execution.next().is_none());
        assert_eq!(http.calls().len(), 5);
    }

    #[test]
    fn plan_sends_nothing() {
        let http = StubHttp::always(200);
        let driver = LoadDriver::with_pacer(config(2, 2, 7), &http, CountingPacer::default());
        let urls: Vec<String> = driver.plan().map(|request| request.url).collect();
        assert_eq!(urls.len(), 4);
        assert!(urls[0].contains("&page=7&"));
        assert!(urls[3].contains("&page=8&"));
        assert!(http.calls().is_empty());
        assert_eq!(driver.total_iterations(), 4);
    }
}
