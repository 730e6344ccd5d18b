use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::pipeline::{Pipeline, PipelineError};

/// Granularity of the stop check while idling between cycles.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(250);

pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Fetches every mailbox and runs one processing batch each `poll_interval`
/// until stopped.
pub fn start_worker(pipeline: Arc<Pipeline>, poll_interval: Duration) -> WorkerControl {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let handle = thread::spawn(move || {
        info!("ingestion worker started poll_interval={:?}", poll_interval);
        while !worker_stop.load(Ordering::Relaxed) {
            run_cycle(&pipeline);
            idle(&worker_stop, poll_interval);
        }
        info!("ingestion worker stopped");
    });
    WorkerControl {
        stop,
        handles: vec![handle],
    }
}

fn run_cycle(pipeline: &Pipeline) {
    if pipeline.fetch_enabled() {
        match pipeline.fetch_once() {
            Ok(summary) => {
                for failure in &summary.failures {
                    warn!(
                        "worker fetch failed account={}: {}",
                        failure.account_id, failure.error
                    );
                }
            }
            Err(PipelineError::FetchDisabled) => {}
            Err(err) => error!("worker fetch failed: {}", err),
        }
    }

    match pipeline.process_once() {
        Ok(report) if report.claimed > 0 => {
            info!(
                "worker batch claimed={} processed={} failed={}",
                report.claimed, report.processed, report.failed
            );
        }
        Ok(_) => {}
        Err(err) if err.is_locked() => info!("worker skipped batch: {}", err),
        Err(err) => error!("worker batch failed: {}", err),
    }
}

fn idle(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_CHECK_INTERVAL.min(deadline - now));
    }
}
