//! Survey-based health checks over the transport seam.
//!
//! Heartbeat-sequence lag on the replication channel is the authoritative
//! liveness signal; the survey channel is the second, independent transport:
//! the primary periodically surveys, replicas respond with their id and
//! applied LSN, and the surveyor keeps a freshness map per respondent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::replication::transport::{RespondentSocket, SurveySocket};
use crate::replication::StopSignal;

/// Survey question frame.
const SURVEY_PING: &[u8] = b"ping";

/// Primary-side health surveyor. Runs on its own thread because the
/// transport capability set is blocking.
pub struct HealthSurveyor {
    stop: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
    responsive: Arc<Mutex<HashMap<String, (Instant, u64)>>>,
}

impl HealthSurveyor {
    pub fn start(socket: Box<dyn SurveySocket>, interval: Duration) -> Self {
        let stop = Arc::new(StopSignal::new());
        let responsive: Arc<Mutex<HashMap<String, (Instant, u64)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let thread_stop = Arc::clone(&stop);
        let thread_map = Arc::clone(&responsive);
        let thread = std::thread::spawn(move || {
            while !thread_stop.is_raised() {
                match socket.survey(SURVEY_PING, interval) {
                    Ok(responses) => {
                        let now = Instant::now();
                        let mut map = thread_map.lock();
                        for response in responses {
                            match parse_response(&response) {
                                Some((id, lsn)) => {
                                    map.insert(id, (now, lsn));
                                }
                                None => warn!("malformed survey response"),
                            }
                        }
                        debug!(respondents = map.len(), "health survey round complete");
                    }
                    Err(e) => warn!("health survey failed: {e}"),
                }
                std::thread::sleep(interval);
            }
        });

        Self {
            stop,
            thread: Mutex::new(Some(thread)),
            responsive,
        }
    }

    /// Respondents heard from within `window`, with their reported LSNs.
    pub fn responsive_within(&self, window: Duration) -> Vec<(String, u64)> {
        let now = Instant::now();
        self.responsive
            .lock()
            .iter()
            .filter(|(_, (seen, _))| now.duration_since(*seen) <= window)
            .map(|(id, (_, lsn))| (id.clone(), *lsn))
            .collect()
    }

    pub fn stop(&self) {
        self.stop.raise();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Replica-side survey respondent.
pub struct HealthResponder {
    stop: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HealthResponder {
    pub fn start(
        socket: Box<dyn RespondentSocket>,
        node_id: String,
        applied_lsn: Arc<AtomicU64>,
    ) -> Self {
        let stop = Arc::new(StopSignal::new());

        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            while !thread_stop.is_raised() {
                let result = socket.serve_one(Duration::from_millis(200), &mut |_frame| {
                    format!("{node_id}:{}", applied_lsn.load(Ordering::Acquire)).into_bytes()
                });
                if let Err(e) = result {
                    warn!("health respondent stopping: {e}");
                    break;
                }
            }
        });

        Self {
            stop,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn stop(&self) {
        self.stop.raise();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn parse_response(response: &[u8]) -> Option<(String, u64)> {
    let text = std::str::from_utf8(response).ok()?;
    let (id, lsn) = text.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), lsn.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use crate::replication::transport::{InProcFactory, SocketFactory};

    use super::*;

    #[test]
    fn surveyor_tracks_respondents() {
        let factory = InProcFactory::new();
        let respondent = factory.new_respondent("inproc://health").unwrap();
        let lsn = Arc::new(AtomicU64::new(17));

        let responder = HealthResponder::start(respondent, "replica-a".into(), Arc::clone(&lsn));
        let surveyor = HealthSurveyor::start(
            factory.new_surveyor("inproc://health").unwrap(),
            Duration::from_millis(20),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            seen = surveyor.responsive_within(Duration::from_secs(1));
            if !seen.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(seen, vec![("replica-a".to_string(), 17)]);

        surveyor.stop();
        responder.stop();
    }

    #[test]
    fn malformed_responses_are_ignored() {
        assert_eq!(parse_response(b"id:42"), Some(("id".into(), 42)));
        assert_eq!(parse_response(b"no-separator"), None);
        assert_eq!(parse_response(b":7"), None);
        assert_eq!(parse_response(b"id:notanumber"), None);
    }
}
