//! Messaging-library seam for the pub/sub and survey transport profiles.
//!
//! The replication core speaks point-to-point TCP natively; scalability
//! profiles (topic-prefixed WAL fan-out, survey/respondent health checks,
//! push/pull write buffering) go through a [`SocketFactory`] so the concrete
//! messaging library stays a collaborator. [`InProcFactory`] is the
//! in-process implementation used by tests and single-machine setups.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errors::GraphdError;

/// Capability set of the messaging collaborator. Implementations exist for a
/// real messaging library (out of tree) and for in-process tests.
pub trait SocketFactory: Send + Sync {
    fn new_pub(&self, addr: &str) -> Result<Box<dyn PubSocket>, GraphdError>;
    fn new_sub(&self, addr: &str, topic: &[u8]) -> Result<Box<dyn SubSocket>, GraphdError>;
    fn new_surveyor(&self, addr: &str) -> Result<Box<dyn SurveySocket>, GraphdError>;
    fn new_respondent(&self, addr: &str) -> Result<Box<dyn RespondentSocket>, GraphdError>;
    fn new_push(&self, addr: &str) -> Result<Box<dyn PushSocket>, GraphdError>;
    fn new_pull(&self, addr: &str) -> Result<Box<dyn PullSocket>, GraphdError>;
}

/// Fan-out publisher. `publish` must not block on slow subscribers.
pub trait PubSocket: Send {
    fn publish(&self, frame: &[u8]) -> Result<(), GraphdError>;
}

/// Subscriber filtered to a topic prefix at creation time.
pub trait SubSocket: Send {
    /// Next frame for the subscribed topic, waiting up to `timeout`.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, GraphdError>;
}

/// Health surveyor: broadcast a question, gather answers until the deadline.
pub trait SurveySocket: Send {
    fn survey(&self, frame: &[u8], deadline: Duration) -> Result<Vec<Vec<u8>>, GraphdError>;
}

/// Health respondent: serve at most one survey, answering via `reply`.
pub trait RespondentSocket: Send {
    /// Returns `false` when no survey arrived before `timeout`.
    fn serve_one(
        &self,
        timeout: Duration,
        reply: &mut dyn FnMut(&[u8]) -> Vec<u8>,
    ) -> Result<bool, GraphdError>;
}

/// Write-buffer producer side (push/pull profile).
pub trait PushSocket: Send {
    fn push(&self, frame: &[u8]) -> Result<(), GraphdError>;
}

/// Write-buffer consumer side (push/pull profile).
pub trait PullSocket: Send {
    fn pull_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, GraphdError>;
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Endpoint {
    subscribers: Vec<(Vec<u8>, Sender<Vec<u8>>)>,
    respondents: Vec<Sender<SurveyRequest>>,
    pull_queue: Option<(Sender<Vec<u8>>, Arc<Mutex<Option<Receiver<Vec<u8>>>>>)>,
}

struct SurveyRequest {
    frame: Vec<u8>,
    reply: Sender<Vec<u8>>,
}

/// In-process socket factory. All sockets created from one factory share a
/// bus keyed by address string.
#[derive(Default, Clone)]
pub struct InProcFactory {
    bus: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl InProcFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SocketFactory for InProcFactory {
    fn new_pub(&self, addr: &str) -> Result<Box<dyn PubSocket>, GraphdError> {
        Ok(Box::new(InProcPub {
            bus: Arc::clone(&self.bus),
            addr: addr.to_string(),
        }))
    }

    fn new_sub(&self, addr: &str, topic: &[u8]) -> Result<Box<dyn SubSocket>, GraphdError> {
        let (tx, rx) = channel();
        let mut bus = self.bus.lock();
        bus.entry(addr.to_string())
            .or_default()
            .subscribers
            .push((topic.to_vec(), tx));
        Ok(Box::new(InProcSub { rx }))
    }

    fn new_surveyor(&self, addr: &str) -> Result<Box<dyn SurveySocket>, GraphdError> {
        Ok(Box::new(InProcSurveyor {
            bus: Arc::clone(&self.bus),
            addr: addr.to_string(),
        }))
    }

    fn new_respondent(&self, addr: &str) -> Result<Box<dyn RespondentSocket>, GraphdError> {
        let (tx, rx) = channel();
        let mut bus = self.bus.lock();
        bus.entry(addr.to_string()).or_default().respondents.push(tx);
        Ok(Box::new(InProcRespondent { rx }))
    }

    fn new_push(&self, addr: &str) -> Result<Box<dyn PushSocket>, GraphdError> {
        let tx = {
            let mut bus = self.bus.lock();
            let endpoint = bus.entry(addr.to_string()).or_default();
            if endpoint.pull_queue.is_none() {
                let (tx, rx) = channel();
                endpoint.pull_queue = Some((tx, Arc::new(Mutex::new(Some(rx)))));
            }
            endpoint.pull_queue.as_ref().map(|(tx, _)| tx.clone())
        };
        match tx {
            Some(tx) => Ok(Box::new(InProcPush { tx })),
            None => Err(GraphdError::replication("push endpoint unavailable")),
        }
    }

    fn new_pull(&self, addr: &str) -> Result<Box<dyn PullSocket>, GraphdError> {
        let rx = {
            let mut bus = self.bus.lock();
            let endpoint = bus.entry(addr.to_string()).or_default();
            if endpoint.pull_queue.is_none() {
                let (tx, rx) = channel();
                endpoint.pull_queue = Some((tx, Arc::new(Mutex::new(Some(rx)))));
            }
            endpoint
                .pull_queue
                .as_ref()
                .and_then(|(_, rx)| rx.lock().take())
        };
        match rx {
            Some(rx) => Ok(Box::new(InProcPull { rx })),
            None => Err(GraphdError::replication(
                "pull endpoint already has a consumer",
            )),
        }
    }
}

struct InProcPub {
    bus: Arc<Mutex<HashMap<String, Endpoint>>>,
    addr: String,
}

impl PubSocket for InProcPub {
    fn publish(&self, frame: &[u8]) -> Result<(), GraphdError> {
        let mut bus = self.bus.lock();
        if let Some(endpoint) = bus.get_mut(&self.addr) {
            // Disconnected subscribers are swept on the next publish.
            endpoint
                .subscribers
                .retain(|(topic, tx)| {
                    if !frame.starts_with(topic) {
                        return true;
                    }
                    tx.send(frame.to_vec()).is_ok()
                });
        }
        Ok(())
    }
}

struct InProcSub {
    rx: Receiver<Vec<u8>>,
}

impl SubSocket for InProcSub {
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, GraphdError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(GraphdError::replication("publisher disconnected"))
            }
        }
    }
}

struct InProcSurveyor {
    bus: Arc<Mutex<HashMap<String, Endpoint>>>,
    addr: String,
}

impl SurveySocket for InProcSurveyor {
    fn survey(&self, frame: &[u8], deadline: Duration) -> Result<Vec<Vec<u8>>, GraphdError> {
        let (reply_tx, reply_rx) = channel();
        let sent = {
            let mut bus = self.bus.lock();
            match bus.get_mut(&self.addr) {
                Some(endpoint) => {
                    endpoint.respondents.retain(|tx| {
                        tx.send(SurveyRequest {
                            frame: frame.to_vec(),
                            reply: reply_tx.clone(),
                        })
                        .is_ok()
                    });
                    endpoint.respondents.len()
                }
                None => 0,
            }
        };
        drop(reply_tx);

        let mut responses = Vec::with_capacity(sent);
        let survey_deadline = Instant::now() + deadline;
        while responses.len() < sent {
            let remaining = survey_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(remaining) {
                Ok(response) => responses.push(response),
                Err(_) => break,
            }
        }
        Ok(responses)
    }
}

struct InProcRespondent {
    rx: Receiver<SurveyRequest>,
}

impl RespondentSocket for InProcRespondent {
    fn serve_one(
        &self,
        timeout: Duration,
        reply: &mut dyn FnMut(&[u8]) -> Vec<u8>,
    ) -> Result<bool, GraphdError> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => {
                let response = reply(&request.frame);
                let _ = request.reply.send(response);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(GraphdError::replication("surveyor disconnected"))
            }
        }
    }
}

struct InProcPush {
    tx: Sender<Vec<u8>>,
}

impl PushSocket for InProcPush {
    fn push(&self, frame: &[u8]) -> Result<(), GraphdError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| GraphdError::replication("pull side disconnected"))
    }
}

struct InProcPull {
    rx: Receiver<Vec<u8>>,
}

impl PullSocket for InProcPull {
    fn pull_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, GraphdError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{strip_topic, wrap_topic, WAL_TOPIC};

    #[test]
    fn pub_sub_delivers_topic_frames_in_order() {
        let factory = InProcFactory::new();
        let sub = factory.new_sub("inproc://wal", WAL_TOPIC).unwrap();
        let publisher = factory.new_pub("inproc://wal").unwrap();

        publisher.publish(&wrap_topic(b"one")).unwrap();
        publisher.publish(b"OTHER:ignored").unwrap();
        publisher.publish(&wrap_topic(b"two")).unwrap();

        let first = sub.recv_timeout(Duration::from_millis(100)).unwrap().unwrap();
        let second = sub.recv_timeout(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(strip_topic(&first).unwrap(), b"one");
        assert_eq!(strip_topic(&second).unwrap(), b"two");
        assert!(sub.recv_timeout(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn survey_collects_responses_from_each_respondent() {
        let factory = InProcFactory::new();
        let respondent_a = factory.new_respondent("inproc://health").unwrap();
        let respondent_b = factory.new_respondent("inproc://health").unwrap();
        let surveyor = factory.new_surveyor("inproc://health").unwrap();

        let worker_a = std::thread::spawn(move || {
            respondent_a
                .serve_one(Duration::from_secs(1), &mut |_| b"a".to_vec())
                .unwrap()
        });
        let worker_b = std::thread::spawn(move || {
            respondent_b
                .serve_one(Duration::from_secs(1), &mut |_| b"b".to_vec())
                .unwrap()
        });

        let mut responses = surveyor
            .survey(b"ping", Duration::from_secs(1))
            .unwrap();
        responses.sort();
        assert_eq!(responses, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(worker_a.join().unwrap());
        assert!(worker_b.join().unwrap());
    }

    #[test]
    fn push_pull_hands_frames_to_single_consumer() {
        let factory = InProcFactory::new();
        let push = factory.new_push("inproc://writes").unwrap();
        let pull = factory.new_pull("inproc://writes").unwrap();

        push.push(b"w1").unwrap();
        push.push(b"w2").unwrap();

        assert_eq!(
            pull.pull_timeout(Duration::from_millis(100)).unwrap(),
            Some(b"w1".to_vec())
        );
        assert_eq!(
            pull.pull_timeout(Duration::from_millis(100)).unwrap(),
            Some(b"w2".to_vec())
        );

        // The pull side is exclusive.
        assert!(factory.new_pull("inproc://writes").is_err());
    }
}
