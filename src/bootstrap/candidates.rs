use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::error::ClusterError;

/// Ordered, deduplicated candidate peers, consumed front to back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQueue {
    pending: VecDeque<IpAddr>,
}

impl CandidateQueue {
    pub fn new(peers: impl IntoIterator<Item = IpAddr>) -> Self {
        let ordered: BTreeSet<IpAddr> = peers.into_iter().collect();
        Self {
            pending: ordered.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Iterator for CandidateQueue {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        self.pending.pop_front()
    }
}

/// Result of walking a candidate queue.
#[derive(Debug)]
pub struct Selection<T> {
    pub winner: Option<(IpAddr, T)>,
    /// Every candidate tried before the winner, in order, with its error
    pub failures: Vec<(IpAddr, ClusterError)>,
}

impl<T> Selection<T> {
    pub fn all_rejected(&self) -> bool {
        self.winner.is_none()
            && !self.failures.is_empty()
            && self.failures.iter().all(|(_, e)| e.is_policy_rejection())
    }
}

/// First-success tie-break: try each candidate once, in queue order, and
/// stop at the first that succeeds.
///
/// Each failure is recorded and the walk moves on; a rejected candidate is
/// never retried within the walk.
pub async fn first_success<T, F, Fut>(queue: CandidateQueue, mut attempt: F) -> Selection<T>
where
    F: FnMut(IpAddr) -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let mut failures = Vec::new();
    for peer in queue {
        match attempt(peer).await {
            Ok(value) => {
                debug!("Candidate {} succeeded after {} failure(s)", peer, failures.len());
                return Selection {
                    winner: Some((peer, value)),
                    failures,
                };
            }
            Err(e) => {
                if e.is_policy_rejection() {
                    warn!("Candidate {} rejected us: {}", peer, e);
                } else {
                    warn!("Candidate {} failed: {}", peer, e);
                }
                failures.push((peer, e));
            }
        }
    }
    Selection {
        winner: None,
        failures,
    }
}
