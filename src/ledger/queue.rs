//! Outstanding ledger requests and the order in which they are proposed.

use super::{LedgerRequest, RequestKey, RequestStatus};
use crate::channel::{ChannelId, Outcome};
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BTreeMap};
use tracing::{debug, info};

/// Which queued request the proposer picks next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Highest `missed_opportunity_count` first, ties broken by age.
    #[default]
    MostMissedThenOldest,
    /// Strictly by age.
    OldestFirst,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: BTreeMap<RequestKey, LedgerRequest>,
    next_seq: u64,
    policy: SchedulingPolicy,
}

impl RequestQueue {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            requests: BTreeMap::new(),
            next_seq: 0,
            policy,
        }
    }

    /// Adds `request` unless one with the same key exists. Announcing a
    /// vetoed request again makes it eligible for proposals. Returns whether
    /// anything changed.
    pub fn upsert(&mut self, mut request: LedgerRequest) -> bool {
        let key = request.key();
        if let Some(existing) = self.requests.get_mut(&key) {
            if existing.vetoed && existing.status == RequestStatus::Queued {
                existing.vetoed = false;
                return true;
            }
            return false;
        }
        request.created_seq = self.next_seq;
        request.status = RequestStatus::Queued;
        request.missed_opportunity_count = 0;
        request.last_seen_agreed_turn = None;
        request.vetoed = false;
        request.proposed_outcome = None;
        self.next_seq += 1;
        debug!(?key, "ledger request queued");
        self.requests.insert(key, request);
        true
    }

    /// Drops the request with the same key, if any, and queues `request`.
    pub fn replace(&mut self, request: LedgerRequest) {
        let key = request.key();
        if self.requests.remove(&key).is_some() {
            info!(?key, "ledger request replaced");
        }
        self.upsert(request);
    }

    pub fn get(&self, key: &RequestKey) -> Option<&LedgerRequest> {
        self.requests.get(key)
    }

    pub fn get_mut(&mut self, key: &RequestKey) -> Option<&mut LedgerRequest> {
        self.requests.get_mut(key)
    }

    pub fn for_ledger(&self, ledger_id: ChannelId) -> impl Iterator<Item = &LedgerRequest> + '_ {
        self.requests
            .values()
            .filter(move |r| r.ledger_channel_id == ledger_id)
    }

    /// Requests still waiting to be serviced on `ledger_id`.
    pub fn outstanding(&self, ledger_id: ChannelId) -> impl Iterator<Item = &LedgerRequest> + '_ {
        self.for_ledger(ledger_id).filter(|r| r.status.is_outstanding())
    }

    /// The queued request to propose next on `ledger_id`.
    pub fn select(&self, ledger_id: ChannelId) -> Option<RequestKey> {
        let queued = self
            .for_ledger(ledger_id)
            .filter(|r| r.status == RequestStatus::Queued && !r.vetoed);
        let picked = match self.policy {
            SchedulingPolicy::MostMissedThenOldest => {
                queued.max_by_key(|r| (r.missed_opportunity_count, Reverse(r.created_seq)))
            }
            SchedulingPolicy::OldestFirst => queued.min_by_key(|r| r.created_seq),
        };
        picked.map(LedgerRequest::key)
    }

    pub fn cancel(&mut self, key: &RequestKey, reason: String) {
        if let Some(r) = self.requests.get_mut(key) {
            info!(?key, %reason, "ledger request cancelled");
            r.status = RequestStatus::Cancelled(reason);
        }
    }

    /// Accounts for a newly agreed ledger state: requests reflected in
    /// `outcome` succeed, every other outstanding one goes back to the queue
    /// with one more missed opportunity.
    pub fn record_agreed_turn(&mut self, ledger_id: ChannelId, turn: u64, outcome: &Outcome) {
        for r in self.requests.values_mut() {
            if r.ledger_channel_id != ledger_id
                || !r.status.is_outstanding()
                || r.last_seen_agreed_turn.map_or(false, |t| t >= turn)
            {
                continue;
            }
            if r.is_applied(outcome) {
                info!(key = ?r.key(), turn_num = turn, "ledger request succeeded");
                r.status = RequestStatus::Succeeded;
            } else {
                if r.last_seen_agreed_turn.is_some() {
                    r.missed_opportunity_count += 1;
                }
                if r.status == RequestStatus::Pending {
                    debug!(key = ?r.key(), turn_num = turn, "ledger request was vetoed");
                    r.vetoed = true;
                }
                r.status = RequestStatus::Queued;
                r.proposed_outcome = None;
            }
            r.last_seen_agreed_turn = Some(turn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::{Address, Bytes32},
        channel::AllocationItem,
        ledger::RequestKind,
    };

    const HOLDER: Address = Address([9; 20]);

    fn request(target: u8) -> LedgerRequest {
        LedgerRequest::new(
            Bytes32([1; 32]),
            RequestKind::Fund,
            Bytes32([target; 32]),
            HOLDER,
            vec![1.into(), 1.into()],
        )
    }

    fn funded(targets: &[u8]) -> Outcome {
        Outcome::allocation(
            HOLDER,
            targets
                .iter()
                .map(|t| AllocationItem::new(Bytes32([*t; 32]), 2.into()))
                .collect(),
        )
    }

    #[test]
    fn one_request_per_key() {
        let mut q = RequestQueue::default();
        assert!(q.upsert(request(2)));
        assert!(!q.upsert(request(2)));
        assert!(q.upsert(request(3)));
        assert_eq!(q.for_ledger(Bytes32([1; 32])).count(), 2);
        assert_eq!(q.for_ledger(Bytes32([7; 32])).count(), 0);
    }

    #[test]
    fn replacing_requeues_with_new_terms() {
        let mut q = RequestQueue::default();
        q.upsert(request(2));
        q.get_mut(&request(2).key()).unwrap().status = RequestStatus::Pending;

        let mut ours = request(2);
        ours.amounts = vec![2.into(), 0.into()];
        q.replace(ours.clone());
        let r = q.get(&ours.key()).unwrap();
        assert_eq!(r.amounts, ours.amounts);
        assert_eq!(r.status, RequestStatus::Queued);
        assert!(r.same_terms(&ours));
        assert!(!r.same_terms(&request(2)));
        assert_eq!(q.for_ledger(Bytes32([1; 32])).count(), 1);
    }

    #[test]
    fn policies_pick_differently() {
        let ledger = Bytes32([1; 32]);
        for (policy, expected) in [
            (SchedulingPolicy::MostMissedThenOldest, 3),
            (SchedulingPolicy::OldestFirst, 2),
        ] {
            let mut q = RequestQueue::new(policy);
            q.upsert(request(2));
            q.upsert(request(3));
            q.get_mut(&request(3).key()).unwrap().missed_opportunity_count = 4;
            assert_eq!(q.select(ledger), Some(request(expected).key()));
        }
    }

    #[test]
    fn agreed_turns_count_misses() {
        let ledger = Bytes32([1; 32]);
        let mut q = RequestQueue::default();
        q.upsert(request(2));
        q.upsert(request(3));

        q.record_agreed_turn(ledger, 2, &Outcome::default());
        assert!(q.outstanding(ledger).all(|r| r.missed_opportunity_count == 0));
        // Seeing the same turn again changes nothing.
        q.record_agreed_turn(ledger, 2, &Outcome::default());

        // Only the outcome we proposed counts as servicing the request.
        let proposed = q.get_mut(&request(2).key()).unwrap();
        proposed.status = RequestStatus::Pending;
        proposed.proposed_outcome = Some(funded(&[2]));
        q.record_agreed_turn(ledger, 3, &funded(&[2, 4]));
        assert!(q.get(&request(2).key()).unwrap().vetoed);

        let proposed = q.get_mut(&request(2).key()).unwrap();
        proposed.status = RequestStatus::Pending;
        proposed.proposed_outcome = Some(funded(&[2]));
        q.record_agreed_turn(ledger, 4, &funded(&[2]));
        assert_eq!(q.get(&request(2).key()).unwrap().status, RequestStatus::Succeeded);
        let starved = q.get(&request(3).key()).unwrap();
        assert_eq!(starved.status, RequestStatus::Queued);
        assert_eq!(starved.missed_opportunity_count, 2);
    }

    #[test]
    fn starvation_is_bounded() {
        // Every round the proposer services the selected request while new
        // requests keep arriving. Each request present at the start must be
        // serviced within as many rounds as there were requests.
        let ledger = Bytes32([1; 32]);
        let n = 6u8;
        let mut q = RequestQueue::default();
        for t in 0..n {
            q.upsert(request(10 + t));
        }
        let initial: Vec<_> = (0..n).map(|t| request(10 + t).key()).collect();

        let mut serviced = Vec::new();
        for round in 0..n {
            let key = q.select(ledger).unwrap();
            serviced.push(key.channel_to_be_funded.0[0]);
            let outcome = funded(&serviced);
            let r = q.get_mut(&key).unwrap();
            r.status = RequestStatus::Pending;
            r.proposed_outcome = Some(outcome.clone());
            q.upsert(request(100 + round));
            q.record_agreed_turn(ledger, 2 + round as u64, &outcome);
        }

        for key in initial {
            assert_eq!(q.get(&key).unwrap().status, RequestStatus::Succeeded);
        }
    }
}
