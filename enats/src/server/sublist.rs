use super::subject;
use std::collections::HashMap;

pub(crate) type ClientId = u64;

#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub client: ClientId,
    pub sid: String,
    pub subject: String,
    pub queue: Option<String>,
    // auto-unsubscribe once `delivered` reaches `max`
    pub max: Option<u64>,
    pub delivered: u64,
}

/// A subscription selected to receive one message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Delivery {
    pub client: ClientId,
    pub sid: String,
}

/// All subscriptions known to the server, keyed by (client, sid).
/// Matching is a linear scan; an embedded test broker never holds
/// enough subscriptions for a trie to pay off.
#[derive(Debug, Default)]
pub(crate) struct Sublist {
    subs: HashMap<(ClientId, String), Subscription>,
    // round-robin cursor per queue name
    cursors: HashMap<String, usize>,
}

impl Sublist {
    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }

    /// Re-using a sid on the same connection replaces the old subscription.
    pub(crate) fn insert(&mut self, sub: Subscription) {
        self.subs.insert((sub.client, sub.sid.clone()), sub);
    }

    /// Removes the subscription now, or arms it to expire after
    /// `max` total deliveries. Returns false if the sid is unknown.
    pub(crate) fn unsubscribe(&mut self, client: ClientId, sid: &str, max: Option<u64>) -> bool {
        let key = (client, sid.to_owned());
        let expired = match self.subs.get_mut(&key) {
            None => return false,
            Some(sub) => match max {
                Some(max) if sub.delivered < max => {
                    sub.max = Some(max);
                    false
                }
                _ => true,
            },
        };
        if expired {
            self.remove(&key);
        }
        true
    }

    pub(crate) fn remove_client(&mut self, client: ClientId) -> usize {
        let before = self.subs.len();
        self.subs.retain(|(owner, _), _| *owner != client);
        self.prune_cursors();
        before - self.subs.len()
    }

    fn remove(&mut self, key: &(ClientId, String)) {
        if let Some(Subscription { queue: Some(_), .. }) = self.subs.remove(key) {
            self.prune_cursors();
        }
    }

    // Forget the cursor of every queue group that has no members left.
    fn prune_cursors(&mut self) {
        let subs = &self.subs;
        self.cursors.retain(|queue, _| {
            subs.values().any(|sub| sub.queue.as_deref() == Some(queue.as_str()))
        });
    }

    /// Picks the receivers of a message published on `subject`:
    /// every matching plain subscription plus one member per
    /// matching queue group. A queue group is every subscription
    /// sharing a queue name, whatever pattern each one used.
    /// Subscriptions owned by `skip` are left out (clients that
    /// connected with `echo: false`).
    pub(crate) fn select(&mut self, subject: &str, skip: Option<ClientId>) -> Vec<Delivery> {
        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<Delivery>> = HashMap::new();
        for sub in self.subs.values() {
            if Some(sub.client) == skip || !subject::matches(&sub.subject, subject) {
                continue;
            }
            let delivery = Delivery {
                client: sub.client,
                sid: sub.sid.clone(),
            };
            match &sub.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(delivery),
                None => plain.push(delivery),
            }
        }
        for (group, mut members) in groups {
            // HashMap order is arbitrary, sort so the cursor is meaningful
            members.sort_by(|a, b| (a.client, &a.sid).cmp(&(b.client, &b.sid)));
            let cursor = self.cursors.entry(group).or_insert(0);
            let idx = *cursor % members.len();
            *cursor = cursor.wrapping_add(1);
            plain.push(members.swap_remove(idx));
        }
        plain
    }

    /// Counts a delivery and drops the subscription if it just hit
    /// its auto-unsubscribe limit.
    pub(crate) fn delivered(&mut self, delivery: &Delivery) {
        let key = (delivery.client, delivery.sid.clone());
        let expired = match self.subs.get_mut(&key) {
            Some(sub) => {
                sub.delivered += 1;
                matches!(sub.max, Some(max) if sub.delivered >= max)
            }
            None => false,
        };
        if expired {
            self.remove(&key);
        }
    }

    /// The sid of a subscription owned by `client` that matches `subject`.
    pub(crate) fn find(&self, client: ClientId, subject: &str) -> Option<String> {
        self.subs
            .values()
            .find(|sub| sub.client == client && subject::matches(&sub.subject, subject))
            .map(|sub| sub.sid.clone())
    }
}
