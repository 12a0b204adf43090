use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

/// Collection names exposed to subscribers. These mirror the persisted
/// schema boundary, not the SQLite table layout.
pub const COLLECTIONS: &[&str] = &[
    "students",
    "teachers",
    "batches",
    "subjects",
    "attendanceRecords",
    "feeStructures",
    "studentFeeDetails",
    "receipts",
    "assessments",
    "grades",
    "assignments",
    "submissions",
    "announcements",
    "events",
    "materials",
    "galleryAlbums",
    "expenses",
    "payroll",
    "settings",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: String,
    pub method: String,
    pub seq: u64,
}

struct Subscription {
    collection: String,
    pending: Vec<ChangeEvent>,
}

/// In-process change bus standing in for the store's live queries.
/// Subscribers poll and drain; unsubscribe is the cancellation path.
#[derive(Default)]
pub struct ChangeBus {
    next_seq: u64,
    subs: HashMap<String, Subscription>,
}

impl ChangeBus {
    pub fn is_known_collection(collection: &str) -> bool {
        COLLECTIONS.contains(&collection)
    }

    pub fn subscribe(&mut self, collection: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.subs.insert(
            id.clone(),
            Subscription {
                collection: collection.to_string(),
                pending: Vec::new(),
            },
        );
        id
    }

    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subs.remove(id).is_some()
    }

    /// Drain pending events for a subscription. `None` means the
    /// subscription does not exist (never created, or already cancelled).
    pub fn poll(&mut self, id: &str) -> Option<Vec<ChangeEvent>> {
        self.subs.get_mut(id).map(|s| std::mem::take(&mut s.pending))
    }

    pub fn notify(&mut self, collection: &str, method: &str) {
        self.next_seq += 1;
        let seq = self.next_seq;
        for sub in self.subs.values_mut() {
            if sub.collection == collection {
                sub.pending.push(ChangeEvent {
                    collection: collection.to_string(),
                    method: method.to_string(),
                    seq,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_drains_and_unsubscribe_cancels() {
        let mut bus = ChangeBus::default();
        let id = bus.subscribe("students");
        bus.notify("students", "students.enroll");
        bus.notify("batches", "batches.create");

        let events = bus.poll(&id).expect("live subscription");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].collection, "students");
        assert_eq!(events[0].method, "students.enroll");

        assert!(bus.poll(&id).expect("live subscription").is_empty());

        assert!(bus.unsubscribe(&id));
        assert!(bus.poll(&id).is_none());
        assert!(!bus.unsubscribe(&id));
    }

    #[test]
    fn notifications_fan_out_to_matching_subscribers_only() {
        let mut bus = ChangeBus::default();
        let a = bus.subscribe("grades");
        let b = bus.subscribe("grades");
        let c = bus.subscribe("expenses");
        bus.notify("grades", "grades.publish");

        assert_eq!(bus.poll(&a).expect("sub a").len(), 1);
        assert_eq!(bus.poll(&b).expect("sub b").len(), 1);
        assert!(bus.poll(&c).expect("sub c").is_empty());
    }
}
