use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

/// Keyed wait map: at most one in-flight operation per key.
///
/// The first caller for a key becomes the leader and receives a guard;
/// followers block until the leader's guard drops, then re-check whatever
/// state the leader was supposed to produce. Used by the write path so that
/// two concurrent writers of the same new content perform exactly one
/// physical write.
pub struct SingleFlight<K: Eq + Hash + Clone> {
    inflight: Mutex<HashMap<K, Arc<Gate>>>,
}

struct Gate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Become the leader for `key`, or wait for the current leader to finish.
    ///
    /// Returns `Some(guard)` when this caller is the leader; the guard must
    /// be held for the duration of the operation. Returns `None` after a
    /// completed wait; the caller re-checks shared state and may try again.
    pub fn lead_or_wait(&self, key: &K) -> Option<FlightGuard<'_, K>> {
        let gate = {
            let mut map = self.inflight.lock().unwrap();
            match map.get(key) {
                Some(gate) => gate.clone(),
                None => {
                    let gate = Arc::new(Gate {
                        done: Mutex::new(false),
                        cv: Condvar::new(),
                    });
                    map.insert(key.clone(), gate);
                    return Some(FlightGuard {
                        owner: self,
                        key: key.clone(),
                    });
                }
            }
        };

        let mut done = gate.done.lock().unwrap();
        while !*done {
            done = gate.cv.wait(done).unwrap();
        }
        None
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leader guard; dropping it wakes all waiters for the key.
pub struct FlightGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a SingleFlight<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        let gate = self.owner.inflight.lock().unwrap().remove(&self.key);
        if let Some(gate) = gate {
            *gate.done.lock().unwrap() = true;
            gate.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn single_leader_per_key() {
        let sf = SingleFlight::new();
        let guard = sf.lead_or_wait(&"k").unwrap();

        // A second leader for a different key is fine.
        let other = sf.lead_or_wait(&"other").unwrap();
        drop(other);
        drop(guard);

        // After the leader finishes, the key is free again.
        assert!(sf.lead_or_wait(&"k").is_some());
    }

    #[test]
    fn followers_wait_for_leader() {
        let sf = Arc::new(SingleFlight::new());
        let leaders = Arc::new(AtomicUsize::new(0));
        let followers = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let sf = sf.clone();
                let leaders = leaders.clone();
                let followers = followers.clone();
                scope.spawn(move || match sf.lead_or_wait(&"shared") {
                    Some(_guard) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                    }
                    None => {
                        followers.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        // Every thread either led or completed a wait; with the leader
        // sleeping, at least one thread must have been a follower.
        assert_eq!(
            leaders.load(Ordering::SeqCst) + followers.load(Ordering::SeqCst),
            8
        );
        assert!(leaders.load(Ordering::SeqCst) >= 1);
        assert!(followers.load(Ordering::SeqCst) >= 1);
    }
}
