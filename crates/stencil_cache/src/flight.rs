//! Single-flight coordination: at most one computation per key at a time.
//!
//! The first caller to [`FlightGroup::join`] a key becomes its leader and
//! computes the value; callers arriving while the flight is in the air
//! become followers and wait for the leader's result. A leader that is
//! dropped without completing (panic, early return) abandons the flight and
//! wakes its followers so one of them can take over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stencil_common::key_hash;

/// Default number of shards of the in-flight table.
pub const DEFAULT_FLIGHT_SHARDS: usize = 16;

enum FlightState<T> {
    Running,
    Finished(T),
    Abandoned,
}

struct Flight<T> {
    state: Mutex<FlightState<T>>,
    done: Condvar,
}

impl<T> Flight<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }
}

type Table<T> = Mutex<HashMap<String, Arc<Flight<T>>>>;

/// A table of in-flight computations keyed by name.
pub struct FlightGroup<T> {
    shards: Box<[Table<T>]>,
    mask: usize,
}

/// Role assigned to a caller by [`FlightGroup::join`].
pub enum Joined<'a, T> {
    /// The caller must compute the value and [`FlightLeader::complete`] it.
    Leader(FlightLeader<'a, T>),
    /// Another caller is computing; wait for its result.
    Follower(FlightFollower<T>),
}

/// Outcome of [`FlightFollower::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Landing<T> {
    /// The leader completed with this value.
    Finished(T),
    /// The leader went away without a value; join again.
    Abandoned,
    /// The wait exceeded its bound. The flight continues.
    TimedOut,
}

/// Guard held by the caller computing a key.
///
/// Dropping the guard without calling [`complete`](Self::complete) abandons
/// the flight.
pub struct FlightLeader<'a, T> {
    group: &'a FlightGroup<T>,
    key: String,
    flight: Arc<Flight<T>>,
    landed: bool,
}

/// Handle held by a caller waiting on another caller's computation.
pub struct FlightFollower<T> {
    flight: Arc<Flight<T>>,
}

impl<T: Clone> FlightGroup<T> {
    /// Creates a group with [`DEFAULT_FLIGHT_SHARDS`] shards.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_FLIGHT_SHARDS)
    }

    /// Creates a group with at least `shards` shards, rounded up to a power
    /// of two.
    pub fn with_shards(shards: usize) -> Self {
        let n = shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
            mask: n - 1,
        }
    }

    /// Joins the flight for `key`, starting one if none is in the air.
    pub fn join(&self, key: &str) -> Joined<'_, T> {
        let mut table = self.table(key).lock();
        if let Some(flight) = table.get(key) {
            return Joined::Follower(FlightFollower {
                flight: Arc::clone(flight),
            });
        }
        let flight = Arc::new(Flight::new());
        table.insert(key.to_string(), Arc::clone(&flight));
        Joined::Leader(FlightLeader {
            group: self,
            key: key.to_string(),
            flight,
            landed: false,
        })
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shards.iter().map(|t| t.lock().len()).sum()
    }

    /// Whether `key` is currently in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.table(key).lock().contains_key(key)
    }
}

impl<T> FlightGroup<T> {
    fn table(&self, key: &str) -> &Table<T> {
        &self.shards[key_hash(key) as usize & self.mask]
    }

    fn land(&self, key: &str, flight: &Arc<Flight<T>>, state: FlightState<T>) {
        {
            let mut table = self.table(key).lock();
            if table.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
                table.remove(key);
            }
        }
        *flight.state.lock() = state;
        flight.done.notify_all();
    }
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlightLeader<'_, T> {
    /// The key this leader is computing.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publishes `value` to every follower and ends the flight.
    pub fn complete(mut self, value: T) {
        self.landed = true;
        self.group
            .land(&self.key, &self.flight, FlightState::Finished(value));
    }
}

impl<T> Drop for FlightLeader<'_, T> {
    fn drop(&mut self) {
        if !self.landed {
            self.group
                .land(&self.key, &self.flight, FlightState::Abandoned);
        }
    }
}

impl<T: Clone> FlightFollower<T> {
    /// Blocks until the leader lands or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Landing<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.flight.state.lock();
        loop {
            match &*state {
                FlightState::Finished(value) => return Landing::Finished(value.clone()),
                FlightState::Abandoned => return Landing::Abandoned,
                FlightState::Running => {}
            }
            if self.flight.done.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    FlightState::Finished(value) => Landing::Finished(value.clone()),
                    FlightState::Abandoned => Landing::Abandoned,
                    FlightState::Running => Landing::TimedOut,
                };
            }
        }
    }
}
