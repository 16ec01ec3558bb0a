#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,

    clippy::all,
    // clippy::restriction,
    clippy::pedantic,
    // clippy::nursery, // It's still under development
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
    clippy::single_char_lifetime_names,
)]

//! Deadline ordered timers keyed by monotonic nanosecond timestamps.
//!
//! Timers sharing a timestamp are kept in insertion order, so popping always yields the
//! minimum `(timestamp, sequence)` pair first.

use once_cell::sync::Lazy;
use std::collections::vec_deque::Iter;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// get the current monotonic clock in ns.
///
/// The value counts from the first call in this process and never goes backwards,
/// wall clock adjustments do not affect it.
#[must_use]
pub fn now() -> u64 {
    u64::try_from(ANCHOR.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// current ns time add `dur`.
#[must_use]
pub fn get_timeout_time(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos())
        .map(|d| d.saturating_add(now()))
        .unwrap_or(u64::MAX)
}

/// Identifies one timer inside a [`TimerList`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerId {
    timestamp: u64,
    sequence: u64,
}

impl TimerId {
    /// The deadline of this timer.
    #[must_use]
    pub fn get_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The insertion sequence number of this timer.
    #[must_use]
    pub fn get_sequence(&self) -> u64 {
        self.sequence
    }
}

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}@{}", self.sequence, self.timestamp)
    }
}

/// A queue for managing multiple timers under a specified timestamp.
#[derive(Debug, Eq, PartialEq)]
pub struct TimerEntry<T> {
    timestamp: u64,
    inner: VecDeque<(u64, T)>,
}

impl<T> TimerEntry<T> {
    /// Creates an empty entry.
    #[must_use]
    pub fn new(timestamp: u64) -> Self {
        TimerEntry {
            timestamp,
            inner: VecDeque::new(),
        }
    }

    /// Returns the number of timers in the entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the entry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the timestamp.
    #[must_use]
    pub fn get_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Removes the earliest inserted timer and returns it, or `None` if the entry is empty.
    pub fn pop_front(&mut self) -> Option<(TimerId, T)> {
        let timestamp = self.timestamp;
        self.inner
            .pop_front()
            .map(|(sequence, t)| (TimerId { timestamp, sequence }, t))
    }

    fn push_back(&mut self, sequence: u64, t: T) {
        self.inner.push_back((sequence, t));
    }

    fn remove(&mut self, sequence: u64) -> Option<T> {
        // sequences only grow, so the deque is sorted
        let index = self
            .inner
            .binary_search_by(|(s, _)| s.cmp(&sequence))
            .ok()?;
        self.inner.remove(index).map(|(_, t)| t)
    }

    /// Returns a front-to-back iterator over `(sequence, timer)`.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, (u64, T)> {
        self.inner.iter()
    }
}

/// Timers ordered ascending by `(timestamp, insertion sequence)`.
#[derive(Debug, PartialEq, Eq)]
pub struct TimerList<T> {
    entries: VecDeque<TimerEntry<T>>,
    sequence: u64,
    len: usize,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        TimerList {
            entries: VecDeque::new(),
            sequence: 0,
            len: 0,
        }
    }
}

impl<T> TimerList<T> {
    /// Returns the number of timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of distinct timestamps.
    #[must_use]
    pub fn entry_len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there is no timer left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The sequence number the next inserted timer will get.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    /// Inserts a timer firing at `timestamp`.
    pub fn insert(&mut self, timestamp: u64, t: T) -> TimerId {
        let sequence = self.sequence;
        self.sequence += 1;
        match self
            .entries
            .binary_search_by(|x| x.timestamp.cmp(&timestamp))
        {
            Ok(index) => self.entries[index].push_back(sequence, t),
            Err(index) => {
                let mut entry = TimerEntry::new(timestamp);
                entry.push_back(sequence, t);
                self.entries.insert(index, entry);
            }
        }
        self.len += 1;
        TimerId {
            timestamp,
            sequence,
        }
    }

    /// Removes the timer and returns its payload.
    ///
    /// Cancelling an unknown, already cancelled or already fired timer returns `None`
    /// and leaves the list untouched.
    pub fn cancel(&mut self, id: &TimerId) -> Option<T> {
        let index = self
            .entries
            .binary_search_by(|x| x.timestamp.cmp(&id.timestamp))
            .ok()?;
        let entry = &mut self.entries[index];
        let t = entry.remove(id.sequence)?;
        if entry.is_empty() {
            _ = self.entries.remove(index);
        }
        self.len -= 1;
        Some(t)
    }

    /// Returns `true` if the timer is still pending.
    #[must_use]
    pub fn contains(&self, id: &TimerId) -> bool {
        self.entries
            .binary_search_by(|x| x.timestamp.cmp(&id.timestamp))
            .is_ok_and(|index| {
                self.entries[index]
                    .inner
                    .binary_search_by(|(s, _)| s.cmp(&id.sequence))
                    .is_ok()
            })
    }

    /// Provides a reference to the earliest entry, or `None` if the list is empty.
    #[must_use]
    pub fn front(&self) -> Option<&TimerEntry<T>> {
        self.entries.front()
    }

    /// The earliest pending timer.
    #[must_use]
    pub fn peek(&self) -> Option<TimerId> {
        self.entries.front().and_then(|entry| {
            entry.inner.front().map(|(sequence, _)| TimerId {
                timestamp: entry.timestamp,
                sequence: *sequence,
            })
        })
    }

    /// The earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.front().map(TimerEntry::get_timestamp)
    }

    /// Removes the earliest entry and returns it, or `None` if the list is empty.
    pub fn pop_front(&mut self) -> Option<TimerEntry<T>> {
        let entry = self.entries.pop_front()?;
        self.len -= entry.len();
        Some(entry)
    }

    /// Removes and returns the minimum timer whose timestamp is not after `now` and
    /// whose sequence is lower than `before`.
    ///
    /// Passing [`TimerList::next_sequence`] taken before a firing round as `before`
    /// keeps timers inserted during that round for the next one.
    pub fn pop_expired(&mut self, now: u64, before: u64) -> Option<(TimerId, T)> {
        let index = self
            .entries
            .iter()
            .take_while(|entry| entry.timestamp <= now)
            .position(|entry| entry.inner.front().is_some_and(|(s, _)| *s < before))?;
        let entry = &mut self.entries[index];
        let popped = entry.pop_front()?;
        if entry.is_empty() {
            _ = self.entries.remove(index);
        }
        self.len -= 1;
        Some(popped)
    }

    /// Removes every timer.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Returns a front-to-back iterator.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, TimerEntry<T>> {
        self.entries.iter()
    }
}
