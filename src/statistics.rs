use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// One increment against a named control-plane counter.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    Requests(usize),
    Errors(usize),
    Registers(usize),
    Heartbeats(usize),
    Queries(usize),
    Evictions(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Control-plane counters.
#[derive(Default)]
pub struct Counts<T> {
    pub requests: T,
    pub errors: T,
    pub registers: T,
    pub heartbeats: T,
    pub queries: T,
    pub evictions: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use m2m_hub::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::Requests(1));
    /// assert_eq!(counts.requests.get(), 1);
    ///
    /// counts.add(&Stats::Errors(1));
    /// assert_eq!(counts.errors.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::Requests(v) => self.requests.add(*v),
            Stats::Errors(v) => self.errors.add(*v),
            Stats::Registers(v) => self.registers.add(*v),
            Stats::Heartbeats(v) => self.heartbeats.add(*v),
            Stats::Queries(v) => self.queries.add(*v),
            Stats::Evictions(v) => self.evictions.add(*v),
        }
    }
}

/// Shared counter handle, cloned into every connection task.
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts<Count>>);

impl Statistics {
    /// # Example
    ///
    /// ```
    /// use m2m_hub::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.add(&Stats::Registers(1));
    /// assert_eq!(statistics.snapshot().registers, 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        self.0.add(payload);
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> Counts<usize> {
        Counts {
            requests: self.0.requests.get(),
            errors: self.0.errors.get(),
            registers: self.0.registers.get(),
            heartbeats: self.0.heartbeats.get(),
            queries: self.0.queries.get(),
            evictions: self.0.evictions.get(),
        }
    }
}
