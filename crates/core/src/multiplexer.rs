//! Generic request merging with a cached maximal.
//!
//! Multiple clients issue per-resource requests; the multiplexer keeps them
//! in insertion order and maintains the merge-fold of all of them. It only
//! reports *whether* the maximal changed; the owning manager decides when to
//! act on that by reprogramming the underlying resource.

/// A mergeable per-resource request.
///
/// `merge` must be commutative, associative, and idempotent, with the
/// default-constructed request as identity, so the cached maximal is
/// unambiguous regardless of fold order.
pub trait Request: Clone + Default {
    fn is_equivalent_to(&self, other: &Self) -> bool;

    /// Combines two requests into the one that satisfies both.
    fn merge(&self, other: &Self) -> Self;
}

/// Ordered container of requests plus the cached maximal.
#[derive(Debug, Clone, Default)]
pub struct RequestMultiplexer<R: Request> {
    requests: Vec<R>,
    maximal: R,
}

impl<R: Request> RequestMultiplexer<R> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            maximal: R::default(),
        }
    }

    /// Appends a request. Returns its index and whether the maximal changed.
    pub fn add(&mut self, request: R) -> (usize, bool) {
        self.requests.push(request);
        let index = self.requests.len() - 1;
        (index, self.update_maximal())
    }

    /// Replaces the request at `index`; returns whether the maximal changed.
    pub fn update(&mut self, index: usize, request: R) -> bool {
        self.requests[index] = request;
        self.update_maximal()
    }

    /// Removes the request at `index`; returns whether the maximal changed.
    pub fn remove(&mut self, index: usize) -> bool {
        self.requests.remove(index);
        self.update_maximal()
    }

    pub fn requests(&self) -> &[R] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The merge-fold of all active requests; this is the value actually
    /// programmed into the driver.
    pub fn current_maximal(&self) -> &R {
        &self.maximal
    }

    fn update_maximal(&mut self) -> bool {
        let folded = self
            .requests
            .iter()
            .fold(R::default(), |acc, request| acc.merge(request));
        let changed = !folded.is_equivalent_to(&self.maximal);
        self.maximal = folded;
        changed
    }
}
