//! AsyncFilterChain: ordered interceptors around an asynchronous handler.
//!
//! Each filter receives the request and a [`Next`] handle for the rest of the
//! chain, so it can act before, after or instead of the inner steps. The
//! chain is closed with a terminal handler and an error handler; the
//! resulting [`FilterChainHandler`] never rejects.

use super::async_value::Async;
use crate::error::AsyncError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// One step of a filter chain.
pub trait AsyncFilter<Req, Resp>: Send + Sync + 'static {
    /// Handle `request`, usually by calling `next.call(request)` at some
    /// point.
    fn filter(&self, request: Req, next: Next<Req, Resp>) -> Async<Resp>;
}

impl<Req, Resp, F> AsyncFilter<Req, Resp> for F
where
    F: Fn(Req, Next<Req, Resp>) -> Async<Resp> + Send + Sync + 'static,
{
    fn filter(&self, request: Req, next: Next<Req, Resp>) -> Async<Resp> {
        self(request, next)
    }
}

type Terminal<Req, Resp> = Arc<dyn Fn(Req) -> Async<Resp> + Send + Sync>;
type ErrorHandler<Resp> = Arc<dyn Fn(AsyncError) -> Resp + Send + Sync>;

struct Chain<Req, Resp> {
    filters: Vec<Arc<dyn AsyncFilter<Req, Resp>>>,
    terminal: Terminal<Req, Resp>,
}

/// The remainder of a chain, as seen by a filter.
pub struct Next<Req, Resp> {
    chain: Arc<Chain<Req, Resp>>,
    index: usize,
}

impl<Req, Resp> Clone for Next<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            index: self.index,
        }
    }
}

impl<Req, Resp> Next<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
{
    /// Run the remaining filters and the terminal handler.
    ///
    /// A panic in any of them becomes a rejection.
    pub fn call(self, request: Req) -> Async<Resp> {
        let chain = self.chain;
        let index = self.index;
        let step = catch_unwind(AssertUnwindSafe(|| match chain.filters.get(index) {
            Some(filter) => {
                let next = Next {
                    chain: chain.clone(),
                    index: index + 1,
                };
                filter.filter(request, next)
            }
            None => (chain.terminal)(request),
        }));
        step.unwrap_or_else(|payload| Async::rejected(AsyncError::panic(payload)))
    }

    /// Filters left before the terminal handler.
    pub fn remaining(&self) -> usize {
        self.chain.filters.len().saturating_sub(self.index)
    }
}

/// Builder for a chain of filters.
pub struct AsyncFilterChain<Req, Resp> {
    filters: Vec<Arc<dyn AsyncFilter<Req, Resp>>>,
}

impl<Req, Resp> Default for AsyncFilterChain<Req, Resp> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
        }
    }
}

impl<Req, Resp> AsyncFilterChain<Req, Resp>
where
    Req: Send + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter. Filters run in the order they are added.
    pub fn push(mut self, filter: impl AsyncFilter<Req, Resp>) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True if there are no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Close the chain.
    ///
    /// `terminal` runs after the last filter. `error_handler` turns any
    /// rejection or panic escaping the chain into a response.
    pub fn with<H, E>(self, terminal: H, error_handler: E) -> FilterChainHandler<Req, Resp>
    where
        H: Fn(Req) -> Async<Resp> + Send + Sync + 'static,
        E: Fn(AsyncError) -> Resp + Send + Sync + 'static,
    {
        FilterChainHandler {
            chain: Arc::new(Chain {
                filters: self.filters,
                terminal: Arc::new(terminal),
            }),
            error_handler: Arc::new(error_handler),
        }
    }
}

/// A closed filter chain.
pub struct FilterChainHandler<Req, Resp> {
    chain: Arc<Chain<Req, Resp>>,
    error_handler: ErrorHandler<Resp>,
}

impl<Req, Resp> Clone for FilterChainHandler<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            error_handler: self.error_handler.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for FilterChainHandler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChainHandler")
            .field("filters", &self.chain.filters.len())
            .finish()
    }
}

impl<Req, Resp> FilterChainHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    /// Run `request` through the chain.
    pub fn handle(&self, request: Req) -> Async<Resp> {
        let outcome = Next {
            chain: self.chain.clone(),
            index: 0,
        }
        .call(request);
        let error_handler = self.error_handler.clone();
        outcome.recover(move |error| {
            warn!(error = %error, "filter chain failed");
            error_handler(error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl AsyncFilter<u32, String> {
        let log = log.clone();
        move |req: u32, next: Next<u32, String>| {
            log.lock().push(format!("{} in", name));
            let out = next.call(req);
            let log = log.clone();
            out.map(move |resp| {
                log.lock().push(format!("{} out", name));
                resp
            })
        }
    }

    #[test]
    fn test_filters_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = AsyncFilterChain::<u32, String>::new()
            .push(recording(&log, "a"))
            .push(recording(&log, "b"))
            .with(|req: u32| Async::result(format!("resp {}", req)), |e| e.to_string());

        assert_eq!(handler.handle(7).join().unwrap(), "resp 7");
        assert_eq!(*log.lock(), vec!["a in", "b in", "b out", "a out"]);
    }

    #[test]
    fn test_filter_can_short_circuit() {
        let handler = AsyncFilterChain::<u32, String>::new()
            .push(|req: u32, next: Next<u32, String>| {
                if req == 0 {
                    Async::result("rejected zero".to_string())
                } else {
                    next.call(req)
                }
            })
            .with(|_| Async::result("ok".to_string()), |e| e.to_string());

        assert_eq!(handler.handle(0).join().unwrap(), "rejected zero");
        assert_eq!(handler.handle(1).join().unwrap(), "ok");
    }

    #[test]
    fn test_errors_become_responses() {
        let handler = AsyncFilterChain::<u32, String>::new()
            .push(|req: u32, next: Next<u32, String>| {
                if req == 1 {
                    panic!("filter blew up");
                }
                next.call(req)
            })
            .with(
                |_| Async::rejected(AsyncError::new("terminal failed")),
                |e| format!("error: {}", e.message()),
            );

        assert_eq!(handler.handle(1).join().unwrap(), "error: filter blew up");
        assert_eq!(handler.handle(2).join().unwrap(), "error: terminal failed");
    }
}
