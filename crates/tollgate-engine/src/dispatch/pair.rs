//! Units of work tracked by the dispatch loop.

use crate::descriptor::{Request, Response, UsageEstimate};

/// Lifecycle of a pair within one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    /// Waiting to be considered for dispatch.
    Open,
    /// Being checked for admission.
    Waiting,
    /// A call is in flight.
    Running,
    /// A response is recorded.
    Done,
}

/// One input request and, eventually, its response.
#[derive(Debug)]
pub(crate) struct Pair {
    pub(crate) index: usize,
    pub(crate) request: Request,
    pub(crate) estimate: UsageEstimate,
    pub(crate) response: Option<Response>,
    pub(crate) status: PairStatus,
}

impl Pair {
    pub(crate) fn new(index: usize, request: Request) -> Self {
        Self {
            index,
            request,
            estimate: UsageEstimate::default(),
            response: None,
            status: PairStatus::Open,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.status == PairStatus::Open
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status == PairStatus::Done
    }

    pub(crate) fn resolve(&mut self, response: Response) {
        self.response = Some(response);
        self.status = PairStatus::Done;
    }

    pub(crate) fn reopen(&mut self) {
        self.status = PairStatus::Open;
    }
}

/// Dispatch order: largest estimated usage first, except that the smallest goes first of all
/// so an early round trip can report the endpoint's quota.
pub(crate) fn dispatch_order(pairs: &[Pair]) -> Vec<usize> {
    let mut order: Vec<usize> = pairs.iter().filter(|p| p.is_open()).map(|p| p.index).collect();
    order.sort_by(|&a, &b| {
        pairs[b].estimate.max_total_tokens().cmp(&pairs[a].estimate.max_total_tokens())
    });
    order.rotate_right(1);
    order
}
