//! Compilation queue entries and their ordering
//!
//! Synchronous requests go first (a thread is blocked on them), then higher
//! optimization levels, then arrival order.

use jit_core::{CompilationErrorCode, CompileDetails, MethodId, PlanHandle, StartPc};
use jit_server::ServerCompilationTask;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

/// Identity used for in-flight de-duplication.
pub type RequestKey = (MethodId, Option<StartPc>);

/// What a finished compilation reports back to a waiting requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionResult {
    pub entry: Option<StartPc>,
    pub error: CompilationErrorCode,
}

/// One-shot completion monitor shared by the worker and any synchronous
/// waiters.
#[derive(Debug, Default)]
pub struct Completion {
    result: Mutex<Option<CompletionResult>>,
    done: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: CompletionResult) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    pub fn wait(&self) -> CompletionResult {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = *result {
                return result;
            }
            self.done.wait(&mut result);
        }
    }

    pub fn try_result(&self) -> Option<CompletionResult> {
        *self.result.lock()
    }
}

/// A local method compilation.
#[derive(Debug)]
pub struct MethodRequest {
    pub details: CompileDetails,
    pub plan: PlanHandle,
    pub old_start_pc: Option<StartPc>,
    pub is_async: bool,
    /// Invalidation compiles bypass suspension and disablement
    pub mandatory: bool,
    pub completion: Arc<Completion>,
    pub queued_at: Instant,
}

impl MethodRequest {
    pub fn key(&self) -> RequestKey {
        (self.details.method.id(), self.old_start_pc)
    }
}

#[derive(Debug)]
pub enum WorkItem {
    Method(MethodRequest),
    /// A connection accepted by the server listener
    Remote(ServerCompilationTask),
}

impl WorkItem {
    fn priority(&self) -> u32 {
        match self {
            WorkItem::Method(request) => {
                let level = request.plan.plan().opt_level as u32;
                if request.is_async { level } else { 100 + level }
            }
            WorkItem::Remote(_) => 50,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, WorkItem::Method(request) if request.mandatory)
    }
}

#[derive(Debug)]
struct QueuedItem {
    priority: u32,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the older entry.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct CompilationQueue {
    heap: BinaryHeap<QueuedItem>,
    next_seq: u64,
    peak: usize,
}

impl CompilationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WorkItem) {
        let priority = item.priority();
        self.heap.push(QueuedItem {
            priority,
            seq: self.next_seq,
            item,
        });
        self.next_seq += 1;
        self.peak = self.peak.max(self.heap.len());
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.heap.pop().map(|queued| queued.item)
    }

    /// Remove the highest-priority mandatory entry, leaving the rest queued.
    pub fn pop_mandatory(&mut self) -> Option<WorkItem> {
        if !self.heap.iter().any(|queued| queued.item.is_mandatory()) {
            return None;
        }
        let mut rest = Vec::with_capacity(self.heap.len());
        let mut found = None;
        while let Some(queued) = self.heap.pop() {
            if found.is_none() && queued.item.is_mandatory() {
                found = Some(queued.item);
            } else {
                rest.push(queued);
            }
        }
        self.heap.extend(rest);
        found
    }

    pub fn has_mandatory(&self) -> bool {
        self.heap.iter().any(|queued| queued.item.is_mandatory())
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Remove every entry matching `predicate`, keeping the rest queued in
    /// their original order.
    pub fn extract_if(&mut self, mut predicate: impl FnMut(&WorkItem) -> bool) -> Vec<WorkItem> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .partition(|queued| predicate(&queued.item));
        self.heap.extend(kept);
        taken.into_iter().map(|queued| queued.item).collect()
    }

    /// Empty the queue, handing back every entry.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|queued| queued.item)
            .collect()
    }
}
