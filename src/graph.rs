//! Edges, input slots and the mutation queues that edit them.
//!
//! Edges are not stored in a central structure. Every input slot holds the
//! upstream [`Source`]s it sums, and each source keeps its node alive, so the
//! graph is simply whatever is reachable from the destination and the
//! automatic-pull list. Edits are never applied where they are requested: the
//! control thread pushes a [`NodeOp`] or [`ParamOp`](crate::param::ParamOp)
//! onto the owner's [`OpQueue`] and the render thread drains it when the owner
//! is next processed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};

use crate::bus::{Bus, ChannelInterpretation};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::render::RenderPass;

/// One upstream end of an edge: a node and one of its outputs.
#[derive(Clone)]
pub(crate) struct Source {
    node: Node,
    output: usize,
}

impl Source {
    pub(crate) fn new(node: Node, output: usize) -> Self {
        Self { node, output }
    }

    #[inline]
    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    pub(crate) fn is(&self, node: &Node, output: usize) -> bool {
        self.output == output && self.node.ptr_eq(node)
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    pub(crate) fn edge(&self, input: usize) -> Edge {
        Edge {
            input,
            source: self.node.id(),
            output: self.output,
        }
    }

    /// The upstream output bus, unless it is being written right now.
    pub(crate) fn output_bus(&self) -> Option<MutexGuard<'_, Bus>> {
        self.node.output_bus(self.output)
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.is(&other.node, other.output)
    }
}

/// A node input: the sources summed into it and the bus they are summed into.
pub(crate) struct InputSlot {
    sources: Vec<Source>,
    bus: Bus,
    interpretation: ChannelInterpretation,
}

impl InputSlot {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            sources: Vec::new(),
            bus: Bus::new(1, frames),
            interpretation: ChannelInterpretation::Speakers,
        }
    }

    #[inline]
    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    #[inline]
    pub(crate) fn number_of_channels(&self) -> usize {
        self.bus.number_of_channels()
    }

    pub(crate) fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub(crate) fn set_interpretation(&mut self, interpretation: ChannelInterpretation) {
        self.interpretation = interpretation;
    }

    /// Add `source` unless already present. Returns it back if it was a
    /// duplicate so the caller can retire the extra reference.
    pub(crate) fn connect(&mut self, source: Source) -> Option<Source> {
        if self.sources.contains(&source) {
            return Some(source);
        }
        self.sources.push(source);
        None
    }

    pub(crate) fn disconnect(&mut self, source: &Source) -> Option<Source> {
        let at = self.sources.iter().position(|s| s == source)?;
        Some(self.sources.swap_remove(at))
    }

    pub(crate) fn take_sources(&mut self) -> Vec<Source> {
        std::mem::take(&mut self.sources)
    }

    /// Render every source for this quantum and sum them into the slot bus.
    ///
    /// The bus takes the channel count of the widest source (mono when
    /// nothing is connected). Returns true when that count changed, which
    /// only happens after a connectivity change.
    pub(crate) fn pull(&mut self, pass: &RenderPass<'_>) -> bool {
        for source in self.sources.iter() {
            source.node().process_if_necessary(pass);
        }

        let mut channels = 0;
        for source in self.sources.iter() {
            if let Some(bus) = source.output_bus() {
                channels = channels.max(bus.number_of_channels());
            }
        }
        if self.sources.is_empty() {
            channels = 1;
        } else if channels == 0 {
            // every source busy or channel-less: keep the current shape
            channels = self.bus.number_of_channels();
        }

        let changed = channels != self.bus.number_of_channels();
        if changed {
            self.bus.set_number_of_channels(channels);
        }

        let mut written = false;
        for source in self.sources.iter() {
            let Some(bus) = source.output_bus() else {
                continue;
            };
            if written {
                self.bus.sum_from(&bus, self.interpretation);
            } else {
                self.bus.copy_from(&bus, self.interpretation);
                written = true;
            }
        }
        if !written {
            self.bus.zero();
        }

        changed
    }
}

/// Mutation requests for a node's inputs.
pub(crate) enum NodeOp {
    AddInput,
    Connect { input: usize, source: Source },
    Disconnect { input: usize, source: Source },
    DisconnectInput(usize),
    DisconnectAll,
    SetInterpretation {
        input: usize,
        interpretation: ChannelInterpretation,
    },
}

/// One applied edge, as control threads see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub input: usize,
    /// [`Node::id`] of the upstream node.
    pub source: u64,
    pub output: usize,
}

/// The applied edges of one node or param, republished by the render thread
/// after it edits them.
///
/// Connectivity queries read this instead of render state. The render side
/// only `try_lock`s it; while a reader holds the lock the publish waits for
/// the next quantum, and the ops it covers stay pending until then.
pub(crate) struct EdgeSnapshot {
    edges: Mutex<Vec<Edge>>,
    unpublished: AtomicUsize,
}

impl EdgeSnapshot {
    pub(crate) fn new() -> Self {
        Self {
            edges: Mutex::new(Vec::new()),
            unpublished: AtomicUsize::new(0),
        }
    }

    /// Record `ops` drained and applied but not yet published.
    pub(crate) fn applied(&self, ops: usize) {
        self.unpublished.fetch_add(ops, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn is_stale(&self) -> bool {
        self.unpublished.load(Ordering::Acquire) > 0
    }

    /// Replace the published edges. Returns how many applied ops became
    /// visible, zero if a reader held the lock.
    pub(crate) fn publish(&self, edges: impl Iterator<Item = Edge>) -> usize {
        let Some(mut published) = self.edges.try_lock() else {
            return 0;
        };
        published.clear();
        published.extend(edges);
        self.unpublished.swap(0, Ordering::AcqRel)
    }

    /// Control-side clear, used when the owner is torn down.
    pub(crate) fn clear(&self) -> usize {
        self.edges.lock().clear();
        self.unpublished.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn any(&self, predicate: impl FnMut(&Edge) -> bool) -> bool {
        self.edges.lock().iter().any(predicate)
    }
}

/// Bounded multi-producer queue drained by exactly one render-side consumer.
///
/// Every queue created by one context shares its `pending` counter, which is
/// what [`Context::synchronize_connections`](crate::Context::synchronize_connections)
/// waits on.
pub(crate) struct OpQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    pending: Arc<AtomicUsize>,
}

impl<T> OpQueue<T> {
    pub(crate) fn new(capacity: usize, pending: Arc<AtomicUsize>) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, pending }
    }

    /// Enqueue `op`. `owner` names the node or param in the error.
    pub(crate) fn push(&self, op: T, owner: &str) -> Result<()> {
        // count first so a racing drain never takes the counter below zero
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(op) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match e {
                    TrySendError::Full(_) => Err(Error::QueueFull {
                        node: owner.to_owned(),
                    }),
                    TrySendError::Disconnected(_) => Err(Error::ContextClosed),
                }
            }
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Pop every queued op in FIFO order without allocating.
    ///
    /// Popped ops still count as pending until [`settle`](Self::settle)d, so
    /// a control thread never sees the queue done before the result is
    /// visible.
    pub(crate) fn drain(&self) -> impl Iterator<Item = T> + '_ {
        core::iter::from_fn(move || self.rx.try_recv().ok())
    }

    pub(crate) fn settle(&self, ops: usize) {
        if ops > 0 {
            self.pending.fetch_sub(ops, Ordering::AcqRel);
        }
    }
}
