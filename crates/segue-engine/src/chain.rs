//! Caller-supplied elements on the shared output path.
//!
//! Filters and tees can be added before the output exists; they wait and
//! go in right after it is built. While the output plays, changes are
//! held until data stops ahead of the element chain. Otherwise they are
//! applied straight away.

use crate::engine::Shared;
use crate::events::PlayerEvent;
use crate::graph::{OutputElementKind, OutputPath};
use crate::hooks::AudioFilter;
use segue_core::{Error, Result};
use tracing::{debug, warn};

/// A requested change to the output's element chain.
#[derive(Debug)]
pub(crate) enum ChainOp {
    Insert(OutputElementKind, Box<dyn AudioFilter>),
    Remove(OutputElementKind, String),
}

/// A change the shell hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainChange {
    Inserted(OutputElementKind, String),
    Removing(OutputElementKind, String),
}

impl<D> From<ChainChange> for PlayerEvent<D> {
    fn from(change: ChainChange) -> Self {
        match change {
            ChainChange::Inserted(kind, name) => Self::ElementInserted { kind, name },
            ChainChange::Removing(kind, name) => Self::ElementRemoving { kind, name },
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutputChain {
    /// Elements in the output, in insertion order.
    elements: Vec<(OutputElementKind, String)>,
    /// Changes waiting for the output to exist or the chain to block.
    queued: Vec<ChainOp>,
    /// A block was requested and hasn't been confirmed yet.
    pub blocking: bool,
}

impl OutputChain {
    pub fn elements(&self) -> Vec<(OutputElementKind, String)> {
        self.elements.clone()
    }

    /// Removing something that was never added is an error.
    pub fn check(&self, op: &ChainOp) -> Result<()> {
        let ChainOp::Remove(kind, name) = op else {
            return Ok(());
        };
        let present = self.elements.iter().any(|(k, n)| k == kind && n == name);
        let pending = self.queued.iter().any(|queued| {
            matches!(queued, ChainOp::Insert(k, element) if k == kind && element.name() == name)
        });
        if present || pending {
            Ok(())
        } else {
            Err(Error::NotFound(format!("output {kind} {name}")))
        }
    }

    pub fn queue(&mut self, op: ChainOp) {
        self.queued.push(op);
    }

    pub fn take_queued(&mut self) -> Vec<ChainOp> {
        std::mem::take(&mut self.queued)
    }

    pub fn apply(
        &mut self,
        output: &mut dyn OutputPath,
        op: ChainOp,
        notify: &mut dyn FnMut(ChainChange),
    ) -> Result<()> {
        match op {
            ChainOp::Insert(kind, element) => {
                let name = element.name().to_string();
                output
                    .insert_element(kind, element)
                    .map_err(|e| Error::Output(format!("failed to insert {kind} {name}: {e}")))?;
                debug!("Inserted output {kind} {name}");
                self.elements.push((kind, name.clone()));
                notify(ChainChange::Inserted(kind, name));
            }
            ChainOp::Remove(kind, name) => {
                let Some(index) = self
                    .elements
                    .iter()
                    .position(|(k, n)| *k == kind && *n == name)
                else {
                    debug!("Output {kind} {name} is already gone");
                    return Ok(());
                };
                notify(ChainChange::Removing(kind, name.clone()));
                self.elements.remove(index);
                output
                    .remove_element(kind, &name)
                    .map_err(|e| Error::Output(format!("failed to remove {kind} {name}: {e}")))?;
                debug!("Removed output {kind} {name}");
            }
        }
        Ok(())
    }
}

impl<D: Send + Sync + 'static> Shared<D> {
    pub(crate) fn change_output_chain(&self, op: ChainOp) -> Result<()> {
        let _control = self.control.lock();
        self.sink
            .change_chain(op, &mut |change| self.emit(change.into()))
    }

    /// Apply queued chain changes once the output exists or its chain
    /// is blocked.
    pub(crate) fn flush_output_chain(&self) {
        for e in self.sink.flush_chain(&mut |change| self.emit(change.into())) {
            warn!("Output chain change failed: {e}");
        }
    }
}
