//! Finalize and revert primitives for multi-step changes.
//!
//! A change that spans several components is applied eagerly and then either
//! made permanent or undone once the caller knows the outcome of the larger
//! operation it belongs to:
//!
//! - **Finalize**: makes a deferred effect permanent (acknowledging a port,
//!   releasing a port). Finalizers run in the order they were added.
//! - **Revert**: undoes an already applied effect. Reverts run in reverse
//!   order, and every step runs even if an earlier one failed.
//!
//! # Invariants
//!
//! - A [`Transaction`] is settled at most once: both [`Transaction::finalize`]
//!   and [`Transaction::revert`] consume it.
//! - Finalize and revert of the same transaction are mutually exclusive.

use std::fmt;
use std::future::Future;
use std::mem;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

/// Revert errors.
#[derive(Debug, Error)]
pub enum RevertError {
    /// A single revert step failed.
    #[error("revert of {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// More than one step failed; the first failure is kept.
    #[error("{failed} revert steps failed, first: {first}")]
    Multiple {
        failed: usize,
        first: Box<RevertError>,
    },
}

impl RevertError {
    /// Build a step failure from any displayable cause.
    pub fn step(step: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::StepFailed {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Closures
// ============================================================================

/// Owned, single-use finalizer.
pub struct FinalizeFn(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>);

impl FinalizeFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    /// Run the finalizer.
    pub async fn call(self) {
        (self.0)().await
    }
}

impl fmt::Debug for FinalizeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FinalizeFn")
    }
}

/// Owned, single-use revert step.
pub struct RevertFn(Box<dyn FnOnce() -> BoxFuture<'static, Result<(), RevertError>> + Send>);

impl RevertFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RevertError>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    /// Run the revert step.
    pub async fn call(self) -> Result<(), RevertError> {
        (self.0)().await
    }
}

impl fmt::Debug for RevertFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RevertFn")
    }
}

// ============================================================================
// Finalize list / revert stack
// ============================================================================

/// Finalizers run in insertion order.
#[derive(Debug, Default)]
pub struct FinalizeList {
    fns: Vec<FinalizeFn>,
}

impl FinalizeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, f: FinalizeFn) {
        self.fns.push(f);
    }

    /// Add a finalizer if there is one.
    pub fn append(&mut self, f: Option<FinalizeFn>) {
        if let Some(f) = f {
            self.fns.push(f);
        }
    }

    /// Move all finalizers of `other` after the ones already queued.
    pub fn extend(&mut self, other: FinalizeList) {
        self.fns.extend(other.fns);
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Run every finalizer in order.
    pub async fn finalize(self) {
        for f in self.fns {
            f.call().await;
        }
    }
}

/// Revert steps run in reverse insertion order.
#[derive(Debug, Default)]
pub struct RevertStack {
    fns: Vec<RevertFn>,
}

impl RevertStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, f: RevertFn) {
        self.fns.push(f);
    }

    /// Push a revert step if there is one.
    pub fn append(&mut self, f: Option<RevertFn>) {
        if let Some(f) = f {
            self.fns.push(f);
        }
    }

    /// Stack `other` on top: its steps are reverted before the ones already here.
    pub fn extend(&mut self, other: RevertStack) {
        self.fns.extend(other.fns);
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Run every revert step, last pushed first.
    ///
    /// A failing step is logged and does not stop the remaining steps. The
    /// first failure is returned once all steps have run.
    pub async fn revert(self) -> Result<(), RevertError> {
        let mut first: Option<RevertError> = None;
        let mut failed = 0usize;

        for f in self.fns.into_iter().rev() {
            if let Err(e) = f.call().await {
                warn!(error = %e, "Revert step failed, continuing");
                failed += 1;
                if first.is_none() {
                    first = Some(e);
                }
            }
        }

        match (first, failed) {
            (None, _) => Ok(()),
            (Some(e), 1) => Err(e),
            (Some(e), n) => Err(RevertError::Multiple {
                failed: n,
                first: Box::new(e),
            }),
        }
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// A set of deferred effects that must be settled exactly once.
///
/// Returned by operations whose caller decides later whether the change
/// sticks. Call [`finalize`](Self::finalize) to commit or
/// [`revert`](Self::revert) to undo.
#[must_use = "a transaction must be finalized or reverted"]
#[derive(Debug, Default)]
pub struct Transaction {
    finalizers: FinalizeList,
    reverts: RevertStack,
    settled: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(finalizers: FinalizeList, reverts: RevertStack) -> Self {
        Self {
            finalizers,
            reverts,
            settled: false,
        }
    }

    pub fn on_finalize(&mut self, f: FinalizeFn) {
        self.finalizers.push(f);
    }

    pub fn on_revert(&mut self, f: RevertFn) {
        self.reverts.push(f);
    }

    /// Compose a sub-transaction into this one.
    ///
    /// Its finalizers run after ours; its reverts run before ours.
    pub fn merge(&mut self, mut other: Transaction) {
        let (finalizers, reverts) = other.take_parts();
        self.finalizers.extend(finalizers);
        self.reverts.extend(reverts);
    }

    /// True if settling this transaction would do nothing.
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty() && self.reverts.is_empty()
    }

    pub fn has_finalizers(&self) -> bool {
        !self.finalizers.is_empty()
    }

    pub fn has_reverts(&self) -> bool {
        !self.reverts.is_empty()
    }

    /// Make every deferred effect permanent.
    pub async fn finalize(mut self) {
        let (finalizers, _reverts) = self.take_parts();
        finalizers.finalize().await;
    }

    /// Undo every applied effect, best effort.
    pub async fn revert(mut self) -> Result<(), RevertError> {
        let (_finalizers, reverts) = self.take_parts();
        reverts.revert().await
    }

    /// Hand the raw closures to the caller, settling this value.
    pub fn into_parts(mut self) -> (FinalizeList, RevertStack) {
        self.take_parts()
    }

    fn take_parts(&mut self) -> (FinalizeList, RevertStack) {
        self.settled = true;
        (
            mem::take(&mut self.finalizers),
            mem::take(&mut self.reverts),
        )
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.settled && !self.is_empty() {
            warn!(
                finalizers = self.finalizers.len(),
                reverts = self.reverts.len(),
                "Transaction dropped without being finalized or reverted"
            );
        }
    }
}
