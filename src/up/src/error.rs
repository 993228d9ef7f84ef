// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed errors surfaced by the deployment engine.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The external-modification sentinel.
///
/// Signals that a resource in the deployment's scope was created, changed,
/// or deleted by something other than this run: a name that follows the
/// deployment's naming scheme without its annotation, an owned resource that
/// disappeared mid-run, or an owned resource whose shape is no longer what
/// the engine submitted. Always fatal. Detect it with
/// [`is_external_modification`].
#[derive(Clone, Copy, Debug, Error)]
#[error("another actor modified resources belonging to this deployment")]
pub struct ExternalModification;

/// Reports whether `err` carries the [`ExternalModification`] sentinel
/// anywhere in its chain.
pub fn is_external_modification(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ExternalModification>())
}

/// Constructs an [`ExternalModification`] error with a description of the
/// observed conflict.
pub(crate) fn external(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ExternalModification).context(msg.into())
}

/// A container reached a terminal state.
#[derive(Clone, Debug, Error)]
#[error(
    "container {container} of pod {pod} terminated: exit code {exit_code}, \
     signal {signal}, reason {reason}, message {message:?}"
)]
pub struct PodFailed {
    pub pod: String,
    pub container: String,
    pub exit_code: i32,
    pub signal: i32,
    pub reason: String,
    pub message: String,
}

/// A container's image could not be pulled by the cluster.
#[derive(Clone, Debug, Error)]
#[error("container {container} of pod {pod} failed to pull its image: {message}")]
pub struct PodImagePullFailed {
    pub pod: String,
    pub container: String,
    pub message: String,
}

/// A cloneable error handle for once-guarded computations.
///
/// Memoized results are shared by every waiter, errors included, so the
/// underlying `anyhow::Error` sits behind an `Arc`. The wrapper reports the
/// shared error as its own source, which keeps sentinel downcasts (such as
/// [`is_external_modification`]) working across the memoization boundary.
#[derive(Clone, Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> SharedError {
        SharedError(Arc::new(err))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let err: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        Some(err)
    }
}
