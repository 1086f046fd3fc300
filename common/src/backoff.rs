// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.
//!
//! These retry policies should be used when attempting to access some
//! loosely-coupled component which may transiently fail due to:
//! - A cloud provider throttling or momentarily rejecting requests
//! - A coordination store write that lost a compare-and-swap race
//! - An inaccessible network

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for issuing cloud provider calls.
///
/// This policy makes early attempts quickly, but backs off significantly to
/// avoid hammering a provider that is throttling us.  It never gives up;
/// callers that need a bounded attempt budget should use
/// [retry_policy_provider_bounded].
pub fn retry_policy_provider() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(30))
        .build()
}

/// Return a backoff policy for issuing cloud provider calls with a bounded
/// total attempt budget.
///
/// The provisioner uses this for per-machine retries inside a single
/// reconciliation pass: once `total` has elapsed the operation fails and the
/// machine is left pending for the next pass.
pub fn retry_policy_provider_bounded(
    total: Duration,
) -> ::backoff::ExponentialBackoff {
    ::backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(Some(total))
        .build()
}

/// Return a backoff policy for conditions local to this process.
///
/// This policy has a very small max interval, and should be used only in
/// cases where repeating the request does not risk overloading whatever is
/// being queried (e.g. re-reading the in-process coordination store).
pub fn retry_policy_local() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .build()
}

fn backoff_builder() -> ::backoff::ExponentialBackoffBuilder {
    let mut builder = ::backoff::ExponentialBackoffBuilder::new();
    builder.with_multiplier(2.0).with_max_elapsed_time(None);
    builder
}
