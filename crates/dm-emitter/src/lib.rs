// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod config;
pub mod emit;
pub mod emitter;
pub mod entity;
pub mod errors;
pub mod feature_flags;
pub mod fwrequest;
pub mod identity;
pub mod processor;
pub mod protocol;
pub mod register;
pub mod sender;
pub mod stats;

#[cfg(test)]
mod test_support;
