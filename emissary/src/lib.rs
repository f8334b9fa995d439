// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod common;
pub mod config;
pub mod util;

pub mod client;

#[cfg(test)]
mod test_support;
