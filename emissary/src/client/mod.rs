// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Gateway-facing halves of Emissary's two modes.
//!
//! Inbound mode fetches the [directory] once, then runs a [pool] of local
//! listeners whose connections each get a dedicated [relay]. Outbound mode
//! runs a single [outbound] session instead.

pub mod directory;
pub mod outbound;
pub mod pool;
pub mod relay;

pub use directory::{fetch_services, fetch_services_with_retry, DirectoryError};
pub use outbound::{OutboundClient, OutboundError, OutboundState};
pub use pool::{BindError, ListenerPool, ProxyBinding};
pub use relay::{RelayEngine, RelayError, RelayStats};
