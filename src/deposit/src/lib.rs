// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The claim-check protocol for long-running requests.
//!
//! A client sends a [`DepositRequest`] to a node. The node answers at once
//! with a [`DepositReceipt`]: either the result, if an earlier request for
//! the same work already computed it, or a ticket to come back with. In the
//! latter case the node computes the result in the background and leaves it
//! in its [`ClaimStore`](sdb_claim::ClaimStore) for the client to collect.
//!
//! [`DepositNode`] is the node side, serving requests over TCP. A
//! [`ClaimAgent`] is the client side, polling a set of nodes until each has
//! produced its result.

#![warn(missing_docs)]

mod agent;
mod config;
mod node;
mod receipt;
mod request;

pub use crate::agent::{ClaimAgent, Collection, NodeAddress};
pub use crate::config::AgentConfig;
pub use crate::node::DepositNode;
pub use crate::receipt::{DepositReceipt, Disposition};
pub use crate::request::{DepositRequest, DepositWork, PendingDeposit};
