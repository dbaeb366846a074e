// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! What a node answers to a deposit request.

use serde::{Deserialize, Serialize};

use sdb_claim::{ProgressSnapshot, Ticket, Withdrawal, WithdrawalCode};

/// Where a request stands on one node, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The node holds a drawer for the request that is not filled yet. Come
    /// back later with the same ticket.
    Pending,
    /// The contents are in the receipt.
    Retrieved,
    /// The computation failed; the receipt carries the failure.
    Failed,
    /// The drawer expired and the request asked not to recompute it.
    Expired,
    /// The node knows nothing of the ticket.
    Unreserved,
}

impl Disposition {
    /// Whether the client should stop asking this node.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Disposition::Retrieved | Disposition::Failed | Disposition::Expired
        )
    }
}

/// A node's answer to a [`DepositRequest`](crate::DepositRequest).
///
/// A receipt without a withdrawal means the node just reserved a drawer for
/// the request and scheduled its computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositReceipt<T> {
    /// The node that issued the receipt.
    pub node_name: String,
    /// The node's ticket for the request.
    pub ticket: Ticket,
    /// The withdrawal made for the request, if the node had a drawer for it.
    pub withdrawal: Option<Withdrawal<T>>,
    /// The progress of the computation filling the drawer.
    pub progress: ProgressSnapshot,
}

impl<T> DepositReceipt<T> {
    /// Where the request stands on the issuing node.
    pub fn disposition(&self) -> Disposition {
        match self.withdrawal.as_ref().map(|w| w.code) {
            None | Some(WithdrawalCode::NoDeposit) => Disposition::Pending,
            Some(WithdrawalCode::Retrieved) => Disposition::Retrieved,
            Some(WithdrawalCode::Failed) => Disposition::Failed,
            Some(WithdrawalCode::Expired) => Disposition::Expired,
            Some(WithdrawalCode::Unreserved) => Disposition::Unreserved,
        }
    }

    /// Whether the client should resubmit the request with this receipt's
    /// ticket.
    pub fn rain_check(&self) -> bool {
        self.disposition() == Disposition::Pending
    }

    /// Whether the receipt carries the drawer's contents.
    pub fn has_contents(&self) -> bool {
        self.contents().is_some()
    }

    /// The drawer's contents, if retrieved.
    pub fn contents(&self) -> Option<&T> {
        self.withdrawal.as_ref().and_then(|w| w.contents.as_ref())
    }

    /// The failure of the computation, if it failed.
    pub fn failure(&self) -> Option<&str> {
        self.withdrawal.as_ref().and_then(|w| w.failure.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(withdrawal: Option<Withdrawal<u32>>) -> DepositReceipt<u32> {
        DepositReceipt {
            node_name: "n1".into(),
            ticket: Ticket(3),
            withdrawal,
            progress: ProgressSnapshot::UNKNOWN,
        }
    }

    fn withdrawal(code: WithdrawalCode) -> Withdrawal<u32> {
        Withdrawal {
            ticket: Ticket(3),
            code,
            contents: (code == WithdrawalCode::Retrieved).then_some(9),
            failure: (code == WithdrawalCode::Failed).then(|| "boom".to_string()),
            reserved_at: Some(0),
            filled_at: None,
            withdrawn_at: 5,
        }
    }

    #[sdb_ore::test]
    fn dispositions() {
        let fresh = receipt(None);
        assert_eq!(fresh.disposition(), Disposition::Pending);
        assert!(fresh.rain_check());
        assert!(!fresh.has_contents());

        let waiting = receipt(Some(withdrawal(WithdrawalCode::NoDeposit)));
        assert!(waiting.rain_check());

        let done = receipt(Some(withdrawal(WithdrawalCode::Retrieved)));
        assert_eq!(done.disposition(), Disposition::Retrieved);
        assert!(!done.rain_check());
        assert_eq!(done.contents(), Some(&9));

        let failed = receipt(Some(withdrawal(WithdrawalCode::Failed)));
        assert_eq!(failed.disposition(), Disposition::Failed);
        assert_eq!(failed.failure(), Some("boom"));
        sdb_ore::assert_none!(failed.contents());

        for code in [WithdrawalCode::Expired, WithdrawalCode::Unreserved] {
            let receipt = receipt(Some(withdrawal(code)));
            assert!(!receipt.rain_check(), "{code}");
            assert!(!receipt.has_contents(), "{code}");
        }
        assert!(Disposition::Expired.is_terminal());
        assert!(!Disposition::Unreserved.is_terminal());
    }
}
