use crate::crd::SwitchoverTrigger;
use crate::error::{Error, Result};

use super::super::sql::NodeAddress;

/// One switchover attempt's inputs.
///
/// Built fresh at the start of every attempt and never reused. A request
/// whose old primary is unreachable never issues SQL against it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchoverRequest {
    old_primary: NodeAddress,
    candidate: NodeAddress,
    trigger: SwitchoverTrigger,
    old_primary_reachable: bool,
}

impl SwitchoverRequest {
    pub fn new(
        old_primary: NodeAddress,
        candidate: NodeAddress,
        trigger: SwitchoverTrigger,
        old_primary_reachable: bool,
    ) -> Result<Self> {
        if old_primary.index == candidate.index {
            return Err(Error::ValidationError(format!(
                "switchover candidate {} is already the primary",
                candidate.name
            )));
        }
        Ok(Self {
            old_primary,
            candidate,
            trigger,
            old_primary_reachable,
        })
    }

    pub fn old_primary(&self) -> &NodeAddress {
        &self.old_primary
    }

    pub fn candidate(&self) -> &NodeAddress {
        &self.candidate
    }

    pub fn trigger(&self) -> SwitchoverTrigger {
        self.trigger
    }

    pub fn old_primary_reachable(&self) -> bool {
        self.old_primary_reachable
    }
}
