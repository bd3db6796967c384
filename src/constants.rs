//! Engine-wide constants and the governance hash type

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, WorkflowError};

/// Length of a governance hash in hexadecimal characters
pub const GOVERNANCE_HASH_LEN: usize = 16;

/// Default overall workflow timeout
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-attempt step timeout
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget per step (attempts beyond the first)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between step retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for a single compensation attempt
pub const DEFAULT_COMPENSATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retry budget for compensations (total attempts)
pub const DEFAULT_COMPENSATION_RETRIES: u32 = 3;

/// Default cap on concurrently executing DAG nodes
pub const DEFAULT_MAX_PARALLEL_NODES: usize = 10;

/// Default iteration budget for cyclic graphs
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Governance hash enforced at every trust boundary.
///
/// The engine never embeds a hash literal; the expected value is injected at
/// construction time and carried through contexts, results, events, and
/// audit payloads. A mismatch at any boundary is a fail-closed error by
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstitutionalHash(String);

impl ConstitutionalHash {
    /// Parse a governance hash, enforcing the 16-lowercase-hex shape
    pub fn new(value: &str) -> EngineResult<Self> {
        let well_formed = value.len() == GOVERNANCE_HASH_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !well_formed {
            return Err(WorkflowError::Validation(format!(
                "governance hash must be {} lowercase hex characters, got '{}'",
                GOVERNANCE_HASH_LEN, value
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// Hash value as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against an arbitrary provided value
    pub fn matches(&self, provided: &str) -> bool {
        self.0 == provided
    }
}

impl fmt::Display for ConstitutionalHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ConstitutionalHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
