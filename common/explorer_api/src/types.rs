use serde::{Deserialize, Serialize};

/// The envelope every explorer response is wrapped in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorerResponse<T> {
    pub status: String,
    pub data: T,
}

/// One epoch of a validator's attestation history, as reported by the explorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerAttestation {
    #[serde(rename = "validatorindex")]
    pub validator_index: u64,
    pub epoch: u64,
    #[serde(rename = "attesterslot")]
    pub attester_slot: u64,
    #[serde(rename = "committeeindex", default)]
    pub committee_index: u64,
    /// Zero when the attestation was never included.
    #[serde(rename = "inclusionslot")]
    pub inclusion_slot: u64,
    #[serde(default)]
    pub status: u64,
}

impl ExplorerAttestation {
    pub fn attested(&self) -> bool {
        self.inclusion_slot != 0
    }
}

/// An error body returned alongside a non-200 status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub status: String,
    #[serde(default)]
    pub data: Option<String>,
}
