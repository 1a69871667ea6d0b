use serde::{Deserialize, Serialize};

/// Mutual-confirmation state of a cash appointment. `Resolved` is terminal;
/// `InReview` is terminal for the engine and waits on manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureState {
    None,
    PendingClose,
    Resolved,
    InReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClosureAction {
    None,
    CodeEntered,
    NoShow,
    Issue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClosureAction {
    None,
    Ok,
    NoShow,
    Issue,
}

/// Free-form per-party annotations. Each party only ever overwrites its own
/// sub-key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureNotes {
    pub provider: Option<String>,
    pub client: Option<String>,
}

impl ClosureNotes {
    pub fn merge_provider(&mut self, note: Option<String>) {
        if note.is_some() {
            self.provider = note;
        }
    }

    pub fn merge_client(&mut self, note: Option<String>) {
        if note.is_some() {
            self.client = note;
        }
    }
}
