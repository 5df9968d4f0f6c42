use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Account signed in to the chat service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
}
