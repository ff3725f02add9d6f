// Core domain types shared by the relay and its clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ot::Ops;

/// Property name to current text of a card.
pub type PropertySnapshot = BTreeMap<String, String>;

/// The property every card carries and free-text search targets.
pub const BODY_PROP: &str = "body";

/// The property shown as a search result's title.
pub const TITLE_PROP: &str = "title";

/// An edit to one property of a card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    pub prop: String,
    pub ops: Ops,
}

/// One record returned by a store query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    pub props: PropertySnapshot,
}

impl SearchHit {
    fn prop(&self, name: &str) -> &str {
        self.props.get(name).map(String::as_str).unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.prop(TITLE_PROP)
    }

    pub fn body(&self) -> &str {
        self.prop(BODY_PROP)
    }
}
