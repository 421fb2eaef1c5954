//! Per-table sync opinions and the strategy two peers agree on.

use crate::error::{SchemaError, SchemaResult};
use crate::schema::{RelationalSchemaObject, SchemaType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One side's view of whether a table may sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOpinion {
    /// The table may sync.
    pub permit_sync: bool,
    /// The peer must convert rows before sending them to us.
    pub require_peer_convert: bool,
    /// Incoming rows must be checked against the local schema.
    pub check_on_receive: bool,
}

impl SyncOpinion {
    /// Creates an opinion.
    pub fn new(permit_sync: bool, require_peer_convert: bool, check_on_receive: bool) -> Self {
        Self {
            permit_sync,
            require_peer_convert,
            check_on_receive,
        }
    }
}

/// Opinions for every table one side knows about.
///
/// Exchanged with peers as JSON during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalSyncOpinion {
    opinions: BTreeMap<String, SyncOpinion>,
}

impl RelationalSyncOpinion {
    /// Creates an empty opinion set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the default-permissive local opinion for a schema.
    ///
    /// Every well formed table may sync; checks and conversions are off
    /// until a negotiation with a specific peer says otherwise. Stores
    /// that are not relational get no opinion.
    pub fn make_local(schema: &RelationalSchemaObject, schema_type: SchemaType) -> Self {
        let mut opinion = Self::new();
        if schema_type != SchemaType::Relative {
            return opinion;
        }
        for (name, table) in schema.tables() {
            let permit = !table.fields.is_empty();
            opinion.add_sync_opinion(name.clone(), SyncOpinion::new(permit, false, false));
        }
        opinion
    }

    /// Sets the opinion for a table.
    pub fn add_sync_opinion(&mut self, table: impl Into<String>, opinion: SyncOpinion) {
        self.opinions.insert(table.into(), opinion);
    }

    /// Opinion for a table; unknown tables read as all-false.
    pub fn get_table_opinion(&self, table: &str) -> SyncOpinion {
        self.opinions.get(table).copied().unwrap_or_default()
    }

    /// All opinions keyed by table.
    pub fn opinions(&self) -> &BTreeMap<String, SyncOpinion> {
        &self.opinions
    }

    /// Encodes for the negotiation message.
    pub fn encode(&self) -> SchemaResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| SchemaError::JsonParseFail(err.to_string()))
    }

    /// Decodes a peer's negotiation message.
    pub fn decode(bytes: &[u8]) -> SchemaResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| SchemaError::JsonParseFail(err.to_string()))
    }
}

/// Agreed handling of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStrategy {
    /// Both sides permit the table.
    pub permit_sync: bool,
    /// Convert rows before sending them to the peer.
    pub convert_on_send: bool,
    /// Convert rows received from the peer.
    pub convert_on_receive: bool,
    /// Check received rows against the local schema.
    pub check_on_receive: bool,
}

/// Strategies for the tables both sides know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalSyncStrategy {
    strategies: BTreeMap<String, SyncStrategy>,
}

impl RelationalSyncStrategy {
    /// Reconciles the local and remote opinions.
    ///
    /// A table appears only if both sides have an opinion on it, and may
    /// sync only if both permit it. Send conversion follows the local
    /// opinion; receive conversion follows the remote one.
    pub fn conclude(local: &RelationalSyncOpinion, remote: &RelationalSyncOpinion) -> Self {
        let mut strategies = BTreeMap::new();
        for (table, mine) in &local.opinions {
            let Some(theirs) = remote.opinions.get(table) else {
                debug!(table = %table, "table unknown to peer, excluded");
                continue;
            };
            strategies.insert(
                table.clone(),
                SyncStrategy {
                    permit_sync: mine.permit_sync && theirs.permit_sync,
                    convert_on_send: mine.require_peer_convert,
                    convert_on_receive: theirs.require_peer_convert,
                    check_on_receive: mine.check_on_receive,
                },
            );
        }
        Self { strategies }
    }

    /// Strategy for a table; tables outside the agreement cannot sync.
    pub fn get_table_strategy(&self, table: &str) -> SyncStrategy {
        self.strategies.get(table).copied().unwrap_or_default()
    }

    /// All strategies keyed by table.
    pub fn strategies(&self) -> &BTreeMap<String, SyncStrategy> {
        &self.strategies
    }

    /// Tables both sides agreed to sync.
    pub fn permitted_tables(&self) -> Vec<String> {
        self.strategies
            .iter()
            .filter(|(_, strategy)| strategy.permit_sync)
            .map(|(table, _)| table.clone())
            .collect()
    }
}
