//! Append-only audit trail for administrative mutations, with
//! cryptographic hash chaining so tampering is detectable.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

/// A single audit entry, hash-chained to its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: u64,
    /// Absent for platform-wide actions (global kill switches).
    pub organization_id: Option<Uuid>,
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 over this entry's content.
    pub entry_hash: String,
    /// Hash of the previous entry ("genesis" for the first).
    pub previous_hash: String,
}

/// Result of verifying the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub tampered_sequences: Vec<u64>,
    pub chain_intact: bool,
}

/// Append-only audit log. Entries are never removed; kill switches are
/// disabled rather than deleted for the same reason.
pub struct AuditTrail {
    entries: DashMap<Uuid, AuditEntry>,
    sequence: parking_lot::Mutex<u64>,
    last_hash: parking_lot::Mutex<String>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sequence: parking_lot::Mutex::new(0),
            last_hash: parking_lot::Mutex::new("genesis".to_string()),
        }
    }

    /// Export every entry in sequence order, for persistence.
    pub fn export(&self) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Rebuild a trail from exported entries, resuming the chain where
    /// it left off.
    pub fn restore(entries: Vec<AuditEntry>) -> Self {
        let trail = Self::new();
        if let Some(last) = entries.iter().max_by_key(|e| e.sequence) {
            *trail.sequence.lock() = last.sequence;
            *trail.last_hash.lock() = last.entry_hash.clone();
        }
        for entry in entries {
            trail.entries.insert(entry.id, entry);
        }
        trail
    }

    /// Record an administrative action.
    pub fn record(
        &self,
        organization_id: Option<Uuid>,
        actor: &str,
        action: &str,
        target_type: &str,
        target_id: &str,
        details: serde_json::Value,
    ) -> AuditEntry {
        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence: 0,
            organization_id,
            actor: actor.to_string(),
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            details,
            timestamp: Utc::now(),
            entry_hash: String::new(),
            previous_hash: String::new(),
        };

        {
            let mut seq = self.sequence.lock();
            *seq += 1;
            entry.sequence = *seq;

            let mut prev = self.last_hash.lock();
            entry.previous_hash = prev.clone();
            entry.entry_hash = Self::content_hash(&entry);
            *prev = entry.entry_hash.clone();
        }

        info!(
            sequence = entry.sequence,
            action = %entry.action,
            target = %entry.target_id,
            actor = %entry.actor,
            "Audit entry recorded"
        );
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    /// Query entries, newest first, optionally filtered by organization
    /// and action.
    pub fn query(
        &self,
        organization_id: Option<Uuid>,
        action: Option<&str>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let mut results: Vec<AuditEntry> = self
            .entries
            .iter()
            .filter(|e| {
                let entry = e.value();
                if let Some(org) = organization_id {
                    if entry.organization_id != Some(org) {
                        return false;
                    }
                }
                if let Some(a) = action {
                    if entry.action != a {
                        return false;
                    }
                }
                true
            })
            .map(|e| e.value().clone())
            .collect();

        results.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        results.truncate(limit);
        results
    }

    /// Walk the chain in sequence order, recomputing every hash.
    pub fn verify_chain(&self) -> ChainVerification {
        let mut entries: Vec<AuditEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.sequence);

        let total = entries.len();
        let mut valid = 0;
        let mut tampered = Vec::new();
        let mut expected_prev = "genesis".to_string();

        for entry in &entries {
            if entry.previous_hash != expected_prev
                || Self::content_hash(entry) != entry.entry_hash
            {
                tampered.push(entry.sequence);
            } else {
                valid += 1;
            }
            expected_prev = entry.entry_hash.clone();
        }

        ChainVerification {
            total_entries: total,
            valid_entries: valid,
            tampered_sequences: tampered,
            chain_intact: valid == total,
        }
    }

    fn content_hash(entry: &AuditEntry) -> String {
        let content = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            entry.sequence,
            entry.actor,
            entry.action,
            entry.target_type,
            entry.target_id,
            entry.timestamp.to_rfc3339(),
            entry.previous_hash,
        );
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }
}
