//! Gate Admin CLI: operate kill switches, organization suspensions, and
//! feature flag overrides against a control-state file. The runbook
//! surface for emergency containment.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tenantgate_access::audit::{AuditEntry, AuditTrail};
use tenantgate_access::flags::FlagResolver;
use tenantgate_access::killswitch::{KillSwitchEngine, KillSwitchQuery};
use tenantgate_core::config::AppConfig;
use tenantgate_core::types::PlanTier;
use tenantgate_store::memory::{ControlState, MemoryControlStore};
use tenantgate_store::records::{FlagConditions, KillSwitchScope, OrganizationFlagOverride};
use tenantgate_store::traits::OrganizationStore;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gate-admin")]
#[command(about = "TenantGate Access Control Administration Tool")]
#[command(version)]
struct Cli {
    /// Path to the control-state file (overrides config)
    #[arg(long, env = "TENANT_GATE__ADMIN__STATE_PATH")]
    state: Option<String>,

    /// Acting operator recorded in the audit trail
    #[arg(long, default_value = "gate-admin")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed demo organizations and flag definitions into the state file
    Seed,

    /// Kill-switch operations
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },

    /// Organization status operations
    Org {
        #[command(subcommand)]
        action: OrgAction,
    },

    /// Feature flag override operations
    Flag {
        #[command(subcommand)]
        action: FlagAction,
    },

    /// Audit trail inspection
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum KillSwitchAction {
    /// Activate a switch (upserts on scope + target)
    Activate {
        /// Scope: global, product, feature, organization
        scope: String,

        /// Target id (omit for global scope)
        #[arg(long)]
        target: Option<String>,

        /// Human-readable reason shown to blocked callers
        #[arg(long)]
        reason: Option<String>,

        /// Auto-expire after this many hours
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },

    /// Disable a switch without deleting it
    Deactivate {
        /// Scope: global, product, feature, organization
        scope: String,

        /// Target id (omit for global scope)
        #[arg(long)]
        target: Option<String>,
    },

    /// List every switch row
    List,

    /// Evaluate the switches for a product/feature/organization
    Check {
        /// Product id
        product: String,

        #[arg(long)]
        feature: Option<String>,

        #[arg(long)]
        org: Option<String>,
    },
}

#[derive(Subcommand)]
enum OrgAction {
    /// Suspend an organization
    Suspend {
        /// Organization UUID
        id: String,

        #[arg(long)]
        reason: String,
    },

    /// Return an organization to active
    Unsuspend {
        /// Organization UUID
        id: String,
    },

    /// Show an organization record
    Status {
        /// Organization UUID
        id: String,
    },
}

#[derive(Subcommand)]
enum FlagAction {
    /// Set a per-organization override
    SetOverride {
        /// Organization UUID
        org: String,

        /// Flag key
        key: String,

        /// Enabled state (true/false)
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove a per-organization override
    RemoveOverride {
        /// Organization UUID
        org: String,

        /// Flag key
        key: String,
    },

    /// Resolve the full flag map for an organization
    Resolve {
        /// Organization UUID
        org: String,

        /// Plan tier: free, starter, pro, enterprise
        #[arg(long, default_value = "free")]
        plan: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// List recent audit entries, newest first
    List {
        #[arg(long)]
        org: Option<String>,

        /// Maximum entries to show (defaults to the configured limit)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Verify the hash chain
    Verify,
}

/// Everything the CLI persists between invocations.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct AdminState {
    #[serde(default)]
    control: ControlState,
    #[serde(default)]
    audit: Vec<AuditEntry>,
}

fn parse_scope(s: &str) -> anyhow::Result<KillSwitchScope> {
    match s.to_lowercase().as_str() {
        "global" => Ok(KillSwitchScope::Global),
        "product" => Ok(KillSwitchScope::Product),
        "feature" => Ok(KillSwitchScope::Feature),
        "organization" | "org" => Ok(KillSwitchScope::Organization),
        _ => bail!("unknown scope '{s}' (expected global, product, feature, organization)"),
    }
}

fn parse_plan(s: &str) -> anyhow::Result<PlanTier> {
    match s.to_lowercase().as_str() {
        "free" => Ok(PlanTier::Free),
        "starter" => Ok(PlanTier::Starter),
        "pro" | "professional" => Ok(PlanTier::Pro),
        "enterprise" | "ent" => Ok(PlanTier::Enterprise),
        _ => bail!("unknown plan '{s}' (expected free, starter, pro, enterprise)"),
    }
}

fn parse_org(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid organization UUID '{s}'"))
}

fn load_state(path: &str) -> anyhow::Result<AdminState> {
    if !Path::new(path).exists() {
        return Ok(AdminState::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse state file {path}"))
}

fn save_state(path: &str, store: &MemoryControlStore, audit: &AuditTrail) -> anyhow::Result<()> {
    let state = AdminState {
        control: store.snapshot(),
        audit: audit.export(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&state)?)
        .with_context(|| format!("failed to write state file {path}"))?;
    info!(path, "Control state saved");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gate_admin=info,tenantgate_access=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    let state_path = cli.state.clone().unwrap_or(config.admin.state_path.clone());

    let state = load_state(&state_path)?;
    let store = Arc::new(MemoryControlStore::restore(state.control));
    let audit = Arc::new(AuditTrail::restore(state.audit));
    let engine = KillSwitchEngine::new(store.clone(), store.clone(), audit.clone())
        .with_fail_closed(config.kill_switch.fail_closed);
    let resolver = FlagResolver::new(store.clone(), audit.clone(), &config.flag_cache);

    match cli.command {
        Commands::Seed => {
            store.seed_demo();
            save_state(&state_path, &store, &audit)?;
            for org in store.snapshot().organizations {
                println!("{}  {}  {}", org.id, org.plan.as_str(), org.name);
            }
        }

        Commands::KillSwitch { action } => match action {
            KillSwitchAction::Activate {
                scope,
                target,
                reason,
                expires_in_hours,
            } => {
                let scope = parse_scope(&scope)?;
                let expires_at = expires_in_hours.map(|h| Utc::now() + Duration::hours(h));
                let switch = engine
                    .activate_kill_switch(scope, target, reason, &cli.actor, expires_at)
                    .await?;
                save_state(&state_path, &store, &audit)?;
                println!("{}", serde_json::to_string_pretty(&switch)?);
            }
            KillSwitchAction::Deactivate { scope, target } => {
                let scope = parse_scope(&scope)?;
                match engine
                    .deactivate_kill_switch(scope, target.as_deref(), &cli.actor)
                    .await?
                {
                    Some(switch) => {
                        save_state(&state_path, &store, &audit)?;
                        println!("{}", serde_json::to_string_pretty(&switch)?);
                    }
                    None => println!("No switch found for that scope/target"),
                }
            }
            KillSwitchAction::List => {
                for switch in engine.list_kill_switches().await? {
                    println!(
                        "{}  {:12}  target={:24}  enabled={}  expires={}",
                        switch.id,
                        switch.scope.as_str(),
                        switch.target_id.as_deref().unwrap_or("*"),
                        switch.enabled,
                        switch
                            .expires_at
                            .map(|e| e.to_rfc3339())
                            .unwrap_or_else(|| "never".into()),
                    );
                }
            }
            KillSwitchAction::Check {
                product,
                feature,
                org,
            } => {
                let mut query = KillSwitchQuery::product(product);
                if let Some(feature) = feature {
                    query = query.feature(feature);
                }
                if let Some(org) = org {
                    query = query.organization(parse_org(&org)?);
                }
                let decision = engine.check_kill_switch(&query).await?;
                println!("{}", serde_json::to_string_pretty(&decision)?);
            }
        },

        Commands::Org { action } => match action {
            OrgAction::Suspend { id, reason } => {
                let record = engine
                    .suspend_organization(parse_org(&id)?, &reason, &cli.actor)
                    .await?;
                save_state(&state_path, &store, &audit)?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            OrgAction::Unsuspend { id } => {
                let record = engine
                    .unsuspend_organization(parse_org(&id)?, &cli.actor)
                    .await?;
                save_state(&state_path, &store, &audit)?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            OrgAction::Status { id } => {
                match OrganizationStore::get(store.as_ref(), parse_org(&id)?).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => println!("Organization not found"),
                }
            }
        },

        Commands::Flag { action } => match action {
            FlagAction::SetOverride {
                org,
                key,
                enabled,
                reason,
            } => {
                resolver
                    .set_override(OrganizationFlagOverride {
                        organization_id: parse_org(&org)?,
                        flag_key: key.clone(),
                        enabled,
                        conditions: FlagConditions::default(),
                        set_by: cli.actor.clone(),
                        reason,
                        updated_at: Utc::now(),
                    })
                    .await?;
                save_state(&state_path, &store, &audit)?;
                println!("Override set: {key} -> {enabled}");
            }
            FlagAction::RemoveOverride { org, key } => {
                let removed = resolver
                    .remove_override(parse_org(&org)?, &key, &cli.actor)
                    .await?;
                if removed {
                    save_state(&state_path, &store, &audit)?;
                    println!("Override removed: {key}");
                } else {
                    println!("No override found for {key}");
                }
            }
            FlagAction::Resolve { org, plan } => {
                let flags = resolver
                    .load_organization_feature_flags(parse_org(&org)?, parse_plan(&plan)?)
                    .await?;
                let mut keys: Vec<_> = flags.keys().collect();
                keys.sort();
                for key in keys {
                    println!("{key:32} {}", flags[key]);
                }
            }
        },

        Commands::Audit { action } => match action {
            AuditAction::List { org, limit } => {
                let org = org.as_deref().map(parse_org).transpose()?;
                let limit = limit.unwrap_or(config.audit.query_limit);
                for entry in audit.query(org, None, limit) {
                    println!(
                        "#{:<5} {}  {:28} {}  by {}",
                        entry.sequence,
                        entry.timestamp.to_rfc3339(),
                        entry.action,
                        entry.target_id,
                        entry.actor,
                    );
                }
            }
            AuditAction::Verify => {
                let verification = audit.verify_chain();
                println!("{}", serde_json::to_string_pretty(&verification)?);
                if !verification.chain_intact {
                    bail!("audit chain verification failed");
                }
            }
        },
    }

    Ok(())
}
