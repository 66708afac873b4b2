//! Keeps frozen test-case step copies in line with their live interface.
//!
//! A step holds its own copy of the interface definition. A [`SyncConfig`]
//! binds one interface to one step and names the fields to propagate. Every
//! propagation, rollback or failure appends a [`SyncRecord`]; records are
//! never edited.

use crate::error::{EngineError, Result};
use crate::model::InterfaceDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncField {
    Method,
    Url,
    Headers,
    Params,
    Body,
    SetupHooks,
    TeardownHooks,
    Variables,
    Validators,
    Extract,
}

impl SyncField {
    pub const ALL: [SyncField; 10] = [
        SyncField::Method,
        SyncField::Url,
        SyncField::Headers,
        SyncField::Params,
        SyncField::Body,
        SyncField::SetupHooks,
        SyncField::TeardownHooks,
        SyncField::Variables,
        SyncField::Validators,
        SyncField::Extract,
    ];

    /// Key of the field in a serialized [`InterfaceDefinition`].
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncField::Method => "method",
            SyncField::Url => "url",
            SyncField::Headers => "headers",
            SyncField::Params => "params",
            SyncField::Body => "body",
            SyncField::SetupHooks => "setup_hooks",
            SyncField::TeardownHooks => "teardown_hooks",
            SyncField::Variables => "variables",
            SyncField::Validators => "validators",
            SyncField::Extract => "extract",
        }
    }

    pub fn all() -> SyncFieldSet {
        Self::ALL.into_iter().collect()
    }
}

pub type SyncFieldSet = BTreeSet<SyncField>;

/// The live interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<u64>,
    pub definition: InterfaceDefinition,
}

/// A test case step with its frozen interface copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseStep {
    pub id: u64,
    #[serde(default)]
    pub interface_id: Option<u64>,
    pub definition: InterfaceDefinition,
    #[serde(default)]
    pub last_sync_time: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Manual,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: u64,
    pub interface_id: u64,
    pub step_id: u64,
    pub fields: SyncFieldSet,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fields whose change triggers a sync; defaults to `fields`.
    #[serde(default)]
    pub fields_to_watch: Option<SyncFieldSet>,
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    fn watched(&self) -> &SyncFieldSet {
        self.fields_to_watch.as_ref().unwrap_or(&self.fields)
    }
}

/// Project-wide field set for interface/step pairs without a config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSyncConfig {
    pub project_id: u64,
    pub fields: SyncFieldSet,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Manual,
    Auto,
    Rollback,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: u64,
    pub config_id: Option<u64>,
    pub interface_id: u64,
    pub step_id: u64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub fields: SyncFieldSet,
    /// Step values before the change.
    pub old_data: Map<String, Value>,
    /// Values written to the step.
    pub new_data: Map<String, Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

/// A detected but not yet applied change (manual mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSync {
    pub config_id: u64,
    pub interface_id: u64,
    pub step_id: u64,
    pub fields: SyncFieldSet,
    pub old_data: Map<String, Value>,
    pub new_data: Map<String, Value>,
    pub detected_at: String,
}

/// Outcome of [`SyncReconciler::batch_sync`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSyncReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub records: Vec<SyncRecord>,
}

/// Storage of test case steps.
pub trait StepRepository {
    fn get_step(&self, id: u64) -> Option<TestCaseStep>;
    fn save_step(&mut self, step: TestCaseStep) -> Result<()>;
}

impl StepRepository for HashMap<u64, TestCaseStep> {
    fn get_step(&self, id: u64) -> Option<TestCaseStep> {
        self.get(&id).cloned()
    }

    fn save_step(&mut self, step: TestCaseStep) -> Result<()> {
        self.insert(step.id, step);
        Ok(())
    }
}

/// Values of `fields` in `def`; absent fields are `null`.
pub fn snapshot(def: &InterfaceDefinition, fields: &SyncFieldSet) -> Result<Map<String, Value>> {
    let Value::Object(all) = serde_json::to_value(def)? else {
        return Err(EngineError::Sync("definition did not serialize to an object".into()));
    };
    Ok(fields
        .iter()
        .map(|f| (f.as_str().to_string(), all.get(f.as_str()).cloned().unwrap_or(Value::Null)))
        .collect())
}

/// Fields among `fields` whose values differ between `a` and `b`.
pub fn diff_fields(
    a: &InterfaceDefinition,
    b: &InterfaceDefinition,
    fields: &SyncFieldSet,
) -> Result<SyncFieldSet> {
    let left = snapshot(a, fields)?;
    let right = snapshot(b, fields)?;
    Ok(fields
        .iter()
        .copied()
        .filter(|f| left.get(f.as_str()) != right.get(f.as_str()))
        .collect())
}

/// Copy of `def` with `values` written over it. `def` itself is untouched.
pub fn apply_fields(def: &InterfaceDefinition, values: &Map<String, Value>) -> Result<InterfaceDefinition> {
    let Value::Object(mut all) = serde_json::to_value(def)? else {
        return Err(EngineError::Sync("definition did not serialize to an object".into()));
    };
    for (key, value) in values {
        if value.is_null() {
            all.remove(key);
        } else {
            all.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(all))
        .map_err(|e| EngineError::Sync(format!("cannot apply synced fields: {e}")))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Reconciles steps in a [`StepRepository`] against interface updates.
pub struct SyncReconciler<R: StepRepository> {
    steps: R,
    configs: Vec<SyncConfig>,
    global: Option<GlobalSyncConfig>,
    records: Vec<SyncRecord>,
    pending: Vec<PendingSync>,
}

impl<R: StepRepository> SyncReconciler<R> {
    pub fn new(steps: R) -> Self {
        Self {
            steps,
            configs: Vec::new(),
            global: None,
            records: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn with_global_config(mut self, global: GlobalSyncConfig) -> Self {
        self.global = Some(global);
        self
    }

    /// Add a config, replacing any with the same id.
    pub fn add_config(&mut self, config: SyncConfig) {
        self.configs.retain(|c| c.id != config.id);
        self.configs.push(config);
    }

    pub fn config(&self, id: u64) -> Option<&SyncConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    pub fn steps(&self) -> &R {
        &self.steps
    }

    pub fn records(&self) -> &[SyncRecord] {
        &self.records
    }

    pub fn pending(&self) -> &[PendingSync] {
        &self.pending
    }

    /// React to an interface change. Auto configs are applied immediately;
    /// manual configs get a pending diff. Returns the records written.
    pub fn on_interface_updated(&mut self, before: &Interface, after: &Interface) -> Vec<SyncRecord> {
        let changed = match diff_fields(&before.definition, &after.definition, &SyncField::all()) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Could not diff interface {}: {}", after.id, e);
                return Vec::new();
            }
        };
        if changed.is_empty() {
            debug!("Interface {} updated without field changes", after.id);
            return Vec::new();
        }
        info!("Interface {} changed fields: {:?}", after.id, changed);

        let triggered: Vec<SyncConfig> = self
            .configs
            .iter()
            .filter(|c| c.interface_id == after.id && c.enabled)
            .filter(|c| c.watched().intersection(&changed).next().is_some())
            .cloned()
            .collect();

        let mut written = Vec::new();
        for config in triggered {
            match config.mode {
                SyncMode::Auto => {
                    written.push(self.apply(Some(config.id), &config.fields, after, config.step_id, SyncType::Auto));
                }
                SyncMode::Manual => self.record_pending(&config, after),
            }
        }
        written
    }

    fn record_pending(&mut self, config: &SyncConfig, interface: &Interface) {
        let Some(step) = self.steps.get_step(config.step_id) else {
            warn!("Sync config {} points at missing step {}", config.id, config.step_id);
            return;
        };
        let diff = diff_fields(&step.definition, &interface.definition, &config.fields).and_then(|fields| {
            Ok((
                snapshot(&step.definition, &fields)?,
                snapshot(&interface.definition, &fields)?,
                fields,
            ))
        });
        match diff {
            Ok((_, _, fields)) if fields.is_empty() => {
                self.pending.retain(|p| p.config_id != config.id);
            }
            Ok((old_data, new_data, fields)) => {
                info!("Pending sync for config {}: {:?}", config.id, fields);
                self.pending.retain(|p| p.config_id != config.id);
                self.pending.push(PendingSync {
                    config_id: config.id,
                    interface_id: interface.id,
                    step_id: config.step_id,
                    fields,
                    old_data,
                    new_data,
                    detected_at: now(),
                });
            }
            Err(e) => warn!("Could not diff step {}: {}", config.step_id, e),
        }
    }

    /// Apply a config now, regardless of its mode.
    pub fn sync_now(&mut self, config_id: u64, interface: &Interface) -> Result<SyncRecord> {
        let config = self
            .config(config_id)
            .cloned()
            .ok_or_else(|| EngineError::Sync(format!("sync config {config_id} not found")))?;
        if !config.enabled {
            return Err(EngineError::Sync(format!("sync config {config_id} is disabled")));
        }
        if config.interface_id != interface.id {
            return Err(EngineError::Sync(format!(
                "sync config {config_id} is bound to interface {}, not {}",
                config.interface_id, interface.id
            )));
        }
        let record = self.apply(Some(config.id), &config.fields, interface, config.step_id, SyncType::Manual);
        if record.status == SyncStatus::Success {
            self.pending.retain(|p| p.config_id != config_id);
        }
        Ok(record)
    }

    /// Sync an interface/step pair: its own config if one exists, else the
    /// project-wide field set.
    pub fn sync_pair(&mut self, interface: &Interface, step_id: u64) -> Result<SyncRecord> {
        if let Some(config) = self
            .configs
            .iter()
            .find(|c| c.interface_id == interface.id && c.step_id == step_id)
        {
            let id = config.id;
            return self.sync_now(id, interface);
        }
        let fields = match &self.global {
            Some(global)
                if global.enabled && (interface.project_id.is_none() || interface.project_id == Some(global.project_id)) =>
            {
                global.fields.clone()
            }
            _ => {
                return Err(EngineError::Sync(format!(
                    "no sync config for interface {} and step {step_id}",
                    interface.id
                )))
            }
        };
        Ok(self.apply(None, &fields, interface, step_id, SyncType::Manual))
    }

    /// Apply several configs; interfaces are looked up by id.
    pub fn batch_sync(&mut self, config_ids: &[u64], interfaces: &[Interface]) -> BatchSyncReport {
        let mut records = Vec::with_capacity(config_ids.len());
        let mut failed = 0;

        for &config_id in config_ids {
            let config = match self.config(config_id).cloned() {
                Some(c) if c.enabled => c,
                Some(_) => {
                    warn!("Batch sync skipped disabled config {}", config_id);
                    failed += 1;
                    continue;
                }
                None => {
                    warn!("Batch sync: config {} not found", config_id);
                    failed += 1;
                    continue;
                }
            };
            let Some(interface) = interfaces.iter().find(|i| i.id == config.interface_id) else {
                warn!("Batch sync: interface {} not found", config.interface_id);
                failed += 1;
                continue;
            };
            let record = self.apply(Some(config.id), &config.fields, interface, config.step_id, SyncType::Batch);
            if record.status == SyncStatus::Success {
                self.pending.retain(|p| p.config_id != config_id);
            } else {
                failed += 1;
            }
            records.push(record);
        }

        let total = config_ids.len();
        info!("Batch sync finished: {} total, {} failed", total, failed);
        BatchSyncReport {
            total,
            success: total - failed,
            failed,
            records,
        }
    }

    /// Restore the fields a successful record overwrote. Appends a new
    /// record holding the pre-rollback values.
    pub fn rollback(&mut self, record_id: u64) -> Result<SyncRecord> {
        let synced = self
            .records
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
            .ok_or_else(|| EngineError::Sync(format!("sync record {record_id} not found")))?;
        if synced.status != SyncStatus::Success {
            return Err(EngineError::Sync(format!(
                "sync record {record_id} did not succeed, nothing to roll back"
            )));
        }

        let mut record = self.new_record(
            synced.config_id,
            synced.interface_id,
            synced.step_id,
            SyncType::Rollback,
            synced.fields.clone(),
        );
        record.new_data = synced.old_data.clone();

        let result = self.steps.get_step(synced.step_id).ok_or_else(|| {
            EngineError::Sync(format!("step {} not found", synced.step_id))
        });
        let outcome = result.and_then(|mut step| {
            record.old_data = snapshot(&step.definition, &synced.fields)?;
            step.definition = apply_fields(&step.definition, &synced.old_data)?;
            step.last_sync_time = Some(now());
            self.steps.save_step(step)
        });
        Ok(self.finish(record, outcome))
    }

    fn apply(
        &mut self,
        config_id: Option<u64>,
        fields: &SyncFieldSet,
        interface: &Interface,
        step_id: u64,
        sync_type: SyncType,
    ) -> SyncRecord {
        let mut record = self.new_record(config_id, interface.id, step_id, sync_type, fields.clone());

        let outcome = self
            .steps
            .get_step(step_id)
            .ok_or_else(|| EngineError::Sync(format!("step {step_id} not found")))
            .and_then(|mut step| {
                record.old_data = snapshot(&step.definition, fields)?;
                record.new_data = snapshot(&interface.definition, fields)?;
                step.definition = apply_fields(&step.definition, &record.new_data)?;
                step.last_sync_time = Some(now());
                self.steps.save_step(step)
            });
        self.finish(record, outcome)
    }

    fn new_record(
        &self,
        config_id: Option<u64>,
        interface_id: u64,
        step_id: u64,
        sync_type: SyncType,
        fields: SyncFieldSet,
    ) -> SyncRecord {
        SyncRecord {
            id: self.records.len() as u64 + 1,
            config_id,
            interface_id,
            step_id,
            sync_type,
            status: SyncStatus::Success,
            fields,
            old_data: Map::new(),
            new_data: Map::new(),
            error: None,
            timestamp: now(),
        }
    }

    fn finish(&mut self, mut record: SyncRecord, outcome: Result<()>) -> SyncRecord {
        match outcome {
            Ok(()) => info!(
                "Synced step {} from interface {} ({:?})",
                record.step_id, record.interface_id, record.sync_type
            ),
            Err(e) => {
                warn!(
                    "Sync of step {} from interface {} failed: {}",
                    record.step_id, record.interface_id, e
                );
                record.status = SyncStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        self.records.push(record.clone());
        record
    }
}
