//! W3C PROV-JSON provenance graphs
//!
//! Links prompts, responses, tool inputs/outputs (entities) to the
//! activities that produced them and the software agents responsible.
//! Documents use the PROV-JSON key names (`prov:label`, `prov:startTime`,
//! `wasGeneratedBy`, ...) and omit empty relation lists.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::merkle::sha256_hex;

/// A PROV-JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvDocument {
    pub entity: BTreeMap<String, Value>,
    pub activity: BTreeMap<String, Value>,
    pub agent: BTreeMap<String, Value>,

    #[serde(rename = "wasGeneratedBy", default, skip_serializing_if = "Vec::is_empty")]
    pub was_generated_by: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used: Vec<Value>,
    #[serde(rename = "wasAssociatedWith", default, skip_serializing_if = "Vec::is_empty")]
    pub was_associated_with: Vec<Value>,
    #[serde(rename = "wasAttributedTo", default, skip_serializing_if = "Vec::is_empty")]
    pub was_attributed_to: Vec<Value>,
    #[serde(rename = "wasDerivedFrom", default, skip_serializing_if = "Vec::is_empty")]
    pub was_derived_from: Vec<Value>,
}

/// Builder assembling a [`ProvDocument`]
#[derive(Debug, Default)]
pub struct ProvBuilder {
    doc: ProvDocument,
}

impl ProvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity (artifact), optionally with extra attributes such
    /// as a content hash
    pub fn add_entity(&mut self, entity_id: &str, label: &str, attributes: Option<Map<String, Value>>) -> &mut Self {
        let mut entity = Map::new();
        entity.insert("prov:label".to_string(), Value::from(label));
        if let Some(attrs) = attributes {
            entity.extend(attrs);
        }
        self.doc.entity.insert(entity_id.to_string(), Value::Object(entity));
        self
    }

    /// Add an activity (process) with its time span
    pub fn add_activity(&mut self, activity_id: &str, start_time: &str, end_time: &str) -> &mut Self {
        self.doc.activity.insert(
            activity_id.to_string(),
            json!({
                "prov:type": "Activity",
                "prov:startTime": start_time,
                "prov:endTime": end_time,
            }),
        );
        self
    }

    /// Add an agent (software, person or organization)
    pub fn add_agent(&mut self, agent_id: &str, agent_type: &str, version: Option<&str>) -> &mut Self {
        let mut agent = Map::new();
        agent.insert("prov:type".to_string(), Value::from(agent_type));
        if let Some(v) = version {
            agent.insert("version".to_string(), Value::from(v));
        }
        self.doc.agent.insert(agent_id.to_string(), Value::Object(agent));
        self
    }

    /// Entity was generated by activity
    pub fn link_generated(&mut self, entity_id: &str, activity_id: &str) -> &mut Self {
        self.doc.was_generated_by.push(json!({
            "prov:entity": entity_id,
            "prov:activity": activity_id,
        }));
        self
    }

    /// Activity used entity
    pub fn link_used(&mut self, activity_id: &str, entity_id: &str) -> &mut Self {
        self.doc.used.push(json!({
            "prov:activity": activity_id,
            "prov:entity": entity_id,
        }));
        self
    }

    /// Activity was associated with agent
    pub fn link_associated(&mut self, activity_id: &str, agent_id: &str) -> &mut Self {
        self.doc.was_associated_with.push(json!({
            "prov:activity": activity_id,
            "prov:agent": agent_id,
        }));
        self
    }

    /// Entity was attributed to agent
    pub fn link_attributed(&mut self, entity_id: &str, agent_id: &str) -> &mut Self {
        self.doc.was_attributed_to.push(json!({
            "prov:entity": entity_id,
            "prov:agent": agent_id,
        }));
        self
    }

    /// Entity was derived from a source entity
    pub fn link_derived(&mut self, entity_id: &str, source_entity_id: &str) -> &mut Self {
        self.doc.was_derived_from.push(json!({
            "prov:generatedEntity": entity_id,
            "prov:usedEntity": source_entity_id,
        }));
        self
    }

    /// Finish and return the document
    pub fn build(self) -> ProvDocument {
        self.doc
    }
}

/// Parameters for [`ProvenanceStore::track_generation`]
#[derive(Debug, Clone)]
pub struct GenerationTrace<'a> {
    pub agent_id: &'a str,
    pub agent_version: &'a str,
    pub task_id: &'a str,
    pub prompt: &'a str,
    pub response: &'a str,
    pub start_time: &'a str,
    pub end_time: &'a str,
}

/// Parameters for [`ProvenanceStore::track_tool_execution`]
#[derive(Debug, Clone)]
pub struct ToolTrace<'a> {
    pub tool_name: &'a str,
    pub input_hash: &'a str,
    pub output_hash: &'a str,
    pub task_id: &'a str,
    pub start_time: &'a str,
    pub end_time: &'a str,
}

/// On-disk store of provenance documents
pub struct ProvenanceStore {
    output_dir: PathBuf,
    lock: Mutex<()>,
}

impl ProvenanceStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        debug!(?output_dir, "ProvenanceStore::new");
        Ok(Self {
            output_dir,
            lock: Mutex::new(()),
        })
    }

    /// Record one model generation: prompt and response entities, a
    /// generation activity and the producing agent
    ///
    /// Returns the provenance id; the document lands at
    /// `<dir>/prov_<id>.json`.
    pub fn track_generation(&self, trace: GenerationTrace<'_>) -> Option<String> {
        let prov_id = format!("prov-{}-{}", trace.task_id, &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let prompt_entity = format!("prompt:{}", trace.task_id);
        let response_entity = format!("response:{}", trace.task_id);
        let activity = format!("gen:{}", trace.task_id);

        let mut builder = ProvBuilder::new();
        builder
            .add_entity(
                &response_entity,
                "Response JSON",
                Some(hash_attrs(&sha256_hex(trace.response.as_bytes()))),
            )
            .add_entity(
                &prompt_entity,
                "Prompt",
                Some(hash_attrs(&sha256_hex(trace.prompt.as_bytes()))),
            )
            .add_activity(&activity, trace.start_time, trace.end_time)
            .add_agent(trace.agent_id, "softwareAgent", Some(trace.agent_version))
            .link_generated(&response_entity, &activity)
            .link_associated(&activity, trace.agent_id)
            .link_used(&activity, &prompt_entity)
            .link_derived(&response_entity, &prompt_entity);

        let filename = format!("prov_{prov_id}.json");
        self.write_document(&filename, &builder.build())?;
        Some(prov_id)
    }

    /// Record one tool execution: input/output entities linked through
    /// the executing tool agent
    pub fn track_tool_execution(&self, trace: ToolTrace<'_>) -> Option<ProvDocument> {
        let input_entity = format!("tool_input:{}:{}", trace.task_id, trace.tool_name);
        let output_entity = format!("tool_output:{}:{}", trace.task_id, trace.tool_name);
        let activity = format!("tool_exec:{}:{}", trace.task_id, trace.tool_name);
        let agent = format!("tool:{}", trace.tool_name);

        let mut builder = ProvBuilder::new();
        builder
            .add_entity(
                &input_entity,
                &format!("Tool input: {}", trace.tool_name),
                Some(hash_attrs(trace.input_hash)),
            )
            .add_entity(
                &output_entity,
                &format!("Tool output: {}", trace.tool_name),
                Some(hash_attrs(trace.output_hash)),
            )
            .add_activity(&activity, trace.start_time, trace.end_time)
            .add_agent(&agent, "softwareAgent", None)
            .link_associated(&activity, &agent)
            .link_generated(&output_entity, &activity)
            .link_used(&activity, &input_entity)
            .link_derived(&output_entity, &input_entity);

        let doc = builder.build();
        let filename = format!("prov-tool-{}-{}.json", trace.tool_name, trace.task_id);
        self.write_document(&filename, &doc)?;
        Some(doc)
    }

    /// Persist an arbitrary document under the store's directory
    pub fn write_document(&self, filename: &str, doc: &ProvDocument) -> Option<()> {
        let _guard = self.lock.lock().expect("provenance lock poisoned");
        let path = self.output_dir.join(filename);
        let json = match serde_json::to_string_pretty(doc) {
            Ok(j) => j,
            Err(e) => {
                error!(error = %e, "failed to serialize provenance document");
                return None;
            }
        };
        match fs::write(&path, json) {
            Ok(()) => Some(()),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to write provenance document");
                None
            }
        }
    }

    /// Load a document back by filename
    pub fn load_document(&self, filename: &str) -> Option<ProvDocument> {
        let content = fs::read_to_string(self.output_dir.join(filename)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

fn hash_attrs(hash_hex: &str) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("hash".to_string(), Value::from(format!("sha256:{hash_hex}")));
    attrs
}

/// RFC 3339 timestamp for activity time spans
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<ProvenanceStore>>> = Mutex::new(None);

/// Initialize the process-wide provenance store
pub fn init_global(output_dir: impl Into<PathBuf>) -> std::io::Result<Arc<ProvenanceStore>> {
    let store = Arc::new(ProvenanceStore::new(output_dir)?);
    *GLOBAL.lock().expect("provenance global lock poisoned") = Some(store.clone());
    Ok(store)
}

/// The process-wide provenance store, if initialized
pub fn global() -> Option<Arc<ProvenanceStore>> {
    GLOBAL.lock().expect("provenance global lock poisoned").clone()
}

/// Drop the process-wide provenance store
pub fn reset_global() {
    *GLOBAL.lock().expect("provenance global lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builder_shapes_prov_json() {
        let mut builder = ProvBuilder::new();
        builder
            .add_entity("response:1", "Response JSON", Some(hash_attrs("abc")))
            .add_entity("prompt:1", "Prompt", None)
            .add_activity("gen:1", "2026-01-01T00:00:00Z", "2026-01-01T00:00:01Z")
            .add_agent("agent", "softwareAgent", Some("1.0.0"))
            .link_generated("response:1", "gen:1")
            .link_used("gen:1", "prompt:1");

        let value = serde_json::to_value(builder.build()).unwrap();
        assert_eq!(value["entity"]["response:1"]["prov:label"], "Response JSON");
        assert_eq!(value["entity"]["response:1"]["hash"], "sha256:abc");
        assert_eq!(value["activity"]["gen:1"]["prov:startTime"], "2026-01-01T00:00:00Z");
        assert_eq!(value["agent"]["agent"]["prov:type"], "softwareAgent");
        assert_eq!(value["agent"]["agent"]["version"], "1.0.0");
        assert_eq!(value["wasGeneratedBy"][0]["prov:entity"], "response:1");
        assert_eq!(value["used"][0]["prov:activity"], "gen:1");
    }

    #[test]
    fn test_empty_relations_omitted() {
        let mut builder = ProvBuilder::new();
        builder.add_entity("e", "Entity", None);
        let value = serde_json::to_value(builder.build()).unwrap();

        let map = value.as_object().unwrap();
        assert!(!map.contains_key("wasGeneratedBy"));
        assert!(!map.contains_key("used"));
        assert!(!map.contains_key("wasAssociatedWith"));
        assert!(!map.contains_key("wasAttributedTo"));
        assert!(!map.contains_key("wasDerivedFrom"));
    }

    #[test]
    fn test_track_generation_writes_document() {
        let temp = tempdir().unwrap();
        let store = ProvenanceStore::new(temp.path()).unwrap();

        let now = now_iso();
        let prov_id = store
            .track_generation(GenerationTrace {
                agent_id: "agentorch",
                agent_version: "0.1.0",
                task_id: "task-9",
                prompt: "sum the file",
                response: "42",
                start_time: &now,
                end_time: &now,
            })
            .unwrap();

        let doc = store.load_document(&format!("prov_{prov_id}.json")).unwrap();
        assert!(doc.entity.contains_key("prompt:task-9"));
        assert!(doc.entity.contains_key("response:task-9"));
        assert!(doc.activity.contains_key("gen:task-9"));
        assert_eq!(doc.was_generated_by.len(), 1);
        assert_eq!(doc.was_derived_from.len(), 1);
    }

    #[test]
    fn test_track_tool_execution_links_derivation() {
        let temp = tempdir().unwrap();
        let store = ProvenanceStore::new(temp.path()).unwrap();

        let now = now_iso();
        let doc = store
            .track_tool_execution(ToolTrace {
                tool_name: "calculate",
                input_hash: "aa11",
                output_hash: "bb22",
                task_id: "task-3",
                start_time: &now,
                end_time: &now,
            })
            .unwrap();

        assert!(doc.entity.contains_key("tool_input:task-3:calculate"));
        assert!(doc.entity.contains_key("tool_output:task-3:calculate"));
        assert!(doc.agent.contains_key("tool:calculate"));
        assert_eq!(doc.was_derived_from.len(), 1);

        // Deterministic filename
        assert!(store.load_document("prov-tool-calculate-task-3.json").is_some());
    }
}
