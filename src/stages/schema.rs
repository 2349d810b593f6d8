//! Typed schemas for every transform call site.
//!
//! Raw transform text is reduced to one JSON object, deserialized into the
//! call site's schema, and then checked with [`ResponseSchema::validate`].
//! Checks that need context (the names in a merge batch, the entities known
//! to the grouping call) live on the schema types as `validate_against`.

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Mermaid diagram headers accepted by the ontology stage.
pub const MERMAID_HEADERS: [&str; 4] = ["classDiagram", "graph", "flowchart", "erDiagram"];

/// A transform response type with intrinsic validation rules.
pub trait ResponseSchema: DeserializeOwned + Send {
    /// Checks invariants serde cannot express. Returns a human readable reason.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Readability verdict of the parse quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub confidence: f64,
    #[serde(default)]
    pub problem: String,
}

impl ResponseSchema for QualityAssessment {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.confidence) {
            return Err(format!(
                "confidence must be between 0 and 100, got {}",
                self.confidence
            ));
        }
        Ok(())
    }
}

/// Markdown transcription of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTranscription {
    pub markdown: String,
}

impl ResponseSchema for PageTranscription {}

/// An entity as returned by one extraction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

/// A directed relationship between two named entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
}

impl Relationship {
    /// Identity used for deduplication.
    pub fn key(&self) -> (String, String, String) {
        (
            self.source.clone(),
            self.target.clone(),
            self.relationship_type.clone(),
        )
    }
}

/// Result of one extraction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPass {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl ResponseSchema for ExtractionPass {
    fn validate(&self) -> Result<(), String> {
        if let Some(pos) = self.entities.iter().position(|e| e.name.trim().is_empty()) {
            return Err(format!("entity at position {} has an empty name", pos));
        }
        if let Some(rel) = self
            .relationships
            .iter()
            .find(|r| r.source.trim().is_empty() || r.target.trim().is_empty())
        {
            return Err(format!(
                "relationship '{}' is missing an endpoint",
                rel.relationship_type
            ));
        }
        Ok(())
    }
}

/// Detailed description of a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub summary: String,
}

impl ResponseSchema for EntityDetail {}

/// One duplicate cluster folded into a canonical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeGroup {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Merge decisions for one batch of candidate entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    #[serde(default)]
    pub merges: Vec<MergeGroup>,
}

impl ResponseSchema for MergeDecision {}

impl MergeDecision {
    /// Every canonical name and alias must come from the submitted batch.
    pub fn validate_against(&self, batch: &[String]) -> Result<(), String> {
        let known: HashSet<&str> = batch.iter().map(String::as_str).collect();
        for merge in &self.merges {
            for name in std::iter::once(&merge.canonical).chain(merge.aliases.iter()) {
                if !known.contains(name.as_str()) {
                    return Err(format!("'{}' is not in the submitted batch", name));
                }
            }
        }
        Ok(())
    }
}

/// A cohesive group of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// A relationship between two groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossGroupRelationship {
    pub source_group: String,
    pub target_group: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
}

/// Grouping of the merged entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingResult {
    #[serde(default)]
    pub groups: Vec<EntityGroup>,
    #[serde(default)]
    pub cross_group_relationships: Vec<CrossGroupRelationship>,
}

impl ResponseSchema for GroupingResult {
    fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err("group with an empty name".to_string());
            }
            if !names.insert(group.name.as_str()) {
                return Err(format!("group '{}' is declared twice", group.name));
            }
        }
        for rel in &self.cross_group_relationships {
            for side in [&rel.source_group, &rel.target_group] {
                if !names.contains(side.as_str()) {
                    return Err(format!(
                        "cross-group relationship names undeclared group '{}'",
                        side
                    ));
                }
            }
        }
        Ok(())
    }
}

impl GroupingResult {
    /// Members must name known entities.
    pub fn validate_against(&self, entities: &[String]) -> Result<(), String> {
        let known: HashSet<&str> = entities.iter().map(String::as_str).collect();
        for group in &self.groups {
            if let Some(unknown) = group.members.iter().find(|m| !known.contains(m.as_str())) {
                return Err(format!(
                    "group '{}' names unknown entity '{}'",
                    group.name, unknown
                ));
            }
        }
        Ok(())
    }
}

/// The ontology diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyDiagram {
    pub mermaid: String,
}

impl ResponseSchema for OntologyDiagram {
    fn validate(&self) -> Result<(), String> {
        let header = self
            .mermaid
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with("%%"))
            .unwrap_or_default();

        let known = MERMAID_HEADERS.iter().any(|h| {
            header == *h
                || header
                    .strip_prefix(h)
                    .is_some_and(|rest| rest.starts_with(char::is_whitespace))
        });
        if !known {
            return Err(format!(
                "mermaid diagram must start with one of {}, got '{}'",
                MERMAID_HEADERS.join(", "),
                header.chars().take(40).collect::<String>()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_json_response;

    #[test]
    fn test_quality_confidence_range() {
        let ok: QualityAssessment =
            parse_json_response(r#"{"confidence": 80, "problem": ""}"#).unwrap();
        assert!(ok.validate().is_ok());

        let bad = QualityAssessment {
            confidence: 140.0,
            problem: String::new(),
        };
        assert!(bad.validate().unwrap_err().contains("confidence"));
    }

    #[test]
    fn test_quality_missing_confidence_is_schema_error() {
        let result = parse_json_response::<QualityAssessment>(r#"{"problem": "blurry"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_extraction_pass_uses_type_field() {
        let pass: ExtractionPass = parse_json_response(
            r#"{"entities":[{"name":"Account","type":"Concept","description":"A ledger"}],
                "relationships":[{"source":"Customer","target":"Account","type":"owns"}]}"#,
        )
        .unwrap();
        assert_eq!(pass.entities[0].entity_type, "Concept");
        assert_eq!(pass.relationships[0].relationship_type, "owns");
        assert!(pass.validate().is_ok());
    }

    #[test]
    fn test_extraction_pass_rejects_empty_names() {
        let pass = ExtractionPass {
            entities: vec![ExtractedEntity {
                name: "  ".to_string(),
                entity_type: "Concept".to_string(),
                description: String::new(),
            }],
            relationships: vec![],
        };
        assert!(pass.validate().is_err());
    }

    #[test]
    fn test_merge_decision_names_must_be_in_batch() {
        let decision = MergeDecision {
            merges: vec![MergeGroup {
                canonical: "Account".to_string(),
                aliases: vec!["Accounts".to_string()],
                description: String::new(),
            }],
        };
        let batch = vec!["Account".to_string(), "Accounts".to_string()];
        assert!(decision.validate_against(&batch).is_ok());
        assert!(decision
            .validate_against(&["Account".to_string()])
            .unwrap_err()
            .contains("Accounts"));
    }

    #[test]
    fn test_grouping_rejects_undeclared_group() {
        let result = GroupingResult {
            groups: vec![EntityGroup {
                name: "Core".to_string(),
                description: String::new(),
                members: vec!["Account".to_string()],
            }],
            cross_group_relationships: vec![CrossGroupRelationship {
                source_group: "Core".to_string(),
                target_group: "Billing".to_string(),
                relationship_type: "uses".to_string(),
                description: String::new(),
            }],
        };
        assert!(result.validate().unwrap_err().contains("Billing"));
    }

    #[test]
    fn test_grouping_rejects_unknown_member() {
        let result = GroupingResult {
            groups: vec![EntityGroup {
                name: "Core".to_string(),
                description: String::new(),
                members: vec!["Ghost".to_string()],
            }],
            cross_group_relationships: vec![],
        };
        assert!(result.validate().is_ok());
        assert!(result
            .validate_against(&["Account".to_string()])
            .unwrap_err()
            .contains("Ghost"));
    }

    #[test]
    fn test_mermaid_header_check() {
        for diagram in [
            "classDiagram\n  class Account",
            "%% generated\ngraph TD\n  A-->B",
            "flowchart LR\n A-->B",
            "erDiagram\n",
        ] {
            let ontology = OntologyDiagram {
                mermaid: diagram.to_string(),
            };
            assert!(ontology.validate().is_ok(), "{}", diagram);
        }

        for diagram in ["", "sequenceDiagram\n A->>B: hi", "graphical nonsense"] {
            let ontology = OntologyDiagram {
                mermaid: diagram.to_string(),
            };
            assert!(ontology.validate().is_err(), "{}", diagram);
        }
    }
}
