//! Prompts for every content transform call site in the pipeline.
//!
//! Each builder returns a [`StagePrompt`] holding the system prompt and the
//! instruction prompt; the content payload (page text, document markdown,
//! entity lists) is attached separately by the caller.

/// Names of the transform call sites, used in logs, metrics and tests.
pub mod call_sites {
    pub const QUALITY: &str = "quality";
    pub const PAGE: &str = "page";
    pub const EXTRACT: &str = "extract";
    pub const ENTITY_DETAIL: &str = "entity_detail";
    pub const MERGE: &str = "merge";
    pub const GROUP: &str = "group";
    pub const ONTOLOGY: &str = "ontology";
}

/// System and instruction prompt for one transform call.
#[derive(Debug, Clone)]
pub struct StagePrompt {
    pub call_site: &'static str,
    pub system: String,
    pub instruction: String,
}

impl StagePrompt {
    fn new(call_site: &'static str, system: &str, instruction: String) -> Self {
        Self {
            call_site,
            system: system.to_string(),
            instruction,
        }
    }
}

const QUALITY_SYSTEM_PROMPT: &str = r#"You are a document intake reviewer. You judge whether scanned or extracted pages are readable enough for automated transcription.

Consider: legibility of the text, scan quality, garbled or missing characters, pages that are blank or mostly images without text.

You must output a JSON object:
{
  "confidence": 0-100,
  "problem": "Short description of the main readability problem, or an empty string"
}

Output ONLY the JSON object. No additional text."#;

const PAGE_SYSTEM_PROMPT: &str = r#"You convert a single document page into clean GitHub-flavored markdown.

Rules:
- Preserve headings, lists, tables and reading order
- Do not summarize or omit content
- Do not invent content that is not on the page

You must output a JSON object:
{
  "markdown": "The page as markdown"
}

Output ONLY the JSON object. No additional text."#;

const EXTRACT_SYSTEM_PROMPT: &str = r#"You are a knowledge engineer building a domain model from documents. You identify the entities (concepts, roles, systems, artifacts, processes) of a domain and the relationships between them.

You must output a JSON object:
{
  "entities": [
    {"name": "Exact entity name", "type": "Entity type", "description": "One sentence"}
  ],
  "relationships": [
    {"source": "Entity name", "target": "Entity name", "type": "relationship verb", "description": "One sentence"}
  ]
}

Output ONLY the JSON object. No additional text."#;

const ENTITY_DETAIL_SYSTEM_PROMPT: &str = r#"You describe one entity of a domain model using only the supplied document.

You must output a JSON object:
{
  "attributes": {"attribute name": "value or description"},
  "summary": "Two or three sentences describing the entity"
}

Output ONLY the JSON object. No additional text."#;

const MERGE_SYSTEM_PROMPT: &str = r#"You reconcile entity lists extracted from several documents of the same domain. Some entities are the same concept under different names (abbreviations, plurals, synonyms).

Only merge entities that truly denote the same concept. Use only names from the supplied list.

You must output a JSON object:
{
  "merges": [
    {"canonical": "Name to keep", "aliases": ["Name to fold into it"], "description": "Combined description"}
  ]
}

Return an empty "merges" list when nothing should be merged. Output ONLY the JSON object. No additional text."#;

const GROUP_SYSTEM_PROMPT: &str = r#"You organize the entities of a domain model into cohesive groups (bounded contexts). Every group has a name, a description and its member entities. Also list the relationships between groups.

Use only entity names from the supplied list. An entity belongs to at most one group.

You must output a JSON object:
{
  "groups": [
    {"name": "Group name", "description": "One sentence", "members": ["Entity name"]}
  ],
  "cross_group_relationships": [
    {"source_group": "Group name", "target_group": "Group name", "type": "relationship verb", "description": "One sentence"}
  ]
}

Output ONLY the JSON object. No additional text."#;

const ONTOLOGY_SYSTEM_PROMPT: &str = r#"You produce a Mermaid diagram of a domain ontology from its entities, relationships and groups.

Use a classDiagram. Represent groups as namespaces, entities as classes with their key attributes, and relationships as labelled associations.

You must output a JSON object:
{
  "mermaid": "classDiagram\n..."
}

Output ONLY the JSON object. No additional text."#;

/// Readability check over the sampled pages of a document.
pub fn quality_prompt(document: &str, sampled_pages: usize, total_pages: usize) -> StagePrompt {
    StagePrompt::new(
        call_sites::QUALITY,
        QUALITY_SYSTEM_PROMPT,
        format!(
            "Assess the readability of the first {} of {} pages of '{}'. The page contents follow.",
            sampled_pages, total_pages, document
        ),
    )
}

/// Transcription of a single page.
pub fn page_prompt(document: &str, page_number: usize, total_pages: usize) -> StagePrompt {
    StagePrompt::new(
        call_sites::PAGE,
        PAGE_SYSTEM_PROMPT,
        format!(
            "Convert page {} of {} of '{}' to markdown.",
            page_number, total_pages, document
        ),
    )
}

/// One pass of iterative entity extraction.
///
/// Later passes see the names found so far and are asked for what was missed.
pub fn extract_prompt(domain: &str, iteration: u32, known_entities: &[String]) -> StagePrompt {
    let instruction = if known_entities.is_empty() {
        format!(
            "Extract the entities and relationships of the '{}' domain from the document below.",
            domain
        )
    } else {
        format!(
            "Pass {}: these entities of the '{}' domain were already found: {}.\n\
             Extract entities and relationships that were missed, and relationships between \
             new and existing entities, from the document below.",
            iteration,
            domain,
            known_entities.join(", ")
        )
    };
    StagePrompt::new(call_sites::EXTRACT, EXTRACT_SYSTEM_PROMPT, instruction)
}

pub fn entity_detail_prompt(domain: &str, name: &str, entity_type: &str) -> StagePrompt {
    StagePrompt::new(
        call_sites::ENTITY_DETAIL,
        ENTITY_DETAIL_SYSTEM_PROMPT,
        format!(
            "Describe the {} '{}' of the '{}' domain using the document below.",
            entity_type, name, domain
        ),
    )
}

pub fn merge_prompt(domain: &str) -> StagePrompt {
    StagePrompt::new(
        call_sites::MERGE,
        MERGE_SYSTEM_PROMPT,
        format!(
            "Decide which of the following '{}' entities are duplicates of each other.",
            domain
        ),
    )
}

pub fn group_prompt(domain: &str) -> StagePrompt {
    StagePrompt::new(
        call_sites::GROUP,
        GROUP_SYSTEM_PROMPT,
        format!(
            "Group the following entities of the '{}' domain. Entities and relationships follow.",
            domain
        ),
    )
}

pub fn ontology_prompt(domain: &str, domain_version: u32) -> StagePrompt {
    StagePrompt::new(
        call_sites::ONTOLOGY,
        ONTOLOGY_SYSTEM_PROMPT,
        format!(
            "Draw the ontology of the '{}' domain (version {}) from the model below.",
            domain, domain_version
        ),
    )
}
