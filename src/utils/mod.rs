//! Shared utility functions for onto-forge.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_json_object, find_matching_brace, parse_json_response,
    JsonExtractionError, JsonStructureAnalysis,
};
