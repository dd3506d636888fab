//! Standoff annotation parser
//!
//! Turns the `.ann` output of the decoder into typed entities and relations.
//! The format is line oriented:
//!
//! ```text
//! T1	PERSON 0 5	Maria
//! T2	ORG 15 24	Acme Corp
//! R1	EMPLOYS Arg1:T2 Arg2:T1
//! ```
//!
//! Lines starting with anything other than `T` or `R` (attributes, notes,
//! normalizations) are skipped. Parsing is pure: no I/O, no state.
//!
//! Author: hephaex@gmail.com

use lazy_static::lazy_static;
use regex::Regex;

use matie_core::{Annotations, Entity, MatieError, Relation, Result};

/// Field separator of the standoff format
pub const FIELD_SEPARATOR: char = '\t';

lazy_static! {
    static ref RELATION_LINE: Regex =
        Regex::new(r"^(R\d+)\t(.*) Arg1:(T\d+) Arg2:(T\d+)$").expect("relation pattern is valid");
}

// ============================================================================
// Line dispatch
// ============================================================================

/// Classification of a single annotation line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Entity(Entity),
    Relation(Relation),
    /// Blank line or an annotation kind that is not modelled
    Ignored,
    /// Line claims to be an entity or relation but does not have the shape
    Malformed(String),
}

/// Classify and parse one line (without its trailing newline)
pub fn parse_line(line: &str) -> ParsedLine {
    if line.starts_with('T') {
        match parse_entity(line) {
            Ok(entity) => ParsedLine::Entity(entity),
            Err(reason) => ParsedLine::Malformed(reason),
        }
    } else if line.starts_with('R') {
        match parse_relation(line) {
            Some(relation) => ParsedLine::Relation(relation),
            None => ParsedLine::Malformed(format!(
                "relation line does not match `R<n>\\t<type> Arg1:T<n> Arg2:T<n>`: {line:?}"
            )),
        }
    } else {
        ParsedLine::Ignored
    }
}

fn parse_entity(line: &str) -> std::result::Result<Entity, String> {
    let mut fields = line.split(FIELD_SEPARATOR);
    let id = fields.next().unwrap_or_default();
    let span = fields
        .next()
        .ok_or_else(|| format!("entity {id} has no type/offset field"))?;

    let parts: Vec<&str> = span.split_whitespace().collect();
    let [entity_type, start, end] = parts.as_slice() else {
        return Err(format!(
            "entity {id} expects `<type> <start> <end>`, got {span:?}"
        ));
    };

    let start = parse_offset(id, start)?;
    let end = parse_offset(id, end)?;

    // The literal text may itself contain separators; keep all of it.
    let entity_string = fields.collect::<Vec<_>>().join("\t");

    Ok(Entity {
        id: id.to_string(),
        entity_type: entity_type.to_string(),
        start,
        end,
        entity_string,
    })
}

fn parse_offset(id: &str, raw: &str) -> std::result::Result<usize, String> {
    raw.parse()
        .map_err(|_| format!("entity {id} has non-integer offset {raw:?}"))
}

fn parse_relation(line: &str) -> Option<Relation> {
    let caps = RELATION_LINE.captures(line)?;
    Some(Relation {
        id: caps[1].to_string(),
        relation_type: caps[2].to_string(),
        arg1: caps[3].to_string(),
        arg2: caps[4].to_string(),
    })
}

// ============================================================================
// Document parsing
// ============================================================================

/// Parse the full content of one `.ann` file
///
/// Entities and relations keep file order. The first malformed line fails the
/// whole document with its 1-based line number.
pub fn parse_annotations(content: &str) -> Result<Annotations> {
    let mut annotations = Annotations::default();

    for (index, line) in content.lines().enumerate() {
        match parse_line(line) {
            ParsedLine::Entity(entity) => annotations.entities.push(entity),
            ParsedLine::Relation(relation) => annotations.relations.push(relation),
            ParsedLine::Ignored => {}
            ParsedLine::Malformed(reason) => {
                return Err(MatieError::MalformedAnnotation {
                    line: index + 1,
                    reason,
                })
            }
        }
    }

    Ok(annotations)
}

// ============================================================================
// Reference validation
// ============================================================================

/// A relation argument that names no entity of the same document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub relation_id: String,
    /// `Arg1` or `Arg2`
    pub argument: &'static str,
    pub entity_id: String,
}

impl std::fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "relation {} {} references unknown entity {}",
            self.relation_id, self.argument, self.entity_id
        )
    }
}

/// Find relation arguments that do not resolve to a parsed entity
pub fn dangling_references(annotations: &Annotations) -> Vec<DanglingReference> {
    let known: std::collections::HashSet<&str> =
        annotations.entities.iter().map(|e| e.id.as_str()).collect();

    let mut dangling = Vec::new();
    for relation in &annotations.relations {
        for (argument, entity_id) in [("Arg1", &relation.arg1), ("Arg2", &relation.arg2)] {
            if !known.contains(entity_id.as_str()) {
                dangling.push(DanglingReference {
                    relation_id: relation.id.clone(),
                    argument,
                    entity_id: entity_id.clone(),
                });
            }
        }
    }
    dangling
}

// ============================================================================
// Tests
// ============================================================================
