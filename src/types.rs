//! Shared data model for the relationship graph
//!
//! Symbols are immutable records produced by external parsers and shared
//! across the graph as `Arc<Symbol>`. Relations between symbols carry the
//! source location where the relationship is expressed, which is distinct
//! from the files the endpoints live in.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::GraphError;

/// Kind of a parsed source symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Method,
    Struct,
    Interface,
    Variable,
    Constant,
    Field,
    Package,
    Module,
    Unknown,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Struct => "struct",
            SymbolKind::Interface => "interface",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Field => "field",
            SymbolKind::Package => "package",
            SymbolKind::Module => "module",
            SymbolKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Source language tag carried by every symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Go,
    Rust,
    TypeScript,
    JavaScript,
    Python,
    #[default]
    Other,
}

/// Source region in line/column coordinates (1-based lines).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceSpan {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// Single-point span, convenient for call sites.
    pub fn point(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }
}

/// Where a relationship is expressed in source. For a call edge this is the
/// call site, not the file of either endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file_path: String,
    pub span: SourceSpan,
}

impl Location {
    pub fn new(file_path: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            file_path: file_path.into(),
            span,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file_path, self.span.start_line, self.span.start_column
        )
    }
}

/// An immutable parsed program entity. Produced by external parsers; the
/// graph only ever holds shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    /// Globally unique identifier, conventionally `file:line:Name`.
    pub id: String,
    /// Bare symbol name; may be empty for anonymous entities.
    pub name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub span: SourceSpan,
    pub language: Language,
    /// Parse time, Unix milliseconds UTC.
    pub parsed_at_millis: i64,
}

impl Symbol {
    /// Construct a symbol stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: SymbolKind,
        file_path: impl Into<String>,
        span: SourceSpan,
        language: Language,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            kind,
            file_path: file_path.into(),
            span,
            language,
            parsed_at_millis: now_millis(),
        })
    }
}

/// Typed directed relationship between two symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    Unknown,
    Calls,
    Imports,
    Defines,
    Implements,
    Embeds,
    References,
    Returns,
    Receives,
    Parameters,
}

impl RelationType {
    /// All relation types, in canonical order.
    pub const ALL: [RelationType; 10] = [
        RelationType::Unknown,
        RelationType::Calls,
        RelationType::Imports,
        RelationType::Defines,
        RelationType::Implements,
        RelationType::Embeds,
        RelationType::References,
        RelationType::Returns,
        RelationType::Receives,
        RelationType::Parameters,
    ];

    /// Canonical lowercase name, used in cache keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Unknown => "unknown",
            RelationType::Calls => "calls",
            RelationType::Imports => "imports",
            RelationType::Defines => "defines",
            RelationType::Implements => "implements",
            RelationType::Embeds => "embeds",
            RelationType::References => "references",
            RelationType::Returns => "returns",
            RelationType::Receives => "receives",
            RelationType::Parameters => "parameters",
        }
    }

    /// Parse a canonical relation name.
    pub fn parse(name: &str) -> Result<Self, GraphError> {
        RelationType::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == name)
            .ok_or_else(|| GraphError::InvalidEdgeType(name.to_string()))
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A relationship record as emitted by a parser, before endpoint resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRelation {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: RelationType,
    pub location: Location,
}

/// Parser output for one file: the symbols it defines and the relationships
/// expressed in it. Parsers are external; this struct is the contract.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub file_path: String,
    pub symbols: Vec<Arc<Symbol>>,
    pub relations: Vec<RawRelation>,
}

impl ParseResult {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            symbols: Vec::new(),
            relations: Vec::new(),
        }
    }
}

/// Current time as Unix milliseconds UTC.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as Unix microseconds UTC, for sub-millisecond build stats.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_type_round_trips_canonical_names() {
        for rel in RelationType::ALL {
            assert_eq!(RelationType::parse(rel.as_str()).unwrap(), rel);
        }
    }

    #[test]
    fn relation_type_rejects_unknown_names() {
        let err = RelationType::parse("invokes").unwrap_err();
        assert_eq!(err, GraphError::InvalidEdgeType("invokes".to_string()));
    }

    #[test]
    fn location_displays_file_line_column() {
        let loc = Location::new("a.go", SourceSpan::point(10, 3));
        assert_eq!(loc.to_string(), "a.go:10:3");
    }

    #[test]
    fn symbol_is_stamped_with_parse_time() {
        let before = now_millis();
        let sym = Symbol::new(
            "a.go:1:A",
            "A",
            SymbolKind::Function,
            "a.go",
            SourceSpan::point(1, 1),
            Language::Go,
        );
        assert!(sym.parsed_at_millis >= before);
        assert_eq!(sym.kind, SymbolKind::Function);
    }
}
