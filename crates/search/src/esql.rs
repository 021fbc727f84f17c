//! Piped (ES|QL) statement rendering.
//!
//! Statements are built command by command and joined with `|`. Filter
//! sets render through [`Renderer`], which knows which roots are real
//! nested objects (for quoting) and, optionally, which fields exist in the
//! target indices so or-groups never reference a missing column.

use std::collections::HashSet;
use std::fmt;

use otq_core::filter::{FieldConventions, FilterIntent, FilterSet, Predicate, TimeRange};

use crate::dsl::format_timestamp;

/// Escape a string literal: only double quotes need a backslash.
pub fn escape(value: &str) -> String {
    value.replace('"', "\\\"")
}

pub fn quote_literal(value: &str) -> String {
    format!("\"{}\"", escape(value))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement {
    commands: Vec<String>,
}

impl Statement {
    pub fn from_source(pattern: &str) -> Self {
        Self {
            commands: vec![format!("FROM {pattern}")],
        }
    }

    /// `FROM pattern METADATA _index, _id`.
    pub fn from_source_with_metadata(pattern: &str, metadata: &[&str]) -> Self {
        if metadata.is_empty() {
            return Self::from_source(pattern);
        }
        Self {
            commands: vec![format!("FROM {pattern} METADATA {}", metadata.join(", "))],
        }
    }

    fn push(mut self, command: String) -> Self {
        self.commands.push(command);
        self
    }

    /// No-op for `None`, so an empty filter set adds nothing.
    pub fn where_clause(self, condition: Option<String>) -> Self {
        match condition {
            Some(condition) => self.push(format!("WHERE {condition}")),
            None => self,
        }
    }

    pub fn stats(self, aggregates: &str, by: Option<&str>) -> Self {
        match by {
            Some(by) => self.push(format!("STATS {aggregates} BY {by}")),
            None => self.push(format!("STATS {aggregates}")),
        }
    }

    pub fn sort(self, expr: &str) -> Self {
        self.push(format!("SORT {expr}"))
    }

    pub fn limit(self, n: usize) -> Self {
        self.push(format!("LIMIT {n}"))
    }

    pub fn keep(self, fields: &[String]) -> Self {
        if fields.is_empty() {
            return self;
        }
        self.push(format!("KEEP {}", fields.join(", ")))
    }

    pub fn render(&self) -> String {
        self.commands.join("\n| ")
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Renderer<'a> {
    conventions: &'a FieldConventions,
    known_fields: Option<&'a HashSet<String>>,
}

impl<'a> Renderer<'a> {
    pub fn new(conventions: &'a FieldConventions) -> Self {
        Self {
            conventions,
            known_fields: None,
        }
    }

    /// Prune or-groups down to fields present in `known`. The timestamp
    /// field is never pruned.
    pub fn with_known_fields(mut self, known: &'a HashSet<String>) -> Self {
        self.known_fields = Some(known);
        self
    }

    pub fn is_known(&self, field: &str) -> bool {
        field == self.conventions.timestamp
            || self.known_fields.is_none_or(|known| known.contains(field))
    }

    /// Back-tick quote a field when it would not parse as a plain column
    /// reference: dotted fields under a root that is not a nested object
    /// (`system.cpu.usage`), or names with other punctuation.
    pub fn field(&self, name: &str) -> String {
        let plain = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@'));
        let dotted_root = name.split_once('.').map(|(root, _)| root);
        let conventional_root = dotted_root
            .is_none_or(|root| self.conventions.nested_roots.iter().any(|r| r == root));

        if plain && conventional_root && !name.starts_with(|c: char| c.is_ascii_digit()) {
            name.to_string()
        } else {
            format!("`{}`", name.replace('`', "``"))
        }
    }

    /// AND of every intent, or `None` when the set is empty.
    pub fn condition(&self, set: &FilterSet) -> Option<String> {
        let clauses = set
            .intents
            .iter()
            .filter_map(|intent| self.intent(intent))
            .collect::<Vec<_>>();
        (!clauses.is_empty()).then(|| clauses.join(" AND "))
    }

    fn intent(&self, intent: &FilterIntent) -> Option<String> {
        let fields = intent
            .fields
            .iter()
            .filter(|f| self.is_known(f))
            .collect::<Vec<_>>();

        if intent.negate {
            // A document is excluded when any spelling matches; missing
            // values must not exclude it.
            let clauses = fields
                .iter()
                .filter_map(|f| {
                    let quoted = self.field(f);
                    let matched = self.predicate(&quoted, &intent.predicate)?;
                    Some(match intent.predicate {
                        Predicate::Exists => format!("{quoted} IS NULL"),
                        _ => format!("({quoted} IS NULL OR NOT ({matched}))"),
                    })
                })
                .collect::<Vec<_>>();
            return (!clauses.is_empty()).then(|| clauses.join(" AND "));
        }

        let clauses = fields
            .iter()
            .filter_map(|f| self.predicate(&self.field(f), &intent.predicate))
            .collect::<Vec<_>>();
        match clauses.len() {
            0 if fields.is_empty() => Some("false".to_string()),
            0 => None,
            1 => clauses.into_iter().next(),
            _ => Some(format!("({})", clauses.join(" OR "))),
        }
    }

    fn predicate(&self, field: &str, predicate: &Predicate) -> Option<String> {
        let rendered = match predicate {
            Predicate::Time(TimeRange::Lookback(lookback)) => {
                format!("{field} >= NOW() - {}", lookback.to_esql_duration()?)
            }
            Predicate::Time(TimeRange::Absolute { from, to }) => {
                let datetime =
                    |ts| format!("TO_DATETIME({})", quote_literal(&format_timestamp(ts)));
                let bounds = [
                    from.map(|ts| format!("{field} >= {}", datetime(ts))),
                    to.map(|ts| format!("{field} <= {}", datetime(ts))),
                ];
                let bounds = bounds.into_iter().flatten().collect::<Vec<_>>();
                if bounds.is_empty() {
                    return None;
                }
                bounds.join(" AND ")
            }
            Predicate::Terms(values) => match values.as_slice() {
                [] => return None,
                [value] => format!("{field} == {}", quote_literal(value)),
                values => {
                    let list = values
                        .iter()
                        .map(|v| quote_literal(v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{field} IN ({list})")
                }
            },
            Predicate::Prefix(prefix) => {
                format!("{field} LIKE {}", quote_literal(&format!("{prefix}*")))
            }
            Predicate::Exists => format!("{field} IS NOT NULL"),
            Predicate::Text(query) => {
                format!("{field} LIKE {}", quote_literal(&format!("*{query}*")))
            }
        };
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use otq_core::filter::FilterBuilder;
    use otq_core::time::Lookback;

    use super::*;

    #[test]
    fn statement_joins_commands_with_pipes() {
        let stmt = Statement::from_source("logs-*")
            .where_clause(Some("level == \"ERROR\"".into()))
            .sort("@timestamp DESC")
            .limit(50);
        assert_eq!(
            stmt.render(),
            "FROM logs-*\n| WHERE level == \"ERROR\"\n| SORT @timestamp DESC\n| LIMIT 50"
        );
        assert_eq!(
            Statement::from_source("logs-*").where_clause(None).render(),
            "FROM logs-*"
        );
        let kept = Statement::from_source_with_metadata("traces-*", &["_id"])
            .keep(&["_id".to_string(), "name".to_string()])
            .keep(&[]);
        assert_eq!(kept.to_string(), "FROM traces-* METADATA _id\n| KEEP _id, name");
    }

    #[test]
    fn quotes_dotted_fields_outside_nested_roots() {
        let conventions = FieldConventions::default();
        let r = Renderer::new(&conventions);
        assert_eq!(r.field("system.cpu.usage"), "`system.cpu.usage`");
        assert_eq!(r.field("resource.attributes.service.name"), "resource.attributes.service.name");
        assert_eq!(r.field("@timestamp"), "@timestamp");
        assert_eq!(r.field("severity_text"), "severity_text");
        assert_eq!(r.field("attributes.http-method"), "`attributes.http-method`");
    }

    #[test]
    fn escapes_only_double_quotes() {
        assert_eq!(escape(r#"say "hi" \ *"#), r#"say \"hi\" \ *"#);
    }

    #[test]
    fn lookback_renders_as_interval() {
        let conventions = FieldConventions::default();
        let set = FilterBuilder::new(&conventions)
            .add_time_range(TimeRange::Lookback(Lookback::parse("1d").unwrap()))
            .build();
        assert_eq!(
            Renderer::new(&conventions).condition(&set).unwrap(),
            "@timestamp >= NOW() - 24 hours"
        );
    }

    #[test]
    fn or_groups_and_negation() {
        let conventions = FieldConventions::default();
        let set = FilterBuilder::new(&conventions)
            .add_service("api", false)
            .add_service("noise", true)
            .build();
        let cond = Renderer::new(&conventions).condition(&set).unwrap();
        assert_eq!(
            cond,
            "(resource.attributes.service.name == \"api\" OR service.name == \"api\") AND \
             (resource.attributes.service.name IS NULL OR \
             NOT (resource.attributes.service.name == \"noise\")) AND \
             (service.name IS NULL OR NOT (service.name == \"noise\"))"
        );
    }

    #[test]
    fn known_fields_prune_or_groups() {
        let conventions = FieldConventions::default();
        let known = HashSet::from(["service.name".to_string()]);
        let renderer = Renderer::new(&conventions).with_known_fields(&known);

        let set = FilterBuilder::new(&conventions)
            .add_time_range(TimeRange::Lookback(Lookback::hours(1)))
            .add_service("api", false)
            .add_resource("staging", true)
            .build();
        assert_eq!(
            renderer.condition(&set).unwrap(),
            "@timestamp >= NOW() - 1 hour AND service.name == \"api\""
        );

        let unknown = FilterBuilder::new(&conventions).add_level("error").build();
        assert_eq!(renderer.condition(&unknown).unwrap(), "false");
    }

    #[test]
    fn text_and_prefix_use_like() {
        let conventions = FieldConventions::default();
        let set = FilterBuilder::new(&conventions)
            .add_text("conn \"reset\"", &["message".to_string()])
            .add_container_prefix("abc")
            .build();
        let cond = Renderer::new(&conventions).condition(&set).unwrap();
        assert!(cond.starts_with("message LIKE \"*conn \\\"reset\\\"*\" AND "));
        assert!(cond.contains("container.id LIKE \"abc*\""));
    }

    #[test]
    fn level_uses_in_list() {
        let conventions = FieldConventions {
            level: vec!["severity_text".into()],
            ..FieldConventions::default()
        };
        let set = FilterBuilder::new(&conventions).add_level("warn").build();
        assert_eq!(
            Renderer::new(&conventions).condition(&set).unwrap(),
            "severity_text IN (\"WARN\", \"warn\")"
        );
    }
}
