// SQLite emitter - renders a Predicate as parameterised SQL
//
// Versions live in `entity_versions` (alias `v`); each row carries a JSON
// `search_index` object mapping attribute name -> array of normalised values,
// which `json_each` unnests for element tests.

use rusqlite::types::Value;

use super::compiler::{Comparison, Predicate};
use super::QueryEmitter;
use crate::attributes::ScalarValue;
use crate::temporal::format_instant;

/// SQL text plus positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEmitter;

impl SqliteEmitter {
    /// WHERE clause body for a predicate
    pub fn condition(&self, predicate: &Predicate) -> SqlQuery {
        let mut params = Vec::new();
        let sql = render(predicate, &mut params);
        SqlQuery { sql, params }
    }
}

impl QueryEmitter for SqliteEmitter {
    type Query = SqlQuery;

    fn paged(&self, predicate: &Predicate, skip: usize, take: usize) -> SqlQuery {
        let mut query = self.condition(predicate);
        query.sql = format!(
            "SELECT v.document FROM entity_versions v WHERE {} ORDER BY v.id LIMIT ? OFFSET ?",
            query.sql
        );
        query.params.push(Value::Integer(take as i64));
        query.params.push(Value::Integer(skip as i64));
        query
    }

    fn count(&self, predicate: &Predicate) -> SqlQuery {
        let mut query = self.condition(predicate);
        query.sql = format!("SELECT COUNT(*) FROM entity_versions v WHERE {}", query.sql);
        query
    }
}

fn render(predicate: &Predicate, params: &mut Vec<Value>) -> String {
    match predicate {
        Predicate::And(children) => join(children, " AND ", "1 = 1", params),
        Predicate::Or(children) => join(children, " OR ", "1 = 0", params),

        Predicate::ArrayContains { field, value } => {
            params.push(path(field));
            params.push(scalar(value));
            "EXISTS (SELECT 1 FROM json_each(v.search_index, ?) WHERE value = ?)".to_string()
        }
        Predicate::ElementContains { field, fragment } => {
            params.push(path(field));
            params.push(Value::Text(fragment.clone()));
            "EXISTS (SELECT 1 FROM json_each(v.search_index, ?) WHERE instr(value, ?) > 0)".to_string()
        }
        Predicate::ArrayEmpty { field } => {
            params.push(path(field));
            "COALESCE(json_array_length(v.search_index, ?), 0) = 0".to_string()
        }
        Predicate::ArrayNotEmpty { field } => {
            params.push(path(field));
            "COALESCE(json_array_length(v.search_index, ?), 0) > 0".to_string()
        }
        Predicate::ElementCompare {
            field,
            comparison,
            value,
        } => {
            params.push(path(field));
            params.push(scalar(value));
            format!(
                "EXISTS (SELECT 1 FROM json_each(v.search_index, ?) WHERE value {} ?)",
                sql_comparison(*comparison)
            )
        }
        Predicate::ElementInRange {
            field,
            lower,
            upper,
        } => {
            params.push(path(field));
            params.push(scalar(lower));
            params.push(scalar(upper));
            "EXISTS (SELECT 1 FROM json_each(v.search_index, ?) WHERE value >= ? AND value <= ?)".to_string()
        }

        Predicate::EntityTypeIs(entity_type) => {
            params.push(Value::Text(entity_type.to_lowercase()));
            "v.entity_type = ?".to_string()
        }
        Predicate::VisibleAt(at) => {
            let at = format_instant(*at);
            params.push(Value::Text(at.clone()));
            params.push(Value::Text(at));
            "(v.valid_from <= ? AND (v.valid_to IS NULL OR v.valid_to >= ?))".to_string()
        }
        Predicate::HasMember(key) => {
            params.push(Value::Text(key.entity_type.clone()));
            params.push(Value::Text(key.source_system_name.clone()));
            params.push(Value::Text(key.source_system_id.clone()));
            "EXISTS (SELECT 1 FROM entity_members m WHERE m.version_id = v.id \
             AND m.entity_type = ? AND m.source_system_name = ? AND m.source_system_id = ?)"
                .to_string()
        }
    }
}

/// Sub-expressions are always parenthesised
fn join(children: &[Predicate], separator: &str, empty: &str, params: &mut Vec<Value>) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = children.iter().map(|c| render(c, params)).collect();
    format!("({})", parts.join(separator))
}

fn path(field: &str) -> Value {
    Value::Text(format!("$.{}", field.to_lowercase()))
}

fn scalar(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Text(s) => Value::Text(s.clone()),
        ScalarValue::Number(n) => Value::Real(*n),
        ScalarValue::Date(d) => Value::Text(format_instant(*d)),
    }
}

fn sql_comparison(comparison: Comparison) -> &'static str {
    match comparison {
        Comparison::GreaterThan => ">",
        Comparison::GreaterThanOrEqualTo => ">=",
        Comparison::LessThan => "<",
        Comparison::LessThanOrEqualTo => "<=",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKey;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_nested_groups_are_parenthesised() {
        let predicate = Predicate::And(vec![
            Predicate::ArrayEmpty { field: "urn".to_string() },
            Predicate::Or(vec![
                Predicate::ArrayNotEmpty { field: "ukprn".to_string() },
                Predicate::ArrayNotEmpty { field: "uprn".to_string() },
            ]),
        ]);

        let query = SqliteEmitter.condition(&predicate);
        assert_eq!(
            query.sql,
            "(COALESCE(json_array_length(v.search_index, ?), 0) = 0 AND \
             (COALESCE(json_array_length(v.search_index, ?), 0) > 0 OR \
             COALESCE(json_array_length(v.search_index, ?), 0) > 0))"
        );
        assert_eq!(query.params.len(), 3);
        assert_eq!(query.params[1], Value::Text("$.ukprn".to_string()));
    }

    #[test]
    fn test_paged_and_count_share_predicate() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let predicate = Predicate::scoped(
            "learning-provider",
            at,
            Predicate::HasMember(EntityKey::new("learning-provider", "gias", "1")),
        );

        let paged = SqliteEmitter.paged(&predicate, 20, 10);
        let count = SqliteEmitter.count(&predicate);

        assert!(paged.sql.starts_with("SELECT v.document"));
        assert!(paged.sql.ends_with("ORDER BY v.id LIMIT ? OFFSET ?"));
        assert!(count.sql.starts_with("SELECT COUNT(*)"));
        assert!(!count.sql.contains("ORDER BY"));
        assert_eq!(paged.params.len(), count.params.len() + 2);
        assert_eq!(paged.params[paged.params.len() - 2], Value::Integer(10));
        assert_eq!(paged.params[paged.params.len() - 1], Value::Integer(20));
    }
}
