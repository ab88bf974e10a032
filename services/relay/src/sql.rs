//! Compiles subscription filters into one parameterized Postgres query.
//!
//! Every filter becomes a `SELECT raw, created_at FROM events WHERE (…)`
//! disjunct; disjuncts are combined with `UNION ALL`, ordered newest-first
//! and limited by the smallest filter limit (capped by the server maximum).
//! All values bind as parameters; nothing client-controlled is ever
//! interpolated into the SQL text.

use relay_protocol::Filter;

use crate::pools::{Pool, Pooled};

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Int(i64),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
}

/// A compiled query. The SQL text and parameter buffers come from shared
/// pools and return there when the query is dropped after execution.
pub struct Query {
    pub sql: Pooled<String>,
    pub params: Pooled<Vec<Param>>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("no filters to compile")]
    NoFilters,
    #[error("filter field {0} contains a malformed prefix")]
    BadPrefix(&'static str),
}

/// Pools shared by all query compilations.
#[derive(Clone)]
pub struct QueryBuffers {
    pub sql: Pool<String>,
    pub params: Pool<Vec<Param>>,
}

impl QueryBuffers {
    pub fn new() -> Self {
        Self {
            sql: Pool::new(String::new),
            params: Pool::new(Vec::new),
        }
    }
}

impl Default for QueryBuffers {
    fn default() -> Self {
        Self::new()
    }
}

pub fn compile(
    filters: &[Filter],
    max_limit: u32,
    buffers: &QueryBuffers,
) -> Result<Query, QueryError> {
    if filters.is_empty() {
        return Err(QueryError::NoFilters);
    }
    let mut sql = buffers.sql.acquire();
    let mut params = buffers.params.acquire();
    let mut limit = max_limit;

    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            sql.push_str(" UNION ALL ");
        }
        sql.push_str("(SELECT raw, created_at FROM events WHERE ");
        let mut any_clause = false;

        if let Some(ids) = &filter.ids {
            push_prefix_clause(&mut sql, &mut params, "id", ids, &mut any_clause)?;
        }
        if let Some(authors) = &filter.authors {
            push_prefix_clause(&mut sql, &mut params, "pubkey", authors, &mut any_clause)?;
        }
        if let Some(kinds) = &filter.kinds {
            push_and(&mut sql, &mut any_clause);
            sql.push_str("kind = ANY(");
            push_param(&mut sql, &mut params, Param::IntArray(kinds.clone()));
            sql.push(')');
        }
        if let Some(since) = filter.since {
            push_and(&mut sql, &mut any_clause);
            sql.push_str("created_at >= ");
            push_param(&mut sql, &mut params, Param::Int(since));
        }
        if let Some(until) = filter.until {
            push_and(&mut sql, &mut any_clause);
            sql.push_str("created_at <= ");
            push_param(&mut sql, &mut params, Param::Int(until));
        }
        for (column, values) in [
            ("ptags", &filter.ptags),
            ("etags", &filter.etags),
            ("gtags", &filter.gtags),
        ] {
            if let Some(values) = values {
                push_and(&mut sql, &mut any_clause);
                sql.push_str(column);
                sql.push_str(" && ");
                push_param(&mut sql, &mut params, Param::TextArray(values.clone()));
                sql.push_str("::text[]");
            }
        }

        if !any_clause {
            sql.push_str("true");
        }
        sql.push(')');
        limit = limit.min(filter.limit.unwrap_or(max_limit)).max(1);
    }

    sql.push_str(" ORDER BY created_at DESC LIMIT ");
    push_param(&mut sql, &mut params, Param::Int(i64::from(limit)));

    Ok(Query { sql, params })
}

fn push_and(sql: &mut String, any_clause: &mut bool) {
    if *any_clause {
        sql.push_str(" AND ");
    }
    *any_clause = true;
}

/// `id = $n` for full 64-char values, `id LIKE $n` with a bound `prefix%`
/// pattern otherwise, OR-joined across the set.
fn push_prefix_clause(
    sql: &mut String,
    params: &mut Vec<Param>,
    column: &str,
    prefixes: &[String],
    any_clause: &mut bool,
) -> Result<(), QueryError> {
    push_and(sql, any_clause);
    sql.push('(');
    for (i, prefix) in prefixes.iter().enumerate() {
        if !relay_protocol::event::is_hex_prefix(prefix) {
            return Err(QueryError::BadPrefix(if column == "id" {
                "ids"
            } else {
                "authors"
            }));
        }
        if i > 0 {
            sql.push_str(" OR ");
        }
        sql.push_str(column);
        if prefix.len() == 64 {
            sql.push_str(" = ");
            push_param(sql, params, Param::Text(prefix.clone()));
        } else {
            sql.push_str(" LIKE ");
            push_param(sql, params, Param::Text(format!("{prefix}%")));
        }
    }
    sql.push(')');
    Ok(())
}

fn push_param(sql: &mut String, params: &mut Vec<Param>, param: Param) {
    params.push(param);
    sql.push('$');
    sql.push_str(&params.len().to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> QueryBuffers {
        QueryBuffers::new()
    }

    fn filter(json: &str) -> Filter {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn single_filter_with_every_field() {
        let f = filter(
            r##"{"ids":["ab"],"authors":["cd"],"kinds":[1,7],"since":100,"until":200,"limit":10,"#p":["ee"]}"##,
        );
        let query = compile(&[f], 500, &buffers()).unwrap();
        assert_eq!(
            query.sql.as_str(),
            "(SELECT raw, created_at FROM events WHERE (id LIKE $1) AND (pubkey LIKE $2) \
             AND kind = ANY($3) AND created_at >= $4 AND created_at <= $5 AND ptags && $6::text[]) \
             ORDER BY created_at DESC LIMIT $7"
        );
        assert_eq!(
            *query.params,
            vec![
                Param::Text("ab%".to_owned()),
                Param::Text("cd%".to_owned()),
                Param::IntArray(vec![1, 7]),
                Param::Int(100),
                Param::Int(200),
                Param::TextArray(vec!["ee".to_owned()]),
                Param::Int(10),
            ]
        );
    }

    #[test]
    fn full_length_ids_use_equality() {
        let id = "ab".repeat(32);
        let f = filter(&format!(r#"{{"ids":["{id}"]}}"#));
        let query = compile(&[f], 500, &buffers()).unwrap();
        assert!(query.sql.contains("(id = $1)"));
        assert_eq!(query.params[0], Param::Text(id));
    }

    #[test]
    fn multiple_filters_union_and_take_the_smallest_limit() {
        let a = filter(r#"{"kinds":[1],"limit":50}"#);
        let b = filter(r#"{"kinds":[7],"limit":20}"#);
        let query = compile(&[a, b], 500, &buffers()).unwrap();
        assert_eq!(
            query.sql.as_str(),
            "(SELECT raw, created_at FROM events WHERE kind = ANY($1)) UNION ALL \
             (SELECT raw, created_at FROM events WHERE kind = ANY($2)) \
             ORDER BY created_at DESC LIMIT $3"
        );
        assert_eq!(query.params[2], Param::Int(20));
    }

    #[test]
    fn server_maximum_caps_the_limit() {
        let f = filter(r#"{"kinds":[1],"limit":100000}"#);
        let query = compile(&[f], 500, &buffers()).unwrap();
        assert_eq!(*query.params.last().unwrap(), Param::Int(500));
    }

    #[test]
    fn empty_filter_compiles_to_a_tautology() {
        let query = compile(&[Filter::default()], 500, &buffers()).unwrap();
        assert_eq!(
            query.sql.as_str(),
            "(SELECT raw, created_at FROM events WHERE true) ORDER BY created_at DESC LIMIT $1"
        );
    }

    #[test]
    fn non_hex_prefix_is_refused() {
        let f = filter(r#"{"ids":["xy"]}"#);
        assert_eq!(
            compile(&[f], 500, &buffers()).err(),
            Some(QueryError::BadPrefix("ids"))
        );
    }

    #[test]
    fn no_filters_is_an_error() {
        assert_eq!(
            compile(&[], 500, &buffers()).err(),
            Some(QueryError::NoFilters)
        );
    }

    #[test]
    fn buffers_are_reused_across_compilations() {
        let buffers = buffers();
        let f = filter(r#"{"kinds":[1]}"#);
        let first = compile(&[f.clone()], 500, &buffers).unwrap();
        let first_sql = first.sql.as_str().to_owned();
        drop(first);
        let second = compile(&[f], 500, &buffers).unwrap();
        assert_eq!(second.sql.as_str(), first_sql);
    }
}
