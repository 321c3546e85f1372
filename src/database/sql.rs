// SQL text helpers for the relational dump fallback and statement-wise restore

use serde_json::{Map, Value};

/// SQLSTATE codes treated as "already exists" during a restore:
/// unique violation, duplicate table, duplicate object, duplicate schema
pub const DUPLICATE_SQLSTATES: [&str; 4] = ["23505", "42P07", "42710", "42P06"];

/// Whether a failed statement only collided with existing data or schema
pub fn is_duplicate_conflict(code: Option<&str>) -> bool {
    code.map(|c| DUPLICATE_SQLSTATES.contains(&c)).unwrap_or(false)
}

/// Column description read from `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// `data_type` column, e.g. `integer`, `ARRAY`, `USER-DEFINED`
    pub data_type: String,
    /// `udt_name` column, e.g. `int4`, `_text`, `booking_status`
    pub udt_name: String,
    pub nullable: bool,
}

impl ColumnDef {
    fn type_sql(&self) -> String {
        match self.data_type.as_str() {
            "ARRAY" => format!("{}[]", self.udt_name.trim_start_matches('_')),
            "USER-DEFINED" => quote_ident(&self.udt_name),
            other => other.to_string(),
        }
    }
}

/// Double-quote an identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `CREATE TABLE IF NOT EXISTS` for a table without constraints or defaults
pub fn render_create_table(table: &str, columns: &[ColumnDef]) -> String {
    let body: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut line = format!("    {} {}", quote_ident(&c.name), c.type_sql());
            if !c.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();
    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n);", quote_ident(table), body.join(",\n"))
}

/// One `INSERT INTO` statement for a row produced by `row_to_json`.
///
/// `columns` fixes the column order; keys absent from the row become NULL.
pub fn render_insert(table: &str, columns: &[String], row: &Map<String, Value>) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let values: Vec<String> = columns
        .iter()
        .map(|c| render_literal(row.get(c).unwrap_or(&Value::Null)))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({});",
        quote_ident(table),
        names.join(", "),
        values.join(", ")
    )
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

/// Split a dump into individual statements.
///
/// Understands single-quoted strings, quoted identifiers, dollar-quoted
/// bodies and both comment styles. psql meta-commands (lines starting with
/// a backslash) are dropped. Returned statements are trimmed and carry no
/// trailing semicolon.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // Meta-command lines only count at the start of a statement
        if c == '\\' && current.trim().is_empty() && at_line_start(&chars, i) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                let end = quoted_end(&chars, i, c);
                current.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i = block_comment_end(&chars, i);
                current.push(' ');
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => {
                    let end = dollar_body_end(&chars, i + tag.len(), &tag);
                    current.extend(&chars[i..end]);
                    i = end;
                }
                None => {
                    current.push(c);
                    i += 1;
                }
            },
            ';' => {
                push_statement(&mut statements, &mut current);
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

fn at_line_start(chars: &[char], i: usize) -> bool {
    chars[..i].iter().rev().take_while(|c| **c != '\n').all(|c| c.is_whitespace())
}

/// Index one past the closing quote; doubled quotes are escapes
fn quoted_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn block_comment_end(chars: &[char], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            depth += 1;
            i += 2;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    chars.len()
}

/// `$tag$` opening at `start`, if any
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    // A `$` right after an identifier character is a positional parameter or part of a name
    if start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        return None;
    }
    let mut i = start + 1;
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    if chars.get(i) != Some(&'$') {
        return None;
    }
    let tag: String = chars[start..=i].iter().collect();
    if tag[1..tag.len() - 1].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(tag)
}

fn dollar_body_end(chars: &[char], body_start: usize, tag: &str) -> usize {
    let tag: Vec<char> = tag.chars().collect();
    let mut i = body_start;
    while i + tag.len() <= chars.len() {
        if chars[i..i + tag.len()] == tag[..] {
            return i + tag.len();
        }
        i += 1;
    }
    chars.len()
}

/// First characters of a statement, for log lines
pub fn statement_prefix(statement: &str) -> String {
    const LIMIT: usize = 80;
    let flat: String = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= LIMIT {
        flat
    } else {
        format!("{}...", flat.chars().take(LIMIT).collect::<String>())
    }
}
