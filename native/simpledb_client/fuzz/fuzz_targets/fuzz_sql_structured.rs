#![no_main]
//! Structured SQL fuzzing
//!
//! Generates statement-like inputs to reach the keyword branches of statement
//! classification, and conninfo-like inputs for the options parser.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use simpledb_client::utils::command_tag;
use simpledb_client::{detect_query_type, ConnectOptions};

/// SQL-like input for fuzzing
#[derive(Debug, Arbitrary)]
struct SqlInput<'a> {
    /// Optional leading whitespace
    leading_whitespace: Option<&'a str>,
    /// SQL keyword (may be mangled)
    keyword: SqlKeyword,
    /// Body of the SQL
    body: &'a str,
    /// Optional trailing semicolon
    has_semicolon: bool,
    /// Conninfo key and value
    option: (&'a str, &'a str),
}

/// SQL keywords to test
#[derive(Debug, Arbitrary)]
enum SqlKeyword {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Begin,
    Commit,
    Rollback,
    Start,
    End,
    Abort,
    Pragma,
    With,
    Values,
    /// Random bytes as keyword
    Random(u8, u8, u8, u8, u8, u8),
}

impl SqlKeyword {
    fn as_str(&self) -> String {
        match self {
            SqlKeyword::Select => "SELECT".to_string(),
            SqlKeyword::Insert => "INSERT".to_string(),
            SqlKeyword::Update => "UPDATE".to_string(),
            SqlKeyword::Delete => "DELETE".to_string(),
            SqlKeyword::Create => "CREATE".to_string(),
            SqlKeyword::Drop => "DROP".to_string(),
            SqlKeyword::Alter => "ALTER".to_string(),
            SqlKeyword::Begin => "BEGIN".to_string(),
            SqlKeyword::Commit => "COMMIT".to_string(),
            SqlKeyword::Rollback => "ROLLBACK".to_string(),
            SqlKeyword::Start => "START".to_string(),
            SqlKeyword::End => "end".to_string(),
            SqlKeyword::Abort => "Abort".to_string(),
            SqlKeyword::Pragma => "PRAGMA".to_string(),
            SqlKeyword::With => "WITH".to_string(),
            SqlKeyword::Values => "VALUES".to_string(),
            SqlKeyword::Random(a, b, c, d, e, f) => {
                format!(
                    "{}{}{}{}{}{}",
                    char::from(*a),
                    char::from(*b),
                    char::from(*c),
                    char::from(*d),
                    char::from(*e),
                    char::from(*f)
                )
            }
        }
    }
}

fuzz_target!(|input: SqlInput| {
    // Build the SQL string
    let mut sql = String::new();

    if let Some(ws) = input.leading_whitespace {
        sql.push_str(ws);
    }

    sql.push_str(&input.keyword.as_str());
    sql.push(' ');
    sql.push_str(input.body);

    if input.has_semicolon {
        sql.push(';');
    }

    let _ = detect_query_type(&sql).is_transaction_control();
    let _ = command_tag(&sql, 0);

    let (key, value) = input.option;
    let _ = format!("{key}={value} {sql}").parse::<ConnectOptions>();
    let _ = format!("{key}='{value}'").parse::<ConnectOptions>();
});
