#![no_main]
//! Fuzz test for statement classification
//!
//! `detect_query_type` decides whether a statement gets an implicit BEGIN and
//! whether it may run in a failed transaction, and the loopback server derives
//! command tags from it. Neither may panic on any input.

use simpledb_client::detect_query_type;
use simpledb_client::utils::command_tag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(sql) = std::str::from_utf8(data) {
        let query_type = detect_query_type(sql);
        let _ = query_type.ends_transaction();
        let _ = command_tag(sql, data.len() as u64);
    }
});
