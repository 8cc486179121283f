//! Protocol constants and defaults for SimpleDB
//!
//! This module holds the static configuration shared by the client core and the
//! loopback server: wire protocol version codes, type OIDs, SQLSTATE codes and
//! connection defaults.

/// PostgreSQL protocol version 3.0, sent in the startup message.
pub const PROTOCOL_VERSION_3: i32 = 0x0003_0000;

/// Magic version code of an SSLRequest.
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679;

/// Single-byte reply to an SSLRequest: TLS is not offered.
pub const SSL_NOT_SUPPORTED: u8 = b'N';

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 5432;

/// Default user name sent in the startup message
pub const DEFAULT_USER: &str = "simpledb";

/// Default `application_name` startup parameter
pub const DEFAULT_APPLICATION_NAME: &str = "simpledb_client";

/// Default timeout for establishing a connection (in seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Size of a single transport read.
///
/// Together with one partially received message this bounds the memory a
/// result stream holds, independent of the result size.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Largest message body accepted from the peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Busy timeout applied to every loopback server session (in milliseconds)
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// Type OIDs from pg_type, used in RowDescription and Parse messages
pub const BOOL_OID: u32 = 16;
pub const BYTEA_OID: u32 = 17;
pub const NAME_OID: u32 = 19;
pub const INT8_OID: u32 = 20;
pub const INT2_OID: u32 = 21;
pub const INT4_OID: u32 = 23;
pub const TEXT_OID: u32 = 25;
pub const FLOAT4_OID: u32 = 700;
pub const FLOAT8_OID: u32 = 701;
pub const UNKNOWN_OID: u32 = 705;
pub const BPCHAR_OID: u32 = 1042;
pub const VARCHAR_OID: u32 = 1043;
pub const NUMERIC_OID: u32 = 1700;

// SQLSTATE codes reported in ErrorResponse messages
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";
pub const SQLSTATE_INVALID_TEXT_REPRESENTATION: &str = "22P02";
pub const SQLSTATE_NOT_NULL_VIOLATION: &str = "23502";
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
pub const SQLSTATE_ACTIVE_TRANSACTION: &str = "25001";
pub const SQLSTATE_NO_ACTIVE_TRANSACTION: &str = "25P01";
pub const SQLSTATE_IN_FAILED_TRANSACTION: &str = "25P02";
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_SYNTAX_ERROR: &str = "42601";
pub const SQLSTATE_UNDEFINED_COLUMN: &str = "42703";
pub const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";
pub const SQLSTATE_DUPLICATE_TABLE: &str = "42P07";
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";
