/// Frontend and backend messages of the PostgreSQL v3 protocol subset SimpleDB speaks
///
/// The client encodes `FrontendMessage`s and decodes `BackendMessage`s; the
/// loopback server does the reverse, so both directions live here.
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_cstr, read_i16, read_i32, read_nullable_bytes, read_u32, read_u8, write_cstr,
    write_message, write_nullable_bytes, CodecError, Frame,
};
use crate::constants::{PROTOCOL_VERSION_3, SSL_REQUEST_CODE};

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: not in a transaction block
    Idle,
    /// `T`: in a transaction block
    InTransaction,
    /// `E`: in a failed transaction block
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(CodecError::InvalidValue(format!(
                "transaction status {other:#04x}"
            ))),
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl FieldDescription {
    /// A text-format field with no originating table.
    pub fn new(name: impl Into<String>, column_id: i16, type_oid: u32, type_size: i16) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id,
            type_oid,
            type_size,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Fields of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorFields {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "FATAL".to_string(),
            ..Self::error(code, message)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    /// Any other authentication request code.
    AuthenticationOther(i32),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
}

impl BackendMessage {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            BackendMessage::AuthenticationOk => write_message(buf, Some(b'R'), |buf| {
                buf.put_i32(0);
                Ok(())
            }),
            BackendMessage::AuthenticationCleartextPassword => {
                write_message(buf, Some(b'R'), |buf| {
                    buf.put_i32(3);
                    Ok(())
                })
            }
            BackendMessage::AuthenticationMd5Password { salt } => {
                write_message(buf, Some(b'R'), |buf| {
                    buf.put_i32(5);
                    buf.put_slice(salt);
                    Ok(())
                })
            }
            BackendMessage::AuthenticationOther(code) => write_message(buf, Some(b'R'), |buf| {
                buf.put_i32(*code);
                Ok(())
            }),
            BackendMessage::ParameterStatus { name, value } => {
                write_message(buf, Some(b'S'), |buf| {
                    write_cstr(buf, name.as_bytes())?;
                    write_cstr(buf, value.as_bytes())
                })
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => write_message(buf, Some(b'K'), |buf| {
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
                Ok(())
            }),
            BackendMessage::ReadyForQuery(status) => write_message(buf, Some(b'Z'), |buf| {
                buf.put_u8(status.as_byte());
                Ok(())
            }),
            BackendMessage::RowDescription(fields) => write_message(buf, Some(b'T'), |buf| {
                buf.put_i16(fields.len() as i16);
                for field in fields {
                    write_cstr(buf, field.name.as_bytes())?;
                    buf.put_u32(field.table_oid);
                    buf.put_i16(field.column_id);
                    buf.put_u32(field.type_oid);
                    buf.put_i16(field.type_size);
                    buf.put_i32(field.type_modifier);
                    buf.put_i16(field.format);
                }
                Ok(())
            }),
            BackendMessage::DataRow(values) => write_message(buf, Some(b'D'), |buf| {
                buf.put_i16(values.len() as i16);
                for value in values {
                    write_nullable_bytes(buf, value.as_deref());
                }
                Ok(())
            }),
            BackendMessage::CommandComplete(tag) => write_message(buf, Some(b'C'), |buf| {
                write_cstr(buf, tag.as_bytes())
            }),
            BackendMessage::EmptyQueryResponse => write_message(buf, Some(b'I'), |_| Ok(())),
            BackendMessage::ErrorResponse(fields) => {
                write_message(buf, Some(b'E'), |buf| encode_error_fields(buf, fields))
            }
            BackendMessage::NoticeResponse(fields) => {
                write_message(buf, Some(b'N'), |buf| encode_error_fields(buf, fields))
            }
            BackendMessage::ParseComplete => write_message(buf, Some(b'1'), |_| Ok(())),
            BackendMessage::BindComplete => write_message(buf, Some(b'2'), |_| Ok(())),
            BackendMessage::CloseComplete => write_message(buf, Some(b'3'), |_| Ok(())),
            BackendMessage::NoData => write_message(buf, Some(b'n'), |_| Ok(())),
        }
    }

    pub fn decode(frame: Frame) -> Result<Self, CodecError> {
        let mut buf = frame.body;
        let msg = match frame.tag {
            b'R' => match read_i32(&mut buf, "authentication code")? {
                0 => BackendMessage::AuthenticationOk,
                3 => BackendMessage::AuthenticationCleartextPassword,
                5 => {
                    let mut salt = [0u8; 4];
                    for b in &mut salt {
                        *b = read_u8(&mut buf, "md5 salt")?;
                    }
                    BackendMessage::AuthenticationMd5Password { salt }
                }
                other => BackendMessage::AuthenticationOther(other),
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstr(&mut buf, "parameter name")?,
                value: read_cstr(&mut buf, "parameter value")?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: read_i32(&mut buf, "process id")?,
                secret_key: read_i32(&mut buf, "secret key")?,
            },
            b'Z' => BackendMessage::ReadyForQuery(TransactionStatus::from_byte(read_u8(
                &mut buf,
                "transaction status",
            )?)?),
            b'T' => {
                let count = read_i16(&mut buf, "field count")?;
                let mut fields = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: read_cstr(&mut buf, "field name")?,
                        table_oid: read_u32(&mut buf, "table oid")?,
                        column_id: read_i16(&mut buf, "column id")?,
                        type_oid: read_u32(&mut buf, "type oid")?,
                        type_size: read_i16(&mut buf, "type size")?,
                        type_modifier: read_i32(&mut buf, "type modifier")?,
                        format: read_i16(&mut buf, "format code")?,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            b'D' => {
                let count = read_i16(&mut buf, "column count")?;
                let mut values = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    values.push(read_nullable_bytes(&mut buf, "column value")?);
                }
                BackendMessage::DataRow(values)
            }
            b'C' => BackendMessage::CommandComplete(read_cstr(&mut buf, "command tag")?),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(decode_error_fields(&mut buf)?),
            b'N' => BackendMessage::NoticeResponse(decode_error_fields(&mut buf)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            tag => return Err(CodecError::UnknownTag(tag)),
        };
        Ok(msg)
    }
}

fn encode_error_fields(buf: &mut BytesMut, fields: &ErrorFields) -> Result<(), CodecError> {
    buf.put_u8(b'S');
    write_cstr(buf, fields.severity.as_bytes())?;
    buf.put_u8(b'C');
    write_cstr(buf, fields.code.as_bytes())?;
    buf.put_u8(b'M');
    write_cstr(buf, fields.message.as_bytes())?;
    if let Some(detail) = &fields.detail {
        buf.put_u8(b'D');
        write_cstr(buf, detail.as_bytes())?;
    }
    buf.put_u8(0);
    Ok(())
}

fn decode_error_fields(buf: &mut Bytes) -> Result<ErrorFields, CodecError> {
    let mut fields = ErrorFields::default();
    loop {
        let kind = read_u8(buf, "error field type")?;
        if kind == 0 {
            break;
        }
        let value = read_cstr(buf, "error field")?;
        match kind {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            // V, H, P, W and friends are not surfaced
            _ => {}
        }
    }
    Ok(fields)
}

/// Target of a Describe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    SslRequest,
    Startup {
        version: i32,
        params: Vec<(String, String)>,
    },
    PasswordMessage {
        password: String,
    },
    Query {
        sql: String,
    },
    Parse {
        name: String,
        sql: String,
        param_types: Vec<u32>,
    },
    /// Bind with all parameters and result columns in text format.
    Bind {
        portal: String,
        statement: String,
        params: Vec<Option<Bytes>>,
    },
    Describe {
        target: DescribeTarget,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Sync,
    Flush,
    Terminate,
}

impl FrontendMessage {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            FrontendMessage::SslRequest => write_message(buf, None, |buf| {
                buf.put_i32(SSL_REQUEST_CODE);
                Ok(())
            }),
            FrontendMessage::Startup { version, params } => write_message(buf, None, |buf| {
                buf.put_i32(*version);
                for (key, val) in params {
                    write_cstr(buf, key.as_bytes())?;
                    write_cstr(buf, val.as_bytes())?;
                }
                buf.put_u8(0);
                Ok(())
            }),
            FrontendMessage::PasswordMessage { password } => {
                write_message(buf, Some(b'p'), |buf| write_cstr(buf, password.as_bytes()))
            }
            FrontendMessage::Query { sql } => {
                write_message(buf, Some(b'Q'), |buf| write_cstr(buf, sql.as_bytes()))
            }
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => write_message(buf, Some(b'P'), |buf| {
                write_cstr(buf, name.as_bytes())?;
                write_cstr(buf, sql.as_bytes())?;
                buf.put_i16(param_types.len() as i16);
                for oid in param_types {
                    buf.put_u32(*oid);
                }
                Ok(())
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                params,
            } => write_message(buf, Some(b'B'), |buf| {
                write_cstr(buf, portal.as_bytes())?;
                write_cstr(buf, statement.as_bytes())?;
                // zero format codes: every parameter is text
                buf.put_i16(0);
                buf.put_i16(params.len() as i16);
                for param in params {
                    write_nullable_bytes(buf, param.as_deref());
                }
                // zero result format codes: every column is text
                buf.put_i16(0);
                Ok(())
            }),
            FrontendMessage::Describe { target, name } => {
                write_message(buf, Some(b'D'), |buf| {
                    buf.put_u8(match target {
                        DescribeTarget::Statement => b'S',
                        DescribeTarget::Portal => b'P',
                    });
                    write_cstr(buf, name.as_bytes())
                })
            }
            FrontendMessage::Execute { portal, max_rows } => {
                write_message(buf, Some(b'E'), |buf| {
                    write_cstr(buf, portal.as_bytes())?;
                    buf.put_i32(*max_rows);
                    Ok(())
                })
            }
            FrontendMessage::Sync => write_message(buf, Some(b'S'), |_| Ok(())),
            FrontendMessage::Flush => write_message(buf, Some(b'H'), |_| Ok(())),
            FrontendMessage::Terminate => write_message(buf, Some(b'X'), |_| Ok(())),
        }
    }

    /// Decode an untagged startup-phase message body.
    pub fn decode_startup(mut body: Bytes) -> Result<Self, CodecError> {
        let version = read_i32(&mut body, "protocol version")?;
        match version {
            SSL_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
            PROTOCOL_VERSION_3 => {
                let mut params = Vec::new();
                loop {
                    let key = read_cstr(&mut body, "startup parameter name")?;
                    if key.is_empty() {
                        break;
                    }
                    let val = read_cstr(&mut body, "startup parameter value")?;
                    params.push((key, val));
                }
                Ok(FrontendMessage::Startup { version, params })
            }
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    pub fn decode(frame: Frame) -> Result<Self, CodecError> {
        let mut buf = frame.body;
        let msg = match frame.tag {
            b'p' => FrontendMessage::PasswordMessage {
                password: read_cstr(&mut buf, "password")?,
            },
            b'Q' => FrontendMessage::Query {
                sql: read_cstr(&mut buf, "query string")?,
            },
            b'P' => {
                let name = read_cstr(&mut buf, "statement name")?;
                let sql = read_cstr(&mut buf, "query string")?;
                let count = read_i16(&mut buf, "parameter type count")?;
                let mut param_types = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    param_types.push(read_u32(&mut buf, "parameter type")?);
                }
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_types,
                }
            }
            b'B' => {
                let portal = read_cstr(&mut buf, "portal name")?;
                let statement = read_cstr(&mut buf, "statement name")?;
                let format_count = read_i16(&mut buf, "parameter format count")?;
                for _ in 0..format_count {
                    if read_i16(&mut buf, "parameter format")? != 0 {
                        return Err(CodecError::InvalidValue(
                            "binary parameters are not supported".to_string(),
                        ));
                    }
                }
                let count = read_i16(&mut buf, "parameter count")?;
                let mut params = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    params.push(read_nullable_bytes(&mut buf, "parameter value")?);
                }
                let result_format_count = read_i16(&mut buf, "result format count")?;
                for _ in 0..result_format_count {
                    if read_i16(&mut buf, "result format")? != 0 {
                        return Err(CodecError::InvalidValue(
                            "binary results are not supported".to_string(),
                        ));
                    }
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    params,
                }
            }
            b'D' => {
                let target = match read_u8(&mut buf, "describe target")? {
                    b'S' => DescribeTarget::Statement,
                    b'P' => DescribeTarget::Portal,
                    other => {
                        return Err(CodecError::InvalidValue(format!(
                            "describe target {other:#04x}"
                        )))
                    }
                };
                FrontendMessage::Describe {
                    target,
                    name: read_cstr(&mut buf, "describe name")?,
                }
            }
            b'E' => FrontendMessage::Execute {
                portal: read_cstr(&mut buf, "portal name")?,
                max_rows: read_i32(&mut buf, "row limit")?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'X' => FrontendMessage::Terminate,
            tag => return Err(CodecError::UnknownTag(tag)),
        };
        Ok(msg)
    }
}
