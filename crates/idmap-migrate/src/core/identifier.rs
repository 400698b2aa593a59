//! Identifier validation, quoting, and id map table naming.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! identifier spliced into SQL goes through [`quote`], which validates it and
//! escapes embedded quotes.

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// Maximum identifier length in bytes.
///
/// PostgreSQL truncates at 63 bytes; generated names stay under it so a map
/// table name is portable to any backend the store may later target.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

const MAP_TABLE_PREFIX: &str = "migrate_map_";
const MESSAGE_TABLE_PREFIX: &str = "migrate_message_";

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, embedded null bytes, and names longer than
/// [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an identifier with double quotes, doubling any embedded quote.
pub fn quote(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Reduce a migration id to `[a-z0-9_]`.
pub fn sanitize(migration_id: &str) -> String {
    migration_id
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Hex digits of the digest appended to shortened names.
const NAME_HASH_LENGTH: usize = 8;

/// Fit a generated ASCII name into [`MAX_IDENTIFIER_LENGTH`].
///
/// Long names keep their head and end in `_` plus a digest of the full
/// name, so names sharing a long prefix stay distinct.
pub fn shorten_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let head = MAX_IDENTIFIER_LENGTH - NAME_HASH_LENGTH - 1;
    format!("{}_{}", &name[..head], &digest[..NAME_HASH_LENGTH])
}

fn prefixed(prefix: &str, migration_id: &str) -> String {
    // sanitize() only emits ASCII, so byte slicing is on a char boundary.
    shorten_identifier(&format!("{}{}", prefix, sanitize(migration_id)))
}

/// Name of the mapping table for a migration.
pub fn map_table_name(migration_id: &str) -> String {
    prefixed(MAP_TABLE_PREFIX, migration_id)
}

/// Name of the message table for a migration.
pub fn message_table_name(migration_id: &str) -> String {
    prefixed(MESSAGE_TABLE_PREFIX, migration_id)
}

/// Column name of the n-th (1-based) source id component.
pub fn source_id_column(n: usize) -> String {
    format!("sourceid{}", n)
}

/// Column name of the n-th (1-based) destination id component.
pub fn dest_id_column(n: usize) -> String {
    format!("destid{}", n)
}
