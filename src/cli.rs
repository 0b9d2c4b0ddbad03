//! CLI command definitions and value coercion

use clap::{Parser, Subcommand};

use crate::message::{Object, ObjectType};

pub const DEFAULT_COORDINATOR_URL: &str = "tcp://127.0.0.1:4800";
pub const DEFAULT_SOURCE_URL: &str = "tcp://127.0.0.1:4803";

/// dmhub - query and mutate a federated data model
#[derive(Parser)]
#[command(name = "dmhub", about = "Data-model federation broker CLI", version)]
pub struct Cli {
    /// Set logging level to DEBUG (normally WARN)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Coordinator URL
    #[arg(short = 'n', long = "coordinator-url", global = true, default_value = DEFAULT_COORDINATOR_URL)]
    pub coordinator_url: String,

    /// Local source URL the coordinator pushes replies to
    #[arg(short = 's', long = "source-url", global = true, default_value = DEFAULT_SOURCE_URL)]
    pub source_url: String,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Read the object at a path
    Get {
        /// Dotted object path
        path: String,
    },

    /// Write a value to the object at a path
    Set {
        /// Dotted object path
        path: String,

        /// Value, coerced to the object's declared type
        value: String,
    },

    /// Enumerate registered objects under a path
    List {
        /// Dotted object path; end with '.' to list a subtree
        path: String,
    },
}

/// Coerce a raw CLI string into the typed payload an object declares
pub fn coerce_value(object: &Object, raw: &str) -> eyre::Result<serde_json::Value> {
    let value = match object.object_type {
        ObjectType::Int | ObjectType::Long => {
            let parsed: i64 = raw
                .parse()
                .map_err(|e| eyre::eyre!("invalid integer value ({raw}): {e}"))?;
            serde_json::json!(parsed)
        }
        ObjectType::UnsignedInt | ObjectType::UnsignedLong => {
            let parsed: u64 = raw
                .parse()
                .map_err(|e| eyre::eyre!("invalid unsigned value ({raw}): {e}"))?;
            serde_json::json!(parsed)
        }
        ObjectType::Float | ObjectType::Double => {
            let parsed: f64 = raw
                .parse()
                .map_err(|e| eyre::eyre!("invalid float value ({raw}): {e}"))?;
            serde_json::Number::from_f64(parsed)
                .map(serde_json::Value::Number)
                .ok_or_else(|| eyre::eyre!("non-finite float value ({raw})"))?
        }
        _ => serde_json::Value::String(raw.to_string()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn typed(object_type: ObjectType) -> Object {
        Object {
            object_type,
            ..Object::named("Device.Custom.Setting")
        }
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_coerce_signed() {
        let value = coerce_value(&typed(ObjectType::Int), "-42").unwrap();
        assert_eq!(value, serde_json::json!(-42));

        let value = coerce_value(&typed(ObjectType::Long), "600").unwrap();
        assert_eq!(value, serde_json::json!(600));

        assert!(coerce_value(&typed(ObjectType::Int), "abc").is_err());
    }

    #[test]
    fn test_coerce_unsigned() {
        let value = coerce_value(&typed(ObjectType::UnsignedLong), "18446744073709551615").unwrap();
        assert_eq!(value, serde_json::json!(u64::MAX));

        assert!(coerce_value(&typed(ObjectType::UnsignedInt), "-1").is_err());
    }

    #[test]
    fn test_coerce_float() {
        let value = coerce_value(&typed(ObjectType::Double), "2.5").unwrap();
        assert_eq!(value, serde_json::json!(2.5));

        assert!(coerce_value(&typed(ObjectType::Float), "NaN").is_err());
    }

    #[test]
    fn test_coerce_everything_else_is_raw_string() {
        for object_type in [ObjectType::String, ObjectType::Bool, ObjectType::DateTime, ObjectType::Base64] {
            let value = coerce_value(&typed(object_type), "8.8.8.8").unwrap();
            assert_eq!(value, serde_json::json!("8.8.8.8"));
        }
    }
}
