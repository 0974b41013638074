use std::str::FromStr;

use log::trace;
use serde_json::{Map, Value};

use super::{ConfigEntry, ConfigError, FlatConfig, PluginKind};

/// The shapes a key inside a config entry can take.
enum Field<'a> {
    /// A plain value copied onto the flat entry.
    Attribute(&'a str, &'a Value),
    /// Another plugin nested under this one; it becomes its own entry based on this one.
    Nested(PluginKind, &'a Value),
    /// The partition list of a `partitioning` entry.
    Partitions(&'a Value),
}

impl<'a> Field<'a> {
    fn classify(parent: PluginKind, key: &'a str, value: &'a Value) -> Self {
        if parent == PluginKind::Partitioning && key == "partitions" {
            return Field::Partitions(value);
        }
        match PluginKind::from_str(key) {
            Ok(kind) => Field::Nested(kind, value),
            Err(_) => Field::Attribute(key, value),
        }
    }
}

/// Turns a config in tree or graph form into the flat graph form.
///
/// Every top-level element must be a mapping with exactly one key naming a plugin kind; all
/// elements are checked before any is expanded. Nested plugin keys become entries of their own
/// whose base defaults to the enclosing entry's name, and whose name defaults to
/// `"{kind}_{base}"`. Children are emitted before their parent.
pub fn config_tree_to_graph(config: &Value) -> Result<FlatConfig, ConfigError> {
    let entries = config.as_array().ok_or(ConfigError::NotAList)?;

    let mut roots = Vec::with_capacity(entries.len());
    for entry in entries {
        let map = entry.as_object().ok_or_else(|| ConfigError::NotAMapping {
            entry: entry.to_string(),
        })?;

        let mut keys = map.iter();
        let (Some((key, body)), None) = (keys.next(), keys.next()) else {
            return Err(ConfigError::NotSingleKey {
                entry: entry.to_string(),
            });
        };

        let kind = PluginKind::from_str(key)
            .map_err(|_| ConfigError::UnknownPlugin { key: key.clone() })?;
        roots.push((kind, body));
    }

    let mut output = Vec::new();
    for (kind, body) in roots {
        expand(kind, body, None, &mut output)?;
    }
    Ok(FlatConfig(output))
}

fn expand(
    kind: PluginKind,
    values: &Value,
    parent: Option<&str>,
    output: &mut Vec<ConfigEntry>,
) -> Result<(), ConfigError> {
    let values = values
        .as_object()
        .ok_or_else(|| ConfigError::InvalidShape {
            name: parent.unwrap_or(kind.name()).into(),
            key: kind.to_string(),
            expected: "a mapping".into(),
        })?;

    let mut this = Map::new();

    let base = match values.get("base") {
        Some(base) => Some(base.clone()),
        None => parent.map(|p| Value::String(p.into())),
    };

    let name = match (values.get("name"), &base) {
        (Some(Value::String(name)), _) => name.clone(),
        (Some(other), _) => {
            return Err(ConfigError::InvalidShape {
                name: other.to_string(),
                key: "name".into(),
                expected: "a string".into(),
            })
        }
        (None, Some(Value::String(base))) => format!("{kind}_{base}"),
        (None, _) => {
            return Err(ConfigError::MissingNameAndBase {
                kind: kind.to_string(),
            })
        }
    };

    if let Some(base) = &base {
        this.insert("base".into(), base.clone());
    }
    this.insert("name".into(), Value::String(name.clone()));

    for (key, value) in values {
        match Field::classify(kind, key, value) {
            Field::Attribute("name" | "base", _) => {}
            Field::Attribute(key, value) => {
                this.insert(key.into(), value.clone());
            }
            Field::Nested(child, value) => {
                trace!("Expanding nested '{child}' of '{name}'");
                expand(child, value, Some(&name), output)?;
            }
            Field::Partitions(partitions) => {
                let partitions = expand_partitions(&name, partitions, base.as_ref(), output)?;
                this.insert("partitions".into(), Value::Array(partitions));
            }
        }
    }

    output.push(ConfigEntry::new(kind, this));
    Ok(())
}

/// Expands a partition list in place: plugin keys of each partition become entries based on the
/// partition, everything else stays on the partition, which inherits the table's base.
fn expand_partitions(
    table: &str,
    partitions: &Value,
    base: Option<&Value>,
    output: &mut Vec<ConfigEntry>,
) -> Result<Vec<Value>, ConfigError> {
    let partitions = partitions
        .as_array()
        .ok_or_else(|| ConfigError::InvalidShape {
            name: table.into(),
            key: "partitions".into(),
            expected: "a list".into(),
        })?;

    let mut flat = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let shape_error = || ConfigError::InvalidShape {
            name: table.into(),
            key: "partitions".into(),
            expected: "a list of mappings with a name".into(),
        };
        let fields = partition.as_object().ok_or_else(shape_error)?;
        let part_name = fields
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(shape_error)?;

        let mut new_part = Map::new();
        for (key, value) in fields {
            match PluginKind::from_str(key) {
                Ok(child) => expand(child, value, Some(part_name), output)?,
                Err(_) => {
                    new_part.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(base) = base {
            new_part.insert("base".into(), base.clone());
        }
        flat.push(Value::Object(new_part));
    }
    Ok(flat)
}
