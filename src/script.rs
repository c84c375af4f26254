//! Narrow seam around the embedded Lua evaluator.
//!
//! Transforms never see the Lua state; they call one of the typed
//! evaluation entry points and get back "emit this", "drop the line" or
//! an aggregation contribution. The receiver's bucket schema is read
//! through the same host.

use std::{collections::BTreeMap, fs, path::Path};

use mlua::{Function, Lua, Table, Value};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ScriptError {
    #[snafu(display("unable to read script {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("script load failed: {source}"))]
    Load { source: mlua::Error },

    #[snafu(display("`{name}` is not a function"))]
    NotFunction { name: String },

    #[snafu(display("`{name}` call failed: {source}"))]
    Call { name: String, source: mlua::Error },

    #[snafu(display("`{name}` returned {detail}"))]
    BadReturn { name: String, detail: String },

    #[snafu(display("global `{name}` {detail}"))]
    BadGlobal { name: String, detail: String },
}

pub struct ScriptHost {
    lua: Lua,
}

impl ScriptHost {
    pub fn load(path: &Path) -> Result<ScriptHost, ScriptError> {
        let source = fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &str) -> Result<ScriptHost, ScriptError> {
        let lua = Lua::new();
        lua.load(source).exec().context(LoadSnafu)?;
        Ok(ScriptHost { lua })
    }

    fn function(&self, name: &str) -> Result<Function, ScriptError> {
        self.lua
            .globals()
            .get::<Function>(name)
            .map_err(|_| ScriptError::NotFunction {
                name: name.to_string(),
            })
    }

    /// Verify a configured function exists; load-time check.
    pub fn require_function(&self, name: &str) -> Result<(), ScriptError> {
        self.function(name).map(|_| ())
    }

    fn fields_table(&self, fields: &[String]) -> Result<Table, mlua::Error> {
        self.lua.create_sequence_from(fields.iter().cloned())
    }

    /// `grep(fields) -> list | nil`. A list emits its elements joined by
    /// the caller; nil drops the line.
    pub fn eval_grep(
        &self,
        name: &str,
        fields: &[String],
    ) -> Result<Option<Vec<String>>, ScriptError> {
        let function = self.function(name)?;
        let args = self.fields_table(fields).context(CallSnafu { name })?;
        let value: Value = function.call(args).context(CallSnafu { name })?;
        match value {
            Value::Nil => Ok(None),
            Value::Table(table) => {
                let mut out = Vec::new();
                for item in table.sequence_values::<Value>() {
                    let item = item.context(CallSnafu { name })?;
                    out.push(lossy_string(&item).ok_or_else(|| ScriptError::BadReturn {
                        name: name.to_string(),
                        detail: "a list with a non-string element".to_string(),
                    })?);
                }
                if out.is_empty() {
                    BadReturnSnafu {
                        name,
                        detail: "an empty list",
                    }
                    .fail()
                } else {
                    Ok(Some(out))
                }
            }
            other => BadReturnSnafu {
                name,
                detail: format!("{} instead of list or nil", other.type_name()),
            }
            .fail(),
        }
    }

    /// `transform(line) -> string | nil`.
    pub fn eval_transform(&self, name: &str, line: &str) -> Result<Option<String>, ScriptError> {
        let function = self.function(name)?;
        let value: Value = function.call(line).context(CallSnafu { name })?;
        match value {
            Value::Nil => Ok(None),
            other => match lossy_string(&other) {
                Some(s) => Ok(Some(s)),
                None => BadReturnSnafu {
                    name,
                    detail: format!("{} instead of string or nil", other.type_name()),
                }
                .fail(),
            },
        }
    }

    /// `aggregate(fields) -> (pkey, {subkey = integer}) | nil`.
    #[allow(clippy::type_complexity)]
    pub fn eval_aggregate(
        &self,
        name: &str,
        fields: &[String],
    ) -> Result<Option<(String, BTreeMap<String, i64>)>, ScriptError> {
        let function = self.function(name)?;
        let args = self.fields_table(fields).context(CallSnafu { name })?;
        let (pkey, counters): (Value, Value) =
            function.call(args).context(CallSnafu { name })?;

        let pkey = match pkey {
            Value::Nil => return Ok(None),
            other => lossy_string(&other).ok_or_else(|| ScriptError::BadReturn {
                name: name.to_string(),
                detail: "a non-string primary key".to_string(),
            })?,
        };

        let table = match counters {
            Value::Table(table) => table,
            other => {
                return BadReturnSnafu {
                    name,
                    detail: format!("{} instead of a counter table", other.type_name()),
                }
                .fail()
            }
        };

        let mut out = BTreeMap::new();
        for pair in table.pairs::<String, i64>() {
            let (key, value) = pair.map_err(|_| ScriptError::BadReturn {
                name: name.to_string(),
                detail: "counter table must map strings to integers".to_string(),
            })?;
            out.insert(key, value);
        }
        Ok(Some((pkey, out)))
    }

    // Globals read by the bucket receiver's schema.

    pub fn global_string_array(&self, name: &str) -> Result<Vec<String>, ScriptError> {
        let table: Table =
            self.lua
                .globals()
                .get(name)
                .map_err(|_| ScriptError::BadGlobal {
                    name: name.to_string(),
                    detail: "must be a string array".to_string(),
                })?;
        let mut out = Vec::new();
        for item in table.sequence_values::<String>() {
            out.push(item.map_err(|_| ScriptError::BadGlobal {
                name: name.to_string(),
                detail: "must be a string array".to_string(),
            })?);
        }
        if out.is_empty() {
            return BadGlobalSnafu {
                name,
                detail: "must not be empty",
            }
            .fail();
        }
        Ok(out)
    }

    pub fn global_string_or(&self, name: &str, default: &str) -> Result<String, ScriptError> {
        match self.lua.globals().get::<Value>(name) {
            Ok(Value::Nil) => Ok(default.to_string()),
            Ok(Value::String(s)) => Ok(s.to_string_lossy().to_string()),
            _ => BadGlobalSnafu {
                name,
                detail: "must be a string",
            }
            .fail(),
        }
    }

    pub fn global_bool_or(&self, name: &str, default: bool) -> Result<bool, ScriptError> {
        match self.lua.globals().get::<Value>(name) {
            Ok(Value::Nil) => Ok(default),
            Ok(Value::Boolean(b)) => Ok(b),
            _ => BadGlobalSnafu {
                name,
                detail: "must be a boolean",
            }
            .fail(),
        }
    }

    pub fn global_string_map(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ScriptError> {
        match self.lua.globals().get::<Value>(name) {
            Ok(Value::Nil) => Ok(BTreeMap::new()),
            Ok(Value::Table(table)) => {
                let mut out = BTreeMap::new();
                for pair in table.pairs::<String, String>() {
                    let (key, value) = pair.map_err(|_| ScriptError::BadGlobal {
                        name: name.to_string(),
                        detail: "must map strings to strings".to_string(),
                    })?;
                    out.insert(key, value);
                }
                Ok(out)
            }
            _ => BadGlobalSnafu {
                name,
                detail: "must be a table",
            }
            .fail(),
        }
    }
}

fn lossy_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
