use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::StoreError;

/// Mutable view of store state while a native script runs
///
/// Native scripts run under the backend's lock, so every call sees and
/// produces a consistent state, the same guarantee Redis gives Lua.
pub trait ScriptState {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>);

    fn delete(&mut self, key: &str) -> bool;

    fn hash_get_all(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    fn hash_set_all(&mut self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    fn expire(&mut self, key: &str, ttl: Duration) -> bool;
}

/// Native implementation of a script, run by in-process backends
pub type NativeScript = fn(&mut dyn ScriptState, &[String], &[String]) -> Result<Vec<String>, StoreError>;

/// Atomic multi-key operation with a Lua body for Redis and an equivalent
/// native body for in-process backends
///
/// Scripts return a flat list of strings. Lua bodies must `tostring` numbers.
pub struct AtomicScript {
    name: &'static str,
    lua: &'static str,
    native: NativeScript,
}

impl AtomicScript {
    pub const fn new(name: &'static str, lua: &'static str, native: NativeScript) -> Self {
        Self { name, lua, native }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn lua(&self) -> &'static str {
        self.lua
    }

    /// Run the native body against a locked state
    pub fn run_native(
        &self,
        state: &mut dyn ScriptState,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        (self.native)(state, keys, args)
    }
}

impl fmt::Debug for AtomicScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicScript").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Fetch a required script argument
pub fn arg<'a>(script: &'static str, args: &'a [String], index: usize) -> Result<&'a str, StoreError> {
    args.get(index).map(String::as_str).ok_or_else(|| StoreError::Script {
        name: script,
        message: format!("missing argument {index}"),
    })
}

/// Fetch and parse a required script argument
pub fn parse_arg<T: std::str::FromStr>(script: &'static str, args: &[String], index: usize) -> Result<T, StoreError> {
    let raw = arg(script, args, index)?;
    raw.parse().map_err(|_| StoreError::Script {
        name: script,
        message: format!("argument {index} is not valid: {raw}"),
    })
}

const COMPARE_AND_DELETE_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return {tostring(redis.call('DEL', KEYS[1]))}
end
return {'0'}
";

fn compare_and_delete_native(
    state: &mut dyn ScriptState,
    keys: &[String],
    args: &[String],
) -> Result<Vec<String>, StoreError> {
    let key = arg("compare_and_delete", keys, 0)?;
    let expected = arg("compare_and_delete", args, 0)?;

    if state.get(key)?.as_deref() == Some(expected) && state.delete(key) {
        return Ok(vec!["1".to_string()]);
    }

    Ok(vec!["0".to_string()])
}

/// Delete a key only while it still holds the expected value
pub static COMPARE_AND_DELETE: AtomicScript =
    AtomicScript::new("compare_and_delete", COMPARE_AND_DELETE_LUA, compare_and_delete_native);
