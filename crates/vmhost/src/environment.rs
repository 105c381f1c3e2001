use std::collections::HashMap;

/// Values supplied with `-D<name>=<value>`, queried by the engine while a script
/// evaluates environment-dependent expressions.
///
/// The map is only allocated by the first definition; lookups against an empty
/// table always report the name as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentTable {
    entries: Option<HashMap<String, String>>,
}

impl EnvironmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `name`; the last definition wins.
    pub fn define(&mut self, name: &str, value: &str) {
        self.entries
            .get_or_insert_with(|| HashMap::with_capacity(4))
            .insert(name.to_string(), value.to_string());
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries.as_ref()?.get(name).map(String::as_str)
    }

    /// Lookup entry point for the engine callback: the name arrives as raw UTF-8 and
    /// is validated in place, so a lookup never allocates.
    pub fn lookup_utf8(&self, name: &[u8]) -> Result<Option<&str>, std::str::Utf8Error> {
        let name = std::str::from_utf8(name)?;
        Ok(self.lookup(name))
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_allocated(&self) -> bool {
        self.entries.is_some()
    }
}
