use std::collections::HashMap;

/// Message-of-the-day text keyed by client build number, with a default
/// message for builds that have no specific entry.
#[derive(Debug, Clone, Default)]
pub struct MotdTable {
    by_build: HashMap<u32, String>,
    default_message: String,
}

impl MotdTable {
    pub fn new(default_message: impl Into<String>) -> Self {
        MotdTable {
            by_build: HashMap::new(),
            default_message: default_message.into(),
        }
    }

    pub fn set(&mut self, build: u32, message: impl Into<String>) {
        self.by_build.insert(build, message.into());
    }

    pub fn message_for(&self, client_build: u32) -> &str {
        self.by_build.get(&client_build).map(String::as_str).unwrap_or(&self.default_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_build_gets_the_default_message() {
        let table = MotdTable::new("welcome");
        assert_eq!(table.message_for(999), "welcome");
    }

    #[test]
    fn known_build_gets_its_own_message() {
        let mut table = MotdTable::new("welcome");
        table.set(100, "upgrade available");
        assert_eq!(table.message_for(100), "upgrade available");
        assert_eq!(table.message_for(101), "welcome");
    }
}
