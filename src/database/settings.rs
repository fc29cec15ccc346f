//! Database client settings.

use crate::logger::LogLevel;

/// Options applied when a [`Database`](crate::database::Database) is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// Level applied to the `@firebase/database` logger; `None` keeps the current one.
    pub log_level: Option<LogLevel>,
    /// Estimated difference between the server clock and the local clock,
    /// used to resolve `server_timestamp()` for optimistic values.
    pub server_time_offset_ms: i64,
}

impl DatabaseSettings {
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn with_server_time_offset_ms(mut self, offset: i64) -> Self {
        self.server_time_offset_ms = offset;
        self
    }
}
