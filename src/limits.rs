//! Hard limits on user-supplied input.

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_CONFIG_KEY_LEN: usize = 64;
pub const MAX_CONFIG_VALUE_LEN: usize = 1_000;
pub const MAX_LOCATIONS: usize = 1_000;
pub const MAX_CELEBRANTS: usize = 1_000;
/// Rows returned by a single wedding search.
pub const MAX_SEARCH_RESULTS: usize = 5_000;
pub const MAX_REMINDER_OFFSET_HOURS: u32 = 24 * 30;
