// Hard caps that keep a single request or property from exhausting memory.

pub const MAX_PROPERTIES: usize = 100_000;
pub const MAX_BOOKINGS_PER_PROPERTY: usize = 20_000;
pub const MAX_RULES_PER_PROPERTY: usize = 1_000;
pub const MAX_BLOCKS_PER_PROPERTY: usize = 1_000;
pub const MAX_LINKS_PER_PROPERTY: usize = 16;

/// Longest stay a single booking may cover.
pub const MAX_STAY_NIGHTS: i64 = 365;
/// Widest window an availability query may ask for.
pub const MAX_QUERY_NIGHTS: i64 = 800;

pub const MAX_CAPACITY: u32 = 1_000;
/// Largest rate, fee or rule amount, in currency units. Nightly rates are capped here too.
pub const MAX_AMOUNT: i64 = 1_000_000_000;
/// Largest seasonal percentage a rule may add.
pub const MAX_PERCENT: i64 = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_REFERENCE_LEN: usize = 256;

/// Largest external calendar document accepted, in bytes.
pub const MAX_FEED_BYTES: usize = 4 * 1024 * 1024;
pub const MAX_FEED_EVENTS: usize = 10_000;
