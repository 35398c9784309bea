// Hard caps on input sizes. Anything past these is rejected with
// `EngineError::LimitExceeded` before touching state.

pub const MAX_STAFF: usize = 1_000;
pub const MAX_SERVICES: usize = 10_000;
pub const MAX_CUSTOMERS: usize = 1_000_000;
pub const MAX_COMMITMENTS_PER_STAFF: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

pub const MAX_SERVICES_PER_BOOKING: usize = 16;
/// One service cannot run longer than a day.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

pub const MIN_GRANULARITY_MIN: u32 = 5;
pub const MAX_GRANULARITY_MIN: u32 = 240;
