pub mod db;
pub mod errors;

// CONSTANTS
// =================================================================================================
pub const COMPONENT: &str = "folio-store";

/// Number of sql statements that each connection will cache.
const SQL_STATEMENT_CACHE_CAPACITY: usize = 32;
