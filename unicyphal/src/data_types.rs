//! (De)serializable Rust representation for selected Cyphal data types
//!
//! Only the standard types the stack itself consumes live here: the
//! register `Value` union and the `List`/`Access` service payloads.
//! Applications bring their own generated or hand-written types; the
//! transport layer deals in raw payload bytes and does not care.

pub(crate) mod cursor;
pub mod register;

pub use register::{
    AccessRequest, AccessResponse, ListRequest, ListResponse, Value, ACCESS_REQUEST_EXTENT,
    ACCESS_SERVICE_ID, LIST_REQUEST_EXTENT, LIST_SERVICE_ID,
};
