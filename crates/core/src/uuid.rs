//! 128-bit opaque identity.
//!
//! The engine never constructs identity-bearing values by hand — logical
//! node IDs, physical slot IDs, lock IDs, and item IDs are all
//! [`Uuid`]s minted with [`uuid::Uuid::new_v4`]. A single sentinel value,
//! [`NIL_UUID`], stands in for "no ID" (an unallocated inactive slot, a
//! failed [`crate::handle::Handle::allocate_id`]).

/// Re-export of the `uuid` crate's type; kept as a crate-local alias so
/// callers write `cowtree_core::Uuid` rather than reaching for the
/// `uuid` crate directly.
pub type Uuid = uuid::Uuid;

/// The sentinel "no ID" value. All-zero, per RFC 4122 §4.1.7.
pub const NIL_UUID: Uuid = uuid::Uuid::nil();

/// Mint a fresh random identity.
///
/// Centralized so every allocation site (handle slots, lock IDs,
/// transaction IDs, rewritten item IDs) goes through one call, making it
/// easy to audit for accidental ID reuse.
pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}
